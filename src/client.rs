//! Client side interactions: requests issued by this node and the results they produce.
//!
//! Chunks are surfaced one at a time. A chunk marked as followed by more is only
//! continued when the application pulls, so the publisher never runs ahead of the reader.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use crate::{
    codec::{self, Value},
    error::{DecodeError, ImError, ImResult},
    exchange::{CloseReason, ExchangeKey},
    interaction::{reject, send_action, Ctx},
    messages::{
        Action, AttributeDataIb, AttributeReportIb, CommandDataIb, EventReportIb, InvokeRequest, InvokeResponseIb,
        ReadRequest, ReportData, SubscribeRequest, WriteRequest,
    },
    node::NodeEvent,
    report::{
        AttributePathFilter, AttributeStatus, AttributeValue, Chunk, ConcreteAttributePath, ConcreteCommandPath,
        ConcreteEventPath, EventPathFilter, EventPriority, EventStatus, EventValue, Report,
    },
    schema::SchemaTree,
    status::StatusCode,
};

pub type InteractionId = u32;

/// One attribute write, optionally conditional on the live data version.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteItem {
    pub path: ConcreteAttributePath,
    pub value: Value,
    pub expected_version: Option<u32>,
}

impl WriteItem {
    pub fn new(path: ConcreteAttributePath, value: Value) -> Self {
        Self {
            path,
            value,
            expected_version: None,
        }
    }
    pub fn expect_version(mut self, version: u32) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Outcome of one command of an invoke.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResult {
    pub path: ConcreteCommandPath,
    pub status: StatusCode,
    pub cluster_status: Option<u8>,
    pub response: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Read,
    Subscribe {
        min_interval: u16,
        max_interval: u16,
        /// Max interval granted by the publisher once established.
        established: Option<u16>,
    },
    Write,
    Invoke,
}

struct ClientInteraction {
    kind: Kind,
    session_id: u16,
    exchange: Option<ExchangeKey>,
    /// Action sent once the preceding TimedRequest is accepted.
    timed_action: Option<Action>,
    awaiting_pull: bool,
    cancelled: bool,
    subscription_id: Option<u32>,
    liveness_deadline: Option<Instant>,
}

pub(crate) struct ClientInteractions {
    interactions: BTreeMap<InteractionId, ClientInteraction>,
    by_exchange: BTreeMap<ExchangeKey, InteractionId>,
    by_subscription: BTreeMap<u32, InteractionId>,
    next_id: InteractionId,
    grace: Duration,
    events: VecDeque<NodeEvent>,
}

fn concrete_attribute(f: &AttributePathFilter) -> Result<ConcreteAttributePath, DecodeError> {
    let mut path = f
        .as_concrete()
        .ok_or_else(|| DecodeError::MissingField("concrete attribute path".to_owned()))?;
    path.node_id = f.node_id;
    Ok(path)
}

fn concrete_event(f: &EventPathFilter) -> Result<ConcreteEventPath, DecodeError> {
    let mut path = f
        .as_concrete()
        .ok_or_else(|| DecodeError::MissingField("concrete event path".to_owned()))?;
    path.node_id = f.node_id;
    Ok(path)
}

fn attribute_report(schema: &SchemaTree, ib: &AttributeReportIb) -> Result<Report, DecodeError> {
    Ok(match ib {
        AttributeReportIb::Status(s) => Report::AttributeStatus(AttributeStatus {
            path: concrete_attribute(&s.path)?,
            status: s.status,
            cluster_status: s.cluster_status,
        }),
        AttributeReportIb::Data(d) => {
            let path = concrete_attribute(&d.path)?;
            let decoded = match schema.attribute(&path) {
                Ok(attr) => codec::from_item(&attr.value, &d.data),
                Err(_) => Ok(codec::decode_untyped(&d.data)),
            };
            match decoded {
                Ok(value) => Report::AttributeValue(AttributeValue {
                    path,
                    version: d.data_version.unwrap_or(0),
                    value,
                }),
                Err(e) => {
                    log::debug!("can't decode report for {}: {}", path, e);
                    Report::AttributeStatus(AttributeStatus {
                        path,
                        status: StatusCode::InvalidDataType,
                        cluster_status: None,
                    })
                }
            }
        }
    })
}

fn event_report(schema: &SchemaTree, ib: &EventReportIb) -> Result<Report, DecodeError> {
    Ok(match ib {
        EventReportIb::Status(s) => Report::EventStatus(EventStatus {
            path: concrete_event(&s.path)?,
            status: s.status,
            cluster_status: s.cluster_status,
        }),
        EventReportIb::Data(d) => {
            let path = concrete_event(&d.path)?;
            let decoded = match schema.event(&path) {
                Ok(ev) => codec::from_item(&ev.value, &d.data),
                Err(_) => Ok(codec::decode_untyped(&d.data)),
            };
            match decoded {
                Ok(value) => Report::EventValue(EventValue {
                    path,
                    number: d.number,
                    priority: EventPriority::from(d.priority),
                    timestamp: d.epoch_timestamp,
                    value,
                }),
                Err(e) => {
                    log::debug!("can't decode event {} #{}: {}", path, d.number, e);
                    Report::EventStatus(EventStatus {
                        path,
                        status: StatusCode::InvalidDataType,
                        cluster_status: None,
                    })
                }
            }
        }
    })
}

/// Converts the reports of one ReportData, keeping their order.
pub(crate) fn chunk_from_report(schema: &SchemaTree, report: &ReportData) -> Result<Chunk, DecodeError> {
    let mut chunk = Vec::with_capacity(report.attribute_reports.len() + report.event_reports.len());
    for a in &report.attribute_reports {
        chunk.push(attribute_report(schema, a)?);
    }
    for e in &report.event_reports {
        chunk.push(event_report(schema, e)?);
    }
    Ok(chunk)
}

fn invoke_result(schema: &SchemaTree, ib: &InvokeResponseIb) -> InvokeResult {
    match ib {
        InvokeResponseIb::Status {
            path,
            status,
            cluster_status,
            ..
        } => InvokeResult {
            path: *path,
            status: *status,
            cluster_status: *cluster_status,
            response: None,
        },
        InvokeResponseIb::Command(c) => {
            let node = schema
                .endpoint_cluster(c.path.endpoint_id, c.path.cluster_id)
                .ok()
                .and_then(|cluster| cluster.command_by_response(c.path.command_id))
                .and_then(|cmd| cmd.response.as_ref());
            let response = match node {
                Some(n) => codec::from_item(n, &c.fields).unwrap_or_else(|e| {
                    log::debug!("command response does not match schema: {}", e);
                    codec::decode_untyped(&c.fields)
                }),
                None => codec::decode_untyped(&c.fields),
            };
            InvokeResult {
                path: c.path,
                status: StatusCode::Success,
                cluster_status: None,
                response: Some(response),
            }
        }
    }
}

impl ClientInteractions {
    pub fn new(grace: Duration) -> Self {
        Self {
            interactions: BTreeMap::new(),
            by_exchange: BTreeMap::new(),
            by_subscription: BTreeMap::new(),
            next_id: 1,
            grace,
            events: VecDeque::new(),
        }
    }

    pub fn owns(&self, key: &ExchangeKey) -> bool {
        self.by_exchange.contains_key(key)
    }

    pub fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.pop_front()
    }

    fn start(
        &mut self,
        ctx: &mut Ctx,
        session_id: u16,
        kind: Kind,
        action: Action,
        timed: Option<u16>,
    ) -> ImResult<InteractionId> {
        let key = ctx.exchanges.open(session_id)?;
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let mut interaction = ClientInteraction {
            kind,
            session_id,
            exchange: Some(key),
            timed_action: None,
            awaiting_pull: false,
            cancelled: false,
            subscription_id: None,
            liveness_deadline: None,
        };
        let first = match timed {
            Some(ms) => {
                interaction.timed_action = Some(action);
                Action::TimedRequest(ms)
            }
            None => action,
        };
        if let Err(e) = send_action(ctx.exchanges, key, &first, ctx.now) {
            ctx.exchanges.close(key);
            return Err(e);
        }
        log::debug!("interaction {} started on {}", id, key);
        self.by_exchange.insert(key, id);
        self.interactions.insert(id, interaction);
        Ok(id)
    }

    pub fn read(&mut self, ctx: &mut Ctx, session_id: u16, request: ReadRequest) -> ImResult<InteractionId> {
        self.start(ctx, session_id, Kind::Read, Action::ReadRequest(request), None)
    }

    pub fn subscribe(&mut self, ctx: &mut Ctx, session_id: u16, request: SubscribeRequest) -> ImResult<InteractionId> {
        let kind = Kind::Subscribe {
            min_interval: request.min_interval_floor,
            max_interval: request.max_interval_ceiling,
            established: None,
        };
        self.start(ctx, session_id, kind, Action::SubscribeRequest(request), None)
    }

    pub fn write(
        &mut self,
        ctx: &mut Ctx,
        session_id: u16,
        items: &[WriteItem],
        atomic: bool,
        timed: Option<u16>,
    ) -> ImResult<InteractionId> {
        let mut writes = Vec::with_capacity(items.len());
        for w in items {
            let attr = ctx.schema.attribute(&w.path).map_err(ImError::Status)?;
            writes.push(AttributeDataIb {
                data_version: w.expected_version,
                path: w.path.into(),
                data: codec::to_item(&attr.value, None, &w.value)?.value,
            });
        }
        let request = WriteRequest {
            suppress_response: false,
            timed: timed.is_some(),
            writes,
            more_chunked: false,
            atomic,
        };
        self.start(ctx, session_id, Kind::Write, Action::WriteRequest(request), timed)
    }

    pub fn invoke(
        &mut self,
        ctx: &mut Ctx,
        session_id: u16,
        path: ConcreteCommandPath,
        payload: &Value,
        timed: Option<u16>,
    ) -> ImResult<InteractionId> {
        let command = ctx
            .schema
            .command(path.endpoint_id, path.cluster_id, path.command_id)
            .map_err(ImError::Status)?;
        let request = InvokeRequest {
            suppress_response: false,
            timed: timed.is_some(),
            commands: vec![CommandDataIb {
                path,
                fields: codec::to_item(&command.request, None, payload)?.value,
                command_ref: None,
            }],
        };
        self.start(ctx, session_id, Kind::Invoke, Action::InvokeRequest(request), timed)
    }

    /// Asks for the chunk following the last delivered one.
    pub fn pull(&mut self, ctx: &mut Ctx, id: InteractionId) -> ImResult<()> {
        let it = self.interactions.get_mut(&id).ok_or(ImError::UnknownInteraction)?;
        match it.exchange {
            Some(key) if it.awaiting_pull => {
                it.awaiting_pull = false;
                send_action(ctx.exchanges, key, &Action::StatusResponse(StatusCode::Success), ctx.now)
            }
            _ => Ok(()),
        }
    }

    /// Cooperative cancellation: no further events are delivered for `id`.
    pub fn cancel(&mut self, ctx: &mut Ctx, id: InteractionId) {
        let Some(it) = self.interactions.get_mut(&id) else {
            return;
        };
        let status = match it.kind {
            Kind::Subscribe { .. } => StatusCode::InvalidSubscription,
            _ => StatusCode::Failure,
        };
        match it.exchange {
            Some(key) if it.awaiting_pull => {
                if let Err(e) = send_action(ctx.exchanges, key, &Action::StatusResponse(status), ctx.now) {
                    log::debug!("can't signal cancel on {}: {}", key, e);
                }
                ctx.exchanges.close_when_acked(key);
                self.finish(id);
            }
            // answered when the peer's next message arrives
            Some(_) => it.cancelled = true,
            None => {
                self.finish(id);
            }
        }
        log::debug!("interaction {} cancelled", id);
    }

    fn finish(&mut self, id: InteractionId) -> Option<ClientInteraction> {
        let it = self.interactions.remove(&id)?;
        if let Some(key) = it.exchange {
            self.by_exchange.remove(&key);
        }
        if let Some(sid) = it.subscription_id {
            self.by_subscription.remove(&sid);
        }
        Some(it)
    }

    fn fail(&mut self, id: InteractionId, error: ImError) {
        if let Some(it) = self.finish(id) {
            if it.cancelled {
                return;
            }
            log::debug!("interaction {} failed: {}", id, error);
            self.events.push_back(NodeEvent::Failed { id, error });
        }
    }

    pub fn on_malformed(&mut self, ctx: &mut Ctx, key: ExchangeKey, error: DecodeError) -> ImResult<()> {
        let Some(&id) = self.by_exchange.get(&key) else {
            return Ok(());
        };
        self.fail(id, ImError::Decode(error));
        reject(ctx, key, StatusCode::InvalidAction)
    }

    pub fn on_action(&mut self, ctx: &mut Ctx, key: ExchangeKey, action: Action) -> ImResult<()> {
        let Some(&id) = self.by_exchange.get(&key) else {
            return Ok(());
        };
        let Some(it) = self.interactions.get_mut(&id) else {
            self.by_exchange.remove(&key);
            return Ok(());
        };
        log::debug!("interaction {} received {}", id, action.name());
        if it.cancelled {
            let status = match it.kind {
                Kind::Subscribe { .. } => StatusCode::InvalidSubscription,
                _ => StatusCode::Failure,
            };
            self.finish(id);
            return match action {
                Action::ReportData(r) if !r.suppress_response => reject(ctx, key, status),
                _ => {
                    ctx.exchanges.close(key);
                    Ok(())
                }
            };
        }
        match (it.kind, action) {
            (_, Action::StatusResponse(s)) if s.is_success() => match it.timed_action.take() {
                Some(a) => send_action(ctx.exchanges, key, &a, ctx.now),
                None => {
                    log::debug!("unexpected success status on {}", key);
                    Ok(())
                }
            },
            (kind, Action::StatusResponse(s)) => {
                let error = match (kind, s) {
                    (_, StatusCode::InvalidAction) => ImError::MalformedRequest,
                    (
                        Kind::Subscribe {
                            min_interval,
                            max_interval,
                            established: None,
                        },
                        StatusCode::ConstraintError,
                    ) => ImError::IntervalNegotiationFailed {
                        min: min_interval,
                        max: max_interval,
                    },
                    (_, s) => ImError::Cancelled(s),
                };
                ctx.exchanges.close(key);
                self.fail(id, error);
                Ok(())
            }
            (Kind::Read | Kind::Subscribe { .. }, Action::ReportData(r)) => self.on_report(ctx, id, key, r),
            (
                Kind::Subscribe {
                    min_interval,
                    established: None,
                    ..
                },
                Action::SubscribeResponse(r),
            ) => {
                it.kind = Kind::Subscribe {
                    min_interval,
                    max_interval: r.max_interval,
                    established: Some(r.max_interval),
                };
                it.exchange = None;
                it.liveness_deadline = Some(ctx.now + Duration::from_secs(r.max_interval as u64) + self.grace);
                if it.subscription_id.is_none() {
                    it.subscription_id = Some(r.subscription_id);
                    self.by_subscription.insert(r.subscription_id, id);
                }
                self.by_exchange.remove(&key);
                ctx.exchanges.close(key);
                log::debug!("subscription {} established, max interval {}s", r.subscription_id, r.max_interval);
                self.events.push_back(NodeEvent::SubscriptionEstablished {
                    id,
                    subscription_id: r.subscription_id,
                    max_interval: r.max_interval,
                });
                Ok(())
            }
            (Kind::Write, Action::WriteResponse(w)) => {
                let statuses = w
                    .statuses
                    .iter()
                    .filter_map(|s| {
                        Some(AttributeStatus {
                            path: concrete_attribute(&s.path).ok()?,
                            status: s.status,
                            cluster_status: s.cluster_status,
                        })
                    })
                    .collect();
                self.finish(id);
                ctx.exchanges.close(key);
                self.events.push_back(NodeEvent::WriteCompleted { id, statuses });
                Ok(())
            }
            (Kind::Invoke, Action::InvokeResponse(i)) => {
                let results = i.responses.iter().map(|r| invoke_result(ctx.schema, r)).collect();
                self.finish(id);
                ctx.exchanges.close(key);
                self.events.push_back(NodeEvent::InvokeCompleted { id, results });
                Ok(())
            }
            (_, other) => {
                self.fail(id, ImError::Wire(format!("unexpected {}", other.name())));
                reject(ctx, key, StatusCode::InvalidAction)
            }
        }
    }

    /// ReportData on an exchange opened by the publisher for an established subscription.
    pub fn on_subscription_report(&mut self, ctx: &mut Ctx, key: ExchangeKey, report: ReportData) -> ImResult<()> {
        let target = report
            .subscription_id
            .and_then(|sid| self.by_subscription.get(&sid).copied());
        let Some(id) = target else {
            log::debug!("report for unknown subscription {:?}", report.subscription_id);
            return reject(ctx, key, StatusCode::InvalidSubscription);
        };
        if let Some(it) = self.interactions.get_mut(&id) {
            if let Some(previous) = it.exchange.replace(key) {
                self.by_exchange.remove(&previous);
            }
            it.awaiting_pull = false;
        }
        self.by_exchange.insert(key, id);
        self.on_report(ctx, id, key, report)
    }

    fn on_report(&mut self, ctx: &mut Ctx, id: InteractionId, key: ExchangeKey, report: ReportData) -> ImResult<()> {
        let chunk = match chunk_from_report(ctx.schema, &report) {
            Ok(c) => c,
            Err(e) => {
                self.fail(id, ImError::Decode(e));
                return reject(ctx, key, StatusCode::InvalidAction);
            }
        };
        let Some(it) = self.interactions.get_mut(&id) else {
            return Ok(());
        };
        if let (Kind::Subscribe { .. }, Some(sid), None) = (it.kind, report.subscription_id, it.subscription_id) {
            it.subscription_id = Some(sid);
            self.by_subscription.insert(sid, id);
        }
        if let Kind::Subscribe {
            established: Some(max), ..
        } = it.kind
        {
            it.liveness_deadline = Some(ctx.now + Duration::from_secs(max as u64) + self.grace);
        }
        let more = report.more_chunked;
        self.events.push_back(NodeEvent::Chunk { id, chunk, more });
        if more {
            it.awaiting_pull = true;
            return Ok(());
        }
        if !report.suppress_response {
            send_action(ctx.exchanges, key, &Action::StatusResponse(StatusCode::Success), ctx.now)?;
        }
        match it.kind {
            Kind::Read => {
                if report.suppress_response {
                    ctx.exchanges.close(key);
                } else {
                    ctx.exchanges.close_when_acked(key);
                }
                self.finish(id);
            }
            Kind::Subscribe {
                established: Some(_), ..
            } => {
                it.exchange = None;
                self.by_exchange.remove(&key);
                ctx.exchanges.close_when_acked(key);
            }
            // priming done, SubscribeResponse follows on this exchange
            _ => {}
        }
        Ok(())
    }

    pub fn on_closed(&mut self, key: &ExchangeKey, reason: CloseReason) {
        let Some(&id) = self.by_exchange.get(key) else {
            return;
        };
        let error = match reason {
            CloseReason::Timeout => ImError::Timeout,
            CloseReason::SessionClosed => ImError::SessionClosed,
        };
        self.fail(id, error);
    }

    /// Subscriber liveness and sessions that went away.
    pub fn poll(&mut self, ctx: &mut Ctx) {
        let now = ctx.now;
        let failed: Vec<(InteractionId, ImError)> = self
            .interactions
            .iter()
            .filter_map(|(id, it)| {
                if ctx.exchanges.session(it.session_id).is_none() {
                    Some((*id, ImError::SessionClosed))
                } else if it.liveness_deadline.is_some_and(|d| d <= now) {
                    Some((*id, ImError::Timeout))
                } else {
                    None
                }
            })
            .collect();
        for (id, error) in failed {
            if let Some(key) = self.interactions.get(&id).and_then(|it| it.exchange) {
                ctx.exchanges.close(key);
            }
            self.fail(id, error);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.interactions.values().filter_map(|it| it.liveness_deadline).min()
    }
}
