//! Server side of the interaction model: reads, writes, invokes and timed requests.
//!
//! Reports are produced lazily. A [ReportStream] keeps the resolved concrete paths and
//! only reads values from the data model when the next chunk is requested, so the
//! number of paths in one read does not bound memory use of the encoded reports.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use crate::{
    codec::{self, Value},
    config::NodeConfig,
    datamodel::DataModel,
    error::{DecodeError, EncodeError, ImResult},
    exchange::{ExchangeKey, ExchangeManager},
    messages::{
        Action, AttributeDataIb, AttributeReportIb, AttributeStatusIb, CommandDataIb, EventDataIb, EventReportIb,
        EventStatusIb, InvokeRequest, InvokeResponse, InvokeResponseIb, ReadRequest, ReportData, WriteRequest,
        WriteResponse,
    },
    report::{ConcreteAttributePath, ConcreteCommandPath, ConcreteEventPath, EventPathFilter},
    schema::SchemaTree,
    status::StatusCode,
};

/// Timed windows are dropped this long after they expired when no action arrived.
const TIMED_LINGER: Duration = Duration::from_secs(10);
/// A chunked read is abandoned when the reader asks for nothing within this time.
pub(crate) const READ_IDLE: Duration = Duration::from_secs(30);

/// Everything a handler needs for one step of the event loop.
pub(crate) struct Ctx<'a> {
    pub exchanges: &'a mut ExchangeManager,
    pub schema: &'a SchemaTree,
    pub data: &'a mut dyn DataModel,
    pub config: &'a NodeConfig,
    pub now: Instant,
}

pub(crate) fn send_action(exchanges: &mut ExchangeManager, key: ExchangeKey, action: &Action, now: Instant) -> ImResult<()> {
    log::debug!("send {} on {}", action.name(), key);
    exchanges.send(key, action.opcode(), action.encode()?, now)
}

/// Answers with a status and ends the exchange.
pub(crate) fn reject(ctx: &mut Ctx, key: ExchangeKey, status: StatusCode) -> ImResult<()> {
    send_action(ctx.exchanges, key, &Action::StatusResponse(status), ctx.now)?;
    ctx.exchanges.close_when_acked(key);
    Ok(())
}

pub(crate) fn event_filter(path: &ConcreteEventPath) -> EventPathFilter {
    EventPathFilter {
        node_id: path.node_id,
        ..EventPathFilter::concrete(path.endpoint_id, path.cluster_id, path.event_id)
    }
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Attribute(ConcreteAttributePath, Option<StatusCode>),
    Event(ConcreteEventPath, Option<StatusCode>),
}

#[derive(Debug, Clone)]
enum ReportIb {
    Attribute(AttributeReportIb),
    Event(EventReportIb),
}

impl ReportIb {
    fn encoded_len(&self) -> Result<usize, EncodeError> {
        let item = match self {
            ReportIb::Attribute(a) => a.to_tlv(),
            ReportIb::Event(e) => e.to_tlv(),
        };
        Ok(item.encode()?.len())
    }
}

/// Reports still to be sent for one read or subscription report.
pub(crate) struct ReportStream {
    subscription_id: Option<u32>,
    pending: VecDeque<Pending>,
    /// Materialized reports that did not fit into the previous chunk.
    ready: VecDeque<ReportIb>,
    event_min: u64,
    last_event: Option<u64>,
    reported_versions: Vec<(ConcreteAttributePath, u32)>,
}

impl ReportStream {
    pub fn new(
        subscription_id: Option<u32>,
        attributes: BTreeMap<ConcreteAttributePath, Option<StatusCode>>,
        events: BTreeMap<ConcreteEventPath, Option<StatusCode>>,
        event_min: Option<u64>,
    ) -> Self {
        let pending = attributes
            .into_iter()
            .map(|(p, s)| Pending::Attribute(p, s))
            .chain(events.into_iter().map(|(p, s)| Pending::Event(p, s)))
            .collect();
        Self {
            subscription_id,
            pending,
            ready: VecDeque::new(),
            event_min: event_min.unwrap_or(0),
            last_event: None,
            reported_versions: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    /// Highest event number sent so far.
    pub fn last_event(&self) -> Option<u64> {
        self.last_event
    }

    pub fn take_reported_versions(&mut self) -> Vec<(ConcreteAttributePath, u32)> {
        std::mem::take(&mut self.reported_versions)
    }

    fn materialize(&mut self, p: Pending, schema: &SchemaTree, data: &dyn DataModel) {
        match p {
            Pending::Attribute(path, status) => {
                let ib = match status {
                    Some(status) => attribute_status(&path, status),
                    None => read_attribute(&path, schema, data).unwrap_or_else(|status| attribute_status(&path, status)),
                };
                self.ready.push_back(ReportIb::Attribute(ib));
            }
            Pending::Event(path, Some(status)) => self.ready.push_back(ReportIb::Event(event_status(&path, status))),
            Pending::Event(path, None) => {
                let node = match schema.event(&path) {
                    Ok(e) => &e.value,
                    Err(status) => {
                        self.ready.push_back(ReportIb::Event(event_status(&path, status)));
                        return;
                    }
                };
                for e in data.read_events(&path, self.event_min) {
                    let ib = match codec::to_item(node, None, &e.value) {
                        Ok(item) => EventReportIb::Data(EventDataIb {
                            path: event_filter(&path),
                            number: e.number,
                            priority: e.priority as u8,
                            epoch_timestamp: e.timestamp,
                            data: item.value,
                        }),
                        Err(err) => {
                            log::debug!("can't encode event {} #{}: {}", path, e.number, err);
                            event_status(&path, StatusCode::Failure)
                        }
                    };
                    self.ready.push_back(ReportIb::Event(ib));
                }
            }
        }
    }

    fn next_report(&mut self, schema: &SchemaTree, data: &dyn DataModel) -> Option<ReportIb> {
        loop {
            if let Some(r) = self.ready.pop_front() {
                return Some(r);
            }
            let p = self.pending.pop_front()?;
            self.materialize(p, schema, data);
        }
    }

    /// Builds the next ReportData whose encoded payload stays within `max_payload`.
    ///
    /// A report is never split; a single report larger than the budget goes out alone.
    pub fn next_chunk(
        &mut self,
        schema: &SchemaTree,
        data: &dyn DataModel,
        max_payload: usize,
    ) -> Result<ReportData, EncodeError> {
        let budget = max_payload.saturating_sub(ReportData::envelope_len(self.subscription_id.is_some()));
        let mut used = 0;
        let mut out = ReportData {
            subscription_id: self.subscription_id,
            ..Default::default()
        };
        while let Some(report) = self.next_report(schema, data) {
            let len = report.encoded_len()?;
            let empty = out.attribute_reports.is_empty() && out.event_reports.is_empty();
            if !empty && used + len > budget {
                self.ready.push_front(report);
                break;
            }
            used += len;
            match report {
                ReportIb::Attribute(a) => {
                    if let AttributeReportIb::Data(d) = &a {
                        if let (Some(path), Some(version)) = (d.path.as_concrete(), d.data_version) {
                            self.reported_versions.push((path, version));
                        }
                    }
                    out.attribute_reports.push(a)
                }
                ReportIb::Event(e) => {
                    if let EventReportIb::Data(d) = &e {
                        self.last_event = Some(self.last_event.map_or(d.number, |n| n.max(d.number)));
                    }
                    out.event_reports.push(e)
                }
            }
        }
        out.more_chunked = !self.is_done();
        out.suppress_response = self.subscription_id.is_none() && !out.more_chunked;
        log::trace!(
            "chunk with {} attribute and {} event reports, {} bytes, more:{}",
            out.attribute_reports.len(),
            out.event_reports.len(),
            used,
            out.more_chunked
        );
        Ok(out)
    }
}

fn attribute_status(path: &ConcreteAttributePath, status: StatusCode) -> AttributeReportIb {
    AttributeReportIb::Status(AttributeStatusIb {
        path: (*path).into(),
        status,
        cluster_status: None,
    })
}

fn event_status(path: &ConcreteEventPath, status: StatusCode) -> EventReportIb {
    EventReportIb::Status(EventStatusIb {
        path: event_filter(path),
        status,
        cluster_status: None,
    })
}

fn read_attribute(
    path: &ConcreteAttributePath,
    schema: &SchemaTree,
    data: &dyn DataModel,
) -> Result<AttributeReportIb, StatusCode> {
    let attr = schema.attribute(path)?;
    let (value, version) = data.read(path)?;
    let item = codec::to_item(&attr.value, None, &value).map_err(|e| {
        log::debug!("can't encode {}: {}", path, e);
        StatusCode::Failure
    })?;
    Ok(AttributeReportIb::Data(AttributeDataIb {
        data_version: Some(version),
        path: (*path).into(),
        data: item.value,
    }))
}

fn decode_status(e: &DecodeError) -> StatusCode {
    match e {
        DecodeError::DatatypeMismatch { .. } => StatusCode::InvalidDataType,
        _ => StatusCode::ConstraintError,
    }
}

/// Checks a single write in the order existence, writability, value, data version.
///
/// `earlier` counts accepted writes to the same path ahead of this one in an atomic batch;
/// the expected version is compared against the version those writes will leave behind.
fn validate_write(
    schema: &SchemaTree,
    data: &dyn DataModel,
    write: &AttributeDataIb,
    earlier: u32,
) -> Result<(ConcreteAttributePath, Value), StatusCode> {
    let path = write.path.as_concrete().ok_or(StatusCode::InvalidAction)?;
    let attr = schema.attribute(&path)?;
    if !attr.writable {
        return Err(StatusCode::UnsupportedWrite);
    }
    let value = codec::from_item(&attr.value, &write.data).map_err(|e| {
        log::debug!("write to {} rejected: {}", path, e);
        decode_status(&e)
    })?;
    match write.data_version {
        Some(expected) if earlier > 0 => {
            let (_, live) = data.read(&path)?;
            if expected != live.wrapping_add(earlier) {
                return Err(StatusCode::DataVersionMismatch);
            }
        }
        expected => data.check_write(&path, expected)?,
    }
    Ok((path, value))
}

/// Applies writes in request order and returns one status per write.
///
/// In atomic mode nothing is applied unless every write validates; failing writes then
/// report their own status and the others `Failure`.
pub(crate) fn apply_writes(
    schema: &SchemaTree,
    data: &mut dyn DataModel,
    writes: &[AttributeDataIb],
    atomic: bool,
) -> Vec<AttributeStatusIb> {
    let status_ib = |w: &AttributeDataIb, status: StatusCode| AttributeStatusIb {
        path: w.path,
        status,
        cluster_status: None,
    };
    if atomic {
        let mut staged: BTreeMap<ConcreteAttributePath, u32> = BTreeMap::new();
        let checked: Vec<_> = writes
            .iter()
            .map(|w| {
                let earlier = w.path.as_concrete().and_then(|p| staged.get(&p).copied()).unwrap_or(0);
                let r = validate_write(schema, &*data, w, earlier);
                if let Ok((path, _)) = &r {
                    *staged.entry(*path).or_default() += 1;
                }
                r
            })
            .collect();
        if checked.iter().any(|r| r.is_err()) {
            return writes
                .iter()
                .zip(checked)
                .map(|(w, r)| status_ib(w, r.err().unwrap_or(StatusCode::Failure)))
                .collect();
        }
        return writes
            .iter()
            .zip(checked)
            .map(|(w, r)| {
                let status = match r {
                    Ok((path, value)) => match data.write(&path, value, w.data_version) {
                        Ok(_) => StatusCode::Success,
                        Err(s) => {
                            log::warn!("validated atomic write to {} failed with {}", path, s);
                            s
                        }
                    },
                    Err(s) => s,
                };
                status_ib(w, status)
            })
            .collect();
    }
    writes
        .iter()
        .map(|w| {
            let status = match validate_write(schema, &*data, w, 0) {
                Ok((path, value)) => match data.write(&path, value, w.data_version) {
                    Ok(version) => {
                        log::debug!("wrote {} version {}", path, version);
                        StatusCode::Success
                    }
                    Err(s) => s,
                },
                Err(s) => s,
            };
            status_ib(w, status)
        })
        .collect()
}

/// Runs one command and builds its response entry.
pub(crate) fn invoke_command(schema: &SchemaTree, data: &mut dyn DataModel, cmd: &CommandDataIb) -> InvokeResponseIb {
    let status = |status: StatusCode| InvokeResponseIb::Status {
        path: cmd.path,
        status,
        cluster_status: None,
        command_ref: cmd.command_ref,
    };
    let p = cmd.path;
    let command = match schema.command(p.endpoint_id, p.cluster_id, p.command_id) {
        Ok(c) => c,
        Err(s) => return status(s),
    };
    let payload = match codec::from_item(&command.request, &cmd.fields) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("command {} payload rejected: {}", command.name, e);
            return status(match e {
                DecodeError::OutOfRange { .. } => StatusCode::ConstraintError,
                _ => StatusCode::InvalidCommand,
            });
        }
    };
    match data.invoke(&p, &payload) {
        Ok(None) => status(StatusCode::Success),
        Ok(Some(response)) => {
            let (Some(node), Some(response_id)) = (&command.response, command.response_id) else {
                log::debug!("command {} has no response schema, dropping response", command.name);
                return status(StatusCode::Success);
            };
            match codec::to_item(node, None, &response) {
                Ok(item) => InvokeResponseIb::Command(CommandDataIb {
                    path: ConcreteCommandPath::new(p.endpoint_id, p.cluster_id, response_id),
                    fields: item.value,
                    command_ref: cmd.command_ref,
                }),
                Err(e) => {
                    log::debug!("can't encode response of {}: {}", command.name, e);
                    status(StatusCode::Failure)
                }
            }
        }
        Err(s) => status(s),
    }
}

enum ServerState {
    /// Chunk sent, the rest goes out as the reader asks for it before `idle_until`.
    Reading { stream: ReportStream, idle_until: Instant },
    /// TimedRequest accepted; the action must arrive before the deadline.
    Timed { deadline: Instant },
}

impl ServerState {
    fn expires_at(&self) -> Instant {
        match self {
            ServerState::Reading { idle_until, .. } => *idle_until,
            ServerState::Timed { deadline } => *deadline + TIMED_LINGER,
        }
    }
}

/// Responder side state of read, write, invoke and timed exchanges.
#[derive(Default)]
pub(crate) struct InteractionEngine {
    states: BTreeMap<ExchangeKey, ServerState>,
}

impl InteractionEngine {
    pub fn owns(&self, key: &ExchangeKey) -> bool {
        self.states.contains_key(key)
    }

    pub fn on_action(&mut self, ctx: &mut Ctx, key: ExchangeKey, action: Action) -> ImResult<()> {
        log::debug!("received {} on {}", action.name(), key);
        let timed = match self.states.remove(&key) {
            Some(ServerState::Reading { stream, .. }) => return self.continue_read(ctx, key, stream, action),
            Some(ServerState::Timed { deadline }) => Some(deadline),
            None => None,
        };
        match action {
            Action::ReadRequest(r) => self.read(ctx, key, r),
            Action::WriteRequest(w) => match timed_status(timed, w.timed, ctx.now) {
                Some(status) => reject(ctx, key, status),
                None => self.write(ctx, key, w),
            },
            Action::InvokeRequest(i) => match timed_status(timed, i.timed, ctx.now) {
                Some(status) => reject(ctx, key, status),
                None => self.invoke(ctx, key, i),
            },
            Action::TimedRequest(ms) if timed.is_none() => {
                let deadline = ctx.now + Duration::from_millis(ms as u64);
                self.states.insert(key, ServerState::Timed { deadline });
                send_action(ctx.exchanges, key, &Action::StatusResponse(StatusCode::Success), ctx.now)
            }
            other => {
                log::debug!("unexpected {} on {}", other.name(), key);
                reject(ctx, key, StatusCode::InvalidAction)
            }
        }
    }

    fn read(&mut self, ctx: &mut Ctx, key: ExchangeKey, req: ReadRequest) -> ImResult<()> {
        let attributes = ctx.schema.expand_attributes(&req.attribute_paths);
        let events = ctx.schema.expand_events(&req.event_paths);
        log::debug!("read of {} attribute and {} event paths", attributes.len(), events.len());
        let stream = ReportStream::new(None, attributes, events, req.event_min);
        self.send_chunk(ctx, key, stream)
    }

    fn send_chunk(&mut self, ctx: &mut Ctx, key: ExchangeKey, mut stream: ReportStream) -> ImResult<()> {
        let report = stream.next_chunk(ctx.schema, &*ctx.data, ctx.config.max_payload_size)?;
        let more = report.more_chunked;
        send_action(ctx.exchanges, key, &Action::ReportData(report), ctx.now)?;
        if more {
            let idle_until = ctx.now + READ_IDLE;
            self.states.insert(key, ServerState::Reading { stream, idle_until });
        } else {
            ctx.exchanges.close_when_acked(key);
        }
        Ok(())
    }

    fn continue_read(&mut self, ctx: &mut Ctx, key: ExchangeKey, stream: ReportStream, action: Action) -> ImResult<()> {
        match action {
            Action::StatusResponse(s) if s.is_success() => self.send_chunk(ctx, key, stream),
            Action::StatusResponse(s) => {
                log::debug!("reader ended {} with {}", key, s);
                ctx.exchanges.close(key);
                Ok(())
            }
            other => {
                log::debug!("expected status response on {}, got {}", key, other.name());
                reject(ctx, key, StatusCode::InvalidAction)
            }
        }
    }

    fn write(&mut self, ctx: &mut Ctx, key: ExchangeKey, req: WriteRequest) -> ImResult<()> {
        if req.more_chunked {
            log::debug!("chunked write requests are not supported");
            return reject(ctx, key, StatusCode::InvalidAction);
        }
        let statuses = apply_writes(ctx.schema, ctx.data, &req.writes, req.atomic);
        if req.suppress_response {
            ctx.exchanges.close(key);
            return Ok(());
        }
        send_action(ctx.exchanges, key, &Action::WriteResponse(WriteResponse { statuses }), ctx.now)?;
        ctx.exchanges.close_when_acked(key);
        Ok(())
    }

    fn invoke(&mut self, ctx: &mut Ctx, key: ExchangeKey, req: InvokeRequest) -> ImResult<()> {
        let responses: Vec<InvokeResponseIb> = req
            .commands
            .iter()
            .map(|c| invoke_command(ctx.schema, ctx.data, c))
            .collect();
        if req.suppress_response {
            ctx.exchanges.close(key);
            return Ok(());
        }
        let response = InvokeResponse {
            suppress_response: false,
            responses,
            more_chunked: false,
        };
        send_action(ctx.exchanges, key, &Action::InvokeResponse(response), ctx.now)?;
        ctx.exchanges.close_when_acked(key);
        Ok(())
    }

    pub fn on_closed(&mut self, key: &ExchangeKey) {
        if self.states.remove(key).is_some() {
            log::debug!("dropped interaction state of closed exchange {}", key);
        }
    }

    /// Drops timed windows nobody used and reads nobody pulls.
    pub fn poll(&mut self, exchanges: &mut ExchangeManager, now: Instant) {
        let expired: Vec<ExchangeKey> = self
            .states
            .iter()
            .filter(|(_, s)| s.expires_at() <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.states.remove(&key);
            log::debug!("abandoned idle exchange {}", key);
            exchanges.close(key);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.states.values().map(ServerState::expires_at).min()
    }
}

/// Status to reject an action with, given the timed window state of its exchange.
fn timed_status(deadline: Option<Instant>, timed_flag: bool, now: Instant) -> Option<StatusCode> {
    match (deadline, timed_flag) {
        (Some(deadline), true) if now > deadline => Some(StatusCode::Timeout),
        (Some(_), true) | (None, false) => None,
        _ => Some(StatusCode::TimedRequestMismatch),
    }
}
