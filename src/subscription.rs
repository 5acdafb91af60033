//! Publisher side subscriptions: priming, change coalescing, keep-alives and liveness.
//!
//! Report times are kept in one queue ordered by (due time, subscription id) and fired
//! from [SubscriptionManager::poll], so scheduling is deterministic for a given clock.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use crate::{
    config::SubscriptionLimits,
    datamodel::Change,
    error::ImResult,
    exchange::{CloseReason, ExchangeKey},
    interaction::{reject, send_action, Ctx, ReportStream},
    messages::{Action, SubscribeRequest, SubscribeResponse},
    report::{AttributePathFilter, ConcreteAttributePath, ConcreteEventPath, EventPathFilter},
    status::StatusCode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Initial report being delivered.
    Priming,
    Active,
    /// Cancelled, timed out or never existed; nothing is kept for it.
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Cancelled locally.
    Cancelled,
    /// Subscriber answered a report with an error status.
    PeerCancelled(StatusCode),
    /// Reports were not acknowledged in time.
    LivenessTimeout,
    SessionClosed,
    /// Replaced by a new subscribe request that did not keep subscriptions.
    Replaced,
}

struct Subscription {
    session_id: u16,
    attribute_filters: Vec<AttributePathFilter>,
    event_filters: Vec<EventPathFilter>,
    event_min: Option<u64>,
    min_interval: Duration,
    max_interval: Duration,
    state: SubscriptionState,
    /// Changed paths to put into the next report, with the newest version or event number.
    dirty: BTreeMap<ConcreteAttributePath, u32>,
    dirty_events: BTreeMap<ConcreteEventPath, u64>,
    reported_versions: BTreeMap<ConcreteAttributePath, u32>,
    last_report: Instant,
    scheduled: Option<Instant>,
    /// Exchange carrying the report currently being delivered.
    in_flight: Option<(ExchangeKey, ReportStream)>,
    liveness_deadline: Option<Instant>,
}

impl Subscription {
    fn has_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.dirty_events.is_empty()
    }
}

pub(crate) struct SubscriptionManager {
    limits: SubscriptionLimits,
    subscriptions: BTreeMap<u32, Subscription>,
    by_exchange: BTreeMap<ExchangeKey, u32>,
    queue: BTreeSet<(Instant, u32)>,
    next_id: u32,
    terminated: Vec<(u32, TerminationReason)>,
}

impl SubscriptionManager {
    pub fn new(limits: SubscriptionLimits) -> Self {
        Self {
            limits,
            subscriptions: BTreeMap::new(),
            by_exchange: BTreeMap::new(),
            queue: BTreeSet::new(),
            next_id: rand::random::<u32>() >> 8,
            terminated: Vec::new(),
        }
    }

    pub fn owns(&self, key: &ExchangeKey) -> bool {
        self.by_exchange.contains_key(key)
    }

    pub fn state(&self, id: u32) -> SubscriptionState {
        self.subscriptions
            .get(&id)
            .map_or(SubscriptionState::Terminated, |s| s.state)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.subscriptions.keys().copied().collect()
    }

    /// Subscriptions ended since the last call.
    pub fn take_terminated(&mut self) -> Vec<(u32, TerminationReason)> {
        std::mem::take(&mut self.terminated)
    }

    /// Chosen (min, max) interval in seconds, or None when the request is outside the limits.
    fn negotiate(&self, req: &SubscribeRequest) -> Option<(u16, u16)> {
        let min = req.min_interval_floor;
        let max = req.max_interval_ceiling;
        if min > max
            || max == 0
            || min < self.limits.min_interval_floor_s
            || max > self.limits.max_interval_ceiling_s
        {
            return None;
        }
        Some((min, max))
    }

    pub fn subscribe(&mut self, ctx: &mut Ctx, key: ExchangeKey, req: SubscribeRequest) -> ImResult<()> {
        let Some((min, max)) = self.negotiate(&req) else {
            log::debug!(
                "subscribe interval {}..{} outside {}..{}",
                req.min_interval_floor,
                req.max_interval_ceiling,
                self.limits.min_interval_floor_s,
                self.limits.max_interval_ceiling_s
            );
            return reject(ctx, key, StatusCode::ConstraintError);
        };
        if !req.keep_subscriptions {
            let replaced: Vec<u32> = self
                .subscriptions
                .iter()
                .filter(|(_, s)| s.session_id == key.session_id)
                .map(|(id, _)| *id)
                .collect();
            for id in replaced {
                self.terminate(ctx, id, TerminationReason::Replaced);
            }
        }
        if self.subscriptions.len() >= self.limits.max_subscriptions {
            return reject(ctx, key, StatusCode::ResourceExhausted);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let attributes = ctx.schema.expand_attributes(&req.attribute_paths);
        let events = ctx.schema.expand_events(&req.event_paths);
        log::debug!(
            "subscription {} on session {}: {} attribute and {} event paths, interval {}..{}s",
            id,
            key.session_id,
            attributes.len(),
            events.len(),
            min,
            max
        );
        let stream = ReportStream::new(Some(id), attributes, events, req.event_min);
        self.subscriptions.insert(
            id,
            Subscription {
                session_id: key.session_id,
                attribute_filters: req.attribute_paths,
                event_filters: req.event_paths,
                event_min: req.event_min,
                min_interval: Duration::from_secs(min as u64),
                max_interval: Duration::from_secs(max as u64),
                state: SubscriptionState::Priming,
                dirty: BTreeMap::new(),
                dirty_events: BTreeMap::new(),
                reported_versions: BTreeMap::new(),
                last_report: ctx.now,
                scheduled: None,
                in_flight: None,
                liveness_deadline: None,
            },
        );
        self.send_chunk(ctx, id, key, stream)
    }

    fn send_chunk(&mut self, ctx: &mut Ctx, id: u32, key: ExchangeKey, mut stream: ReportStream) -> ImResult<()> {
        let liveness_factor = self.limits.liveness_factor;
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return Ok(());
        };
        let report = match stream.next_chunk(ctx.schema, &*ctx.data, ctx.config.max_payload_size) {
            Ok(r) => r,
            Err(e) => {
                log::debug!("can't build report for subscription {}: {}", id, e);
                ctx.exchanges.close(key);
                self.terminate(ctx, id, TerminationReason::Cancelled);
                return Err(e.into());
            }
        };
        for (path, version) in stream.take_reported_versions() {
            sub.reported_versions.insert(path, version);
        }
        if let Some(n) = stream.last_event() {
            sub.event_min = Some(n + 1);
        }
        // changes this chunk already carried
        let reported = &sub.reported_versions;
        sub.dirty
            .retain(|path, version| !reported.get(path).is_some_and(|v| v >= version));
        if let Some(min) = sub.event_min {
            sub.dirty_events.retain(|_, number| *number >= min);
        }
        if sub.liveness_deadline.is_none() {
            sub.liveness_deadline = Some(ctx.now + sub.max_interval * liveness_factor);
        }
        sub.in_flight = Some((key, stream));
        self.by_exchange.insert(key, id);
        send_action(ctx.exchanges, key, &Action::ReportData(report), ctx.now)
    }

    /// Status response from the subscriber on a report exchange.
    pub fn on_action(&mut self, ctx: &mut Ctx, key: ExchangeKey, action: Action) -> ImResult<()> {
        let Some(id) = self.by_exchange.remove(&key) else {
            return Ok(());
        };
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return Ok(());
        };
        let stream = match sub.in_flight.take() {
            Some((k, stream)) if k == key => stream,
            other => {
                sub.in_flight = other;
                return Ok(());
            }
        };
        match action {
            Action::StatusResponse(s) if s.is_success() => {
                sub.liveness_deadline = None;
                if !stream.is_done() {
                    return self.send_chunk(ctx, id, key, stream);
                }
                sub.last_report = ctx.now;
                if sub.state == SubscriptionState::Priming {
                    sub.state = SubscriptionState::Active;
                    let response = SubscribeResponse {
                        subscription_id: id,
                        max_interval: sub.max_interval.as_secs() as u16,
                    };
                    log::debug!("subscription {} active", id);
                    send_action(ctx.exchanges, key, &Action::SubscribeResponse(response), ctx.now)?;
                    ctx.exchanges.close_when_acked(key);
                } else {
                    ctx.exchanges.close(key);
                }
                self.schedule(id, ctx.now);
                Ok(())
            }
            Action::StatusResponse(s) => {
                log::debug!("subscriber ended subscription {} with {}", id, s);
                ctx.exchanges.close(key);
                self.terminate(ctx, id, TerminationReason::PeerCancelled(s));
                Ok(())
            }
            other => {
                log::debug!("unexpected {} on report exchange {}", other.name(), key);
                self.terminate(ctx, id, TerminationReason::PeerCancelled(StatusCode::InvalidAction));
                reject(ctx, key, StatusCode::InvalidAction)
            }
        }
    }

    /// Undecodable message on a report exchange; the caller answers it.
    pub fn abort(&mut self, ctx: &mut Ctx, key: &ExchangeKey) {
        if let Some(id) = self.by_exchange.remove(key) {
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                sub.in_flight = None;
            }
            self.terminate(ctx, id, TerminationReason::PeerCancelled(StatusCode::InvalidAction));
        }
    }

    /// Marks changed paths on every subscription whose filters match.
    pub fn on_change(&mut self, change: &Change, now: Instant) {
        let mut touched = Vec::new();
        for (id, sub) in self.subscriptions.iter_mut() {
            let hit = match change {
                Change::Attribute { path, version } => {
                    let stale = sub.reported_versions.get(path).is_some_and(|v| v >= version);
                    let matched = !stale && sub.attribute_filters.iter().any(|f| f.matches(path));
                    if matched {
                        sub.dirty.insert(*path, *version);
                    }
                    matched
                }
                Change::Event { path, number } => {
                    let matched = sub.event_min.map_or(true, |min| *number >= min)
                        && sub.event_filters.iter().any(|f| f.matches(path));
                    if matched {
                        sub.dirty_events.insert(*path, *number);
                    }
                    matched
                }
            };
            if hit && sub.state == SubscriptionState::Active && sub.in_flight.is_none() {
                touched.push(*id);
            }
        }
        for id in touched {
            self.schedule(id, now);
        }
    }

    /// Next report time: after min interval when something changed, else the keep-alive.
    fn schedule(&mut self, id: u32, now: Instant) {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return;
        };
        if let Some(t) = sub.scheduled.take() {
            self.queue.remove(&(t, id));
        }
        let due = if sub.has_changes() {
            (sub.last_report + sub.min_interval).max(now)
        } else {
            sub.last_report + sub.max_interval
        };
        log::trace!("subscription {} next report in {:?}", id, due.saturating_duration_since(now));
        sub.scheduled = Some(due);
        self.queue.insert((due, id));
    }

    fn fire(&mut self, ctx: &mut Ctx, id: u32) -> ImResult<()> {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return Ok(());
        };
        sub.scheduled = None;
        if sub.state != SubscriptionState::Active || sub.in_flight.is_some() {
            return Ok(());
        }
        let attributes = std::mem::take(&mut sub.dirty).into_keys().map(|p| (p, None)).collect();
        let events = std::mem::take(&mut sub.dirty_events).into_keys().map(|p| (p, None)).collect();
        let stream = ReportStream::new(Some(id), attributes, events, sub.event_min);
        let session_id = sub.session_id;
        sub.last_report = ctx.now;
        let key = match ctx.exchanges.open(session_id) {
            Ok(key) => key,
            Err(e) => {
                log::debug!("can't report subscription {}: {}", id, e);
                self.terminate(ctx, id, TerminationReason::SessionClosed);
                return Ok(());
            }
        };
        log::debug!("report for subscription {} on {}", id, key);
        self.send_chunk(ctx, id, key, stream)
    }

    pub fn poll(&mut self, ctx: &mut Ctx) {
        let now = ctx.now;
        let expired: Vec<u32> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.liveness_deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            log::debug!("subscription {} reports not acknowledged, terminating", id);
            self.terminate(ctx, id, TerminationReason::LivenessTimeout);
        }
        while let Some(&(due, id)) = self.queue.first() {
            if due > now {
                break;
            }
            self.queue.remove(&(due, id));
            if let Err(e) = self.fire(ctx, id) {
                log::debug!("subscription {} report failed: {}", id, e);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let liveness = self.subscriptions.values().filter_map(|s| s.liveness_deadline).min();
        let scheduled = self.queue.first().map(|(t, _)| *t);
        match (liveness, scheduled) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_closed(&mut self, ctx: &mut Ctx, key: &ExchangeKey, reason: CloseReason) {
        if let Some(id) = self.by_exchange.remove(key) {
            let reason = match reason {
                CloseReason::Timeout => TerminationReason::LivenessTimeout,
                CloseReason::SessionClosed => TerminationReason::SessionClosed,
            };
            self.terminate(ctx, id, reason);
        }
    }

    /// Ends all subscriptions of a session that went away.
    pub fn on_session_closed(&mut self, ctx: &mut Ctx, session_id: u16) {
        let ids: Vec<u32> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.terminate(ctx, id, TerminationReason::SessionClosed);
        }
    }

    pub fn cancel(&mut self, ctx: &mut Ctx, id: u32) -> bool {
        self.terminate(ctx, id, TerminationReason::Cancelled)
    }

    fn terminate(&mut self, ctx: &mut Ctx, id: u32, reason: TerminationReason) -> bool {
        let Some(mut sub) = self.subscriptions.remove(&id) else {
            return false;
        };
        sub.state = SubscriptionState::Terminated;
        if let Some(t) = sub.scheduled.take() {
            self.queue.remove(&(t, id));
        }
        if let Some((key, _)) = sub.in_flight.take() {
            self.by_exchange.remove(&key);
            ctx.exchanges.close(key);
        }
        log::debug!("subscription {} terminated: {:?}", id, reason);
        self.terminated.push((id, reason));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::config::NodeConfig;
    use crate::datamodel::{DataModel, InMemoryDataModel};
    use crate::exchange::tests::manager_pair;
    use crate::exchange::{ExchangeEvent, ExchangeManager};
    use crate::messages::ReportData;
    use crate::schema::tests::{test_tree, CLUSTER_LEVEL};
    use crate::schema::SchemaTree;

    struct Publisher {
        exchanges: ExchangeManager,
        peer: ExchangeManager,
        schema: SchemaTree,
        data: InMemoryDataModel,
        config: NodeConfig,
        subs: SubscriptionManager,
    }

    impl Publisher {
        fn new() -> Self {
            let (exchanges, peer) = manager_pair();
            let mut data = InMemoryDataModel::new();
            data.insert(ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0), Value::UInt(1), 1);
            let config = NodeConfig::default();
            Self {
                exchanges,
                peer,
                schema: test_tree(),
                data,
                subs: SubscriptionManager::new(config.subscriptions.clone()),
                config,
            }
        }

        fn with_ctx<R>(&mut self, now: Instant, f: impl FnOnce(&mut SubscriptionManager, &mut Ctx) -> R) -> R {
            let mut ctx = Ctx {
                exchanges: &mut self.exchanges,
                schema: &self.schema,
                data: &mut self.data,
                config: &self.config,
                now,
            };
            f(&mut self.subs, &mut ctx)
        }

        /// Delivers publisher output to the peer, returning the actions it received.
        fn to_peer(&mut self, now: Instant) -> Vec<(ExchangeKey, Action)> {
            for o in self.exchanges.drain_outgoing() {
                self.peer.on_receive(&o.data, now).unwrap();
            }
            let mut out = Vec::new();
            while let Some(ev) = self.peer.next_event() {
                if let ExchangeEvent::Message { key, message, .. } = ev {
                    let action = Action::decode(message.protocol_header.opcode, &message.payload).unwrap();
                    out.push((key, action));
                }
            }
            out
        }

        fn answer(&mut self, key: ExchangeKey, status: StatusCode, now: Instant) {
            send_action(&mut self.peer, key, &Action::StatusResponse(status), now).unwrap();
            for o in self.peer.drain_outgoing() {
                self.exchanges.on_receive(&o.data, now).unwrap();
            }
            while let Some(ev) = self.exchanges.next_event() {
                if let ExchangeEvent::Message { key, message, .. } = ev {
                    let action = Action::decode(message.protocol_header.opcode, &message.payload).unwrap();
                    self.with_ctx(now, |subs, ctx| subs.on_action(ctx, key, action)).unwrap();
                }
            }
        }

        fn pump_changes(&mut self, now: Instant) {
            for c in self.data.take_changes() {
                self.subs.on_change(&c, now);
            }
        }

        fn poll(&mut self, now: Instant) {
            self.pump_changes(now);
            self.with_ctx(now, |subs, ctx| subs.poll(ctx));
        }

        /// Subscribes through a peer initiated exchange and completes priming.
        fn subscribe(&mut self, min: u16, max: u16, now: Instant) -> u32 {
            let peer_key = self.peer.open(2).unwrap();
            let req = SubscribeRequest {
                keep_subscriptions: true,
                min_interval_floor: min,
                max_interval_ceiling: max,
                attribute_paths: vec![AttributePathFilter::concrete(1, CLUSTER_LEVEL, 0)],
                ..Default::default()
            };
            send_action(&mut self.peer, peer_key, &Action::SubscribeRequest(req.clone()), now).unwrap();
            for o in self.peer.drain_outgoing() {
                self.exchanges.on_receive(&o.data, now).unwrap();
            }
            let key = match self.exchanges.next_event() {
                Some(ExchangeEvent::Message { key, .. }) => key,
                other => panic!("unexpected {:?}", other),
            };
            self.with_ctx(now, |subs, ctx| subs.subscribe(ctx, key, req)).unwrap();
            let priming = self.to_peer(now);
            let Some((_, Action::ReportData(r))) = priming.first() else {
                panic!("expected priming report, got {:?}", priming);
            };
            let id = r.subscription_id.unwrap();
            assert_eq!(self.subs.state(id), SubscriptionState::Priming);
            self.answer(peer_key, StatusCode::Success, now);
            let response = self.to_peer(now);
            assert!(matches!(
                response.first(),
                Some((_, Action::SubscribeResponse(SubscribeResponse { max_interval, .. }))) if *max_interval == max
            ));
            assert_eq!(self.subs.state(id), SubscriptionState::Active);
            id
        }
    }

    fn reports(actions: &[(ExchangeKey, Action)]) -> Vec<(ExchangeKey, ReportData)> {
        actions
            .iter()
            .filter_map(|(k, a)| match a {
                Action::ReportData(r) => Some((*k, r.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn changes_coalesced_until_min_interval() {
        let mut p = Publisher::new();
        let t0 = Instant::now();
        let id = p.subscribe(1, 10, t0);
        let path = ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0);

        p.data.set_attribute(path, Value::UInt(2));
        p.poll(t0 + Duration::from_millis(200));
        p.data.set_attribute(path, Value::UInt(3));
        p.poll(t0 + Duration::from_millis(500));
        assert!(reports(&p.to_peer(t0 + Duration::from_millis(500))).is_empty());
        assert_eq!(p.subs.next_deadline(), Some(t0 + Duration::from_secs(1)));

        p.poll(t0 + Duration::from_secs(1));
        let sent = reports(&p.to_peer(t0 + Duration::from_secs(1)));
        assert_eq!(sent.len(), 1);
        let (key, report) = &sent[0];
        assert_eq!(report.subscription_id, Some(id));
        assert_eq!(report.attribute_reports.len(), 1);
        match &report.attribute_reports[0] {
            crate::messages::AttributeReportIb::Data(d) => {
                assert_eq!(d.data, crate::tlv::TlvItemValue::Int(3));
                assert_eq!(d.data_version, Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
        p.answer(*key, StatusCode::Success, t0 + Duration::from_secs(1));
        // nothing changed since: next is the keep-alive
        assert_eq!(p.subs.next_deadline(), Some(t0 + Duration::from_secs(11)));
    }

    #[test]
    fn keepalive_is_empty_report() {
        let mut p = Publisher::new();
        let t0 = Instant::now();
        let id = p.subscribe(0, 5, t0);
        p.poll(t0 + Duration::from_secs(5));
        let sent = reports(&p.to_peer(t0 + Duration::from_secs(5)));
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.subscription_id, Some(id));
        assert!(sent[0].1.attribute_reports.is_empty());
        assert!(sent[0].1.event_reports.is_empty());
    }

    #[test]
    fn unacknowledged_reports_terminate_subscription() {
        let mut p = Publisher::new();
        let t0 = Instant::now();
        let id = p.subscribe(0, 60, t0);
        p.poll(t0 + Duration::from_secs(60));
        assert_eq!(reports(&p.to_peer(t0 + Duration::from_secs(60))).len(), 1);
        // the peer acknowledges at the transport level but never answers the report
        p.poll(t0 + Duration::from_secs(179));
        assert_eq!(p.subs.state(id), SubscriptionState::Active);
        p.poll(t0 + Duration::from_secs(180));
        assert_eq!(p.subs.state(id), SubscriptionState::Terminated);
        assert_eq!(p.subs.take_terminated(), vec![(id, TerminationReason::LivenessTimeout)]);
        assert!(p.subs.ids().is_empty());
        assert_eq!(p.subs.next_deadline(), None);
        // later changes are not reported anywhere
        p.data.set_attribute(ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0), Value::UInt(9));
        p.poll(t0 + Duration::from_secs(200));
        assert!(p.exchanges.drain_outgoing().is_empty());
    }

    #[test]
    fn peer_cancel_with_invalid_subscription() {
        let mut p = Publisher::new();
        let t0 = Instant::now();
        let id = p.subscribe(0, 5, t0);
        p.poll(t0 + Duration::from_secs(5));
        let sent = reports(&p.to_peer(t0 + Duration::from_secs(5)));
        p.answer(sent[0].0, StatusCode::InvalidSubscription, t0 + Duration::from_secs(5));
        assert_eq!(p.subs.state(id), SubscriptionState::Terminated);
        assert_eq!(
            p.subs.take_terminated(),
            vec![(id, TerminationReason::PeerCancelled(StatusCode::InvalidSubscription))]
        );
    }

    #[test]
    fn interval_outside_limits_rejected() {
        let mut p = Publisher::new();
        p.subs.limits.max_interval_ceiling_s = 100;
        let now = Instant::now();
        let peer_key = p.peer.open(2).unwrap();
        let req = SubscribeRequest {
            min_interval_floor: 10,
            max_interval_ceiling: 200,
            attribute_paths: vec![AttributePathFilter::wildcard()],
            ..Default::default()
        };
        send_action(&mut p.peer, peer_key, &Action::SubscribeRequest(req.clone()), now).unwrap();
        for o in p.peer.drain_outgoing() {
            p.exchanges.on_receive(&o.data, now).unwrap();
        }
        let Some(ExchangeEvent::Message { key, .. }) = p.exchanges.next_event() else {
            panic!("no request");
        };
        p.with_ctx(now, |subs, ctx| subs.subscribe(ctx, key, req)).unwrap();
        let answer = p.to_peer(now);
        assert!(matches!(answer.first(), Some((_, Action::StatusResponse(StatusCode::ConstraintError)))));
        assert!(p.subs.ids().is_empty());
    }

    #[test]
    fn change_carried_by_priming_not_repeated() {
        let mut p = Publisher::new();
        p.config.max_payload_size = ReportData::envelope_len(true) + 8;
        let on_level = ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0x11);
        p.data.insert(on_level, Value::Null, 5);
        let t0 = Instant::now();
        let peer_key = p.peer.open(2).unwrap();
        let req = SubscribeRequest {
            keep_subscriptions: true,
            min_interval_floor: 0,
            max_interval_ceiling: 10,
            attribute_paths: vec![
                AttributePathFilter::concrete(1, CLUSTER_LEVEL, 0),
                AttributePathFilter::concrete(1, CLUSTER_LEVEL, 0x11),
            ],
            ..Default::default()
        };
        send_action(&mut p.peer, peer_key, &Action::SubscribeRequest(req.clone()), t0).unwrap();
        for o in p.peer.drain_outgoing() {
            p.exchanges.on_receive(&o.data, t0).unwrap();
        }
        let Some(ExchangeEvent::Message { key, .. }) = p.exchanges.next_event() else {
            panic!("no request");
        };
        p.with_ctx(t0, |subs, ctx| subs.subscribe(ctx, key, req)).unwrap();
        let first = reports(&p.to_peer(t0));
        assert_eq!(first.len(), 1);
        assert!(first[0].1.more_chunked);
        let id = first[0].1.subscription_id.unwrap();

        // changed before the chunk holding it is built
        p.data.set_attribute(on_level, Value::UInt(7));
        p.pump_changes(t0);
        p.answer(peer_key, StatusCode::Success, t0);
        let second = reports(&p.to_peer(t0));
        assert_eq!(second.len(), 1);
        match &second[0].1.attribute_reports[..] {
            [crate::messages::AttributeReportIb::Data(d)] => assert_eq!(d.data_version, Some(6)),
            other => panic!("unexpected {:?}", other),
        }
        p.answer(peer_key, StatusCode::Success, t0);
        assert!(matches!(p.to_peer(t0).first(), Some((_, Action::SubscribeResponse(_)))));
        assert_eq!(p.subs.state(id), SubscriptionState::Active);
        // only the keep-alive is due
        assert_eq!(p.subs.next_deadline(), Some(t0 + Duration::from_secs(10)));
    }

    #[test]
    fn stale_versions_not_rereported() {
        let mut p = Publisher::new();
        let t0 = Instant::now();
        p.subscribe(0, 10, t0);
        let path = ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0);
        // version 1 was in the priming report
        p.subs.on_change(&Change::Attribute { path, version: 1 }, t0);
        assert_eq!(p.subs.next_deadline(), Some(t0 + Duration::from_secs(10)));
        assert_eq!(p.data.read(&path), Ok((Value::UInt(1), 1)));
    }
}
