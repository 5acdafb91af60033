//! Node: one interaction model endpoint acting as publisher and client at once.
//!
//! The node does no I/O. Datagrams are fed with [Node::handle_datagram], timers are
//! driven with [Node::poll], and outgoing datagrams are taken with [Node::drain_outgoing].
//! [active_connection](crate::active_connection) runs it on a tokio task.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    client::{ClientInteractions, InteractionId, InvokeResult, WriteItem},
    codec::Value,
    config::NodeConfig,
    datamodel::DataModel,
    error::{ImError, ImResult},
    exchange::{ExchangeEvent, ExchangeKey, ExchangeManager, Outgoing, Role},
    interaction::{reject, Ctx, InteractionEngine},
    messages::{Action, Message, ReadRequest, SubscribeRequest},
    report::{AttributeStatus, Chunk, ConcreteCommandPath},
    schema::SchemaTree,
    session::Session,
    status::StatusCode,
    subscription::{SubscriptionManager, SubscriptionState, TerminationReason},
};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Reports of a read or subscription. `more` means the next chunk waits for [Node::pull].
    Chunk {
        id: InteractionId,
        chunk: Chunk,
        more: bool,
    },
    SubscriptionEstablished {
        id: InteractionId,
        subscription_id: u32,
        max_interval: u16,
    },
    WriteCompleted {
        id: InteractionId,
        statuses: Vec<AttributeStatus>,
    },
    InvokeCompleted {
        id: InteractionId,
        results: Vec<InvokeResult>,
    },
    Failed {
        id: InteractionId,
        error: ImError,
    },
    /// A subscription this node publishes has ended.
    SubscriptionTerminated {
        subscription_id: u32,
        reason: TerminationReason,
    },
}

macro_rules! ctx {
    ($node:expr, $now:expr) => {
        Ctx {
            exchanges: &mut $node.exchanges,
            schema: &$node.schema,
            data: &mut $node.data,
            config: &$node.config,
            now: $now,
        }
    };
}

pub struct Node<D: DataModel> {
    config: NodeConfig,
    schema: Arc<SchemaTree>,
    data: D,
    exchanges: ExchangeManager,
    engine: InteractionEngine,
    subscriptions: SubscriptionManager,
    client: ClientInteractions,
    sessions: BTreeSet<u16>,
    events: VecDeque<NodeEvent>,
}

fn route(
    engine: &mut InteractionEngine,
    subscriptions: &mut SubscriptionManager,
    client: &mut ClientInteractions,
    ctx: &mut Ctx,
    key: ExchangeKey,
    message: Message,
    unsolicited: bool,
) -> ImResult<()> {
    let decoded = Action::decode(message.protocol_header.opcode, &message.payload);
    if client.owns(&key) {
        return match decoded {
            Ok(action) => client.on_action(ctx, key, action),
            Err(e) => client.on_malformed(ctx, key, e),
        };
    }
    let action = match decoded {
        Ok(action) => action,
        Err(e) => {
            log::debug!("malformed message on {}: {}", key, e);
            subscriptions.abort(ctx, &key);
            engine.on_closed(&key);
            return reject(ctx, key, StatusCode::InvalidAction);
        }
    };
    if subscriptions.owns(&key) {
        return subscriptions.on_action(ctx, key, action);
    }
    if engine.owns(&key) {
        return engine.on_action(ctx, key, action);
    }
    if !unsolicited {
        log::debug!("{} on {} outside of any interaction", action.name(), key);
        return reject(ctx, key, StatusCode::InvalidAction);
    }
    match action {
        Action::SubscribeRequest(req) => subscriptions.subscribe(ctx, key, req),
        Action::ReportData(report) if key.role == Role::Responder => client.on_subscription_report(ctx, key, report),
        other => engine.on_action(ctx, key, other),
    }
}

impl<D: DataModel> Node<D> {
    pub fn new(config: NodeConfig, schema: Arc<SchemaTree>, data: D) -> Self {
        Self {
            exchanges: ExchangeManager::new(config.mrp.clone()),
            subscriptions: SubscriptionManager::new(config.subscriptions.clone()),
            client: ClientInteractions::new(Duration::from_millis(config.client_liveness_grace_ms)),
            engine: InteractionEngine::default(),
            sessions: BTreeSet::new(),
            events: VecDeque::new(),
            config,
            schema,
            data,
        }
    }

    pub fn add_session(&mut self, session: Session) {
        self.sessions.insert(session.my_session_id);
        self.exchanges.add_session(session);
    }

    pub fn session(&self, session_id: u16) -> Option<&Session> {
        self.exchanges.session(session_id)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn schema(&self) -> &SchemaTree {
        &self.schema
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// Local changes made through this are reported on the next poll.
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn handle_datagram(&mut self, data: &[u8], now: Instant) -> ImResult<()> {
        self.exchanges.on_receive(data, now)?;
        self.dispatch(now);
        Ok(())
    }

    /// Runs every timer due at `now`.
    pub fn poll(&mut self, now: Instant) {
        self.exchanges.poll(now);
        self.dispatch(now);
        self.reap_sessions(now);
        self.engine.poll(&mut self.exchanges, now);
        let mut ctx = ctx!(self, now);
        self.subscriptions.poll(&mut ctx);
        self.client.poll(&mut ctx);
        self.collect_terminated();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.exchanges.next_deadline(),
            self.engine.next_deadline(),
            self.subscriptions.next_deadline(),
            self.client.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        self.exchanges.drain_outgoing()
    }

    pub fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.pop_front().or_else(|| self.client.next_event())
    }

    fn dispatch(&mut self, now: Instant) {
        while let Some(event) = self.exchanges.next_event() {
            let mut ctx = ctx!(self, now);
            let result = match event {
                ExchangeEvent::Message {
                    key,
                    message,
                    unsolicited,
                } => route(
                    &mut self.engine,
                    &mut self.subscriptions,
                    &mut self.client,
                    &mut ctx,
                    key,
                    message,
                    unsolicited,
                ),
                ExchangeEvent::Closed { key, reason } => {
                    log::debug!("exchange {} closed: {:?}", key, reason);
                    self.engine.on_closed(&key);
                    self.subscriptions.on_closed(&mut ctx, &key, reason);
                    self.client.on_closed(&key, reason);
                    Ok(())
                }
            };
            if let Err(e) = result {
                log::debug!("exchange event not handled: {}", e);
            }
        }
        for change in self.data.take_changes() {
            self.subscriptions.on_change(&change, now);
        }
        self.collect_terminated();
    }

    fn reap_sessions(&mut self, now: Instant) {
        let live: BTreeSet<u16> = self.exchanges.session_ids().into_iter().collect();
        let gone: Vec<u16> = self.sessions.difference(&live).copied().collect();
        for session_id in gone {
            log::debug!("session {} gone", session_id);
            self.sessions.remove(&session_id);
            let mut ctx = ctx!(self, now);
            self.subscriptions.on_session_closed(&mut ctx, session_id);
        }
    }

    fn collect_terminated(&mut self) {
        for (subscription_id, reason) in self.subscriptions.take_terminated() {
            self.events.push_back(NodeEvent::SubscriptionTerminated {
                subscription_id,
                reason,
            });
        }
    }

    pub fn read(&mut self, session_id: u16, request: ReadRequest, now: Instant) -> ImResult<InteractionId> {
        let mut ctx = ctx!(self, now);
        self.client.read(&mut ctx, session_id, request)
    }

    pub fn subscribe(&mut self, session_id: u16, request: SubscribeRequest, now: Instant) -> ImResult<InteractionId> {
        let mut ctx = ctx!(self, now);
        self.client.subscribe(&mut ctx, session_id, request)
    }

    /// `timed` is the timed window in milliseconds announced before the write.
    pub fn write(
        &mut self,
        session_id: u16,
        items: &[WriteItem],
        atomic: bool,
        timed: Option<u16>,
        now: Instant,
    ) -> ImResult<InteractionId> {
        let mut ctx = ctx!(self, now);
        self.client.write(&mut ctx, session_id, items, atomic, timed)
    }

    pub fn invoke(
        &mut self,
        session_id: u16,
        path: ConcreteCommandPath,
        payload: &Value,
        timed: Option<u16>,
        now: Instant,
    ) -> ImResult<InteractionId> {
        let mut ctx = ctx!(self, now);
        self.client.invoke(&mut ctx, session_id, path, payload, timed)
    }

    /// Requests the chunk after the last one delivered with `more` set.
    pub fn pull(&mut self, id: InteractionId, now: Instant) -> ImResult<()> {
        let mut ctx = ctx!(self, now);
        self.client.pull(&mut ctx, id)
    }

    pub fn cancel(&mut self, id: InteractionId, now: Instant) {
        let mut ctx = ctx!(self, now);
        self.client.cancel(&mut ctx, id)
    }

    pub fn subscription_state(&self, subscription_id: u32) -> SubscriptionState {
        self.subscriptions.state(subscription_id)
    }

    pub fn subscription_ids(&self) -> Vec<u32> {
        self.subscriptions.ids()
    }

    /// Ends a subscription served by this node. The subscriber notices when its
    /// liveness deadline passes.
    pub fn cancel_subscription(&mut self, subscription_id: u32, now: Instant) -> bool {
        let mut ctx = ctx!(self, now);
        let cancelled = self.subscriptions.cancel(&mut ctx, subscription_id);
        self.collect_terminated();
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::InMemoryDataModel;
    use crate::error::EncodeError;
    use crate::interaction::{send_action, READ_IDLE};
    use crate::messages::{
        AttributeDataIb, AttributeReportIb, CommandDataIb, InvokeRequest, InvokeResponseIb, ProtocolMessageHeader,
        ReportData, WriteRequest,
    };
    use crate::tlv::{TlvItem, TlvItemValue};
    use crate::report::{AttributePathFilter, AttributeValue, ConcreteAttributePath, Report};
    use crate::schema::tests::{test_tree, CLUSTER_LEVEL, CLUSTER_ON_OFF};

    const CLIENT_SESSION: u16 = 1;

    struct Pair {
        server: Node<InMemoryDataModel>,
        client: Node<InMemoryDataModel>,
        now: Instant,
    }

    fn server_model() -> InMemoryDataModel {
        let mut dm = InMemoryDataModel::new();
        dm.insert(ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0), Value::Bool(false), 1);
        dm.insert(ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0x4000), Value::Bool(true), 1);
        dm.insert(ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0x4001), Value::UInt(0), 1);
        dm.insert(ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0), Value::UInt(50), 2);
        dm.insert(ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0x11), Value::UInt(10), 5);
        dm.insert(ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0xfff0), Value::from("kitchen"), 1);
        dm.on_command(ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 1), |_, store| {
            store.set(ConcreteAttributePath::new(1, CLUSTER_ON_OFF, 0), Value::Bool(true));
            Ok(None)
        });
        dm
    }

    fn pair_with(config: NodeConfig) -> Pair {
        let schema = Arc::new(test_tree());
        let mut server = Node::new(config.clone(), schema.clone(), server_model());
        let mut client = Node::new(config, schema, InMemoryDataModel::new());
        let mut ss = Session::new(2, 1);
        ss.set_nodes(0x20, 0x10);
        let mut cs = Session::new(CLIENT_SESSION, 2);
        cs.set_nodes(0x10, 0x20);
        server.add_session(ss);
        client.add_session(cs);
        Pair {
            server,
            client,
            now: Instant::now(),
        }
    }

    fn pair() -> Pair {
        pair_with(NodeConfig::default())
    }

    impl Pair {
        fn shuttle(&mut self) {
            loop {
                let to_server = self.client.drain_outgoing();
                let to_client = self.server.drain_outgoing();
                if to_server.is_empty() && to_client.is_empty() {
                    return;
                }
                for o in to_server {
                    self.server.handle_datagram(&o.data, self.now).unwrap();
                }
                for o in to_client {
                    self.client.handle_datagram(&o.data, self.now).unwrap();
                }
            }
        }

        /// Moves time forward, polls both nodes and exchanges everything that results.
        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.server.poll(self.now);
            self.client.poll(self.now);
            self.shuttle();
        }

        fn client_events(&mut self) -> Vec<NodeEvent> {
            std::iter::from_fn(|| self.client.next_event()).collect()
        }
    }

    /// Bare exchange layer with one session: the client side when `my_session` is 1, else the server side.
    fn raw_peer(my_session: u16, peer_session: u16) -> ExchangeManager {
        let mut raw = ExchangeManager::new(NodeConfig::default().mrp);
        let mut s = Session::new(my_session, peer_session);
        if my_session == CLIENT_SESSION {
            s.set_nodes(0x10, 0x20);
        } else {
            s.set_nodes(0x20, 0x10);
        }
        raw.add_session(s);
        raw
    }

    fn raw_actions(raw: &mut ExchangeManager) -> Vec<(ExchangeKey, Action)> {
        let mut out = Vec::new();
        while let Some(ev) = raw.next_event() {
            if let ExchangeEvent::Message { key, message, .. } = ev {
                out.push((key, Action::decode(message.protocol_header.opcode, &message.payload).unwrap()));
            }
        }
        out
    }

    /// Sends `action` from a raw client to the server and returns what the server answered.
    fn raw_request(p: &mut Pair, action: Action) -> Vec<(ExchangeKey, Action)> {
        let mut raw = raw_peer(CLIENT_SESSION, 2);
        let key = raw.open(CLIENT_SESSION).unwrap();
        send_action(&mut raw, key, &action, p.now).unwrap();
        for o in raw.drain_outgoing() {
            p.server.handle_datagram(&o.data, p.now).unwrap();
        }
        for o in p.server.drain_outgoing() {
            raw.on_receive(&o.data, p.now).unwrap();
        }
        raw_actions(&mut raw)
    }

    fn on_off(attribute: u32) -> ConcreteAttributePath {
        ConcreteAttributePath::new(1, CLUSTER_ON_OFF, attribute)
    }

    fn empty() -> Value {
        Value::object(Vec::<(String, Value)>::new())
    }

    #[test]
    fn read_reports_values_and_missing_attribute() {
        let mut p = pair();
        let request = ReadRequest {
            attribute_paths: vec![
                AttributePathFilter::concrete(1, CLUSTER_ON_OFF, 0),
                AttributePathFilter::concrete(1, CLUSTER_LEVEL, 0),
                AttributePathFilter::concrete(1, CLUSTER_LEVEL, 0x11),
                AttributePathFilter::concrete(1, CLUSTER_ON_OFF, 0x9999),
            ],
            ..Default::default()
        };
        let id = p.client.read(CLIENT_SESSION, request, p.now).unwrap();
        p.shuttle();
        let events = p.client_events();
        assert_eq!(events.len(), 1);
        let NodeEvent::Chunk { id: got, chunk, more } = &events[0] else {
            panic!("unexpected {:?}", events[0]);
        };
        assert_eq!((*got, *more), (id, false));
        assert_eq!(chunk.len(), 4);
        let statuses: Vec<&Report> = chunk.iter().filter(|r| matches!(r, Report::AttributeStatus(_))).collect();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].attribute_path(), Some(&on_off(0x9999)));
        assert!(chunk.contains(&Report::AttributeValue(AttributeValue {
            path: ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0x11),
            version: 5,
            value: Value::UInt(10),
        })));
        p.advance(Duration::from_secs(1));
        assert_eq!(p.client.exchanges.open_exchanges(), 0);
        assert_eq!(p.server.exchanges.open_exchanges(), 0);
    }

    #[test]
    fn repeated_read_is_identical() {
        let mut p = pair();
        let request = ReadRequest {
            attribute_paths: vec![AttributePathFilter::wildcard().endpoint(1)],
            ..Default::default()
        };
        let mut reads = Vec::new();
        for _ in 0..2 {
            p.client.read(CLIENT_SESSION, request.clone(), p.now).unwrap();
            p.shuttle();
            let chunks: Vec<Chunk> = p
                .client_events()
                .into_iter()
                .filter_map(|e| match e {
                    NodeEvent::Chunk { chunk, .. } => Some(chunk),
                    _ => None,
                })
                .collect();
            reads.push(chunks);
        }
        assert!(!reads[0].is_empty());
        assert_eq!(reads[0], reads[1]);
    }

    #[test]
    fn chunks_arrive_in_order_after_pull() {
        let config = NodeConfig {
            max_payload_size: crate::messages::ReportData::envelope_len(false) + 40,
            ..NodeConfig::default()
        };
        let mut p = pair_with(config);
        let request = ReadRequest {
            attribute_paths: vec![AttributePathFilter::wildcard().endpoint(1)],
            ..Default::default()
        };
        let id = p.client.read(CLIENT_SESSION, request, p.now).unwrap();
        p.shuttle();
        let mut paths = Vec::new();
        let mut rounds = 0;
        loop {
            let events = p.client_events();
            assert_eq!(events.len(), 1, "one chunk per pull");
            let NodeEvent::Chunk { chunk, more, .. } = &events[0] else {
                panic!("unexpected {:?}", events[0]);
            };
            paths.extend(chunk.iter().filter_map(|r| r.attribute_path().copied()));
            rounds += 1;
            if !more {
                break;
            }
            // nothing moves until the reader pulls
            p.shuttle();
            assert!(p.client_events().is_empty());
            p.client.pull(id, p.now).unwrap();
            p.shuttle();
        }
        assert!(rounds > 2);
        let expected: Vec<ConcreteAttributePath> = p
            .server
            .schema()
            .expand_attributes(&[AttributePathFilter::wildcard().endpoint(1)])
            .keys()
            .copied()
            .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn write_with_data_version() {
        let mut p = pair();
        let on_level = ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0x11);
        let item = WriteItem::new(on_level, Value::UInt(20)).expect_version(5);
        let id = p.client.write(CLIENT_SESSION, &[item.clone()], false, None, p.now).unwrap();
        p.shuttle();
        assert_eq!(
            p.client_events(),
            vec![NodeEvent::WriteCompleted {
                id,
                statuses: vec![AttributeStatus {
                    path: on_level,
                    status: StatusCode::Success,
                    cluster_status: None
                }]
            }]
        );
        assert_eq!(p.server.data().attribute(&on_level), Some(&(Value::UInt(20), 6)));

        let id = p.client.write(CLIENT_SESSION, &[item], false, None, p.now).unwrap();
        p.shuttle();
        match &p.client_events()[..] {
            [NodeEvent::WriteCompleted { id: got, statuses }] => {
                assert_eq!(*got, id);
                assert_eq!(statuses[0].status, StatusCode::DataVersionMismatch);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.server.data().attribute(&on_level), Some(&(Value::UInt(20), 6)));
    }

    #[test]
    fn atomic_write_repeating_a_path_applies_nothing() {
        let mut p = pair();
        let on_level = ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0x11);
        let items = [
            WriteItem::new(on_level, Value::UInt(20)).expect_version(5),
            WriteItem::new(on_level, Value::UInt(30)).expect_version(5),
        ];
        let id = p.client.write(CLIENT_SESSION, &items, true, None, p.now).unwrap();
        p.shuttle();
        match &p.client_events()[..] {
            [NodeEvent::WriteCompleted { id: got, statuses }] => {
                assert_eq!(*got, id);
                let codes: Vec<StatusCode> = statuses.iter().map(|s| s.status).collect();
                assert_eq!(codes, vec![StatusCode::Failure, StatusCode::DataVersionMismatch]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.server.data().attribute(&on_level), Some(&(Value::UInt(10), 5)));
    }

    #[test]
    fn out_of_range_write_rejected() {
        let mut p = pair();
        let on_level = ConcreteAttributePath::new(1, CLUSTER_LEVEL, 0x11);
        let err = p
            .client
            .write(CLIENT_SESSION, &[WriteItem::new(on_level, Value::UInt(300))], false, None, p.now)
            .unwrap_err();
        assert!(matches!(err, ImError::Encode(EncodeError::OutOfRange { width: 1, .. })));
        assert!(p.client.drain_outgoing().is_empty());

        // a peer that does not check widths
        let request = WriteRequest {
            writes: vec![AttributeDataIb {
                data_version: Some(5),
                path: on_level.into(),
                data: TlvItemValue::Int(300),
            }],
            ..Default::default()
        };
        match &raw_request(&mut p, Action::WriteRequest(request))[..] {
            [(_, Action::WriteResponse(r))] => assert_eq!(r.statuses[0].status, StatusCode::ConstraintError),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.server.data().attribute(&on_level), Some(&(Value::UInt(10), 5)));
    }

    #[test]
    fn out_of_range_command_field_rejected() {
        let mut p = pair();
        let path = ConcreteCommandPath::new(1, CLUSTER_LEVEL, 0);
        let request = InvokeRequest {
            commands: vec![CommandDataIb {
                path,
                fields: TlvItemValue::Struct(vec![
                    TlvItem::ctx(0, TlvItemValue::Int(300)),
                    TlvItem::ctx(1, TlvItemValue::Nil()),
                    TlvItem::ctx(2, TlvItemValue::Int(0)),
                    TlvItem::ctx(3, TlvItemValue::Int(0)),
                ]),
                command_ref: None,
            }],
            ..Default::default()
        };
        match &raw_request(&mut p, Action::InvokeRequest(request))[..] {
            [(_, Action::InvokeResponse(r))] => match &r.responses[..] {
                [InvokeResponseIb::Status { status, .. }] => assert_eq!(*status, StatusCode::ConstraintError),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn retransmitted_write_applied_once() {
        let mut p = pair();
        let path = on_off(0x4001);
        p.client
            .write(CLIENT_SESSION, &[WriteItem::new(path, Value::UInt(7))], false, None, p.now)
            .unwrap();
        let out = p.client.drain_outgoing();
        assert_eq!(out.len(), 1);
        p.server.handle_datagram(&out[0].data, p.now).unwrap();
        p.server.handle_datagram(&out[0].data, p.now).unwrap();
        assert_eq!(p.server.data().attribute(&path), Some(&(Value::UInt(7), 2)));
        p.shuttle();
        assert!(matches!(&p.client_events()[..], [NodeEvent::WriteCompleted { .. }]));
    }

    #[test]
    fn invoke_runs_handler() {
        let mut p = pair();
        let id = p
            .client
            .invoke(CLIENT_SESSION, ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 1), &empty(), None, p.now)
            .unwrap();
        p.shuttle();
        match &p.client_events()[..] {
            [NodeEvent::InvokeCompleted { id: got, results }] => {
                assert_eq!(*got, id);
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].status, StatusCode::Success);
                assert_eq!(results[0].response, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.server.data().attribute(&on_off(0)), Some(&(Value::Bool(true), 2)));
    }

    #[test]
    fn unknown_command_path_rejected_locally() {
        let mut p = pair();
        let err = p
            .client
            .invoke(CLIENT_SESSION, ConcreteCommandPath::new(2, CLUSTER_LEVEL, 0), &empty(), None, p.now)
            .unwrap_err();
        assert_eq!(err, ImError::Status(StatusCode::UnsupportedCluster));
        assert!(p.client.drain_outgoing().is_empty());
    }

    #[test]
    fn timed_invoke() {
        let mut p = pair();
        let path = ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 1);
        p.client.invoke(CLIENT_SESSION, path, &empty(), Some(500), p.now).unwrap();
        p.shuttle();
        assert!(matches!(&p.client_events()[..], [NodeEvent::InvokeCompleted { results, .. }] if results[0].status.is_success()));
        assert_eq!(p.server.data().attribute(&on_off(0)), Some(&(Value::Bool(true), 2)));
    }

    #[test]
    fn timed_window_expired() {
        let mut p = pair();
        let path = ConcreteCommandPath::new(1, CLUSTER_ON_OFF, 1);
        let id = p.client.invoke(CLIENT_SESSION, path, &empty(), Some(100), p.now).unwrap();
        // TimedRequest and its status response
        let out = p.client.drain_outgoing();
        p.server.handle_datagram(&out[0].data, p.now).unwrap();
        let out = p.server.drain_outgoing();
        p.client.handle_datagram(&out[0].data, p.now).unwrap();
        // the invoke reaches the server after the window closed
        p.now += Duration::from_secs(1);
        p.shuttle();
        assert_eq!(
            p.client_events(),
            vec![NodeEvent::Failed {
                id,
                error: ImError::Cancelled(StatusCode::Timeout)
            }]
        );
        assert_eq!(p.server.data().attribute(&on_off(0)), Some(&(Value::Bool(false), 1)));
    }

    #[test]
    fn malformed_request_answered_with_invalid_action() {
        let mut p = pair();
        let mut raw = raw_peer(CLIENT_SESSION, 2);
        let key = raw.open(1).unwrap();
        // read request holding an unterminated structure
        raw.send(key, ProtocolMessageHeader::INTERACTION_OPCODE_READ_REQ, vec![0x15], p.now).unwrap();
        for o in raw.drain_outgoing() {
            p.server.handle_datagram(&o.data, p.now).unwrap();
        }
        for o in p.server.drain_outgoing() {
            raw.on_receive(&o.data, p.now).unwrap();
        }
        match raw.next_event() {
            Some(ExchangeEvent::Message { message, .. }) => {
                let action = Action::decode(message.protocol_header.opcode, &message.payload).unwrap();
                assert_eq!(action, Action::StatusResponse(StatusCode::InvalidAction));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unpulled_read_abandoned_by_server() {
        let config = NodeConfig {
            max_payload_size: ReportData::envelope_len(false) + 40,
            ..NodeConfig::default()
        };
        let mut p = pair_with(config);
        let request = ReadRequest {
            attribute_paths: vec![AttributePathFilter::wildcard().endpoint(1)],
            ..Default::default()
        };
        let start = p.now;
        p.client.read(CLIENT_SESSION, request, p.now).unwrap();
        p.shuttle();
        assert!(matches!(&p.client_events()[..], [NodeEvent::Chunk { more: true, .. }]));
        // report acknowledged, the reader never asks for more
        p.advance(Duration::from_secs(1));
        assert_eq!(p.server.exchanges.open_exchanges(), 1);
        assert_eq!(p.server.next_deadline(), Some(start + READ_IDLE));
        p.advance(READ_IDLE);
        assert_eq!(p.server.exchanges.open_exchanges(), 0);
        assert_eq!(p.server.next_deadline(), None);
    }

    #[test]
    fn peer_status_mid_read_cancels() {
        let mut p = pair();
        let mut raw = raw_peer(2, CLIENT_SESSION);
        let request = ReadRequest {
            attribute_paths: vec![AttributePathFilter::concrete(1, CLUSTER_ON_OFF, 0)],
            ..Default::default()
        };
        let id = p.client.read(CLIENT_SESSION, request, p.now).unwrap();
        for o in p.client.drain_outgoing() {
            raw.on_receive(&o.data, p.now).unwrap();
        }
        let actions = raw_actions(&mut raw);
        let key = match &actions[..] {
            [(key, Action::ReadRequest(_))] => *key,
            other => panic!("unexpected {:?}", other),
        };
        let first = ReportData {
            attribute_reports: vec![AttributeReportIb::Data(AttributeDataIb {
                data_version: Some(1),
                path: on_off(0).into(),
                data: TlvItemValue::Bool(false),
            })],
            more_chunked: true,
            ..Default::default()
        };
        send_action(&mut raw, key, &Action::ReportData(first), p.now).unwrap();
        // goes out once the report is acknowledged
        send_action(&mut raw, key, &Action::StatusResponse(StatusCode::Busy), p.now).unwrap();
        for o in raw.drain_outgoing() {
            p.client.handle_datagram(&o.data, p.now).unwrap();
        }
        assert!(matches!(&p.client_events()[..], [NodeEvent::Chunk { more: true, .. }]));

        p.now += Duration::from_secs(1);
        p.client.poll(p.now);
        for o in p.client.drain_outgoing() {
            raw.on_receive(&o.data, p.now).unwrap();
        }
        for o in raw.drain_outgoing() {
            p.client.handle_datagram(&o.data, p.now).unwrap();
        }
        assert_eq!(
            p.client_events(),
            vec![NodeEvent::Failed {
                id,
                error: ImError::Cancelled(StatusCode::Busy)
            }]
        );
        assert_eq!(p.client.exchanges.open_exchanges(), 0);
    }

    #[test]
    fn unanswered_read_times_out() {
        let mut p = pair();
        let request = ReadRequest {
            attribute_paths: vec![AttributePathFilter::concrete(1, CLUSTER_ON_OFF, 0)],
            ..Default::default()
        };
        let id = p.client.read(CLIENT_SESSION, request, p.now).unwrap();
        for _ in 0..20 {
            p.client.drain_outgoing();
            match p.client.next_deadline() {
                Some(deadline) => {
                    p.now = deadline;
                    p.client.poll(p.now);
                }
                None => break,
            }
        }
        assert_eq!(
            p.client_events(),
            vec![NodeEvent::Failed {
                id,
                error: ImError::Timeout
            }]
        );
    }

    fn subscribe_request(min: u16, max: u16) -> SubscribeRequest {
        SubscribeRequest {
            keep_subscriptions: true,
            min_interval_floor: min,
            max_interval_ceiling: max,
            attribute_paths: vec![AttributePathFilter::concrete(1, CLUSTER_ON_OFF, 0)],
            event_paths: vec![],
            event_min: None,
            fabric_filtered: false,
        }
    }

    #[test]
    fn subscription_priming_change_and_cancel() {
        let mut p = pair();
        let id = p.client.subscribe(CLIENT_SESSION, subscribe_request(1, 30), p.now).unwrap();
        p.shuttle();
        let events = p.client_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], NodeEvent::Chunk { chunk, more: false, .. } if chunk.len() == 1));
        let NodeEvent::SubscriptionEstablished {
            subscription_id,
            max_interval,
            ..
        } = events[1]
        else {
            panic!("unexpected {:?}", events[1]);
        };
        assert_eq!(max_interval, 30);
        assert_eq!(p.server.subscription_state(subscription_id), SubscriptionState::Active);

        p.server.data_mut().set_attribute(on_off(0), Value::Bool(true));
        p.advance(Duration::from_secs(2));
        match &p.client_events()[..] {
            [NodeEvent::Chunk { id: got, chunk, .. }] => {
                assert_eq!(*got, id);
                assert_eq!(
                    chunk[0],
                    Report::AttributeValue(AttributeValue {
                        path: on_off(0),
                        version: 2,
                        value: Value::Bool(true)
                    })
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        p.client.cancel(id, p.now);
        p.server.data_mut().set_attribute(on_off(0), Value::Bool(false));
        p.advance(Duration::from_secs(2));
        assert!(p.client_events().is_empty());
        let terminated: Vec<NodeEvent> = std::iter::from_fn(|| p.server.next_event()).collect();
        assert_eq!(
            terminated,
            vec![NodeEvent::SubscriptionTerminated {
                subscription_id,
                reason: TerminationReason::PeerCancelled(StatusCode::InvalidSubscription)
            }]
        );
        assert_eq!(p.server.subscription_state(subscription_id), SubscriptionState::Terminated);
    }

    #[test]
    fn subscription_interval_rejected() {
        let mut p = pair();
        let id = p.client.subscribe(CLIENT_SESSION, subscribe_request(10, 5), p.now).unwrap();
        p.shuttle();
        assert_eq!(
            p.client_events(),
            vec![NodeEvent::Failed {
                id,
                error: ImError::IntervalNegotiationFailed { min: 10, max: 5 }
            }]
        );
        assert!(p.server.subscription_ids().is_empty());
    }

    #[test]
    fn silent_publisher_fails_subscription() {
        let mut p = pair();
        let id = p.client.subscribe(CLIENT_SESSION, subscribe_request(0, 10), p.now).unwrap();
        p.shuttle();
        let established = p.client_events();
        let Some(NodeEvent::SubscriptionEstablished { subscription_id, .. }) = established.last().cloned() else {
            panic!("unexpected {:?}", established);
        };
        assert!(p.server.cancel_subscription(subscription_id, p.now));
        p.advance(Duration::from_secs(1));
        assert!(p.client_events().is_empty());
        // max interval plus the default five second grace
        p.advance(Duration::from_secs(15));
        assert_eq!(
            p.client_events(),
            vec![NodeEvent::Failed {
                id,
                error: ImError::Timeout
            }]
        );
    }
}
