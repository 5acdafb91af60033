//! Exchange manager: sessions, exchanges, acknowledgements and retransmission.
//!
//! Owns all per-session reliability state. It is driven by a single owner: datagrams
//! go in through [ExchangeManager::on_receive], timers through [ExchangeManager::poll],
//! and what has to go on the wire is collected with [ExchangeManager::drain_outgoing].

use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

use crate::{
    config::MrpConfig,
    error::{ImError, ImResult},
    messages::{self, Message, MessageHeader, ProtocolMessageHeader, StatusReportInfo},
    retransmit::{ReceivedCounters, RetrContext, RetransmitAction},
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Initiator,
    Responder,
}

/// Exchange identity: local session id, exchange id and our role in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeKey {
    pub session_id: u16,
    pub exchange_id: u16,
    pub role: Role,
}

impl std::fmt::Display for ExchangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = match self.role {
            Role::Initiator => "i",
            Role::Responder => "r",
        };
        write!(f, "{}:{}{}", self.session_id, self.exchange_id, r)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Timeout,
    SessionClosed,
}

#[derive(Debug)]
pub enum ExchangeEvent {
    /// Application message on an exchange. `unsolicited` marks the first message of a
    /// peer-initiated exchange.
    Message {
        key: ExchangeKey,
        message: Message,
        unsolicited: bool,
    },
    Closed {
        key: ExchangeKey,
        reason: CloseReason,
    },
}

/// Datagram to send to the peer of a session.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub session_id: u16,
    pub data: Vec<u8>,
}

struct SessionEntry {
    session: Session,
    received: ReceivedCounters,
    next_exchange_id: u16,
}

struct PendingAck {
    counter: u32,
    deadline: Instant,
}

struct Exchange {
    retr: RetrContext,
    pending_ack: Option<PendingAck>,
    /// Messages waiting for the one in flight to be acknowledged.
    queue: VecDeque<(u8, Vec<u8>)>,
    close_when_acked: bool,
}

pub struct ExchangeManager {
    config: MrpConfig,
    sessions: BTreeMap<u16, SessionEntry>,
    exchanges: BTreeMap<ExchangeKey, Exchange>,
    outbox: VecDeque<Outgoing>,
    events: VecDeque<ExchangeEvent>,
}

impl ExchangeManager {
    pub fn new(config: MrpConfig) -> Self {
        Self {
            config,
            sessions: BTreeMap::new(),
            exchanges: BTreeMap::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn add_session(&mut self, session: Session) {
        log::debug!("adding session {:?}", session);
        let entry = SessionEntry {
            received: ReceivedCounters::new(self.config.dedup_window as usize),
            next_exchange_id: rand::random(),
            session,
        };
        self.sessions.insert(entry.session.my_session_id, entry);
    }

    pub fn session(&self, session_id: u16) -> Option<&Session> {
        self.sessions.get(&session_id).map(|s| &s.session)
    }

    pub fn session_ids(&self) -> Vec<u16> {
        self.sessions.keys().copied().collect()
    }

    #[cfg(test)]
    pub fn is_open(&self, key: &ExchangeKey) -> bool {
        self.exchanges.contains_key(key)
    }

    #[cfg(test)]
    pub fn open_exchanges(&self) -> usize {
        self.exchanges.len()
    }

    /// Opens a new exchange as initiator.
    pub fn open(&mut self, session_id: u16) -> ImResult<ExchangeKey> {
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ImError::UnknownSession(session_id))?;
        if entry.session.is_revoked() {
            return Err(ImError::SessionClosed);
        }
        let mut exchange_id = entry.next_exchange_id;
        while self.exchanges.contains_key(&ExchangeKey {
            session_id,
            exchange_id,
            role: Role::Initiator,
        }) {
            exchange_id = exchange_id.wrapping_add(1);
        }
        entry.next_exchange_id = exchange_id.wrapping_add(1);
        let key = ExchangeKey {
            session_id,
            exchange_id,
            role: Role::Initiator,
        };
        self.exchanges.insert(key, self.new_exchange());
        log::debug!("opened exchange {}", key);
        Ok(key)
    }

    fn new_exchange(&self) -> Exchange {
        Exchange {
            retr: RetrContext::new(&self.config),
            pending_ack: None,
            queue: VecDeque::new(),
            close_when_acked: false,
        }
    }

    /// Sends an interaction model message reliably, piggybacking a pending acknowledgement.
    pub fn send(&mut self, key: ExchangeKey, opcode: u8, payload: Vec<u8>, now: Instant) -> ImResult<()> {
        let exchange = self.exchanges.get_mut(&key).ok_or(ImError::UnknownInteraction)?;
        if exchange.retr.has_unacked() {
            log::trace!("exchange {} busy, queueing opcode 0x{:x}", key, opcode);
            exchange.queue.push_back((opcode, payload));
            return Ok(());
        }
        self.transmit(key, opcode, payload, now)
    }

    fn transmit(&mut self, key: ExchangeKey, opcode: u8, payload: Vec<u8>, now: Instant) -> ImResult<()> {
        let entry = self
            .sessions
            .get(&key.session_id)
            .ok_or(ImError::UnknownSession(key.session_id))?;
        let exchange = self.exchanges.get_mut(&key).ok_or(ImError::UnknownInteraction)?;
        let ack = exchange.pending_ack.take().map(|p| p.counter);
        let mut data = messages::im_header(key.exchange_id, opcode, key.role == Role::Initiator, ack).encode()?;
        data.extend_from_slice(&payload);
        let (counter, encoded) = entry.session.encode_message(&data)?;
        log::trace!(
            "send exchange {} opcode 0x{:x} counter {} ack {:?}",
            key,
            opcode,
            counter,
            ack
        );
        exchange.retr.on_sent(counter, encoded.clone(), now);
        self.outbox.push_back(Outgoing {
            session_id: key.session_id,
            data: encoded,
        });
        Ok(())
    }

    fn send_standalone_ack(&mut self, session_id: u16, exchange_id: u16, role: Role, counter: u32) -> ImResult<()> {
        let entry = self
            .sessions
            .get(&session_id)
            .ok_or(ImError::UnknownSession(session_id))?;
        let data = messages::ack(exchange_id, counter, role == Role::Initiator)?;
        let (own, encoded) = entry.session.encode_message(&data)?;
        log::trace!("send ack for counter {} exchange {} (counter {})", counter, exchange_id, own);
        self.outbox.push_back(Outgoing {
            session_id,
            data: encoded,
        });
        Ok(())
    }

    /// Closes immediately, flushing a pending acknowledgement and dropping retransmissions.
    pub fn close(&mut self, key: ExchangeKey) {
        if let Some(mut exchange) = self.exchanges.remove(&key) {
            if let Some(p) = exchange.pending_ack.take() {
                if let Err(e) = self.send_standalone_ack(key.session_id, key.exchange_id, key.role, p.counter) {
                    log::debug!("can't flush ack on close of {}: {:?}", key, e);
                }
            }
            log::debug!("closed exchange {} in state {:?}", key, exchange.retr.state());
            exchange.retr.close();
        }
    }

    /// Closes once everything sent on the exchange has been acknowledged.
    pub fn close_when_acked(&mut self, key: ExchangeKey) {
        match self.exchanges.get_mut(&key) {
            Some(e) if e.retr.has_unacked() || !e.queue.is_empty() => e.close_when_acked = true,
            Some(_) => self.close(key),
            None => {}
        }
    }

    pub fn on_receive(&mut self, data: &[u8], now: Instant) -> ImResult<()> {
        let (header, _) = MessageHeader::decode(data)?;
        let session_id = header.session_id;
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ImError::UnknownSession(session_id))?;
        let plain = entry.session.decode_message(data)?;
        let message = Message::decode(&plain)?;
        let counter = message.message_header.message_counter;
        let ph = &message.protocol_header;
        let role = if ph.is_initiator() {
            Role::Responder
        } else {
            Role::Initiator
        };
        let key = ExchangeKey {
            session_id,
            exchange_id: ph.exchange_id,
            role,
        };

        if !entry.received.insert(counter) {
            log::trace!("duplicate counter {} on {}, dropping", counter, key);
            if ph.needs_ack() {
                self.send_standalone_ack(session_id, key.exchange_id, role, counter)?;
            }
            return Ok(());
        }

        if let Some(ack) = ph.ack_counter {
            self.on_ack(key, ack, now)?;
        }

        if ph.is_standalone_ack() {
            if !self.exchanges.contains_key(&key) {
                log::trace!("ack for unknown exchange {} ignored", key);
            }
            return Ok(());
        }

        if ph.protocol_id == ProtocolMessageHeader::PROTOCOL_ID_SECURE_CHANNEL
            && ph.opcode == ProtocolMessageHeader::OPCODE_STATUS
        {
            let info = StatusReportInfo::parse(&message.payload)?;
            if info.is_close_session() {
                log::debug!("peer closed session {}", session_id);
                if let Some(entry) = self.sessions.get(&session_id) {
                    entry.session.revoke();
                }
                self.reap_revoked();
            } else {
                log::debug!("ignoring {}", info);
            }
            return Ok(());
        }

        let unsolicited = !self.exchanges.contains_key(&key);
        if unsolicited {
            if role == Role::Initiator {
                log::debug!("message for unknown exchange {} dropped", key);
                if ph.needs_ack() {
                    self.send_standalone_ack(session_id, key.exchange_id, role, counter)?;
                }
                return Ok(());
            }
            log::debug!("new exchange {} from peer", key);
            let exchange = self.new_exchange();
            self.exchanges.insert(key, exchange);
        }

        if ph.needs_ack() {
            let deadline = now + self.config.ack_deferral();
            let previous = self
                .exchanges
                .get_mut(&key)
                .and_then(|e| e.pending_ack.replace(PendingAck { counter, deadline }));
            if let Some(p) = previous {
                self.send_standalone_ack(session_id, key.exchange_id, role, p.counter)?;
            }
        }

        self.events.push_back(ExchangeEvent::Message {
            key,
            message,
            unsolicited,
        });
        Ok(())
    }

    fn on_ack(&mut self, key: ExchangeKey, ack: u32, now: Instant) -> ImResult<()> {
        let Some(exchange) = self.exchanges.get_mut(&key) else {
            return Ok(());
        };
        if !exchange.retr.on_ack(ack) {
            log::trace!("stale ack {} on {}", ack, key);
            return Ok(());
        }
        if let Some((opcode, payload)) = exchange.queue.pop_front() {
            return self.transmit(key, opcode, payload, now);
        }
        if exchange.close_when_acked {
            self.close(key);
        }
        Ok(())
    }

    /// Fires due acknowledgements and retransmissions, and reaps revoked sessions.
    pub fn poll(&mut self, now: Instant) {
        self.reap_revoked();
        let keys: Vec<ExchangeKey> = self.exchanges.keys().copied().collect();
        for key in keys {
            let Some(exchange) = self.exchanges.get_mut(&key) else {
                continue;
            };
            let due_ack = if exchange.pending_ack.as_ref().is_some_and(|p| p.deadline <= now) {
                exchange.pending_ack.take().map(|p| p.counter)
            } else {
                None
            };
            let action = exchange.retr.poll(now);
            if let Some(counter) = due_ack {
                if let Err(e) = self.send_standalone_ack(key.session_id, key.exchange_id, key.role, counter) {
                    log::debug!("can't send ack on {}: {:?}", key, e);
                }
            }
            match action {
                RetransmitAction::Nothing => {}
                RetransmitAction::Resend(data) => self.outbox.push_back(Outgoing {
                    session_id: key.session_id,
                    data,
                }),
                RetransmitAction::Exhausted => {
                    self.exchanges.remove(&key);
                    log::debug!("exchange {} timed out", key);
                    self.events.push_back(ExchangeEvent::Closed {
                        key,
                        reason: CloseReason::Timeout,
                    });
                }
            }
        }
    }

    fn reap_revoked(&mut self) {
        let revoked: Vec<u16> = self
            .sessions
            .iter()
            .filter(|(_, e)| e.session.is_revoked())
            .map(|(id, _)| *id)
            .collect();
        for session_id in revoked {
            self.sessions.remove(&session_id);
            let keys: Vec<ExchangeKey> = self
                .exchanges
                .keys()
                .filter(|k| k.session_id == session_id)
                .copied()
                .collect();
            for key in keys {
                self.exchanges.remove(&key);
                self.events.push_back(ExchangeEvent::Closed {
                    key,
                    reason: CloseReason::SessionClosed,
                });
            }
            log::debug!("session {} revoked, exchanges closed", session_id);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.exchanges
            .values()
            .flat_map(|e| [e.pending_ack.as_ref().map(|p| p.deadline), e.retr.next_due()])
            .flatten()
            .min()
    }

    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        self.outbox.drain(..).collect()
    }

    pub fn next_event(&mut self) -> Option<ExchangeEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub fn manager_pair() -> (ExchangeManager, ExchangeManager) {
        let mut a = ExchangeManager::new(MrpConfig::default());
        let mut b = ExchangeManager::new(MrpConfig::default());
        let mut sa = Session::new(1, 2);
        sa.set_nodes(0x10, 0x20);
        let mut sb = Session::new(2, 1);
        sb.set_nodes(0x20, 0x10);
        a.add_session(sa);
        b.add_session(sb);
        (a, b)
    }

    fn deliver(from: &mut ExchangeManager, to: &mut ExchangeManager, now: Instant) -> usize {
        let out = from.drain_outgoing();
        let n = out.len();
        for o in out {
            to.on_receive(&o.data, now).unwrap();
        }
        n
    }

    fn expect_message(m: &mut ExchangeManager) -> (ExchangeKey, Message, bool) {
        match m.next_event() {
            Some(ExchangeEvent::Message {
                key,
                message,
                unsolicited,
            }) => (key, message, unsolicited),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn request_response_with_piggybacked_ack() {
        let (mut a, mut b) = manager_pair();
        let now = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], now).unwrap();
        assert_eq!(deliver(&mut a, &mut b, now), 1);
        let (kb, msg, unsolicited) = expect_message(&mut b);
        assert!(unsolicited);
        assert_eq!(kb.role, Role::Responder);
        assert_eq!(kb.exchange_id, ka.exchange_id);
        assert_eq!(msg.payload, vec![0x15, 0x18]);

        b.send(kb, 5, vec![0x15, 0x18], now).unwrap();
        deliver(&mut b, &mut a, now);
        let (k, msg, unsolicited) = expect_message(&mut a);
        assert_eq!(k, ka);
        assert!(!unsolicited);
        assert!(msg.protocol_header.ack_counter.is_some());
        // acknowledged, nothing to retransmit on a; b still waits for its ack
        a.poll(now + Duration::from_secs(1));
        let out = a.drain_outgoing();
        // only the deferred standalone ack for b's message
        assert_eq!(out.len(), 1);
        for o in out {
            b.on_receive(&o.data, now).unwrap();
        }
        assert_eq!(b.next_deadline(), None);
    }

    #[test]
    fn duplicate_is_reacked_not_redelivered() {
        let (mut a, mut b) = manager_pair();
        let now = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], now).unwrap();
        let out = a.drain_outgoing();
        b.on_receive(&out[0].data, now).unwrap();
        b.on_receive(&out[0].data, now).unwrap();
        expect_message(&mut b);
        assert!(b.next_event().is_none());
        // the duplicate triggered an immediate standalone ack
        let acks = b.drain_outgoing();
        assert_eq!(acks.len(), 1);
        a.on_receive(&acks[0].data, now).unwrap();
        assert!(a.next_event().is_none());
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn unacknowledged_exchange_times_out() {
        let (mut a, _) = manager_pair();
        let start = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], start).unwrap();
        assert_eq!(a.drain_outgoing().len(), 1);
        let mut retransmissions = 0;
        while let Some(due) = a.next_deadline() {
            a.poll(due);
            retransmissions += a.drain_outgoing().len();
        }
        assert_eq!(retransmissions, 5);
        match a.next_event() {
            Some(ExchangeEvent::Closed { key, reason }) => {
                assert_eq!(key, ka);
                assert_eq!(reason, CloseReason::Timeout);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!a.is_open(&ka));
    }

    #[test]
    fn standalone_ack_for_unknown_exchange_dropped() {
        let (mut a, mut b) = manager_pair();
        let now = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], now).unwrap();
        deliver(&mut a, &mut b, now);
        let (kb, _, _) = expect_message(&mut b);
        b.close(kb);
        let acks = b.drain_outgoing();
        assert_eq!(acks.len(), 1);
        a.on_receive(&acks[0].data, now).unwrap();
        a.close(ka);
        // ack retransmitted by the peer after close
        let session = b.session(2).unwrap();
        let (_, again) = session
            .encode_message(&messages::ack(ka.exchange_id, 1, false).unwrap())
            .unwrap();
        assert!(a.on_receive(&again, now).is_ok());
        assert!(a.next_event().is_none());
        assert!(a.drain_outgoing().is_empty());
    }

    #[test]
    fn deferred_standalone_ack() {
        let (mut a, mut b) = manager_pair();
        let now = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], now).unwrap();
        deliver(&mut a, &mut b, now);
        expect_message(&mut b);
        b.poll(now + Duration::from_millis(100));
        assert!(b.drain_outgoing().is_empty());
        assert_eq!(b.next_deadline(), Some(now + Duration::from_millis(200)));
        b.poll(now + Duration::from_millis(200));
        assert_eq!(deliver(&mut b, &mut a, now), 1);
        assert_eq!(a.next_deadline(), None);
    }

    #[test]
    fn revoked_session_closes_exchanges() {
        let (mut a, _) = manager_pair();
        let now = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], now).unwrap();
        if let Some(s) = a.session(1) {
            s.revoke();
        }
        a.poll(now);
        match a.next_event() {
            Some(ExchangeEvent::Closed { key, reason }) => {
                assert_eq!(key, ka);
                assert_eq!(reason, CloseReason::SessionClosed);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(a.open(1), Err(ImError::UnknownSession(1))));
    }

    #[test]
    fn queued_until_acked() {
        let (mut a, mut b) = manager_pair();
        let now = Instant::now();
        let ka = a.open(1).unwrap();
        a.send(ka, 2, vec![0x15, 0x18], now).unwrap();
        a.send(ka, 1, vec![0x15, 0x18], now).unwrap();
        assert_eq!(deliver(&mut a, &mut b, now), 1);
        expect_message(&mut b);
        b.poll(now + Duration::from_millis(200));
        deliver(&mut b, &mut a, now);
        // ack released the queued message
        assert_eq!(deliver(&mut a, &mut b, now), 1);
        let (_, m, unsolicited) = expect_message(&mut b);
        assert!(!unsolicited);
        assert_eq!(m.protocol_header.opcode, 1);
    }
}
