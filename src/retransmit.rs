//! Message reliability: retransmission with exponential backoff and duplicate detection.
//!
//! Nothing here touches a socket or a clock; callers pass `now` and send what they are told to.

use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, Instant},
};

use crate::config::MrpConfig;

const MAX_BACKOFF_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityState {
    Idle,
    UnackedSent,
    Acked,
    Closed,
}

/// Sent reliable message waiting for acknowledgement.
struct UnackedMessage {
    counter: u32,
    /// Encoded datagram as it went out the first time.
    data: Vec<u8>,
    /// Retransmissions done so far.
    attempts: u32,
    next_due: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetransmitAction {
    Nothing,
    Resend(Vec<u8>),
    /// Attempts exhausted; the exchange must be closed with a timeout.
    Exhausted,
}

/// Reliability state of one exchange. At most one reliable message is in flight.
pub struct RetrContext {
    base_interval: Duration,
    max_retransmissions: u32,
    state: ReliabilityState,
    unacked: Option<UnackedMessage>,
}

impl RetrContext {
    pub fn new(config: &MrpConfig) -> Self {
        Self {
            base_interval: config.base_interval(),
            max_retransmissions: config.max_retransmissions,
            state: ReliabilityState::Idle,
            unacked: None,
        }
    }

    pub fn state(&self) -> ReliabilityState {
        self.state
    }

    pub fn has_unacked(&self) -> bool {
        self.unacked.is_some()
    }

    fn backoff(&self, attempts: u32) -> Duration {
        self.base_interval * (1u32 << attempts.min(MAX_BACKOFF_SHIFT))
    }

    pub fn on_sent(&mut self, counter: u32, data: Vec<u8>, now: Instant) {
        if self.state == ReliabilityState::Closed {
            return;
        }
        log::trace!("tracking counter {} for retransmit", counter);
        self.unacked = Some(UnackedMessage {
            counter,
            data,
            attempts: 0,
            next_due: now + self.backoff(0),
        });
        self.state = ReliabilityState::UnackedSent;
    }

    /// Returns true when the acknowledgement matched the message in flight.
    pub fn on_ack(&mut self, counter: u32) -> bool {
        match &self.unacked {
            Some(u) if u.counter == counter => {
                log::trace!("received ack counter:{}", counter);
                self.unacked = None;
                if self.state != ReliabilityState::Closed {
                    self.state = ReliabilityState::Acked;
                }
                true
            }
            _ => false,
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.unacked.as_ref().map(|u| u.next_due)
    }

    pub fn poll(&mut self, now: Instant) -> RetransmitAction {
        let Some(u) = self.unacked.as_ref() else {
            return RetransmitAction::Nothing;
        };
        if now < u.next_due {
            return RetransmitAction::Nothing;
        }
        if u.attempts >= self.max_retransmissions {
            log::debug!("counter {} not acknowledged after {} retransmissions", u.counter, u.attempts);
            self.close();
            return RetransmitAction::Exhausted;
        }
        let attempts = u.attempts + 1;
        let next_due = now + self.backoff(attempts);
        let Some(u) = self.unacked.as_mut() else {
            return RetransmitAction::Nothing;
        };
        u.attempts = attempts;
        u.next_due = next_due;
        log::trace!("retransmit counter = {} attempt {}", u.counter, attempts);
        RetransmitAction::Resend(u.data.clone())
    }

    /// Drops any pending retransmission.
    pub fn close(&mut self) {
        self.unacked = None;
        self.state = ReliabilityState::Closed;
    }
}

/// Bounded set for tracking received message counters to detect duplicates.
///
/// Counters further behind the highest seen one than the window are treated as duplicates.
pub struct ReceivedCounters {
    set: HashSet<u32>,
    order: VecDeque<u32>,
    max_size: usize,
    highest: Option<u32>,
}

impl ReceivedCounters {
    pub fn new(max_size: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
            highest: None,
        }
    }

    /// Returns true if counter was new (not a duplicate)
    pub fn insert(&mut self, counter: u32) -> bool {
        if let Some(h) = self.highest {
            if counter < h && (h - counter) as usize >= self.max_size {
                return false;
            }
        }
        if !self.set.insert(counter) {
            return false;
        }
        self.order.push_back(counter);
        self.highest = Some(self.highest.map_or(counter, |h| h.max(counter)));
        while self.order.len() > self.max_size {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RetrContext {
        RetrContext::new(&MrpConfig::default())
    }

    #[test]
    fn exactly_five_retransmissions_then_exhausted() {
        let mut r = ctx();
        let start = Instant::now();
        r.on_sent(100, vec![1, 2, 3], start);
        assert_eq!(r.state(), ReliabilityState::UnackedSent);
        let mut now = start;
        let mut resent = 0;
        loop {
            now = r.next_due().unwrap_or(now);
            match r.poll(now) {
                RetransmitAction::Resend(d) => {
                    assert_eq!(d, vec![1, 2, 3]);
                    resent += 1;
                }
                RetransmitAction::Exhausted => break,
                RetransmitAction::Nothing => panic!("poll at due time did nothing"),
            }
        }
        assert_eq!(resent, 5);
        assert_eq!(r.state(), ReliabilityState::Closed);
        assert_eq!(r.poll(now + Duration::from_secs(3600)), RetransmitAction::Nothing);
        // 300 * (1 + 2 + 4 + 8 + 16 + 32) ms
        assert_eq!(now - start, Duration::from_millis(300 * 63));
    }

    #[test]
    fn ack_stops_retransmission() {
        let mut r = ctx();
        let now = Instant::now();
        r.on_sent(7, vec![9], now);
        assert_eq!(r.poll(now + Duration::from_millis(100)), RetransmitAction::Nothing);
        assert!(!r.on_ack(6));
        assert!(r.on_ack(7));
        assert_eq!(r.state(), ReliabilityState::Acked);
        assert_eq!(r.next_due(), None);
        assert_eq!(r.poll(now + Duration::from_secs(10)), RetransmitAction::Nothing);
    }

    #[test]
    fn duplicate_counters() {
        let mut rc = ReceivedCounters::new(4);
        assert!(rc.insert(10));
        assert!(!rc.insert(10));
        assert!(rc.insert(12));
        assert!(rc.insert(11));
        assert!(!rc.insert(12));
        for c in 13..20 {
            assert!(rc.insert(c));
        }
        // evicted from the set but behind the window
        assert!(!rc.insert(11));
        assert!(!rc.insert(15));
        assert!(rc.insert(20));
    }
}
