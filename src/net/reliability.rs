//! Reliable-delivery bookkeeping for one connection
//!
//! Tracks the inbound nonce watermark, a ring of recently received nonces used to
//! build acknowledgements, and a ring of outbound reliable packets awaiting
//! acknowledgement together with their retransmission timers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::net::protocol::Nonce;

/// Capacity of both the inbound and the in-flight rings
pub const RING_CAPACITY: usize = 8;
/// Spacing between retransmissions of an unacknowledged packet
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(1500);
/// Retransmissions before the connection is given up
pub const MAX_RETRANSMITS: u32 = 8;

/// An outbound reliable packet awaiting acknowledgement
#[derive(Debug)]
pub struct InFlight {
    pub nonce: Nonce,
    pub acked: bool,
    pub attempts: u32,
    bytes: Arc<[u8]>,
    timer: Option<JoinHandle<()>>,
}

impl InFlight {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// What a retransmission timer should do on its next tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStep {
    /// Resend the identical bytes
    Resend { attempt: u32, bytes: Arc<[u8]> },
    /// Attempts used up, the connection must be dropped
    Exhausted,
    /// Acknowledged or no longer tracked, stop the timer
    Done,
}

#[derive(Debug, Default)]
pub struct ReliabilityState {
    last_inbound: Option<Nonce>,
    /// Most recent first
    received: VecDeque<Nonce>,
    /// Oldest first
    in_flight: VecDeque<InFlight>,
}

impl ReliabilityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the watermark; `false` means duplicate or stale, drop the packet
    pub fn accept_inbound(&mut self, nonce: Nonce) -> bool {
        match self.last_inbound {
            Some(last) if nonce <= last => false,
            _ => {
                self.last_inbound = Some(nonce);
                true
            }
        }
    }

    pub fn last_inbound(&self) -> Option<Nonce> {
        self.last_inbound
    }

    /// Remember a received nonce and build the missing-packets bitfield for its ack
    pub fn record_received(&mut self, nonce: Nonce) -> u8 {
        self.received.push_front(nonce);
        self.received.truncate(RING_CAPACITY);

        let mut missing = 0u8;
        for offset in 1..=RING_CAPACITY as u32 {
            if let Some(previous) = nonce.checked_sub(offset) {
                if !self.received.contains(&previous) {
                    missing |= 1 << (offset - 1);
                }
            }
        }
        missing
    }

    pub fn received(&self) -> impl Iterator<Item = Nonce> + '_ {
        self.received.iter().copied()
    }

    /// Track a sent reliable packet; evicts and cancels the oldest beyond capacity
    pub fn track(&mut self, nonce: Nonce, bytes: Arc<[u8]>) -> Option<Nonce> {
        self.in_flight.push_back(InFlight {
            nonce,
            acked: false,
            attempts: 0,
            bytes,
            timer: None,
        });

        if self.in_flight.len() > RING_CAPACITY {
            let mut evicted = self.in_flight.pop_front()?;
            evicted.cancel();
            return Some(evicted.nonce);
        }
        None
    }

    /// Attach the retransmission timer of a tracked packet
    ///
    /// A timer for a packet that is already acknowledged or evicted is aborted.
    pub fn attach_timer(&mut self, nonce: Nonce, timer: JoinHandle<()>) {
        match self
            .in_flight
            .iter_mut()
            .find(|entry| entry.nonce == nonce && !entry.acked)
        {
            Some(entry) => {
                entry.cancel();
                entry.timer = Some(timer);
            }
            None => timer.abort(),
        }
    }

    /// Mark a packet acknowledged and cancel its timer; `false` if not in flight
    pub fn acknowledge(&mut self, nonce: Nonce) -> bool {
        match self.in_flight.iter_mut().find(|entry| entry.nonce == nonce) {
            Some(entry) if !entry.acked => {
                entry.acked = true;
                entry.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_acked(&self, nonce: Nonce) -> Option<bool> {
        self.in_flight
            .iter()
            .find(|entry| entry.nonce == nonce)
            .map(|entry| entry.acked)
    }

    /// Number of tracked packets not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.in_flight.iter().filter(|entry| !entry.acked).count()
    }

    /// Advance the retry state of one packet, called from its timer
    pub fn retry_step(&mut self, nonce: Nonce) -> RetryStep {
        let Some(entry) = self.in_flight.iter_mut().find(|entry| entry.nonce == nonce) else {
            return RetryStep::Done;
        };
        if entry.acked {
            return RetryStep::Done;
        }

        entry.attempts += 1;
        if entry.attempts > MAX_RETRANSMITS {
            // The calling timer finishes on its own; detach rather than abort it
            entry.timer.take();
            return RetryStep::Exhausted;
        }

        RetryStep::Resend {
            attempt: entry.attempts,
            bytes: entry.bytes.clone(),
        }
    }

    /// Cancel every pending timer, returning how many were running
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for entry in self.in_flight.iter_mut() {
            if entry.timer.is_some() {
                entry.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
