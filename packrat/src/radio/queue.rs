//! The TNC outbound queue.
//!
//! All senders (AX.25 sessions, APRS beacons, file transfers) funnel their frames through this
//! queue; the radio accepts at most one in-flight `HT_SEND_DATA` exchange at a time.
//!
//! A queued packet becomes *pending* only when nothing else is pending, the radio reports its TNC
//! path free, and any post-response delay has elapsed. The head packet leaves the queue only on a
//! confirmed outcome:
//!
//! * `SUCCESS` — popped; next dispatch is scheduled shortly after.
//! * `INCORRECT_STATE` — retained at the head, not retried until the next `HT_STATUS_CHANGED`
//!   (the radio is transmitting or switching; the same bytes will go through later).
//! * any other status — popped and dropped; the radio rejected the content and retrying the same
//!   bytes would fail again.

use crate::gaia::StatusCode;
use crate::time::{Duration, Instant, NextUpdate};
use crate::Error;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// One frame awaiting transmission over the radio's TNC path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TncPacket {
    pub channel_id: u8,
    pub data: Vec<u8>,
}

/// Outcome of a completed `HT_SEND_DATA` exchange, as reported to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Packet delivered to the radio; head popped.
    Sent,
    /// Radio busy; head retained for the next status change.
    Deferred,
    /// Radio rejected the packet; head dropped.
    Rejected(Error),
}

pub struct TncQueue {
    queue: VecDeque<TncPacket>,
    /// Head handed to the radio, awaiting its acknowledgement(s).
    pending_acks: u8,
    /// Set by `INCORRECT_STATE`: no dispatch until the next status change.
    wait_status: bool,
    /// Earliest instant the next dispatch may happen.
    retry_at: Option<Instant>,
}

impl TncQueue {
    /// Pause after a successful send before dispatching the next packet.
    const DELAY_AFTER_SUCCESS: Duration = Duration::from_micros(10_000);

    /// Pause after a rejected send before dispatching the next packet.
    const DELAY_AFTER_REJECT: Duration = Duration::from_micros(50_000);

    pub fn new() -> Self {
        TncQueue {
            queue: VecDeque::new(),
            pending_acks: 0,
            wait_status: false,
            retry_at: None,
        }
    }

    pub fn push(&mut self, packet: TncPacket) {
        self.queue.push_back(packet);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the head may be handed to the radio right now.
    pub fn ready(&self, now: Instant, tnc_free: bool) -> bool {
        if self.queue.is_empty() || self.pending_acks > 0 || self.wait_status || !tnc_free {
            return false;
        }
        match self.retry_at {
            Some(at) => now.has_reached(at),
            None => true,
        }
    }

    /// Returns the head packet without changing queue state.
    pub fn peek(&self) -> Option<&TncPacket> {
        self.queue.front()
    }

    /// Marks the head as handed to the radio in `acks` fragments.
    ///
    /// Callers must check [`ready`] first.
    ///
    /// [`ready`]: #method.ready
    pub fn mark_pending(&mut self, acks: u8) {
        debug_assert!(self.pending_acks == 0 && !self.wait_status && !self.queue.is_empty());
        self.pending_acks = acks;
        self.retry_at = None;
    }

    /// Processes one `HT_SEND_DATA` response status.
    pub fn on_send_response(&mut self, status: StatusCode, now: Instant) -> Option<SendOutcome> {
        if self.pending_acks == 0 {
            // A stale acknowledgement from an exchange already resolved (eg. a fragment ack
            // arriving after a deferral). Nothing to account.
            return None;
        }
        match status {
            StatusCode::Success => {
                self.pending_acks -= 1;
                if self.pending_acks > 0 {
                    return None;
                }
                self.queue.pop_front();
                self.retry_at = Some(now + Self::DELAY_AFTER_SUCCESS);
                Some(SendOutcome::Sent)
            }
            StatusCode::IncorrectState => {
                self.pending_acks = 0;
                self.wait_status = true;
                Some(SendOutcome::Deferred)
            }
            other => {
                warn!("radio rejected TNC packet: {:?}", other);
                self.pending_acks = 0;
                self.queue.pop_front();
                self.retry_at = Some(now + Self::DELAY_AFTER_REJECT);
                Some(SendOutcome::Rejected(Error::RadioRejected))
            }
        }
    }

    /// Unblocks a deferred head; called on every `HT_STATUS_CHANGED`.
    pub fn on_status_changed(&mut self) {
        self.wait_status = false;
    }

    /// Drops all queued packets (transport gone).
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending_acks = 0;
        self.wait_status = false;
        self.retry_at = None;
    }

    /// When the queue wants to be polled for a delayed dispatch.
    pub fn next_update(&self) -> NextUpdate {
        if self.queue.is_empty() || self.pending_acks > 0 || self.wait_status {
            return NextUpdate::Disable;
        }
        match self.retry_at {
            Some(at) => NextUpdate::At(at),
            None => NextUpdate::Disable,
        }
    }
}

impl Default for TncQueue {
    fn default() -> Self {
        Self::new()
    }
}
