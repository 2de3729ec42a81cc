//! The per-peer AX.25 connected-mode state machine.
//!
//! An [`Ax25Session`] provides a reliable, ordered byte stream between two callsigns over the
//! radio's TNC path, plus unreliable UI datagrams. It is sans-I/O: inbound frames are injected
//! with [`handle_frame`], outbound frames are drained with [`pop_outgoing`], timers run through
//! [`update_timers`]/[`next_update`], and everything observable comes out of [`pop_event`].
//!
//! ## Out-of-order reception
//!
//! Rejecting every out-of-order I-frame forces the peer to resend its whole window on a single
//! loss. Instead, up to `max_frames - 2` future frames are buffered and at most one REJ is sent
//! per gap episode; when the missing frame arrives, it and the buffered run are delivered in
//! sequence. A frame at or beyond `max_frames - 1` ahead of V(R) is outside the admissible window
//! and is discarded (still covered by the single outstanding REJ). Frames *behind* V(R) are
//! duplicates of already-delivered data and are discarded with a re-acknowledgement.
//!
//! ## Timers
//!
//! * **T1** — retransmission: SABM/DISC repeats, I-frame retransmission, poll responses. Bounded
//!   by the N2 retry budget; exhaustion tears the session down with [`Error::LinkTimeout`].
//! * **T2** — response delay: coalesces outbound writes, delays the RR acknowledgement so it can
//!   piggyback on reverse traffic, and paces RR(P) probes while the peer reports busy.
//! * **T3** — idle probe: after a quiet period an RR(P=1) checks the link is still alive.
//!
//! [`Ax25Session`]: struct.Ax25Session.html
//! [`handle_frame`]: struct.Ax25Session.html#method.handle_frame
//! [`pop_outgoing`]: struct.Ax25Session.html#method.pop_outgoing
//! [`update_timers`]: struct.Ax25Session.html#method.update_timers
//! [`next_update`]: struct.Ax25Session.html#method.next_update
//! [`pop_event`]: struct.Ax25Session.html#method.pop_event
//! [`Error::LinkTimeout`]: ../../enum.Error.html

use super::frame::{Ax25Frame, Control, SFormat, UFormat, PID_NO_L3};
use super::seq_num::{in_window, Modulus, SeqNum};
use super::{AddressField, SessionKey};
use crate::time::{Duration, Instant, NextUpdate};
use crate::Error;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

/// Tunables of one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Window size k: outstanding I-frames bound.
    pub max_frames: u8,
    /// Maximum information payload per I-frame.
    pub max_payload: usize,
    /// T1, the retransmission timer.
    pub t1: Duration,
    /// T2, the response/coalescing delay.
    pub t2: Duration,
    /// T3, the idle link probe.
    pub t3: Duration,
    /// Retry budget for T1-driven repeats.
    pub n2: u8,
    /// Offer SABME (modulo-128) when initiating.
    pub prefer_mod128: bool,
    /// Accept SABME from peers; otherwise answer DM so they fall back to SABM.
    pub allow_mod128: bool,
    /// Grace period a disconnected session stays around so its final frames drain.
    pub disc_linger: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_frames: 4,
            max_payload: 128,
            t1: Duration::from_secs(4),
            t2: Duration::from_millis(100),
            t3: Duration::from_secs(180),
            n2: 10,
            prefer_mod128: false,
            allow_mod128: true,
            disc_linger: Duration::from_millis(100),
        }
    }
}

/// Connection state of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Events reported by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection state changed; a failure reason accompanies error teardowns.
    StateChanged {
        state: ConnectionState,
        reason: Option<Error>,
    },
    /// In-sequence payload bytes from the peer.
    Data(Vec<u8>),
    /// A UI datagram addressed to this session.
    UiData { pid: u8, data: Vec<u8> },
    /// The session ended with accepted-but-undelivered bytes still queued.
    SendAborted { unsent_bytes: usize },
}

/// Transfer counters of one session.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub start_time: Option<Instant>,
}

struct SentFrame {
    ns: SeqNum,
    payload: Vec<u8>,
}

/// One AX.25 connected-mode endpoint.
pub struct Ax25Session {
    key: SessionKey,
    config: SessionConfig,
    channel_id: u8,

    state: ConnectionState,
    modulus: Modulus,
    vs: SeqNum,
    vr: SeqNum,
    va: SeqNum,

    send_window: VecDeque<SentFrame>,
    recv_buffer: BTreeMap<u8, Vec<u8>>,
    pending_outbound: VecDeque<Vec<u8>>,
    sent_rej: bool,
    peer_busy: bool,
    local_busy: bool,
    /// An acknowledgement is owed to the peer (sent on T2 unless piggybacked earlier).
    ack_pending: bool,

    t1: Option<Instant>,
    t2: Option<Instant>,
    t3: Option<Instant>,
    rc: u8,
    reap_at: Option<Instant>,

    events: VecDeque<SessionEvent>,
    outgoing: VecDeque<Ax25Frame>,
    stats: SessionStats,
}

impl Ax25Session {
    pub fn new(key: SessionKey, channel_id: u8, config: SessionConfig) -> Self {
        Ax25Session {
            key,
            config,
            channel_id,
            state: ConnectionState::Disconnected,
            modulus: Modulus::Eight,
            vs: SeqNum::ZERO,
            vr: SeqNum::ZERO,
            va: SeqNum::ZERO,
            send_window: VecDeque::new(),
            recv_buffer: BTreeMap::new(),
            pending_outbound: VecDeque::new(),
            sent_rej: false,
            peer_busy: false,
            local_busy: false,
            ack_pending: false,
            t1: None,
            t2: None,
            t3: None,
            rc: 0,
            reap_at: None,
            events: VecDeque::new(),
            outgoing: VecDeque::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn modulus(&self) -> Modulus {
        self.modulus
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn channel_id(&self) -> u8 {
        self.channel_id
    }

    /// Whether the dispatcher may destroy this session.
    pub fn ready_to_reap(&self, now: Instant) -> bool {
        self.state == ConnectionState::Disconnected
            && self.outgoing.is_empty()
            && self.events.is_empty()
            && match self.reap_at {
                Some(at) => now.has_reached(at),
                None => true,
            }
    }

    /// Marks the local receiver busy/free. While busy, inbound I-frames are answered with RNR.
    pub fn set_local_busy(&mut self, busy: bool) {
        if self.local_busy && !busy {
            // Returning to service: tell the peer right away.
            self.ack_pending = true;
        }
        self.local_busy = busy;
    }

    /// Next queued event.
    pub fn pop_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Next frame awaiting transmission.
    pub fn pop_outgoing(&mut self) -> Option<Ax25Frame> {
        self.outgoing.pop_front()
    }

    /// Initiates the connection: sends SABM (or SABME) and starts the T1 retry cycle.
    pub fn connect(&mut self, now: Instant) -> Result<(), Error> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::InvalidValue);
        }
        self.reset_link(if self.config.prefer_mod128 {
            Modulus::OneTwentyEight
        } else {
            Modulus::Eight
        });
        self.set_state(ConnectionState::Connecting, None);
        self.rc = 0;
        self.send_mode_request(true);
        self.t1 = Some(now + self.config.t1);
        Ok(())
    }

    /// Accepts bytes for reliable delivery.
    ///
    /// With `immediate` the window is pumped at once; otherwise transmission waits for the T2
    /// coalescing window or the next acknowledgement.
    pub fn send(&mut self, data: &[u8], immediate: bool, now: Instant) -> Result<(), Error> {
        if self.state != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        if data.is_empty() {
            return Ok(());
        }
        for chunk in data.chunks(self.config.max_payload) {
            self.pending_outbound.push_back(chunk.to_vec());
        }
        if immediate {
            self.pump_sends(now);
        } else {
            self.schedule_t2(now);
        }
        Ok(())
    }

    /// Emits a single UI frame towards the peer, outside the connected stream.
    pub fn send_ui(&mut self, pid: u8, data: Vec<u8>) {
        let frame = Ax25Frame::ui(self.peer_path(), pid, data);
        self.push_frame(frame);
    }

    /// Initiates disconnection. Queued-but-unsent data is dropped and surfaced as lost.
    pub fn disconnect(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
        self.surface_lost_data();
        self.set_state(ConnectionState::Disconnecting, None);
        self.rc = 0;
        self.t2 = None;
        self.t3 = None;
        self.send_control(Control::U {
            format: UFormat::Disc,
            poll_final: true,
        });
        self.t1 = Some(now + self.config.t1);
    }

    /// Tears the session down because the transport below is gone.
    pub fn transport_closed(&mut self, now: Instant) {
        if self.state != ConnectionState::Disconnected {
            self.surface_lost_data();
            self.go_disconnected(Some(Error::TransportClosed), now);
        }
    }

    /// Injects one inbound frame addressed to this session.
    pub fn handle_frame(&mut self, frame: &Ax25Frame, now: Instant) {
        self.stats.packets_received += 1;
        if self.state == ConnectionState::Connected {
            self.t3 = Some(now + self.config.t3);
        }

        let is_command = frame.addresses.destination.command;
        match frame.control {
            Control::U { format, poll_final } => {
                self.handle_unnumbered(format, poll_final, frame, now)
            }
            Control::I { ns, nr, poll } => {
                self.handle_information(ns, nr, poll, &frame.payload, frame.pid, now)
            }
            Control::S {
                format,
                nr,
                poll_final,
            } => self.handle_supervisory(format, nr, poll_final, is_command, now),
        }
    }

    /// Performs due timer work. Call at (or after) the instant reported by [`next_update`].
    ///
    /// [`next_update`]: #method.next_update
    pub fn update_timers(&mut self, now: Instant) {
        if let Some(at) = self.t1 {
            if now.has_reached(at) {
                self.t1 = None;
                self.t1_expired(now);
            }
        }
        if let Some(at) = self.t2 {
            if now.has_reached(at) {
                self.t2 = None;
                self.t2_expired(now);
            }
        }
        if let Some(at) = self.t3 {
            if now.has_reached(at) {
                self.t3 = None;
                self.t3_expired(now);
            }
        }
    }

    /// The earliest pending deadline.
    pub fn next_update(&self) -> NextUpdate {
        let mut next = NextUpdate::Disable;
        for deadline in [self.t1, self.t2, self.t3, self.reap_at].iter() {
            if let Some(at) = deadline {
                next = next.merge(NextUpdate::At(*at));
            }
        }
        next
    }

    // --- internals ---

    fn peer_path(&self) -> AddressField {
        AddressField::direct(self.key.remote.clone(), self.key.local.clone())
    }

    fn reply_path(&self) -> AddressField {
        let mut path = self.peer_path();
        // Responses carry the C bit on the source entry instead.
        path.destination.command = false;
        path.source.command = true;
        path
    }

    fn push_frame(&mut self, mut frame: Ax25Frame) {
        frame.channel_id = self.channel_id;
        self.stats.packets_sent += 1;
        self.outgoing.push_back(frame);
    }

    fn send_control(&mut self, control: Control) {
        let path = match control {
            // Acknowledgements and mode responses are responses; mode-setting frames commands.
            Control::U {
                format: UFormat::Ua,
                ..
            }
            | Control::U {
                format: UFormat::Dm,
                ..
            }
            | Control::U {
                format: UFormat::Frmr,
                ..
            } => self.reply_path(),
            // Acknowledgement S frames are responses; command polls go through `send_poll`.
            Control::S { .. } => self.reply_path(),
            _ => self.peer_path(),
        };
        let frame = Ax25Frame::control(path, control);
        self.push_frame(frame);
    }

    fn send_poll(&mut self, now: Instant) {
        let format = if self.local_busy {
            SFormat::Rnr
        } else {
            SFormat::Rr
        };
        let control = Control::S {
            format,
            nr: self.vr,
            poll_final: true,
        };
        let frame = Ax25Frame::control(self.peer_path(), control);
        self.push_frame(frame);
        if self.t1.is_none() {
            self.t1 = Some(now + self.config.t1);
        }
    }

    fn send_ack(&mut self, final_bit: bool) {
        let format = if self.local_busy {
            SFormat::Rnr
        } else {
            SFormat::Rr
        };
        self.send_control(Control::S {
            format,
            nr: self.vr,
            poll_final: final_bit,
        });
        self.ack_pending = false;
    }

    fn send_mode_request(&mut self, poll: bool) {
        let format = match self.modulus {
            Modulus::Eight => UFormat::Sabm,
            Modulus::OneTwentyEight => UFormat::Sabme,
        };
        self.send_control(Control::U {
            format,
            poll_final: poll,
        });
    }

    fn schedule_t2(&mut self, now: Instant) {
        if self.t2.is_none() {
            self.t2 = Some(now + self.config.t2);
        }
    }

    fn reset_link(&mut self, modulus: Modulus) {
        self.modulus = modulus;
        self.vs = SeqNum::ZERO;
        self.vr = SeqNum::ZERO;
        self.va = SeqNum::ZERO;
        self.send_window.clear();
        self.recv_buffer.clear();
        self.sent_rej = false;
        self.peer_busy = false;
        self.ack_pending = false;
        self.rc = 0;
    }

    fn set_state(&mut self, state: ConnectionState, reason: Option<Error>) {
        if self.state != state {
            self.state = state;
            self.events
                .push_back(SessionEvent::StateChanged { state, reason });
        }
    }

    fn go_disconnected(&mut self, reason: Option<Error>, now: Instant) {
        self.t1 = None;
        self.t2 = None;
        self.t3 = None;
        self.reap_at = Some(now + self.config.disc_linger);
        self.set_state(ConnectionState::Disconnected, reason);
    }

    fn surface_lost_data(&mut self) {
        let unsent: usize = self
            .pending_outbound
            .iter()
            .map(Vec::len)
            .chain(self.send_window.iter().map(|f| f.payload.len()))
            .sum();
        if unsent > 0 {
            warn!("{}: {} bytes lost on teardown", self.key, unsent);
            self.events
                .push_back(SessionEvent::SendAborted {
                    unsent_bytes: unsent,
                });
        }
        self.pending_outbound.clear();
        self.send_window.clear();
    }

    fn protocol_error(&mut self, now: Instant) {
        // An acknowledgement outside the window means the two ends disagree about link state.
        self.send_control(Control::U {
            format: UFormat::Frmr,
            poll_final: false,
        });
        self.surface_lost_data();
        self.go_disconnected(Some(Error::InvalidValue), now);
    }

    fn handle_unnumbered(
        &mut self,
        format: UFormat,
        poll_final: bool,
        frame: &Ax25Frame,
        now: Instant,
    ) {
        match format {
            UFormat::Sabm | UFormat::Sabme => {
                if format == UFormat::Sabme && !self.config.allow_mod128 {
                    self.send_control(Control::U {
                        format: UFormat::Dm,
                        poll_final,
                    });
                    return;
                }
                self.reset_link(match format {
                    UFormat::Sabme => Modulus::OneTwentyEight,
                    _ => Modulus::Eight,
                });
                self.send_control(Control::U {
                    format: UFormat::Ua,
                    poll_final,
                });
                self.t1 = None;
                self.t2 = None;
                self.t3 = Some(now + self.config.t3);
                self.stats.start_time = Some(now);
                self.set_state(ConnectionState::Connected, None);
            }
            UFormat::Ua => match self.state {
                ConnectionState::Connecting => {
                    self.t1 = None;
                    self.rc = 0;
                    self.vs = SeqNum::ZERO;
                    self.vr = SeqNum::ZERO;
                    self.va = SeqNum::ZERO;
                    self.t3 = Some(now + self.config.t3);
                    self.stats.start_time = Some(now);
                    self.set_state(ConnectionState::Connected, None);
                    // Data accepted while connecting is held; release it now.
                    self.pump_sends(now);
                }
                ConnectionState::Disconnecting => {
                    self.go_disconnected(None, now);
                }
                _ => debug!("{}: unexpected UA", self.key),
            },
            UFormat::Dm => match self.state {
                ConnectionState::Connecting => {
                    self.surface_lost_data();
                    self.go_disconnected(Some(Error::PeerRefused), now);
                }
                ConnectionState::Disconnecting => self.go_disconnected(None, now),
                ConnectionState::Connected => {
                    // The peer lost its link state; nothing to keep alive here.
                    self.surface_lost_data();
                    self.go_disconnected(Some(Error::PeerRefused), now);
                }
                ConnectionState::Disconnected => {}
            },
            UFormat::Disc => {
                self.send_control(Control::U {
                    format: UFormat::Ua,
                    poll_final,
                });
                if self.state != ConnectionState::Disconnected {
                    self.surface_lost_data();
                    self.go_disconnected(None, now);
                }
            }
            UFormat::Ui => {
                self.events.push_back(SessionEvent::UiData {
                    pid: frame.pid.unwrap_or(PID_NO_L3),
                    data: frame.payload.clone(),
                });
            }
            UFormat::Frmr => {
                warn!("{}: peer reported frame reject", self.key);
                self.surface_lost_data();
                self.go_disconnected(Some(Error::InvalidValue), now);
            }
            UFormat::Xid | UFormat::Test => {
                debug!("{}: ignoring {:?}", self.key, format);
            }
        }
    }

    fn handle_information(
        &mut self,
        ns: SeqNum,
        nr: SeqNum,
        poll: bool,
        payload: &[u8],
        pid: Option<u8>,
        now: Instant,
    ) {
        if self.state != ConnectionState::Connected {
            if self.state == ConnectionState::Disconnected {
                self.send_control(Control::U {
                    format: UFormat::Dm,
                    poll_final: poll,
                });
            }
            return;
        }
        if pid.map(|p| p != PID_NO_L3).unwrap_or(false) {
            debug!("{}: I frame with PID {:?}", self.key, pid);
        }
        if !self.process_ack(nr, now) {
            return;
        }

        if self.local_busy {
            // Not accepting payloads right now; RNR tells the peer to hold off.
            self.send_ack(poll);
            return;
        }

        let k = ns.offset_from(self.vr, self.modulus);
        let window = self.config.max_frames.min(self.modulus.value() - 1);
        if k == 0 {
            self.deliver(payload.to_vec());
            self.vr.advance(self.modulus);
            self.sent_rej = false;
            // Close the gap from the buffer, in sequence.
            while let Some(buffered) = self.recv_buffer.remove(&self.vr.value()) {
                self.deliver(buffered);
                self.vr.advance(self.modulus);
            }
            if poll {
                self.send_ack(true);
            } else {
                self.ack_pending = true;
                self.schedule_t2(now);
            }
        } else if k < window.saturating_sub(1) {
            // A future frame within the window: keep it for the gap to close.
            self.recv_buffer.insert(ns.value(), payload.to_vec());
            self.nack_gap(poll);
        } else if k >= self.modulus.value() - window {
            // Behind V(R): a duplicate of something already delivered. Re-acknowledge.
            trace!("{}: duplicate I frame ns={}", self.key, ns);
            if poll {
                self.send_ack(true);
            } else {
                self.ack_pending = true;
                self.schedule_t2(now);
            }
        } else {
            // Too far ahead to admit under the window.
            trace!("{}: inadmissible I frame ns={} (vr={})", self.key, ns, self.vr);
            self.nack_gap(poll);
        }
    }

    fn nack_gap(&mut self, final_bit: bool) {
        if !self.sent_rej {
            self.send_control(Control::S {
                format: SFormat::Rej,
                nr: self.vr,
                poll_final: final_bit,
            });
            self.sent_rej = true;
        } else if final_bit {
            self.send_ack(true);
        }
    }

    fn deliver(&mut self, payload: Vec<u8>) {
        self.stats.bytes_received += payload.len() as u64;
        self.events.push_back(SessionEvent::Data(payload));
    }

    fn handle_supervisory(
        &mut self,
        format: SFormat,
        nr: SeqNum,
        poll_final: bool,
        is_command: bool,
        now: Instant,
    ) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if !self.process_ack(nr, now) {
            return;
        }
        match format {
            SFormat::Rr => {
                if self.peer_busy {
                    self.peer_busy = false;
                    // Frames refused while the peer was busy were never accepted; resend them
                    // before releasing queued traffic.
                    self.retransmit_window(now);
                    self.pump_sends(now);
                }
            }
            SFormat::Rnr => {
                if !self.peer_busy {
                    debug!("{}: peer busy", self.key);
                }
                self.peer_busy = true;
                // Re-probe on the response delay.
                self.schedule_t2(now);
            }
            SFormat::Rej => {
                self.peer_busy = false;
                self.retransmit_window(now);
            }
            SFormat::Srej => {
                // Retransmit just the requested frame.
                if let Some(sent) = self.send_window.iter().find(|f| f.ns == nr) {
                    let frame = Ax25Frame {
                        addresses: self.peer_path(),
                        control: Control::I {
                            ns: sent.ns,
                            nr: self.vr,
                            poll: false,
                        },
                        pid: Some(PID_NO_L3),
                        payload: sent.payload.clone(),
                        channel_id: 0,
                        channel_name: Default::default(),
                    };
                    self.push_frame(frame);
                    self.t1 = Some(now + self.config.t1);
                }
            }
        }
        if poll_final && is_command {
            // A command poll demands an immediate status report with F=1.
            self.send_ack(true);
        } else if poll_final {
            // The final response to one of our polls: the peer is alive.
            self.rc = 0;
            if self.send_window.is_empty() {
                self.t1 = None;
            }
        }
    }

    /// Accounts an incoming N(R). Returns `false` when the session was torn down.
    fn process_ack(&mut self, nr: SeqNum, now: Instant) -> bool {
        if !in_window(nr, self.va, self.vs, self.modulus) {
            warn!(
                "{}: N(R)={} outside window va={} vs={}",
                self.key, nr, self.va, self.vs
            );
            self.protocol_error(now);
            return false;
        }
        let advanced = nr != self.va;
        while self.va != nr {
            let acked = self.send_window.pop_front();
            debug_assert!(acked.map(|f| f.ns == self.va).unwrap_or(false));
            self.va.advance(self.modulus);
        }
        if advanced {
            self.rc = 0;
            if self.send_window.is_empty() {
                self.t1 = None;
            } else {
                self.t1 = Some(now + self.config.t1);
            }
            // Window space opened up; more data may flow.
            self.pump_sends(now);
        }
        true
    }

    fn retransmit_window(&mut self, now: Instant) {
        let frames: Vec<Ax25Frame> = self
            .send_window
            .iter()
            .map(|sent| Ax25Frame {
                addresses: self.peer_path(),
                control: Control::I {
                    ns: sent.ns,
                    nr: self.vr,
                    poll: false,
                },
                pid: Some(PID_NO_L3),
                payload: sent.payload.clone(),
                channel_id: 0,
                channel_name: Default::default(),
            })
            .collect();
        for frame in frames {
            self.push_frame(frame);
        }
        if !self.send_window.is_empty() {
            self.t1 = Some(now + self.config.t1);
        }
        // The retransmission acknowledges everything received so far.
        self.ack_pending = false;
    }

    fn pump_sends(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected || self.peer_busy {
            return;
        }
        while (self.send_window.len() as u8) < self.config.max_frames {
            let chunk = match self.pending_outbound.pop_front() {
                Some(chunk) => chunk,
                None => break,
            };
            let ns = self.vs;
            self.stats.bytes_sent += chunk.len() as u64;
            let frame = Ax25Frame {
                addresses: self.peer_path(),
                control: Control::I {
                    ns,
                    nr: self.vr,
                    poll: false,
                },
                pid: Some(PID_NO_L3),
                payload: chunk.clone(),
                channel_id: 0,
                channel_name: Default::default(),
            };
            self.push_frame(frame);
            self.send_window.push_back(SentFrame { ns, payload: chunk });
            self.vs.advance(self.modulus);
            // The piggybacked N(R) acknowledged everything delivered so far.
            self.ack_pending = false;
            if self.t1.is_none() {
                self.t1 = Some(now + self.config.t1);
            }
        }
    }

    fn t1_expired(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Connecting => {
                self.rc += 1;
                if self.rc > self.config.n2 {
                    self.go_disconnected(Some(Error::LinkTimeout), now);
                } else {
                    self.send_mode_request(true);
                    self.t1 = Some(now + self.config.t1);
                }
            }
            ConnectionState::Disconnecting => {
                self.rc += 1;
                if self.rc > self.config.n2 {
                    // Give up waiting for the UA; the link is gone either way.
                    self.go_disconnected(Some(Error::LinkTimeout), now);
                } else {
                    self.send_control(Control::U {
                        format: UFormat::Disc,
                        poll_final: true,
                    });
                    self.t1 = Some(now + self.config.t1);
                }
            }
            ConnectionState::Connected => {
                self.rc += 1;
                if self.rc > self.config.n2 {
                    self.surface_lost_data();
                    self.go_disconnected(Some(Error::LinkTimeout), now);
                } else if self.send_window.is_empty() || self.peer_busy {
                    self.send_poll(now);
                } else {
                    self.retransmit_window(now);
                    // Poll for the peer's receive state alongside the retransmission.
                    if let Some(Ax25Frame {
                        control: Control::I { poll, .. },
                        ..
                    }) = self.outgoing.back_mut()
                    {
                        *poll = true;
                    }
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    fn t2_expired(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if self.peer_busy {
            // Busy probe; keep probing at the response pace until the peer recovers.
            self.send_poll(now);
            self.schedule_t2(now);
            return;
        }
        self.pump_sends(now);
        if self.ack_pending {
            self.send_ack(false);
        }
    }

    fn t3_expired(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            // Idle link check.
            self.send_poll(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::Callsign;

    const MS: u32 = 1_000;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_micros(ms * MS)
    }

    fn pair() -> (Ax25Session, Ax25Session) {
        let a_call = Callsign::parse("N0CALL-1").unwrap();
        let b_call = Callsign::parse("W1AW-2").unwrap();
        let a = Ax25Session::new(
            SessionKey::new(a_call.clone(), b_call.clone()),
            0,
            SessionConfig::default(),
        );
        let b = Ax25Session::new(SessionKey::new(b_call, a_call), 0, SessionConfig::default());
        (a, b)
    }

    /// Carries every queued frame from `from` to `to`, optionally dropping by index.
    fn shuttle(from: &mut Ax25Session, to: &mut Ax25Session, now: Instant, drop: &[usize]) {
        let mut i = 0;
        while let Some(frame) = from.pop_outgoing() {
            let bytes = frame.encode(from.modulus());
            if !drop.contains(&i) {
                let decoded = Ax25Frame::parse(&bytes, to.modulus()).unwrap();
                to.handle_frame(&decoded, now);
            }
            i += 1;
        }
    }

    fn drain_data(s: &mut Ax25Session) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = VecDeque::new();
        while let Some(ev) = s.pop_event() {
            match ev {
                SessionEvent::Data(d) => out.extend_from_slice(&d),
                other => rest.push_back(other),
            }
        }
        s.events = rest;
        out
    }

    fn connect(a: &mut Ax25Session, b: &mut Ax25Session) {
        a.connect(at(0)).unwrap();
        shuttle(a, b, at(1), &[]);
        shuttle(b, a, at(2), &[]);
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
        while a.pop_event().is_some() {}
        while b.pop_event().is_some() {}
    }

    #[test]
    fn connect_send_disconnect() {
        let (mut a, mut b) = pair();

        a.connect(at(0)).unwrap();
        assert_eq!(a.state(), ConnectionState::Connecting);
        shuttle(&mut a, &mut b, at(1), &[]);
        assert_eq!(b.state(), ConnectionState::Connected);
        shuttle(&mut b, &mut a, at(2), &[]);
        assert_eq!(a.state(), ConnectionState::Connected);

        a.send(b"HELLO", false, at(10)).unwrap();
        a.send(b" WORLD", true, at(11)).unwrap();
        shuttle(&mut a, &mut b, at(12), &[]);
        assert_eq!(drain_data(&mut b), b"HELLO WORLD");

        // B owes a delayed RR; let T2 fire.
        b.update_timers(at(12 + 100));
        shuttle(&mut b, &mut a, at(113), &[]);

        a.disconnect(at(120));
        shuttle(&mut a, &mut b, at(121), &[]);
        assert_eq!(b.state(), ConnectionState::Disconnected);
        shuttle(&mut b, &mut a, at(122), &[]);
        assert_eq!(a.state(), ConnectionState::Disconnected);

        assert!(a.stats().packets_sent >= 3);
        assert_eq!(a.stats().bytes_sent, 11);
        assert_eq!(b.stats().bytes_received, 11);
    }

    #[test]
    fn refused_connection() {
        let (mut a, mut b) = pair();
        b.config.allow_mod128 = false;
        a.config.prefer_mod128 = true;

        a.connect(at(0)).unwrap();
        shuttle(&mut a, &mut b, at(1), &[]);
        assert_eq!(b.state(), ConnectionState::Disconnected);
        shuttle(&mut b, &mut a, at(2), &[]);
        // DM answers SABME; the connect attempt fails with PeerRefused.
        assert_eq!(a.state(), ConnectionState::Disconnected);
        let mut saw_refused = false;
        while let Some(ev) = a.pop_event() {
            if let SessionEvent::StateChanged {
                state: ConnectionState::Disconnected,
                reason: Some(Error::PeerRefused),
            } = ev
            {
                saw_refused = true;
            }
        }
        assert!(saw_refused);
    }

    #[test]
    fn sabme_negotiates_mod128() {
        let (mut a, mut b) = pair();
        a.config.prefer_mod128 = true;

        a.connect(at(0)).unwrap();
        shuttle(&mut a, &mut b, at(1), &[]);
        assert_eq!(b.state(), ConnectionState::Connected);
        assert_eq!(b.modulus(), Modulus::OneTwentyEight);
        shuttle(&mut b, &mut a, at(2), &[]);
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(a.modulus(), Modulus::OneTwentyEight);

        a.send(b"extended", true, at(3)).unwrap();
        shuttle(&mut a, &mut b, at(4), &[]);
        assert_eq!(drain_data(&mut b), b"extended");
    }

    #[test]
    fn out_of_order_single_rej() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        a.send(b"A", true, at(10)).unwrap();
        a.send(b"B", true, at(10)).unwrap();
        a.send(b"C", true, at(10)).unwrap();
        // Drop I0; B sees I1 then I2.
        shuttle(&mut a, &mut b, at(11), &[0]);

        // Exactly one REJ(0) went back.
        let mut rejs = 0;
        let mut frames = Vec::new();
        while let Some(f) = b.pop_outgoing() {
            if let Control::S {
                format: SFormat::Rej,
                nr,
                ..
            } = f.control
            {
                rejs += 1;
                assert_eq!(nr.value(), 0);
            }
            frames.push(f);
        }
        assert_eq!(rejs, 1);
        assert!(drain_data(&mut b).is_empty());
        for f in frames {
            a.handle_frame(&f, at(12));
        }

        // A retransmits starting at 0; everything arrives in order exactly once.
        shuttle(&mut a, &mut b, at(13), &[]);
        assert_eq!(drain_data(&mut b), b"ABC");
        assert!(b.recv_buffer.is_empty());

        // The later duplicates must not have produced duplicate deliveries.
        assert_eq!(b.stats().bytes_received, 3);
    }

    #[test]
    fn too_far_ahead_is_discarded() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        // Forge I-frames ns=1..=3 towards B (ns=0 missing). max_frames=4 admits ns=1,2; ns=3 is
        // at the window edge and must be discarded.
        for ns in 1u8..=3 {
            let frame = Ax25Frame {
                addresses: b.peer_path().reversed(),
                control: Control::I {
                    ns: SeqNum::new(ns, Modulus::Eight),
                    nr: SeqNum::ZERO,
                    poll: false,
                },
                pid: Some(PID_NO_L3),
                payload: alloc::vec![ns],
                channel_id: 0,
                channel_name: Default::default(),
            };
            b.handle_frame(&frame, at(10 + u32::from(ns)));
        }
        assert_eq!(b.recv_buffer.len(), 2);
        assert!(!b.recv_buffer.contains_key(&3));
    }

    #[test]
    fn t1_retry_until_link_timeout() {
        let (mut a, _b) = pair();
        a.connect(at(0)).unwrap();
        let mut sabms = 0;
        while let Some(f) = a.pop_outgoing() {
            if matches!(
                f.control,
                Control::U {
                    format: UFormat::Sabm,
                    ..
                }
            ) {
                sabms += 1;
            }
        }
        assert_eq!(sabms, 1);

        // Let T1 fire n2+1 times with no response.
        let mut now = 0u32;
        for _ in 0..=a.config.n2 {
            now += a.config.t1.whole_millis() + 1;
            a.update_timers(at(now));
        }
        assert_eq!(a.state(), ConnectionState::Disconnected);
        let mut retries = 0;
        let mut timed_out = false;
        while let Some(ev) = a.pop_event() {
            if let SessionEvent::StateChanged {
                reason: Some(Error::LinkTimeout),
                ..
            } = ev
            {
                timed_out = true;
            }
        }
        while let Some(f) = a.pop_outgoing() {
            if matches!(
                f.control,
                Control::U {
                    format: UFormat::Sabm,
                    ..
                }
            ) {
                retries += 1;
            }
        }
        assert!(timed_out);
        assert_eq!(retries, usize::from(a.config.n2));
    }

    #[test]
    fn t1_retransmits_unacked_window() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        a.send(b"payload", true, at(10)).unwrap();
        // Lose the I frame entirely.
        while a.pop_outgoing().is_some() {}

        a.update_timers(at(10 + 4_001));
        let f = a.pop_outgoing().expect("retransmission");
        match f.control {
            Control::I { ns, poll, .. } => {
                assert_eq!(ns.value(), 0);
                assert!(poll);
            }
            other => panic!("expected I frame, got {:?}", other),
        }

        // The retransmission reaches B and is delivered once.
        let bytes = f.encode(a.modulus());
        b.handle_frame(&Ax25Frame::parse(&bytes, b.modulus()).unwrap(), at(14_002));
        assert_eq!(drain_data(&mut b), b"payload");
    }

    #[test]
    fn peer_busy_suspends_sends() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        // B goes busy and tells A.
        b.set_local_busy(true);
        a.send(b"one", true, at(10)).unwrap();
        shuttle(&mut a, &mut b, at(11), &[]);
        // B refused delivery with RNR.
        assert!(drain_data(&mut b).is_empty());
        shuttle(&mut b, &mut a, at(12), &[]);
        assert!(a.peer_busy);

        // Further sends queue instead of entering the window.
        a.send(b"two", true, at(13)).unwrap();
        assert!(a.pop_outgoing().is_none());

        // A's T2 probe polls the (still busy) peer.
        a.update_timers(at(13 + 101));
        let probe = a.pop_outgoing().expect("RR probe");
        assert!(matches!(
            probe.control,
            Control::S {
                format: SFormat::Rr,
                poll_final: true,
                ..
            }
        ));

        // B recovers; its RR(F) releases the suspended traffic.
        b.set_local_busy(false);
        b.handle_frame(
            &Ax25Frame::parse(&probe.encode(a.modulus()), b.modulus()).unwrap(),
            at(150),
        );
        shuttle(&mut b, &mut a, at(151), &[]);
        assert!(!a.peer_busy);
        shuttle(&mut a, &mut b, at(152), &[]);
        let got = drain_data(&mut b);
        assert!(got.ends_with(b"two"));
    }

    #[test]
    fn t3_probes_idle_link() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        a.update_timers(at(181_000));
        let probe = a.pop_outgoing().expect("T3 probe");
        assert!(matches!(
            probe.control,
            Control::S {
                format: SFormat::Rr,
                poll_final: true,
                ..
            }
        ));
        // The probe starts T1; the peer's F response clears it.
        assert!(a.t1.is_some());
        b.handle_frame(
            &Ax25Frame::parse(&probe.encode(a.modulus()), b.modulus()).unwrap(),
            at(181_001),
        );
        shuttle(&mut b, &mut a, at(181_002), &[]);
        assert!(matches!(a.state(), ConnectionState::Connected));
    }

    #[test]
    fn invalid_ack_is_protocol_error() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        // RR acknowledging a frame A never sent.
        let rr = Ax25Frame::control(
            a.peer_path().reversed(),
            Control::S {
                format: SFormat::Rr,
                nr: SeqNum::new(5, Modulus::Eight),
                poll_final: false,
            },
        );
        a.handle_frame(&rr, at(10));
        assert_eq!(a.state(), ConnectionState::Disconnected);
        let mut frmr = false;
        while let Some(f) = a.pop_outgoing() {
            if matches!(
                f.control,
                Control::U {
                    format: UFormat::Frmr,
                    ..
                }
            ) {
                frmr = true;
            }
        }
        assert!(frmr);
        let _ = b;
    }

    #[test]
    fn incoming_disc_is_acknowledged() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        b.disconnect(at(10));
        shuttle(&mut b, &mut a, at(11), &[]);
        assert_eq!(a.state(), ConnectionState::Disconnected);
        shuttle(&mut a, &mut b, at(12), &[]);
        assert_eq!(b.state(), ConnectionState::Disconnected);

        // Sessions become reapable after the linger.
        assert!(!a.ready_to_reap(at(12)));
        while a.pop_event().is_some() {}
        assert!(a.ready_to_reap(at(500)));
    }

    #[test]
    fn lost_data_is_surfaced() {
        let (mut a, mut b) = pair();
        connect(&mut a, &mut b);

        a.send(b"doomed", true, at(10)).unwrap();
        while a.pop_outgoing().is_some() {}
        a.transport_closed(at(11));
        let mut aborted = None;
        while let Some(ev) = a.pop_event() {
            if let SessionEvent::SendAborted { unsent_bytes } = ev {
                aborted = Some(unsent_bytes);
            }
        }
        assert_eq!(aborted, Some(6));
        let _ = b;
    }

    #[test]
    fn ui_passthrough() {
        let (mut a, mut b) = pair();
        a.send_ui(PID_NO_L3, b"beacon".to_vec());
        shuttle(&mut a, &mut b, at(1), &[]);
        let ev = b.pop_event().unwrap();
        assert_eq!(
            ev,
            SessionEvent::UiData {
                pid: PID_NO_L3,
                data: b"beacon".to_vec()
            }
        );
    }
}
