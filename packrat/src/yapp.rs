//! YAPP file transfer over a connected AX.25 session.
//!
//! A small stop-and-wait block protocol. The sender offers a file (`SI`), the receiver accepts
//! (`RR`) or refuses (`RF`), data then moves in `DT` blocks of at most [`YappConfig::block_len`]
//! bytes, each acknowledged with `RR`; `ET` ends the file and is acknowledged one last time.
//! Either side can abort with `AT`, and a missing acknowledgement aborts after
//! [`YappConfig::ack_timeout`].
//!
//! An optional trailing XOR checksum per data block is negotiated at `SI` time (a `C` suffix on
//! the init packet).
//!
//! While a transfer is active the owning service routes all session bytes here; ordinary command
//! processing resumes after `ET`/`AT`.
//!
//! [`YappConfig::block_len`]: struct.YappConfig.html
//! [`YappConfig::ack_timeout`]: struct.YappConfig.html

use crate::ax25::session::Ax25Session;
use crate::time::{Duration, Instant, NextUpdate};
use crate::Error;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write as _;

/// Send-init: `SI <filename> NUL <length-ascii> NUL [C]`.
const SI: u8 = 0x01;
/// Receiver ready: accept / acknowledge.
const RR: u8 = 0x02;
/// Refused.
const RF: u8 = 0x03;
/// Data block: `DT <len> <bytes> [xor]`.
const DT: u8 = 0x04;
/// End of file.
const ET: u8 = 0x05;
/// Abort.
const AT: u8 = 0x06;

#[derive(Debug, Clone)]
pub struct YappConfig {
    /// Data bytes per `DT` block.
    pub block_len: usize,
    /// How long to wait for the peer's next packet before aborting.
    pub ack_timeout: Duration,
    /// Offer the per-block XOR checksum when sending.
    pub use_checksum: bool,
}

impl Default for YappConfig {
    fn default() -> Self {
        YappConfig {
            block_len: 128,
            ack_timeout: Duration::from_secs(30),
            use_checksum: false,
        }
    }
}

/// Transfer progress reported to the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum YappEvent {
    /// The peer offers a file; answer with [`accept`] or [`refuse`].
    ///
    /// [`accept`]: struct.YappSession.html#method.accept
    /// [`refuse`]: struct.YappSession.html#method.refuse
    FileOffered { name: String, size: u32 },
    /// A whole file arrived.
    FileReceived { name: String, data: Vec<u8> },
    /// The offered file was fully sent and acknowledged.
    FileSent { name: String },
    /// The transfer ended without completing.
    TransferAborted { reason: Option<Error> },
}

enum State {
    Idle,
    /// Sender: init sent, awaiting RR/RF.
    SiSent,
    /// Sender: a data block is unacknowledged.
    SendingBlock { offset: usize },
    /// Sender: ET sent, awaiting the final RR.
    EtSent,
    /// Receiver: offer surfaced, awaiting the local verdict.
    Offered { name: String, size: u32, checksum: bool },
    /// Receiver: accepting DT blocks.
    Receiving {
        name: String,
        size: u32,
        checksum: bool,
        data: Vec<u8>,
    },
}

/// One YAPP endpoint (sender or receiver, decided by use).
pub struct YappSession {
    config: YappConfig,
    state: State,
    buf: VecDeque<u8>,
    outgoing: Option<(String, Vec<u8>)>,
    /// Whether the active transfer uses per-block checksums.
    checksummed: bool,
    deadline: Option<Instant>,
    events: VecDeque<YappEvent>,
}

impl YappSession {
    pub fn new(config: YappConfig) -> Self {
        YappSession {
            config,
            state: State::Idle,
            buf: VecDeque::new(),
            outgoing: None,
            checksummed: false,
            deadline: None,
            events: VecDeque::new(),
        }
    }

    /// Whether a transfer is in progress (session bytes belong to YAPP).
    pub fn is_active(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub fn pop_event(&mut self) -> Option<YappEvent> {
        self.events.pop_front()
    }

    /// Sender entry point: offers `data` to the peer under `name`.
    pub fn offer_file(
        &mut self,
        name: &str,
        data: Vec<u8>,
        link: &mut Ax25Session,
        now: Instant,
    ) -> Result<(), Error> {
        if self.is_active() {
            return Err(Error::InvalidValue);
        }
        let mut init = Vec::with_capacity(name.len() + 16);
        init.push(SI);
        init.extend_from_slice(name.as_bytes());
        init.push(0);
        let mut len = String::new();
        let _ = write!(len, "{}", data.len());
        init.extend_from_slice(len.as_bytes());
        init.push(0);
        if self.config.use_checksum {
            init.push(b'C');
        }
        link.send(&init, true, now)?;
        self.checksummed = self.config.use_checksum;
        self.outgoing = Some((String::from(name), data));
        self.state = State::SiSent;
        self.arm(now);
        Ok(())
    }

    /// Receiver verdict: accept the pending offer.
    pub fn accept(&mut self, link: &mut Ax25Session, now: Instant) -> Result<(), Error> {
        match core::mem::replace(&mut self.state, State::Idle) {
            State::Offered { name, size, checksum } => {
                link.send(&[RR], true, now)?;
                self.checksummed = checksum;
                self.state = State::Receiving {
                    name,
                    size,
                    checksum,
                    data: Vec::new(),
                };
                self.arm(now);
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::InvalidValue)
            }
        }
    }

    /// Receiver verdict: refuse the pending offer.
    pub fn refuse(&mut self, link: &mut Ax25Session, now: Instant) -> Result<(), Error> {
        match core::mem::replace(&mut self.state, State::Idle) {
            State::Offered { .. } => {
                link.send(&[RF], true, now)?;
                self.deadline = None;
                Ok(())
            }
            other => {
                self.state = other;
                Err(Error::InvalidValue)
            }
        }
    }

    /// Aborts whatever is in progress.
    pub fn abort(&mut self, link: &mut Ax25Session, now: Instant) {
        if self.is_active() {
            let _ = link.send(&[AT], true, now);
            self.finish_aborted(None);
        }
    }

    /// Feeds connected-session bytes.
    pub fn process(&mut self, data: &[u8], link: &mut Ax25Session, now: Instant) {
        self.buf.extend(data.iter().copied());
        while self.step(link, now) {}
    }

    /// Ack-timeout handling.
    pub fn update_timers(&mut self, link: &mut Ax25Session, now: Instant) {
        if let Some(deadline) = self.deadline {
            if now.has_reached(deadline) && self.is_active() {
                warn!("yapp transfer timed out");
                let _ = link.send(&[AT], true, now);
                self.finish_aborted(Some(Error::LinkTimeout));
            }
        }
    }

    pub fn next_update(&self) -> NextUpdate {
        match self.deadline {
            Some(at) if self.is_active() => NextUpdate::At(at),
            _ => NextUpdate::Disable,
        }
    }

    // --- internals ---

    fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.config.ack_timeout);
    }

    fn finish_aborted(&mut self, reason: Option<Error>) {
        self.state = State::Idle;
        self.outgoing = None;
        self.buf.clear();
        self.deadline = None;
        self.events.push_back(YappEvent::TransferAborted { reason });
    }

    /// Tries to consume one packet; returns whether progress was made.
    fn step(&mut self, link: &mut Ax25Session, now: Instant) -> bool {
        let kind = match self.buf.front() {
            Some(&k) => k,
            None => return false,
        };
        match kind {
            SI => self.take_si(),
            DT => self.take_dt(link, now),
            RR | RF | ET | AT => {
                self.buf.pop_front();
                self.on_control(kind, link, now);
                true
            }
            other => {
                warn!("unexpected yapp byte {:#04x}", other);
                self.buf.pop_front();
                true
            }
        }
    }

    fn take_si(&mut self) -> bool {
        // SI name NUL digits NUL [C] — wait for both terminators before parsing.
        let mut nuls = self.buf.iter().enumerate().filter(|(_, &b)| b == 0);
        let first = match nuls.next() {
            Some((i, _)) => i,
            None => return false,
        };
        let second = match nuls.next() {
            Some((i, _)) => i,
            None => return false,
        };
        let packet: Vec<u8> = self.buf.drain(..=second).collect();
        let name = String::from_utf8_lossy(&packet[1..first]).into_owned();
        let size: u32 = core::str::from_utf8(&packet[first + 1..second])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let checksum = if self.buf.front() == Some(&b'C') {
            self.buf.pop_front();
            true
        } else {
            false
        };
        if self.is_active() {
            debug!("SI while busy; ignored");
            return true;
        }
        self.state = State::Offered {
            name: name.clone(),
            size,
            checksum,
        };
        self.events.push_back(YappEvent::FileOffered { name, size });
        true
    }

    fn take_dt(&mut self, link: &mut Ax25Session, now: Instant) -> bool {
        let len = match self.buf.get(1) {
            Some(&l) => {
                if l == 0 {
                    256
                } else {
                    usize::from(l)
                }
            }
            None => return false,
        };
        let total = 2 + len + usize::from(self.checksummed);
        if self.buf.len() < total {
            return false;
        }
        self.buf.drain(..2);
        let block: Vec<u8> = self.buf.drain(..len).collect();
        let check = if self.checksummed {
            self.buf.pop_front()
        } else {
            None
        };

        match &mut self.state {
            State::Receiving { data, .. } => {
                if let Some(expected) = check {
                    let xor = block.iter().fold(0u8, |acc, &b| acc ^ b);
                    if xor != expected {
                        warn!("yapp block checksum mismatch");
                        let _ = link.send(&[AT], true, now);
                        self.finish_aborted(Some(Error::ChecksumFailed));
                        return true;
                    }
                }
                data.extend_from_slice(&block);
                let _ = link.send(&[RR], true, now);
                self.arm(now);
            }
            _ => debug!("DT outside a transfer"),
        }
        true
    }

    fn on_control(&mut self, kind: u8, link: &mut Ax25Session, now: Instant) {
        match kind {
            RR => self.on_ready(link, now),
            RF => {
                if matches!(self.state, State::SiSent) {
                    info!("yapp offer refused");
                    self.finish_aborted(Some(Error::PeerRefused));
                }
            }
            ET => {
                if let State::Receiving { .. } = self.state {
                    let _ = link.send(&[RR], true, now);
                    if let State::Receiving { name, data, .. } =
                        core::mem::replace(&mut self.state, State::Idle)
                    {
                        self.deadline = None;
                        self.events.push_back(YappEvent::FileReceived { name, data });
                    }
                }
            }
            AT => {
                if self.is_active() {
                    self.finish_aborted(None);
                }
            }
            _ => unreachable!(),
        }
    }

    fn on_ready(&mut self, link: &mut Ax25Session, now: Instant) {
        match self.state {
            State::SiSent => {
                let empty = self
                    .outgoing
                    .as_ref()
                    .map(|(_, d)| d.is_empty())
                    .unwrap_or(true);
                if empty {
                    // Nothing to move; close the file right away.
                    let _ = link.send(&[ET], true, now);
                    self.state = State::EtSent;
                    self.arm(now);
                } else {
                    self.state = State::SendingBlock { offset: 0 };
                    self.send_block(0, link, now);
                }
            }
            State::SendingBlock { offset } => {
                let next = offset + self.config.block_len.min(
                    self.outgoing
                        .as_ref()
                        .map(|(_, d)| d.len() - offset)
                        .unwrap_or(0),
                );
                let done = self
                    .outgoing
                    .as_ref()
                    .map(|(_, d)| next >= d.len())
                    .unwrap_or(true);
                if done {
                    let _ = link.send(&[ET], true, now);
                    self.state = State::EtSent;
                    self.arm(now);
                } else {
                    self.state = State::SendingBlock { offset: next };
                    self.send_block(next, link, now);
                }
            }
            State::EtSent => {
                self.deadline = None;
                self.state = State::Idle;
                if let Some((name, _)) = self.outgoing.take() {
                    info!("yapp file {} sent", name);
                    self.events.push_back(YappEvent::FileSent { name });
                }
            }
            _ => debug!("stray RR"),
        }
    }

    fn send_block(&mut self, offset: usize, link: &mut Ax25Session, now: Instant) {
        let (chunk, checksummed) = match &self.outgoing {
            Some((_, data)) => {
                let end = (offset + self.config.block_len).min(data.len());
                (data[offset..end].to_vec(), self.checksummed)
            }
            None => return,
        };
        let mut block = Vec::with_capacity(chunk.len() + 3);
        block.push(DT);
        block.push(if chunk.len() == 256 { 0 } else { chunk.len() as u8 });
        block.extend_from_slice(&chunk);
        if checksummed {
            block.push(chunk.iter().fold(0u8, |acc, &b| acc ^ b));
        }
        let _ = link.send(&block, true, now);
        self.arm(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::frame::Ax25Frame;
    use crate::ax25::session::{ConnectionState, SessionConfig, SessionEvent};
    use crate::ax25::{Callsign, SessionKey};

    fn at(ms: u32) -> Instant {
        Instant::from_raw_micros(ms * 1000)
    }

    fn linked_pair() -> (Ax25Session, Ax25Session) {
        let a_call = Callsign::parse("N0CALL-3").unwrap();
        let b_call = Callsign::parse("W1AW").unwrap();
        let mut a = Ax25Session::new(
            SessionKey::new(a_call.clone(), b_call.clone()),
            0,
            SessionConfig::default(),
        );
        let mut b = Ax25Session::new(SessionKey::new(b_call, a_call), 0, SessionConfig::default());
        a.connect(at(0)).unwrap();
        shuttle(&mut a, &mut b);
        shuttle(&mut b, &mut a);
        assert_eq!(a.state(), ConnectionState::Connected);
        while a.pop_event().is_some() {}
        while b.pop_event().is_some() {}
        (a, b)
    }

    fn shuttle(from: &mut Ax25Session, to: &mut Ax25Session) {
        while let Some(frame) = from.pop_outgoing() {
            let bytes = frame.encode(from.modulus());
            to.handle_frame(&Ax25Frame::parse(&bytes, to.modulus()).unwrap(), at(1));
        }
    }

    fn drain(link: &mut Ax25Session) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(ev) = link.pop_event() {
            if let SessionEvent::Data(d) = ev {
                out.extend_from_slice(&d);
            }
        }
        out
    }

    /// Runs both endpoints until the byte flow dries up.
    fn pump(
        tx: &mut YappSession,
        tx_link: &mut Ax25Session,
        rx: &mut YappSession,
        rx_link: &mut Ax25Session,
    ) {
        for _ in 0..200 {
            shuttle(tx_link, rx_link);
            let to_rx = drain(rx_link);
            if !to_rx.is_empty() {
                rx.process(&to_rx, rx_link, at(5));
            }
            // Receiver-side offers are auto-accepted by the tests that want that, outside pump.
            shuttle(rx_link, tx_link);
            let to_tx = drain(tx_link);
            if to_tx.is_empty() {
                break;
            }
            tx.process(&to_tx, tx_link, at(6));
        }
    }

    fn transfer(use_checksum: bool, len: usize) {
        let (mut sl, mut rl) = linked_pair();
        let mut sender = YappSession::new(YappConfig {
            use_checksum,
            ..YappConfig::default()
        });
        let mut receiver = YappSession::new(YappConfig::default());

        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
        sender
            .offer_file("field.log", payload.clone(), &mut sl, at(1))
            .unwrap();

        // Deliver the SI, surface the offer, accept it.
        shuttle(&mut sl, &mut rl);
        let si = drain(&mut rl);
        receiver.process(&si, &mut rl, at(2));
        match receiver.pop_event() {
            Some(YappEvent::FileOffered { name, size }) => {
                assert_eq!(name, "field.log");
                assert_eq!(size as usize, len);
            }
            other => panic!("unexpected {:?}", other),
        }
        receiver.accept(&mut rl, at(3)).unwrap();

        pump(&mut sender, &mut sl, &mut receiver, &mut rl);

        match receiver.pop_event() {
            Some(YappEvent::FileReceived { name, data }) => {
                assert_eq!(name, "field.log");
                assert_eq!(data, payload);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            sender.pop_event(),
            Some(YappEvent::FileSent {
                name: String::from("field.log")
            })
        );
        assert!(!sender.is_active());
        assert!(!receiver.is_active());
    }

    #[test]
    fn plain_transfer() {
        transfer(false, 300);
    }

    #[test]
    fn checksummed_transfer() {
        transfer(true, 129);
    }

    #[test]
    fn empty_file_transfer() {
        transfer(false, 0);
    }

    #[test]
    fn refusal_reaches_sender() {
        let (mut sl, mut rl) = linked_pair();
        let mut sender = YappSession::new(YappConfig::default());
        let mut receiver = YappSession::new(YappConfig::default());

        sender
            .offer_file("secret.bin", alloc::vec![1, 2, 3], &mut sl, at(1))
            .unwrap();
        shuttle(&mut sl, &mut rl);
        let si = drain(&mut rl);
        receiver.process(&si, &mut rl, at(2));
        receiver.refuse(&mut rl, at(3)).unwrap();
        shuttle(&mut rl, &mut sl);
        let rf = drain(&mut sl);
        sender.process(&rf, &mut sl, at(4));
        assert_eq!(
            sender.pop_event(),
            Some(YappEvent::TransferAborted {
                reason: Some(Error::PeerRefused)
            })
        );
        assert!(!sender.is_active());
    }

    #[test]
    fn timeout_aborts() {
        let (mut sl, mut rl) = linked_pair();
        let mut sender = YappSession::new(YappConfig::default());
        sender
            .offer_file("slow.bin", alloc::vec![0; 64], &mut sl, at(1))
            .unwrap();
        assert!(matches!(sender.next_update(), NextUpdate::At(_)));

        // No RR ever arrives.
        sender.update_timers(&mut sl, at(31_000));
        assert_eq!(
            sender.pop_event(),
            Some(YappEvent::TransferAborted {
                reason: Some(Error::LinkTimeout)
            })
        );
        assert!(!sender.is_active());
        let _ = rl;
    }

    #[test]
    fn corrupted_checksum_aborts() {
        let (mut sl, mut rl) = linked_pair();
        let mut receiver = YappSession::new(YappConfig::default());

        // Offer with checksum, then hand-feed a corrupted DT block.
        receiver.process(b"\x01f.bin\x003\x00C", &mut rl, at(1));
        assert!(matches!(
            receiver.pop_event(),
            Some(YappEvent::FileOffered { .. })
        ));
        receiver.accept(&mut rl, at(2)).unwrap();
        receiver.process(&[DT, 3, b'a', b'b', b'c', 0xFF], &mut rl, at(3));
        assert_eq!(
            receiver.pop_event(),
            Some(YappEvent::TransferAborted {
                reason: Some(Error::ChecksumFailed)
            })
        );
        let _ = sl;
    }
}
