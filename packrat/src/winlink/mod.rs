//! The Winlink B2F mail session.
//!
//! Runs on top of an already-connected [`Ax25Session`]. This station implements the server
//! (mailbox) side: it banners with its SID and an optional secure-login challenge, exchanges
//! proposals (`FC`/`F>`/`FS`), and moves compressed mail in SOH/STX/EOT block streams. With a
//! relay target configured the session instead bridges the radio peer byte-for-byte to an
//! internet CMS gateway, falling back to local service when the gateway cannot be reached in
//! time.
//!
//! The session is sans-I/O like everything else in the stack: connected-mode payload bytes go in
//! through [`process`], responses come out through the `Ax25Session` passed to it, and the
//! embedder observes progress through [`WinlinkEvent`]s.
//!
//! [`Ax25Session`]: ../ax25/session/struct.Ax25Session.html
//! [`process`]: struct.WinlinkSession.html#method.process
//! [`WinlinkEvent`]: enum.WinlinkEvent.html

pub mod auth;
pub mod cms;
pub mod crc;
pub mod lzhuf;
pub mod mail;

pub use self::cms::CmsRelayConfig;
pub use self::mail::{Mailbox, MailFlags, MessageId, WinlinkMail};

use self::auth::LoginDigits;
use self::cms::{BinarySwitch, StreamMark};
use self::crc::complement_checksum;
use crate::ax25::session::Ax25Session;
use crate::ax25::Callsign;
use crate::store::Store;
use crate::time::{Duration, Instant, NextUpdate};
use crate::Error;
use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::Write as _;
use rand_core::RngCore;

/// The SID this station banners with: B2F-capable, hierarchical addresses, messages, compression.
pub const STATION_SID: &str = "[WL2K-5.0-B2FWIHJM$]";

/// Block framing bytes of the compressed mail stream.
const SOH: u8 = 0x01;
const STX: u8 = 0x02;
const EOT: u8 = 0x04;

/// Payload bytes per STX block.
const BLOCK_LEN: usize = 128;

/// Station-level Winlink configuration.
#[derive(Debug, Clone)]
pub struct WinlinkConfig {
    /// The callsign presented to the CMS when relaying.
    pub callsign: Callsign,
    /// Secure-login password; `None` disables the PQ challenge entirely.
    pub password: Option<String>,
    /// Bridge sessions to this gateway instead of serving mail locally.
    pub relay: Option<CmsRelayConfig>,
    /// How long to wait for the relay socket before falling back to local service.
    pub relay_timeout: Duration,
}

impl WinlinkConfig {
    pub fn local(callsign: Callsign, password: Option<String>) -> Self {
        WinlinkConfig {
            callsign,
            password,
            relay: None,
            relay_timeout: Duration::from_secs(15),
        }
    }
}

/// Session progress reported to the embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WinlinkEvent {
    /// A mail was received, verified, decompressed and stored.
    MailReceived(MessageId),
    /// An offered mail was accepted and fully streamed to the peer.
    MailSent(MessageId),
    /// The peer failed secure login; the session was refused.
    AuthFailed,
    /// The B2F conversation ended; the AX.25 link should be released.
    SessionClosed,
    /// A relay is configured: open the CMS socket now and report back.
    RelayConnectRequested,
    /// Bytes to forward to the CMS socket.
    RelayData(Vec<u8>),
    /// The relay could not be used; the session fell back to local service.
    RelayFallback,
}

/// One mail proposal, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Proposal {
    mid: MessageId,
    uncompressed: u32,
    compressed: u32,
}

/// A mail offered to the peer, with its compressed payload prepared up front so the proposal
/// sizes are exact.
struct Offered {
    mail: WinlinkMail,
    payload: Vec<u8>,
}

/// Incremental decoder for the SOH/STX/EOT block stream.
struct BlockDecoder {
    buf: VecDeque<u8>,
    payload: Vec<u8>,
}

enum BlockProgress {
    NeedMore,
    Complete { checksum: u8 },
}

impl BlockDecoder {
    fn new() -> Self {
        BlockDecoder {
            buf: VecDeque::new(),
            payload: Vec::new(),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
    }

    /// Consumes as many whole blocks as available.
    fn advance(&mut self) -> Result<BlockProgress, Error> {
        loop {
            let kind = match self.buf.front() {
                Some(&k) => k,
                None => return Ok(BlockProgress::NeedMore),
            };
            match kind {
                SOH | STX => {
                    let len = match self.buf.get(1) {
                        Some(&l) => block_len(kind, l),
                        None => return Ok(BlockProgress::NeedMore),
                    };
                    if self.buf.len() < 2 + len {
                        return Ok(BlockProgress::NeedMore);
                    }
                    self.buf.drain(..2);
                    let block: Vec<u8> = self.buf.drain(..len).collect();
                    if kind == STX {
                        self.payload.extend_from_slice(&block);
                    } else {
                        // SOH: subject NUL offset NUL; informational only.
                        trace!("mail header block: {:?}", crate::utils::HexSlice(&block));
                    }
                }
                EOT => {
                    if self.buf.len() < 2 {
                        return Ok(BlockProgress::NeedMore);
                    }
                    self.buf.drain(..1);
                    let checksum = self.buf.pop_front().unwrap();
                    return Ok(BlockProgress::Complete { checksum });
                }
                other => {
                    warn!("unexpected block type {:#04x}", other);
                    return Err(Error::InvalidValue);
                }
            }
        }
    }

    /// Bytes that arrived after the stream completed.
    fn leftover(self) -> Vec<u8> {
        self.buf.into_iter().collect()
    }
}

/// STX length octet 0 means a full 256-byte block.
fn block_len(kind: u8, len: u8) -> usize {
    if kind == STX && len == 0 {
        256
    } else {
        usize::from(len)
    }
}

enum State {
    /// Command mode: banner sent, exchanging lines.
    Greeting,
    /// Client streams compressed mail for the proposals we accepted.
    Receiving {
        accepted: VecDeque<Proposal>,
        decoder: BlockDecoder,
    },
    /// Waiting for the embedder to open the CMS socket.
    RelayConnecting { deadline: Instant },
    /// Transparent bridge to the CMS.
    Relay {
        from_radio: BinarySwitch,
        from_cms: BinarySwitch,
    },
    Closed,
}

/// Server side of one B2F conversation with a radio peer.
pub struct WinlinkSession {
    config: WinlinkConfig,
    peer: Callsign,
    state: State,
    line_buf: Vec<u8>,
    challenge: Option<LoginDigits>,
    authenticated: bool,
    client_sid: Option<String>,
    /// Raw bytes of the FC lines of the current proposal batch, for the `F>` checksum.
    fc_bytes: Vec<u8>,
    proposals: Vec<Proposal>,
    offered: Vec<Offered>,
    events: VecDeque<WinlinkEvent>,
}

impl WinlinkSession {
    pub fn new(config: WinlinkConfig, peer: Callsign) -> Self {
        WinlinkSession {
            config,
            peer,
            state: State::Greeting,
            line_buf: Vec::new(),
            challenge: None,
            authenticated: false,
            client_sid: None,
            fc_bytes: Vec::new(),
            proposals: Vec::new(),
            offered: Vec::new(),
            events: VecDeque::new(),
        }
    }

    pub fn pop_event(&mut self) -> Option<WinlinkEvent> {
        self.events.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// The SID the client announced, once seen.
    pub fn client_sid(&self) -> Option<&str> {
        self.client_sid.as_deref()
    }

    /// Starts the conversation once the AX.25 session is connected.
    pub fn start<R: RngCore>(&mut self, rng: &mut R, link: &mut Ax25Session, now: Instant) {
        if self.config.relay.is_some() {
            self.state = State::RelayConnecting {
                deadline: now + self.config.relay_timeout,
            };
            self.events.push_back(WinlinkEvent::RelayConnectRequested);
        } else {
            self.send_banner(rng, link, now);
        }
    }

    /// Feeds connected-mode payload bytes from the radio peer.
    pub fn process<S: Store>(
        &mut self,
        data: &[u8],
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        match &mut self.state {
            State::Relay { from_radio, .. } => {
                let mark = from_radio.observe(data);
                self.events
                    .push_back(WinlinkEvent::RelayData(data.to_vec()));
                if mark == StreamMark::Quit {
                    self.close(None);
                }
                return;
            }
            State::RelayConnecting { .. } => {
                // The peer is early; hold its bytes for after connect/fallback.
                self.line_buf.extend_from_slice(data);
                return;
            }
            State::Closed => return,
            _ => {}
        }

        let mut pending = core::mem::replace(&mut self.line_buf, Vec::new());
        pending.extend_from_slice(data);
        self.consume(pending, link, store, now);
    }

    /// The embedder's CMS socket is up; begin bridging.
    pub fn relay_established(&mut self) {
        if !matches!(self.state, State::RelayConnecting { .. }) {
            return;
        }
        let mut hello = String::new();
        let _ = write!(hello, "{}\rCMSTelnet\r", self.config.callsign);
        self.events
            .push_back(WinlinkEvent::RelayData(hello.into_bytes()));
        // Bytes the radio peer sent while the socket was opening follow immediately.
        if !self.line_buf.is_empty() {
            let held = core::mem::replace(&mut self.line_buf, Vec::new());
            self.events.push_back(WinlinkEvent::RelayData(held));
        }
        self.state = State::Relay {
            from_radio: BinarySwitch::new(),
            from_cms: BinarySwitch::new(),
        };
    }

    /// Bytes from the CMS socket, to forward to the radio peer.
    pub fn relay_data(&mut self, data: &[u8], link: &mut Ax25Session, now: Instant) {
        if let State::Relay { from_cms, .. } = &mut self.state {
            let mark = from_cms.observe(data);
            if link.send(data, false, now).is_err() {
                self.close(None);
                return;
            }
            if mark == StreamMark::Quit {
                self.close(None);
            }
        }
    }

    /// The CMS socket failed or closed.
    ///
    /// During connect this falls back to local service; mid-bridge it ends the session.
    pub fn relay_closed<R: RngCore, S: Store>(
        &mut self,
        rng: &mut R,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        match self.state {
            State::RelayConnecting { .. } => self.fall_back(rng, link, store, now),
            State::Relay { .. } => self.close(None),
            _ => {}
        }
    }

    /// Deadline work: the relay connect timeout.
    pub fn update_timers<R: RngCore, S: Store>(
        &mut self,
        rng: &mut R,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        if let State::RelayConnecting { deadline } = self.state {
            if now.has_reached(deadline) {
                self.fall_back(rng, link, store, now);
            }
        }
    }

    pub fn next_update(&self) -> NextUpdate {
        match self.state {
            State::RelayConnecting { deadline } => NextUpdate::At(deadline),
            _ => NextUpdate::Disable,
        }
    }

    // --- internals ---

    fn fall_back<R: RngCore, S: Store>(
        &mut self,
        rng: &mut R,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        info!("CMS relay unavailable, serving {} locally", self.peer);
        self.events.push_back(WinlinkEvent::RelayFallback);
        self.state = State::Greeting;
        self.send_banner(rng, link, now);
        // Replay anything the peer said while the socket was opening.
        if !self.line_buf.is_empty() {
            let held = core::mem::replace(&mut self.line_buf, Vec::new());
            self.consume(held, link, store, now);
        }
    }

    fn send_banner<R: RngCore>(&mut self, rng: &mut R, link: &mut Ax25Session, now: Instant) {
        self.send_line(link, STATION_SID, now);
        if self.config.password.is_some() {
            let challenge = auth::generate_challenge(rng);
            let mut line = String::new();
            let _ = write!(line, ";PQ: {}", challenge);
            self.send_line(link, &line, now);
            self.challenge = Some(challenge);
        } else {
            self.authenticated = true;
        }
        self.send_line(link, ">", now);
    }

    fn send_line(&mut self, link: &mut Ax25Session, line: &str, now: Instant) {
        trace!("wl2k-> {}", line);
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\r');
        if link.send(&bytes, true, now).is_err() {
            self.close(None);
        }
    }

    fn close(&mut self, error: Option<Error>) {
        if let Some(e) = error {
            warn!("winlink session with {} failed: {}", self.peer, e);
        }
        if !matches!(self.state, State::Closed) {
            self.state = State::Closed;
            self.events.push_back(WinlinkEvent::SessionClosed);
        }
    }

    fn refuse(&mut self, link: &mut Ax25Session, now: Instant, error: Option<Error>) {
        self.send_line(link, "FQ", now);
        self.close(error);
    }

    /// Runs the byte stream through block decoding and line handling until it is exhausted.
    fn consume<S: Store>(
        &mut self,
        mut data: Vec<u8>,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        loop {
            if matches!(self.state, State::Receiving { .. }) {
                match self.consume_blocks(&data, store) {
                    Ok(rest) => {
                        data = rest;
                        if data.is_empty() {
                            return;
                        }
                        // Fell back to command mode with bytes left over.
                        continue;
                    }
                    Err(e) => {
                        self.refuse(link, now, Some(e));
                        return;
                    }
                }
            }

            // Command mode: take one line; stash a partial line for the next chunk.
            let split = data.iter().position(|&b| b == b'\r' || b == b'\n');
            let line_end = match split {
                Some(i) => i,
                None => {
                    self.line_buf = data;
                    return;
                }
            };
            let rest = data.split_off(line_end + 1);
            data.pop(); // terminator
            let line = String::from_utf8_lossy(&data).into_owned();
            data = rest;
            if !line.is_empty() {
                self.handle_line(&line, link, store, now);
            }
            if matches!(self.state, State::Closed) {
                return;
            }
        }
    }

    /// Feeds bytes to the active block stream; returns leftover bytes once it ends.
    ///
    /// On error the session has already left the receiving state; the caller refuses it.
    fn consume_blocks<S: Store>(&mut self, data: &[u8], store: &mut S) -> Result<Vec<u8>, Error> {
        let (mut accepted, mut decoder) =
            match core::mem::replace(&mut self.state, State::Greeting) {
                State::Receiving { accepted, decoder } => (accepted, decoder),
                other => {
                    self.state = other;
                    return Ok(data.to_vec());
                }
            };
        decoder.push(data);
        loop {
            match decoder.advance()? {
                BlockProgress::NeedMore => {
                    self.state = State::Receiving { accepted, decoder };
                    return Ok(Vec::new());
                }
                BlockProgress::Complete { checksum } => {
                    let payload = core::mem::replace(&mut decoder.payload, Vec::new());
                    if complement_checksum(&payload) != checksum {
                        return Err(Error::ChecksumFailed);
                    }
                    let envelope = lzhuf::decompress(&payload, true)?;
                    let mut mail = WinlinkMail::from_b2f(&envelope)?;
                    let proposal = accepted.pop_front().ok_or(Error::InvalidValue)?;
                    if mail.mid.as_str() != proposal.mid.as_str() {
                        debug!(
                            "mail MID {} differs from proposal {}",
                            mail.mid, proposal.mid
                        );
                    }
                    mail.mailbox = Mailbox::Inbox;
                    mail.flags |= MailFlags::UNREAD;
                    if !mail::save_mail(store, &mail) {
                        warn!("mail store rejected {}", mail.mid);
                    }
                    info!("received mail {} from {}", mail.mid, self.peer);
                    self.events.push_back(WinlinkEvent::MailReceived(mail.mid));
                    if accepted.is_empty() {
                        // Batch complete; back to command mode with whatever followed.
                        return Ok(decoder.leftover());
                    }
                }
            }
        }
    }

    fn handle_line<S: Store>(
        &mut self,
        line: &str,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        trace!("wl2k<- {}", line);
        if line.starts_with('[') && line.ends_with(']') {
            self.client_sid = Some(line.to_string());
            if !line.contains("B2F") {
                debug!("client SID without B2F support: {}", line);
            }
            return;
        }
        if let Some(response) = line.strip_prefix(";PR:") {
            self.check_login(response.trim(), link, now);
            return;
        }
        if line.starts_with(';') {
            // Other metadata lines (;FW: forwarding lists etc.) are informational.
            debug!("meta: {}", line);
            return;
        }
        if line == ">" {
            return;
        }

        let upper = line.to_ascii_uppercase();
        if upper.starts_with("FC") {
            self.collect_proposal(line, link, now);
        } else if upper.starts_with("F>") {
            self.answer_proposals(line, link, store, now);
        } else if upper.starts_with("FS") {
            self.stream_accepted(line, link, store, now);
        } else if upper == "FF" {
            self.their_turn_done(link, store, now);
        } else if upper == "FQ" {
            self.close(None);
        } else {
            debug!("unhandled line from {}: {}", self.peer, line);
        }
    }

    fn check_login(&mut self, response: &str, link: &mut Ax25Session, now: Instant) {
        let (challenge, password) = match (&self.challenge, &self.config.password) {
            (Some(c), Some(p)) => (c.clone(), p.clone()),
            _ => return,
        };
        if auth::verify_response(&challenge, &password, response) {
            self.authenticated = true;
        } else {
            warn!("secure login failed for {}", self.peer);
            self.events.push_back(WinlinkEvent::AuthFailed);
            self.refuse(link, now, Some(Error::AuthFailed));
        }
    }

    fn require_auth(&mut self, link: &mut Ax25Session, now: Instant) -> bool {
        if self.authenticated {
            return true;
        }
        self.events.push_back(WinlinkEvent::AuthFailed);
        self.refuse(link, now, Some(Error::AuthFailed));
        false
    }

    fn collect_proposal(&mut self, line: &str, link: &mut Ax25Session, now: Instant) {
        // FC EM <MID> <uncompressed> <compressed> 0
        self.fc_bytes.extend_from_slice(line.as_bytes());
        self.fc_bytes.push(b'\r');
        let mut parts = line.split_ascii_whitespace();
        let _fc = parts.next();
        let kind = parts.next().unwrap_or("");
        let mid = parts.next().unwrap_or("");
        let uncompressed = parts.next().and_then(|v| v.parse().ok());
        let compressed = parts.next().and_then(|v| v.parse().ok());
        if !kind.eq_ignore_ascii_case("EM") || mid.is_empty() || mid.len() > 12 {
            debug!("unsupported proposal: {}", line);
            self.proposals.push(Proposal {
                mid: MessageId::new(),
                uncompressed: 0,
                compressed: 0,
            });
            return;
        }
        let (uncompressed, compressed) = match (uncompressed, compressed) {
            (Some(u), Some(c)) => (u, c),
            _ => {
                self.refuse(link, now, Some(Error::InvalidValue));
                return;
            }
        };
        let mut id = MessageId::new();
        let _ = id.push_str(mid);
        self.proposals.push(Proposal {
            mid: id,
            uncompressed,
            compressed,
        });
    }

    fn answer_proposals<S: Store>(
        &mut self,
        line: &str,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        if !self.require_auth(link, now) {
            return;
        }
        // F> <checksum-hex> over the FC lines of this batch.
        let expected = complement_checksum(&self.fc_bytes);
        let stated = line[2..].trim();
        let stated = u8::from_str_radix(stated, 16).ok();
        self.fc_bytes.clear();
        if stated != Some(expected) {
            warn!(
                "proposal checksum mismatch: peer {:?}, computed {:02X}",
                stated, expected
            );
            self.refuse(link, now, Some(Error::ChecksumFailed));
            return;
        }

        let proposals = core::mem::replace(&mut self.proposals, Vec::new());
        let mut answer = String::from("FS ");
        let mut accepted = VecDeque::new();
        for p in proposals {
            if p.mid.is_empty() {
                // Unsupported type.
                answer.push('N');
            } else if mail::contains_mid(store, &p.mid) {
                answer.push('N');
            } else {
                debug!(
                    "accepting {} ({} bytes, {} compressed)",
                    p.mid, p.uncompressed, p.compressed
                );
                answer.push('Y');
                accepted.push_back(p);
            }
        }
        self.send_line(link, &answer, now);
        if !accepted.is_empty() {
            self.state = State::Receiving {
                accepted,
                decoder: BlockDecoder::new(),
            };
        }
    }

    /// `FF`: the client has nothing (more) to send; offer our traffic or quit.
    fn their_turn_done<S: Store>(&mut self, link: &mut Ax25Session, store: &mut S, now: Instant) {
        if !self.require_auth(link, now) {
            return;
        }
        let pending = mail::pending_for(store, &self.peer);
        if pending.is_empty() {
            self.send_line(link, "FQ", now);
            self.close(None);
            return;
        }
        let mut fc_bytes = Vec::new();
        let mut offered = Vec::new();
        for mail in pending {
            let envelope = mail.to_b2f();
            let payload = lzhuf::compress(&envelope, true);
            let mut line = String::new();
            let _ = write!(
                line,
                "FC EM {} {} {} 0",
                mail.mid,
                envelope.len(),
                payload.len()
            );
            fc_bytes.extend_from_slice(line.as_bytes());
            fc_bytes.push(b'\r');
            self.send_line(link, &line, now);
            offered.push(Offered { mail, payload });
        }
        self.offered = offered;
        let mut fin = String::new();
        let _ = write!(fin, "F> {:02X}", complement_checksum(&fc_bytes));
        self.send_line(link, &fin, now);
    }

    /// `FS ...`: the client's verdict on our offers; stream what was accepted.
    fn stream_accepted<S: Store>(
        &mut self,
        line: &str,
        link: &mut Ax25Session,
        store: &mut S,
        now: Instant,
    ) {
        let verdicts = line[2..].trim();
        let offered = core::mem::replace(&mut self.offered, Vec::new());
        if offered.is_empty() {
            debug!("FS without outstanding offers");
            return;
        }
        for (offer, verdict) in offered.into_iter().zip(verdicts.chars()) {
            let accept = matches!(verdict, 'Y' | 'y' | '+');
            if !accept {
                debug!("offer {} declined ({})", offer.mail.mid, verdict);
                continue;
            }
            self.stream_mail(&offer, link, now);
            mail::mark_sent(store, &offer.mail.mid);
            self.events
                .push_back(WinlinkEvent::MailSent(offer.mail.mid.clone()));
        }
        // Turn passes back to the client; it answers FF (or FQ) when done.
        self.send_line(link, "FF", now);
    }

    fn stream_mail(&mut self, offer: &Offered, link: &mut Ax25Session, now: Instant) {
        // SOH: subject NUL '0' NUL (offset zero: resumption is not supported).
        let subject = offer.mail.subject.as_bytes();
        let subject = &subject[..subject.len().min(120)];
        let mut header = Vec::with_capacity(subject.len() + 5);
        header.push(SOH);
        header.push((subject.len() + 3) as u8);
        header.extend_from_slice(subject);
        header.push(0);
        header.push(b'0');
        header.push(0);
        if link.send(&header, false, now).is_err() {
            return;
        }

        for chunk in offer.payload.chunks(BLOCK_LEN) {
            let mut block = Vec::with_capacity(chunk.len() + 2);
            block.push(STX);
            block.push(chunk.len() as u8);
            block.extend_from_slice(chunk);
            if link.send(&block, false, now).is_err() {
                return;
            }
        }

        let trailer = [EOT, complement_checksum(&offer.payload)];
        let _ = link.send(&trailer, true, now);
        info!("streamed mail {} to {}", offer.mail.mid, self.peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::frame::Ax25Frame;
    use crate::ax25::session::{ConnectionState, SessionConfig, SessionEvent};
    use crate::ax25::SessionKey;
    use crate::store::MemStore;
    use crate::testutil::NullRng;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_micros(ms * 1000)
    }

    /// A connected server-side AX.25 session plus its (test-driven) peer.
    fn connected_link() -> (Ax25Session, Ax25Session) {
        let local = Callsign::parse("N0CALL-10").unwrap();
        let remote = Callsign::parse("W1AW").unwrap();
        let mut server = Ax25Session::new(
            SessionKey::new(local.clone(), remote.clone()),
            0,
            SessionConfig::default(),
        );
        let mut client = Ax25Session::new(
            SessionKey::new(remote, local),
            0,
            SessionConfig::default(),
        );
        client.connect(at(0)).unwrap();
        shuttle(&mut client, &mut server);
        shuttle(&mut server, &mut client);
        assert_eq!(server.state(), ConnectionState::Connected);
        while server.pop_event().is_some() {}
        while client.pop_event().is_some() {}
        (server, client)
    }

    fn shuttle(from: &mut Ax25Session, to: &mut Ax25Session) {
        while let Some(frame) = from.pop_outgoing() {
            let bytes = frame.encode(from.modulus());
            let decoded = Ax25Frame::parse(&bytes, to.modulus()).unwrap();
            to.handle_frame(&decoded, at(1));
        }
    }

    /// Delivers `bytes` from the client to the winlink session and returns the server's reply
    /// bytes as the client would see them.
    ///
    /// Runs both link endpoints (including their T2 acknowledgements) until the flow dries up,
    /// so transfers larger than one AX.25 window complete.
    fn exchange(
        wl: &mut WinlinkSession,
        server: &mut Ax25Session,
        client: &mut Ax25Session,
        store: &mut MemStore,
        bytes: &[u8],
    ) -> Vec<u8> {
        if !bytes.is_empty() {
            client.send(bytes, true, at(2)).unwrap();
        }
        let mut out = Vec::new();
        let mut t = 10u32;
        for _ in 0..50 {
            let mut progressed = false;
            while let Some(frame) = client.pop_outgoing() {
                progressed = true;
                let raw = frame.encode(client.modulus());
                server.handle_frame(&Ax25Frame::parse(&raw, server.modulus()).unwrap(), at(t));
            }
            let mut inbound = Vec::new();
            while let Some(ev) = server.pop_event() {
                if let SessionEvent::Data(d) = ev {
                    inbound.extend_from_slice(&d);
                }
            }
            if !inbound.is_empty() {
                wl.process(&inbound, server, store, at(t));
            }
            while let Some(frame) = server.pop_outgoing() {
                progressed = true;
                let raw = frame.encode(server.modulus());
                client.handle_frame(&Ax25Frame::parse(&raw, client.modulus()).unwrap(), at(t));
            }
            while let Some(ev) = client.pop_event() {
                if let SessionEvent::Data(d) = ev {
                    out.extend_from_slice(&d);
                }
            }
            if !progressed {
                break;
            }
            // Let the delayed acknowledgements fire so windows drain.
            t += 150;
            client.update_timers(at(t));
            server.update_timers(at(t));
        }
        out
    }

    fn config(password: Option<&str>) -> WinlinkConfig {
        WinlinkConfig::local(
            Callsign::parse("N0CALL-10").unwrap(),
            password.map(|p| p.to_string()),
        )
    }

    fn peer() -> Callsign {
        Callsign::parse("W1AW").unwrap()
    }

    fn mid(s: &str) -> MessageId {
        let mut m = MessageId::new();
        let _ = m.push_str(s);
        m
    }

    #[test]
    fn banner_without_password() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut wl = WinlinkSession::new(config(None), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, b"");
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "[WL2K-5.0-B2FWIHJM$]\r>\r");
        assert!(!text.contains(";PQ:"));
    }

    #[test]
    fn banner_with_challenge_and_failed_login() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut wl = WinlinkSession::new(config(Some("SECRET")), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, b"");
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(";PQ: "), "{}", text);

        let out = exchange(
            &mut wl,
            &mut server,
            &mut client,
            &mut store,
            b"[RMS-1.0-B2F$]\r;PR: 00000000\r",
        );
        assert!(String::from_utf8(out).unwrap().contains("FQ"));
        assert!(wl.is_closed());
        let events: Vec<_> = core::iter::from_fn(|| wl.pop_event()).collect();
        assert!(events.contains(&WinlinkEvent::AuthFailed));
    }

    #[test]
    fn successful_login_and_quiet_session() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut wl = WinlinkSession::new(config(Some("SECRET")), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, b"");
        let text = String::from_utf8(out).unwrap();
        let challenge = text
            .split('\r')
            .find_map(|l| l.strip_prefix(";PQ: "))
            .unwrap()
            .to_string();
        let response = auth::challenge_response(&challenge, "SECRET");

        let mut login = Vec::new();
        login.extend_from_slice(b"[RMS-1.0-B2F$]\r");
        login.extend_from_slice(alloc::format!(";PR: {}\r", response).as_bytes());
        login.extend_from_slice(b"FF\r");
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, &login);
        // Authenticated, but no mail for the peer: the server quits.
        assert_eq!(String::from_utf8(out).unwrap(), "FQ\r");
        assert!(wl.is_closed());
    }

    #[test]
    fn inbound_mail_is_received_and_stored() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut wl = WinlinkSession::new(config(None), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        exchange(&mut wl, &mut server, &mut client, &mut store, b"");

        let mail = WinlinkMail::outbound(
            mid("TESTMID00001"),
            1_700_000_000,
            "W1AW",
            "N0CALL",
            "hi",
            b"hello from the field".to_vec(),
        );
        let envelope = mail.to_b2f();
        let payload = lzhuf::compress(&envelope, true);

        let mut fc = alloc::format!(
            "FC EM TESTMID00001 {} {} 0\r",
            envelope.len(),
            payload.len()
        )
        .into_bytes();
        let cks = complement_checksum(&fc);
        fc.extend_from_slice(alloc::format!("F> {:02X}\r", cks).as_bytes());

        let out = exchange(&mut wl, &mut server, &mut client, &mut store, &fc);
        assert_eq!(String::from_utf8(out).unwrap(), "FS Y\r");

        // Stream the blocks: SOH header, STX data, EOT checksum.
        let mut stream = Vec::new();
        stream.extend_from_slice(&[SOH, 5, b'h', b'i', 0, b'0', 0]);
        for chunk in payload.chunks(128) {
            stream.push(STX);
            stream.push(chunk.len() as u8);
            stream.extend_from_slice(chunk);
        }
        stream.extend_from_slice(&[EOT, complement_checksum(&payload)]);
        // Followed in the same flow by the client's FF.
        stream.extend_from_slice(b"FF\r");

        let out = exchange(&mut wl, &mut server, &mut client, &mut store, &stream);
        // Nothing outbound for the peer: session ends.
        assert_eq!(String::from_utf8(out).unwrap(), "FQ\r");

        let events: Vec<_> = core::iter::from_fn(|| wl.pop_event()).collect();
        assert!(events.contains(&WinlinkEvent::MailReceived(mid("TESTMID00001"))));
        let stored = mail::load_mail(&store, "TESTMID00001").unwrap();
        assert_eq!(stored.body, b"hello from the field");
        assert_eq!(stored.mailbox, Mailbox::Inbox);
        assert!(stored.flags.contains(MailFlags::UNREAD));
    }

    #[test]
    fn duplicate_mid_is_declined() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let existing = WinlinkMail::outbound(
            mid("DUPMID000001"),
            0,
            "W1AW",
            "N0CALL",
            "old",
            b"seen".to_vec(),
        );
        mail::save_mail(&mut store, &existing);

        let mut wl = WinlinkSession::new(config(None), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        exchange(&mut wl, &mut server, &mut client, &mut store, b"");

        let mut fc = b"FC EM DUPMID000001 100 80 0\r".to_vec();
        let cks = complement_checksum(&fc);
        fc.extend_from_slice(alloc::format!("F> {:02X}\r", cks).as_bytes());
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, &fc);
        assert_eq!(String::from_utf8(out).unwrap(), "FS N\r");
    }

    #[test]
    fn bad_proposal_checksum_refuses_session() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut wl = WinlinkSession::new(config(None), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        exchange(&mut wl, &mut server, &mut client, &mut store, b"");

        let out = exchange(
            &mut wl,
            &mut server,
            &mut client,
            &mut store,
            b"FC EM SOMEMID00001 10 8 0\rF> 00\r",
        );
        assert!(String::from_utf8(out).unwrap().contains("FQ"));
        assert!(wl.is_closed());
    }

    #[test]
    fn outbound_mail_is_offered_and_streamed() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let outgoing = WinlinkMail::outbound(
            mid("OUTMID000001"),
            1_700_000_000,
            "N0CALL",
            "W1AW@winlink.org",
            "status report",
            b"All systems nominal.".to_vec(),
        );
        mail::save_mail(&mut store, &outgoing);

        let mut wl = WinlinkSession::new(config(None), peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        exchange(&mut wl, &mut server, &mut client, &mut store, b"");

        // Client has nothing; our offer goes out with a checksum line.
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, b"FF\r");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("FC EM OUTMID000001 "), "{}", text);
        let fc_line = text.split('\r').next().unwrap();
        let expected = {
            let mut b = fc_line.as_bytes().to_vec();
            b.push(b'\r');
            complement_checksum(&b)
        };
        assert!(
            text.contains(&alloc::format!("F> {:02X}", expected)),
            "{}",
            text
        );

        // Accept it; the server streams blocks and passes the turn.
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, b"FS Y\r");
        assert_eq!(out[0], SOH);
        // ... blocks ... EOT checksum, then the turn-passing FF line.
        assert_eq!(&out[out.len() - 3..], b"FF\r");
        assert_eq!(out[out.len() - 5], EOT);

        // Re-decode what was streamed.
        let mut decoder = BlockDecoder::new();
        decoder.push(&out[..out.len() - 3]); // strip the trailing "FF\r"
        let progress = decoder.advance().unwrap();
        let checksum = match progress {
            BlockProgress::Complete { checksum } => checksum,
            BlockProgress::NeedMore => panic!("incomplete stream"),
        };
        assert_eq!(complement_checksum(&decoder.payload), checksum);
        let envelope = lzhuf::decompress(&decoder.payload, true).unwrap();
        let received = WinlinkMail::from_b2f(&envelope).unwrap();
        assert_eq!(received.subject, "status report");
        assert_eq!(received.body, b"All systems nominal.");

        let events: Vec<_> = core::iter::from_fn(|| wl.pop_event()).collect();
        assert!(events.contains(&WinlinkEvent::MailSent(mid("OUTMID000001"))));
        assert_eq!(
            mail::load_mail(&store, "OUTMID000001").unwrap().mailbox,
            Mailbox::Sent
        );

        // The client finishes; the session quits.
        let out = exchange(&mut wl, &mut server, &mut client, &mut store, b"FF\r");
        assert_eq!(String::from_utf8(out).unwrap(), "FQ\r");
        assert!(wl.is_closed());
    }

    #[test]
    fn relay_bridges_both_directions() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut cfg = config(None);
        cfg.relay = Some(CmsRelayConfig {
            host: String::from("cms.winlink.org"),
            port: 8772,
            tls: false,
        });
        let mut wl = WinlinkSession::new(cfg, peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(1));
        assert_eq!(wl.pop_event(), Some(WinlinkEvent::RelayConnectRequested));

        wl.relay_established();
        match wl.pop_event() {
            Some(WinlinkEvent::RelayData(hello)) => {
                assert_eq!(hello, b"N0CALL-10\rCMSTelnet\r");
            }
            other => panic!("unexpected {:?}", other),
        }

        // CMS banner goes to the radio unchanged.
        wl.relay_data(b"[WL2K-5.0-B2FWIHJM$]\r;PQ: 42424242\r>\r", &mut server, at(11));
        shuttle(&mut server, &mut client);
        let mut to_radio = Vec::new();
        while let Some(ev) = client.pop_event() {
            if let SessionEvent::Data(d) = ev {
                to_radio.extend_from_slice(&d);
            }
        }
        assert_eq!(to_radio, b"[WL2K-5.0-B2FWIHJM$]\r;PQ: 42424242\r>\r");

        // Radio bytes go to the CMS verbatim.
        wl.process(b"[RMS-1.0-B2F$]\rFF\r", &mut server, &mut store, at(12));
        match wl.pop_event() {
            Some(WinlinkEvent::RelayData(d)) => assert_eq!(d, b"[RMS-1.0-B2F$]\rFF\r"),
            other => panic!("unexpected {:?}", other),
        }

        // A quit from the CMS side ends the bridge after forwarding.
        wl.relay_data(b"FQ\r", &mut server, at(13));
        assert_eq!(wl.pop_event(), Some(WinlinkEvent::SessionClosed));
        assert!(wl.is_closed());
    }

    #[test]
    fn relay_timeout_falls_back_to_local() {
        let (mut server, mut client) = connected_link();
        let mut store = MemStore::new();
        let mut cfg = config(None);
        cfg.relay = Some(CmsRelayConfig {
            host: String::from("cms.winlink.org"),
            port: 8772,
            tls: true,
        });
        let mut wl = WinlinkSession::new(cfg, peer());
        let mut rng = NullRng(1);
        wl.start(&mut rng, &mut server, at(0));
        assert_eq!(wl.pop_event(), Some(WinlinkEvent::RelayConnectRequested));
        assert_eq!(wl.next_update(), NextUpdate::At(at(15_000)));

        wl.update_timers(&mut rng, &mut server, &mut store, at(15_001));
        assert_eq!(wl.pop_event(), Some(WinlinkEvent::RelayFallback));
        shuttle(&mut server, &mut client);
        let mut banner = Vec::new();
        while let Some(ev) = client.pop_event() {
            if let SessionEvent::Data(d) = ev {
                banner.extend_from_slice(&d);
            }
        }
        assert_eq!(banner, b"[WL2K-5.0-B2FWIHJM$]\r>\r");
    }
}
