//! Inbound frame routing and the session registry.
//!
//! Every reassembled over-the-air frame ends up here. Routing order:
//!
//! 1. Frames addressed to one of the station's service addresses (BBS or Winlink SSID) that
//!    belong to connected-mode operation are injected into the matching [`Ax25Session`],
//!    creating it on SABM/SABME. A remote callsign may hold a session with only one service at a
//!    time; a SABM for a second service is answered with DM (busy).
//! 2. UI frames on an APRS channel (or with an APRS-style destination) go through the APRS
//!    parser; messages addressed to the station produce a ready-made acknowledgement and an
//!    `aprs-msg-<ts>` store record.
//! 3. Other UI frames addressed to the station are echoed back with the addresses swapped, a
//!    cheap over-the-air ping.
//! 4. Anything else is dropped with a diagnostic.
//!
//! The dispatcher is the only owner that creates and destroys sessions; it also funnels their
//! outbound frames into the radio's TNC queue and relays their timer needs.
//!
//! [`Ax25Session`]: ../ax25/session/struct.Ax25Session.html

use crate::aprs::{self, AprsMessage, AprsPacket};
use crate::ax25::frame::{Ax25Frame, Control, UFormat};
use crate::ax25::session::{Ax25Session, ConnectionState, SessionConfig, SessionEvent};
use crate::ax25::{AddressField, Callsign, SessionKey};
use crate::bytes::ByteReader;
use crate::bytes::FromBytes;
use crate::config::Config;
use crate::gaia::reassembly::UniqueDataFrame;
use crate::radio::{RadioController, RadioEvent};
use crate::store::Store;
use crate::time::{Instant, NextUpdate};
use crate::winlink::{WinlinkConfig, WinlinkEvent, WinlinkSession};
use crate::Error;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

/// Station identity and service addressing.
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Base callsign of the station.
    pub callsign: Callsign,
    /// SSID answering BBS connections.
    pub bbs_ssid: u8,
    /// SSID answering Winlink connections.
    pub winlink_ssid: u8,
    /// Link-layer tunables applied to every session.
    pub session: SessionConfig,
    /// Winlink service settings.
    pub winlink: WinlinkConfig,
}

impl StationConfig {
    fn bbs_address(&self) -> Callsign {
        self.callsign.with_ssid(self.bbs_ssid).unwrap_or_else(|_| self.callsign.clone())
    }

    fn winlink_address(&self) -> Callsign {
        self.callsign
            .with_ssid(self.winlink_ssid)
            .unwrap_or_else(|_| self.callsign.clone())
    }
}

/// The service a session is attached to.
enum Service {
    Bbs,
    Winlink(WinlinkSession),
}

struct SessionEntry {
    session: Ax25Session,
    service: Service,
}

/// What the dispatcher reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    /// A decoded APRS packet from the air.
    Aprs(AprsPacket),
    /// An APRS message for this station was acknowledged over the air.
    AprsMessageAcked { from: Callsign },
    /// A BBS session reached the connected state.
    SessionUp(SessionKey),
    /// Connected-mode bytes for the BBS service.
    SessionData { key: SessionKey, data: Vec<u8> },
    /// A session ended.
    SessionDown {
        key: SessionKey,
        reason: Option<Error>,
    },
    /// Winlink session progress (including CMS relay plumbing).
    Winlink {
        key: SessionKey,
        event: WinlinkEvent,
    },
}

/// Routes frames between the radio, the AX.25 sessions and the station services.
pub struct Dispatcher<C: Config> {
    config: StationConfig,
    store: C::Store,
    rng: C::Rng,
    sessions: BTreeMap<SessionKey, SessionEntry>,
    events: VecDeque<DispatcherEvent>,
}

impl<C: Config> Dispatcher<C> {
    pub fn new(config: StationConfig, store: C::Store, rng: C::Rng) -> Self {
        Dispatcher {
            config,
            store,
            rng,
            sessions: BTreeMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn pop_event(&mut self) -> Option<DispatcherEvent> {
        self.events.pop_front()
    }

    pub fn store(&mut self) -> &mut C::Store {
        &mut self.store
    }

    /// Applies a radio event; frames are routed, link loss tears everything down.
    pub fn handle_radio_event(
        &mut self,
        event: RadioEvent,
        radio: &mut RadioController<C>,
        now: Instant,
    ) {
        match event {
            RadioEvent::FrameReceived(frame) => self.handle_frame(&frame, radio, now),
            RadioEvent::LinkClosed => {
                let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
                for key in keys {
                    if let Some(mut entry) = self.sessions.remove(&key) {
                        entry.session.transport_closed(now);
                        self.collect_service_events(&key, &mut entry, now);
                        self.sessions.insert(key, entry);
                    }
                }
                self.flush_sessions(radio, now);
            }
            _ => {}
        }
    }

    /// Routes one reassembled frame.
    pub fn handle_frame(
        &mut self,
        raw: &UniqueDataFrame,
        radio: &mut RadioController<C>,
        now: Instant,
    ) {
        let addresses =
            match AddressField::from_bytes(&mut ByteReader::new(&raw.data)) {
                Ok(a) => a,
                Err(_) => {
                    debug!("undecodable address field, dropping frame");
                    return;
                }
            };
        let dest = addresses.destination.callsign.clone();
        let source = addresses.source.callsign.clone();

        let service = self.service_for(&dest);
        if let Some(service_is_winlink) = service {
            let key = SessionKey::new(dest.clone(), source.clone());
            let modulus = self
                .sessions
                .get(&key)
                .map(|e| e.session.modulus())
                .unwrap_or(crate::ax25::seq_num::Modulus::Eight);
            let frame = match Ax25Frame::parse(&raw.data, modulus) {
                Ok(mut f) => {
                    f.channel_id = raw.channel_id;
                    f.channel_name = raw.channel_name.clone();
                    f
                }
                Err(_) => {
                    debug!("undecodable frame from {}, dropping", source);
                    return;
                }
            };
            if self.is_session_frame(&frame) {
                self.inject(key, frame, service_is_winlink, radio, now);
                return;
            }
            // Fall through for UI frames addressed to a service SSID (echo below).
        }

        if self.is_aprs_traffic(raw, &dest) {
            self.handle_aprs(raw, radio, now);
            return;
        }

        if service.is_some() {
            // Rule 3: a non-session U frame with payload addressed to us: echo it back.
            if let Ok(frame) = Ax25Frame::parse(&raw.data, crate::ax25::seq_num::Modulus::Eight) {
                if let Control::U { .. } = frame.control {
                    if !frame.payload.is_empty() {
                        let echo = Ax25Frame::ui(
                            frame.addresses.reversed(),
                            frame.pid.unwrap_or(crate::ax25::frame::PID_NO_L3),
                            frame.payload.clone(),
                        );
                        debug!("echoing {} bytes to {}", frame.payload.len(), source);
                        self.transmit(&echo, raw.channel_id, radio);
                        return;
                    }
                }
            }
        }

        debug!("dropping frame {} -> {}", source, dest);
    }

    /// Opens an outbound BBS session towards `remote`.
    pub fn connect(
        &mut self,
        remote: Callsign,
        channel_id: u8,
        radio: &mut RadioController<C>,
        now: Instant,
    ) -> Result<SessionKey, Error> {
        let key = SessionKey::new(self.config.bbs_address(), remote);
        if self.sessions.contains_key(&key) {
            return Err(Error::InvalidValue);
        }
        let mut session = Ax25Session::new(key.clone(), channel_id, self.config.session.clone());
        session.connect(now)?;
        self.sessions.insert(
            key.clone(),
            SessionEntry {
                session,
                service: Service::Bbs,
            },
        );
        self.flush_sessions(radio, now);
        Ok(key)
    }

    /// Sends connected-mode bytes on a BBS session (for the menu service above).
    pub fn send(
        &mut self,
        key: &SessionKey,
        data: &[u8],
        immediate: bool,
        radio: &mut RadioController<C>,
        now: Instant,
    ) -> Result<(), Error> {
        let entry = self.sessions.get_mut(key).ok_or(Error::NotConnected)?;
        entry.session.send(data, immediate, now)?;
        self.flush_sessions(radio, now);
        Ok(())
    }

    /// Closes a session.
    pub fn disconnect(
        &mut self,
        key: &SessionKey,
        radio: &mut RadioController<C>,
        now: Instant,
    ) {
        if let Some(mut entry) = self.sessions.remove(key) {
            entry.session.disconnect(now);
            self.collect_service_events(key, &mut entry, now);
            self.sessions.insert(key.clone(), entry);
        }
        self.flush_sessions(radio, now);
    }

    /// Emits an APRS information field as a UI frame.
    pub fn send_aprs(
        &mut self,
        info: Vec<u8>,
        channel_id: u8,
        radio: &mut RadioController<C>,
    ) {
        let path = AddressField::direct(
            Callsign::new("APRS", 0).unwrap(),
            self.config.callsign.clone(),
        );
        let frame = Ax25Frame::ui(path, crate::ax25::frame::PID_NO_L3, info);
        self.transmit(&frame, channel_id, radio);
    }

    /// The embedder's CMS socket for `key` is connected.
    pub fn relay_established(&mut self, key: &SessionKey, radio: &mut RadioController<C>, now: Instant) {
        if let Some(mut entry) = self.sessions.remove(key) {
            if let Service::Winlink(wl) = &mut entry.service {
                wl.relay_established();
            }
            self.collect_service_events(key, &mut entry, now);
            self.sessions.insert(key.clone(), entry);
            self.flush_sessions(radio, now);
        }
    }

    /// Bytes from the CMS socket for `key`.
    pub fn relay_data(
        &mut self,
        key: &SessionKey,
        data: &[u8],
        radio: &mut RadioController<C>,
        now: Instant,
    ) {
        if let Some(mut entry) = self.sessions.remove(key) {
            if let Service::Winlink(wl) = &mut entry.service {
                wl.relay_data(data, &mut entry.session, now);
            }
            self.collect_service_events(key, &mut entry, now);
            self.sessions.insert(key.clone(), entry);
            self.flush_sessions(radio, now);
        }
    }

    /// The CMS socket for `key` failed or closed.
    pub fn relay_closed(&mut self, key: &SessionKey, radio: &mut RadioController<C>, now: Instant) {
        if let Some(mut entry) = self.sessions.remove(key) {
            if let Service::Winlink(wl) = &mut entry.service {
                wl.relay_closed(&mut self.rng, &mut entry.session, &mut self.store, now);
            }
            self.collect_service_events(key, &mut entry, now);
            self.sessions.insert(key.clone(), entry);
            self.flush_sessions(radio, now);
        }
    }

    /// Runs due timers of all sessions and services.
    pub fn update_timers(&mut self, radio: &mut RadioController<C>, now: Instant) {
        let keys: Vec<SessionKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            if let Some(mut entry) = self.sessions.remove(&key) {
                entry.session.update_timers(now);
                if let Service::Winlink(wl) = &mut entry.service {
                    wl.update_timers(&mut self.rng, &mut entry.session, &mut self.store, now);
                }
                self.collect_service_events(&key, &mut entry, now);
                self.sessions.insert(key, entry);
            }
        }
        self.flush_sessions(radio, now);
    }

    /// The earliest wakeup any session or service needs.
    pub fn next_update(&self) -> NextUpdate {
        let mut next = NextUpdate::Disable;
        for entry in self.sessions.values() {
            next = next.merge(entry.session.next_update());
            if let Service::Winlink(wl) = &entry.service {
                next = next.merge(wl.next_update());
            }
        }
        next
    }

    /// Number of live sessions (diagnostics).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // --- internals ---

    /// Which service (if any) answers at `dest`: `Some(false)` BBS, `Some(true)` Winlink.
    fn service_for(&self, dest: &Callsign) -> Option<bool> {
        if *dest == self.config.winlink_address() {
            Some(true)
        } else if *dest == self.config.bbs_address() {
            Some(false)
        } else {
            None
        }
    }

    fn is_session_frame(&self, frame: &Ax25Frame) -> bool {
        match frame.control {
            Control::I { .. } | Control::S { .. } => true,
            Control::U { format, .. } => !matches!(format, UFormat::Ui | UFormat::Test),
        }
    }

    fn is_aprs_traffic(&self, raw: &UniqueDataFrame, dest: &Callsign) -> bool {
        let name = raw.channel_name.as_str();
        let channel_is_aprs = name.len() >= 4 && name.as_bytes()[..4].eq_ignore_ascii_case(b"APRS");
        channel_is_aprs || aprs::is_aprs_destination(dest)
    }

    fn inject(
        &mut self,
        key: SessionKey,
        frame: Ax25Frame,
        winlink: bool,
        radio: &mut RadioController<C>,
        now: Instant,
    ) {
        let mut entry = match self.sessions.remove(&key) {
            Some(entry) => entry,
            None => {
                let opening = matches!(
                    frame.control,
                    Control::U {
                        format: UFormat::Sabm,
                        ..
                    } | Control::U {
                        format: UFormat::Sabme,
                        ..
                    }
                );
                if !opening {
                    // No session state for this peer: the standard busy/unknown answer.
                    debug!("frame for unknown session {}", key);
                    let dm = Ax25Frame::control(
                        frame.addresses.reversed(),
                        Control::U {
                            format: UFormat::Dm,
                            poll_final: true,
                        },
                    );
                    self.transmit(&dm, frame.channel_id, radio);
                    return;
                }
                if self.remote_holds_other_service(&key) {
                    info!("{} busy with another service, sending DM", key.remote);
                    let dm = Ax25Frame::control(
                        frame.addresses.reversed(),
                        Control::U {
                            format: UFormat::Dm,
                            poll_final: true,
                        },
                    );
                    self.transmit(&dm, frame.channel_id, radio);
                    return;
                }
                let session =
                    Ax25Session::new(key.clone(), frame.channel_id, self.config.session.clone());
                let service = if winlink {
                    Service::Winlink(WinlinkSession::new(
                        self.config.winlink.clone(),
                        key.remote.clone(),
                    ))
                } else {
                    Service::Bbs
                };
                SessionEntry { session, service }
            }
        };

        entry.session.handle_frame(&frame, now);
        self.collect_service_events(&key, &mut entry, now);
        self.sessions.insert(key, entry);
        self.flush_sessions(radio, now);
    }

    /// Whether `key.remote` already holds a session with a different local address.
    fn remote_holds_other_service(&self, key: &SessionKey) -> bool {
        self.sessions
            .keys()
            .any(|k| k.remote == key.remote && k.local != key.local)
    }

    /// Drains a session's events into service handling and dispatcher events.
    fn collect_service_events(&mut self, key: &SessionKey, entry: &mut SessionEntry, now: Instant) {
        while let Some(event) = entry.session.pop_event() {
            match event {
                SessionEvent::StateChanged { state, reason } => match state {
                    ConnectionState::Connected => match &mut entry.service {
                        Service::Winlink(wl) => {
                            wl.start(&mut self.rng, &mut entry.session, now);
                            self.drain_winlink(key, entry);
                        }
                        Service::Bbs => {
                            self.events.push_back(DispatcherEvent::SessionUp(key.clone()));
                        }
                    },
                    ConnectionState::Disconnected => {
                        self.record_connection(key, entry, now);
                        self.events.push_back(DispatcherEvent::SessionDown {
                            key: key.clone(),
                            reason,
                        });
                    }
                    _ => {}
                },
                SessionEvent::Data(data) => match &mut entry.service {
                    Service::Winlink(wl) => {
                        wl.process(&data, &mut entry.session, &mut self.store, now);
                        self.drain_winlink(key, entry);
                    }
                    Service::Bbs => {
                        self.events.push_back(DispatcherEvent::SessionData {
                            key: key.clone(),
                            data,
                        });
                    }
                },
                SessionEvent::UiData { .. } => {
                    debug!("UI datagram inside session {}", key);
                }
                SessionEvent::SendAborted { unsent_bytes } => {
                    warn!("{}: {} bytes undelivered", key, unsent_bytes);
                }
            }
        }
        // Service-level events may exist even without new session events.
        self.drain_winlink(key, entry);
    }

    fn drain_winlink(&mut self, key: &SessionKey, entry: &mut SessionEntry) {
        if let Service::Winlink(wl) = &mut entry.service {
            while let Some(event) = wl.pop_event() {
                self.events.push_back(DispatcherEvent::Winlink {
                    key: key.clone(),
                    event,
                });
            }
        }
    }

    /// Appends a `connection-<ts>` summary record.
    fn record_connection(&mut self, key: &SessionKey, entry: &SessionEntry, now: Instant) {
        let stats = entry.session.stats();
        let record = format!(
            "{} pkts_tx={} pkts_rx={} bytes_tx={} bytes_rx={}",
            key, stats.packets_sent, stats.packets_received, stats.bytes_sent, stats.bytes_received
        );
        let record_key = format!("connection-{}", now.raw_micros());
        if !self.store.save(&record_key, record.as_bytes()) {
            warn!("could not persist connection record");
        }
    }

    fn handle_aprs(&mut self, raw: &UniqueDataFrame, radio: &mut RadioController<C>, now: Instant) {
        let frame = match Ax25Frame::parse(&raw.data, crate::ax25::seq_num::Modulus::Eight) {
            Ok(f) => f,
            Err(_) => {
                debug!("undecodable APRS frame");
                return;
            }
        };
        let packet = match AprsPacket::parse_frame(&frame) {
            Some(p) => p,
            None => return,
        };

        if let Some(message) = packet.message.as_ref() {
            if self.message_is_for_station(message) {
                let ts = now.raw_micros();
                let record_key = format!("aprs-msg-{}", ts);
                let mut record = String::new();
                record.push_str(&frame.addresses.source.callsign.to_string());
                record.push(' ');
                record.push_str(&message.text);
                let _ = self.store.save(&record_key, record.as_bytes());

                if let Some(ack) = message.ack_for() {
                    let mut reply = ack;
                    // The ack goes back to the sender, not to the original addressee field.
                    reply.addressee = heapless::String::new();
                    let sender = frame.addresses.source.callsign.to_string();
                    for c in sender.chars().take(9) {
                        let _ = reply.addressee.push(c);
                    }
                    let path = AddressField::direct(
                        Callsign::new("APRS", 0).unwrap(),
                        self.config.callsign.clone(),
                    );
                    let ui =
                        Ax25Frame::ui(path, crate::ax25::frame::PID_NO_L3, reply.encode());
                    self.transmit(&ui, raw.channel_id, radio);
                    self.events.push_back(DispatcherEvent::AprsMessageAcked {
                        from: frame.addresses.source.callsign.clone(),
                    });
                }
            }
        }

        self.events.push_back(DispatcherEvent::Aprs(packet));
    }

    fn message_is_for_station(&self, message: &AprsMessage) -> bool {
        match Callsign::parse(&message.addressee) {
            Ok(addressee) => addressee.base() == self.config.callsign.base(),
            Err(_) => false,
        }
    }

    fn transmit(&mut self, frame: &Ax25Frame, channel_id: u8, radio: &mut RadioController<C>) {
        let modulus = crate::ax25::seq_num::Modulus::Eight;
        if radio.enqueue_tnc(channel_id, frame.encode(modulus)).is_err() {
            warn!("transport closed while transmitting");
        }
    }

    /// Moves queued session frames to the radio and reaps finished sessions.
    fn flush_sessions(&mut self, radio: &mut RadioController<C>, now: Instant) {
        let mut dead = Vec::new();
        for (key, entry) in self.sessions.iter_mut() {
            let modulus = entry.session.modulus();
            let channel = entry.session.channel_id();
            while let Some(frame) = entry.session.pop_outgoing() {
                if radio.enqueue_tnc(channel, frame.encode(modulus)).is_err() {
                    warn!("transport closed; dropping outbound frame for {}", key);
                }
            }
            if entry.session.ready_to_reap(now) {
                dead.push(key.clone());
            }
        }
        for key in dead {
            debug!("reaping session {}", key);
            self.sessions.remove(&key);
        }
    }
}
