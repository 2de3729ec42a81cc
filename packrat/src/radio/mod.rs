//! The radio controller: typed operations over the GAIA link.
//!
//! [`RadioController`] owns the transport writer and everything GAIA: it correlates command
//! responses, runs the startup handshake, decodes notifications into typed events, reassembles
//! inbound TNC fragments, and drives the outbound [`TncQueue`].
//!
//! Responses carry no transaction tag, so correlation relies on the link being ordered: issued
//! commands are remembered in FIFO order and a response is matched to the earliest outstanding
//! request with the same command number (unsolicited messages are distinguishable by the
//! notification bit and never enter this path).
//!
//! The startup handshake runs `GET_DEV_INFO` → notification subscriptions → `READ_SETTINGS` →
//! `READ_BSS_SETTINGS` → `READ_RF_CH` for every channel, and announces completion with a single
//! [`RadioEvent::ChannelsLoaded`].
//!
//! [`RadioController`]: struct.RadioController.html
//! [`TncQueue`]: queue/struct.TncQueue.html
//! [`RadioEvent::ChannelsLoaded`]: enum.RadioEvent.html

pub mod queue;

use crate::bytes::*;
use crate::config::Config;
use crate::gaia::reassembly::{fragment, Reassembler, TncFragment, UniqueDataFrame};
use crate::gaia::status::{BssSettings, DevInfo, GpsPosition, HtStatus, RfChannel, Settings};
use crate::gaia::{encode_message, Command, EventType, GaiaMessage, StatusCode};
use crate::time::{NextUpdate, Timer};
use crate::transport::Transport;
use crate::Error;

use self::queue::{SendOutcome, TncPacket, TncQueue};
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Notification types subscribed during the handshake, in order.
const SUBSCRIPTIONS: [EventType; 4] = [
    EventType::HtStatusChanged,
    EventType::HtSettingsChanged,
    EventType::DataRxd,
    EventType::PositionChange,
];

/// Progress of the startup handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InitState {
    Idle,
    AwaitDevInfo,
    Subscribing(usize),
    AwaitSettings,
    AwaitBssSettings,
    LoadingChannels(u8),
    Ready,
}

/// Events produced by the radio controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Device descriptor received; the handshake continues.
    DeviceInfo(DevInfo),
    /// The radio's packed status word changed.
    StatusChanged(HtStatus),
    SettingsChanged(Settings),
    BssSettingsChanged(BssSettings),
    PositionChanged(GpsPosition),
    VolumeChanged(u8),
    /// One channel finished loading during the handshake.
    ChannelLoaded(RfChannel),
    /// All channels are loaded; the controller is ready for traffic.
    ChannelsLoaded,
    /// A whole over-the-air frame was reassembled.
    FrameReceived(UniqueDataFrame),
    /// A queued TNC packet was dropped after a non-transient radio error.
    PacketRejected,
    /// The wireless link is gone.
    LinkClosed,
}

/// Binds GAIA commands to typed operations and owns the single transport writer.
pub struct RadioController<C: Config> {
    transport: C::Transport,
    timer: C::Timer,

    init: InitState,
    dev_info: Option<DevInfo>,
    status: Option<HtStatus>,
    settings: Option<Settings>,
    bss_settings: Option<BssSettings>,
    position: Option<GpsPosition>,
    volume: Option<u8>,
    channels: Vec<RfChannel>,

    /// Outstanding requests, oldest first.
    outstanding: VecDeque<Command>,
    reassembler: Reassembler,
    tnc: TncQueue,
    events: VecDeque<RadioEvent>,
}

impl<C: Config> RadioController<C> {
    pub fn new(transport: C::Transport, timer: C::Timer) -> Self {
        RadioController {
            transport,
            timer,
            init: InitState::Idle,
            dev_info: None,
            status: None,
            settings: None,
            bss_settings: None,
            position: None,
            volume: None,
            channels: Vec::new(),
            outstanding: VecDeque::new(),
            reassembler: Reassembler::new(),
            tnc: TncQueue::new(),
            events: VecDeque::new(),
        }
    }

    /// Begins the startup handshake. Call once the link is up.
    pub fn start(&mut self) -> Result<(), Error> {
        self.init = InitState::AwaitDevInfo;
        self.send_request(Command::GetDevInfo, &[])
    }

    /// Whether the handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.init == InitState::Ready
    }

    pub fn dev_info(&self) -> Option<&DevInfo> {
        self.dev_info.as_ref()
    }

    pub fn status(&self) -> Option<&HtStatus> {
        self.status.as_ref()
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_ref()
    }

    pub fn bss_settings(&self) -> Option<&BssSettings> {
        self.bss_settings.as_ref()
    }

    pub fn position(&self) -> Option<&GpsPosition> {
        self.position.as_ref()
    }

    pub fn channels(&self) -> &[RfChannel] {
        &self.channels
    }

    /// Returns the next queued event, if any.
    pub fn pop_event(&mut self) -> Option<RadioEvent> {
        self.events.pop_front()
    }

    /// Access to the transport writer, for embedders that manage reconnection.
    pub fn transport_mut(&mut self) -> &mut C::Transport {
        &mut self.transport
    }

    /// Queues an AX.25 frame for over-the-air transmission on the given VFO channel.
    pub fn enqueue_tnc(&mut self, channel_id: u8, data: Vec<u8>) -> Result<(), Error> {
        self.tnc.push(TncPacket { channel_id, data });
        self.pump_tnc()
    }

    pub fn set_volume(&mut self, volume: u8) -> Result<(), Error> {
        self.send_request(Command::SetVolume, &[volume])
    }

    pub fn set_region(&mut self, region: u8) -> Result<(), Error> {
        self.send_request(Command::SetRegion, &[region])
    }

    pub fn request_position(&mut self) -> Result<(), Error> {
        self.send_request(Command::GetPosition, &[])
    }

    /// Reports loss of the wireless link. Pending work is discarded.
    pub fn link_closed(&mut self) {
        self.init = InitState::Idle;
        self.outstanding.clear();
        self.tnc.clear();
        self.events.push_back(RadioEvent::LinkClosed);
    }

    /// When the controller wants `update_timer` called.
    pub fn next_update(&self) -> NextUpdate {
        self.tnc.next_update()
    }

    /// Performs delayed work (the TNC dispatch pauses).
    pub fn update_timer(&mut self) -> Result<(), Error> {
        self.pump_tnc()
    }

    /// Processes one inbound link packet.
    ///
    /// Malformed packets are dropped with a diagnostic; the error is returned for accounting but
    /// the controller remains usable.
    pub fn process_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        let msg = match GaiaMessage::from_bytes(&mut ByteReader::new(packet)) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable GAIA packet: {:?}", crate::utils::HexSlice(packet));
                return Err(e);
            }
        };

        if msg.is_notification {
            self.handle_notification(&msg)
        } else {
            self.handle_response(&msg)
        }
    }

    fn send_request(&mut self, command: Command, payload: &[u8]) -> Result<(), Error> {
        let msg = GaiaMessage::request(command, payload.to_vec());
        self.transport.write_packet(&encode_message(&msg))?;
        self.outstanding.push_back(command);
        Ok(())
    }

    fn handle_notification(&mut self, msg: &GaiaMessage) -> Result<(), Error> {
        if msg.command != Command::EventNotification {
            debug!("unhandled notification {:?}", msg.command);
            return Ok(());
        }
        let mut r = ByteReader::new(&msg.payload);
        let event = EventType::from(r.read_u8()?);
        let body = r.read_rest();
        match event {
            EventType::HtStatusChanged => {
                let status = HtStatus::from_payload(body)?;
                self.status = Some(status);
                self.events.push_back(RadioEvent::StatusChanged(status));
                // A status change is the retry opportunity for a deferred TNC head.
                self.tnc.on_status_changed();
                self.pump_tnc()
            }
            EventType::DataRxd => {
                let frag = TncFragment::from_bytes(&mut ByteReader::new(body))?;
                if let Some(mut frame) = self.reassembler.push(&frag) {
                    frame.channel_name = self
                        .channels
                        .iter()
                        .find(|ch| ch.channel_id == frame.channel_id)
                        .map(|ch| ch.name.clone())
                        .unwrap_or_default();
                    trace!(
                        "rx frame on ch {} ({} bytes)",
                        frame.channel_id,
                        frame.data.len()
                    );
                    self.events.push_back(RadioEvent::FrameReceived(frame));
                }
                Ok(())
            }
            EventType::HtSettingsChanged => {
                let settings = Settings::from_payload(body)?;
                self.settings = Some(settings.clone());
                self.events.push_back(RadioEvent::SettingsChanged(settings));
                Ok(())
            }
            EventType::PositionChange => {
                let pos = GpsPosition::from_bytes(&mut ByteReader::new(body))?;
                self.position = Some(pos);
                self.events.push_back(RadioEvent::PositionChanged(pos));
                Ok(())
            }
            other => {
                debug!("ignored event {:?}", other);
                Ok(())
            }
        }
    }

    fn handle_response(&mut self, msg: &GaiaMessage) -> Result<(), Error> {
        let pos = self
            .outstanding
            .iter()
            .position(|&cmd| cmd == msg.command)
            .ok_or_else(|| {
                warn!("response without matching request: {:?}", msg.command);
                Error::InvalidValue
            })?;
        self.outstanding.remove(pos);

        let (status, body) = msg.response_body()?;
        match msg.command {
            Command::HtSendData => self.handle_send_result(status),
            _ if status != StatusCode::Success => {
                warn!("{:?} failed with {:?}", msg.command, status);
                Ok(())
            }
            Command::GetDevInfo => {
                let info = DevInfo::from_bytes(&mut ByteReader::new(body))?;
                self.dev_info = Some(info.clone());
                self.events.push_back(RadioEvent::DeviceInfo(info));
                self.init = InitState::Subscribing(0);
                self.send_request(
                    Command::RegisterNotification,
                    &[u8::from(SUBSCRIPTIONS[0])],
                )
            }
            Command::RegisterNotification => {
                if let InitState::Subscribing(i) = self.init {
                    let next = i + 1;
                    if next < SUBSCRIPTIONS.len() {
                        self.init = InitState::Subscribing(next);
                        self.send_request(
                            Command::RegisterNotification,
                            &[u8::from(SUBSCRIPTIONS[next])],
                        )
                    } else {
                        self.init = InitState::AwaitSettings;
                        self.send_request(Command::ReadSettings, &[])
                    }
                } else {
                    Ok(())
                }
            }
            Command::ReadSettings => {
                let settings = Settings::from_payload(body)?;
                self.settings = Some(settings.clone());
                self.events.push_back(RadioEvent::SettingsChanged(settings));
                if self.init == InitState::AwaitSettings {
                    self.init = InitState::AwaitBssSettings;
                    self.send_request(Command::ReadBssSettings, &[])
                } else {
                    Ok(())
                }
            }
            Command::ReadBssSettings => {
                let bss = BssSettings::from_payload(body)?;
                self.bss_settings = Some(bss.clone());
                self.events.push_back(RadioEvent::BssSettingsChanged(bss));
                if self.init == InitState::AwaitBssSettings {
                    self.load_next_channel(0)
                } else {
                    Ok(())
                }
            }
            Command::ReadRfCh => {
                let channel = RfChannel::from_bytes(&mut ByteReader::new(body))?;
                self.channels.retain(|ch| ch.channel_id != channel.channel_id);
                self.channels.push(channel.clone());
                self.events.push_back(RadioEvent::ChannelLoaded(channel));
                if let InitState::LoadingChannels(i) = self.init {
                    self.load_next_channel(i + 1)
                } else {
                    Ok(())
                }
            }
            Command::GetHtStatus => {
                let status = HtStatus::from_payload(body)?;
                self.status = Some(status);
                self.events.push_back(RadioEvent::StatusChanged(status));
                Ok(())
            }
            Command::GetVolume | Command::SetVolume => {
                if let Ok(v) = ByteReader::new(body).read_u8() {
                    self.volume = Some(v);
                    self.events.push_back(RadioEvent::VolumeChanged(v));
                }
                Ok(())
            }
            Command::GetPosition => {
                let pos = GpsPosition::from_bytes(&mut ByteReader::new(body))?;
                self.position = Some(pos);
                self.events.push_back(RadioEvent::PositionChanged(pos));
                Ok(())
            }
            other => {
                debug!("unhandled response {:?}", other);
                Ok(())
            }
        }
    }

    fn load_next_channel(&mut self, index: u8) -> Result<(), Error> {
        let count = self.dev_info.as_ref().map(|i| i.channel_count).unwrap_or(0);
        if index < count {
            self.init = InitState::LoadingChannels(index);
            self.send_request(Command::ReadRfCh, &[index])
        } else {
            info!("handshake complete, {} channels", self.channels.len());
            self.init = InitState::Ready;
            self.events.push_back(RadioEvent::ChannelsLoaded);
            Ok(())
        }
    }

    fn handle_send_result(&mut self, status: StatusCode) -> Result<(), Error> {
        let now = self.timer.now();
        match self.tnc.on_send_response(status, now) {
            Some(SendOutcome::Sent) | None => {}
            Some(SendOutcome::Deferred) => {
                debug!("TNC busy, holding head for next status change");
            }
            Some(SendOutcome::Rejected(_)) => {
                self.events.push_back(RadioEvent::PacketRejected);
            }
        }
        self.pump_tnc()
    }

    /// Hands the queue head to the radio when the queue permits it.
    fn pump_tnc(&mut self) -> Result<(), Error> {
        let now = self.timer.now();
        let tnc_free = self.status.map(|s| s.tnc_free()).unwrap_or(true);
        if !self.tnc.ready(now, tnc_free) {
            return Ok(());
        }

        let (channel_id, data) = match self.tnc.peek() {
            Some(head) => (head.channel_id, head.data.clone()),
            None => return Ok(()),
        };
        let frags = fragment(channel_id, &data);
        self.tnc.mark_pending(frags.len() as u8);
        for frag in &frags {
            self.send_request(Command::HtSendData, frag)?;
        }
        Ok(())
    }
}
