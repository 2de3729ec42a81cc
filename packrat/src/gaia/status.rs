//! Decoded device state: device descriptor, HT status word, RF channels, settings, position.
//!
//! These are the payloads behind `GET_DEV_INFO`, `HT_STATUS_CHANGED`, `READ_RF_CH`,
//! `READ_SETTINGS`, `READ_BSS_SETTINGS` and `GET_POSITION`/`POSITION_CHANGE`. The
//! [`RadioController`] keeps the latest decoded values and shares them by value.
//!
//! [`RadioController`]: ../../radio/struct.RadioController.html

use crate::bytes::*;
use crate::Error;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

/// Channel names as reported by the radio (NUL-padded ASCII, up to 10 chars).
pub type ChannelName = heapless::String<10>;

bitflags! {
    /// Capability bits reported in the device descriptor.
    pub struct Capabilities: u16 {
        const GPS        = 1 << 0;
        const TNC        = 1 << 1;
        const DUAL_WATCH = 1 << 2;
        const NOAA       = 1 << 3;
        const VFO        = 1 << 4;
    }
}

/// Device descriptor parsed from the `GET_DEV_INFO` response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub firmware_major: u8,
    pub firmware_minor: u8,
    pub channel_count: u8,
    pub region_count: u8,
    pub capabilities: Capabilities,
}

impl<'a> FromBytes<'a> for DevInfo {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(DevInfo {
            firmware_major: bytes.read_u8()?,
            firmware_minor: bytes.read_u8()?,
            channel_count: bytes.read_u8()?,
            region_count: bytes.read_u8()?,
            capabilities: Capabilities::from_bits_truncate(bytes.read_u16_be()?),
        })
    }
}

/// The radio's packed status word.
///
/// The interesting bits start at byte offset 5 of the status payload; the four bytes from there
/// are kept in wire form and decoded through accessors:
///
/// ```notrust
/// B5: power_on | is_in_tx | squelch_open | is_in_rx | double_channel(2) | scan | is_radio
/// B6: curr_ch_id_lower(4) | gps_locked | hfp_connected | aoc_connected | -
/// B7: rssi(4) | curr_region upper(4)
/// B8: curr_region lower(2) | curr_channel_id_upper(4) | -(2)
/// ```
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HtStatus {
    raw: [u8; 4],
}

impl HtStatus {
    /// Offset of the status word inside the status payload.
    const WORD_OFFSET: usize = 5;

    /// Decodes a status payload (from `HT_STATUS_CHANGED` or the `GET_HT_STATUS` response body).
    pub fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        r.skip(Self::WORD_OFFSET)?;
        Ok(HtStatus {
            raw: r.read_array::<[u8; 4]>()?,
        })
    }

    pub fn power_on(&self) -> bool {
        self.raw[0] & 0x80 != 0
    }

    pub fn is_in_tx(&self) -> bool {
        self.raw[0] & 0x40 != 0
    }

    pub fn squelch_open(&self) -> bool {
        self.raw[0] & 0x20 != 0
    }

    pub fn is_in_rx(&self) -> bool {
        self.raw[0] & 0x10 != 0
    }

    /// Dual-watch mode, 0..=3.
    pub fn double_channel(&self) -> u8 {
        (self.raw[0] >> 2) & 0b11
    }

    pub fn scan(&self) -> bool {
        self.raw[0] & 0x02 != 0
    }

    pub fn is_radio(&self) -> bool {
        self.raw[0] & 0x01 != 0
    }

    pub fn gps_locked(&self) -> bool {
        self.raw[1] & 0x08 != 0
    }

    pub fn hfp_connected(&self) -> bool {
        self.raw[1] & 0x04 != 0
    }

    pub fn aoc_connected(&self) -> bool {
        self.raw[1] & 0x02 != 0
    }

    pub fn rssi(&self) -> u8 {
        self.raw[2] >> 4
    }

    pub fn curr_region(&self) -> u8 {
        ((self.raw[2] & 0x0F) << 2) | (self.raw[3] >> 6)
    }

    /// Currently selected channel, assembled from the split id fields.
    pub fn curr_channel_id(&self) -> u16 {
        let lower = u16::from(self.raw[1] >> 4);
        let upper = u16::from((self.raw[3] >> 2) & 0x0F);
        (upper << 4) | lower
    }

    /// Whether the TNC path is free to accept a packet right now.
    ///
    /// The radio refuses `HT_SEND_DATA` while it is transmitting or receiving.
    pub fn tnc_free(&self) -> bool {
        self.power_on() && !self.is_in_tx() && !self.is_in_rx()
    }
}

impl fmt::Debug for HtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HtStatus")
            .field("power_on", &self.power_on())
            .field("is_in_tx", &self.is_in_tx())
            .field("squelch_open", &self.squelch_open())
            .field("is_in_rx", &self.is_in_rx())
            .field("double_channel", &self.double_channel())
            .field("scan", &self.scan())
            .field("is_radio", &self.is_radio())
            .field("channel", &self.curr_channel_id())
            .field("gps_locked", &self.gps_locked())
            .field("rssi", &self.rssi())
            .field("region", &self.curr_region())
            .finish()
    }
}

bitflags! {
    /// Per-channel option bits.
    pub struct ChannelFlags: u8 {
        const TX_DISABLE   = 1 << 0;
        const SCAN         = 1 << 1;
        const TX_MAX_POWER = 1 << 2;
        const TX_MED_POWER = 1 << 3;
    }
}

/// One VFO memory channel, from the `READ_RF_CH` response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfChannel {
    pub channel_id: u8,
    pub rx_freq_hz: u32,
    pub tx_freq_hz: u32,
    pub flags: ChannelFlags,
    pub name: ChannelName,
}

impl RfChannel {
    /// Whether the channel is set aside for APRS traffic, by naming convention.
    pub fn is_aprs(&self) -> bool {
        let name = self.name.as_str();
        name.len() >= 4 && name.as_bytes()[..4].eq_ignore_ascii_case(b"APRS")
    }
}

fn read_padded_name(bytes: &mut ByteReader<'_>, len: usize) -> Result<ChannelName, Error> {
    let raw = bytes.read_slice(len)?;
    let mut name = ChannelName::new();
    for &b in raw.iter().take_while(|&&b| b != 0) {
        if !b.is_ascii() {
            return Err(Error::InvalidValue);
        }
        name.push(b as char).map_err(|_| Error::InvalidLength)?;
    }
    Ok(name)
}

impl<'a> FromBytes<'a> for RfChannel {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let channel_id = bytes.read_u8()?;
        let rx_freq_hz = bytes.read_u32_be()?;
        let tx_freq_hz = bytes.read_u32_be()?;
        let flags = ChannelFlags::from_bits_truncate(bytes.read_u8()?);
        let name = read_padded_name(bytes, 10)?;
        Ok(RfChannel {
            channel_id,
            rx_freq_hz,
            tx_freq_hz,
            flags,
            name,
        })
    }
}

impl ToBytes for RfChannel {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.channel_id)?;
        writer.write_u32_be(self.rx_freq_hz)?;
        writer.write_u32_be(self.tx_freq_hz)?;
        writer.write_u8(self.flags.bits())?;
        let mut padded = [0u8; 10];
        padded[..self.name.len()].copy_from_slice(self.name.as_bytes());
        writer.write_slice(&padded)
    }
}

/// General radio settings (`READ_SETTINGS`).
///
/// Only the fields the station acts on are decoded; the full payload is retained so
/// `WRITE_SETTINGS` can send it back unchanged apart from targeted edits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub channel_a: u8,
    pub channel_b: u8,
    pub scan: bool,
    pub squelch_level: u8,
    pub raw: Vec<u8>,
}

impl Settings {
    pub fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        let channel_a = r.read_u8()?;
        let channel_b = r.read_u8()?;
        let scan = r.read_u8()? != 0;
        let squelch_level = r.read_u8()?;
        Ok(Settings {
            channel_a,
            channel_b,
            scan,
            squelch_level,
            raw: payload.to_vec(),
        })
    }
}

/// APRS/beacon ("BSS") settings (`READ_BSS_SETTINGS`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BssSettings {
    pub aprs_ssid: u8,
    pub aprs_symbol: u8,
    pub location_share_interval_s: u16,
    pub ptt_release_send_location: bool,
    pub beacon_message: heapless::String<18>,
    pub raw: Vec<u8>,
}

impl BssSettings {
    pub fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        let mut r = ByteReader::new(payload);
        let aprs_ssid = r.read_u8()?;
        let aprs_symbol = r.read_u8()?;
        let location_share_interval_s = r.read_u16_be()?;
        let flags = r.read_u8()?;
        let raw_msg = r.read_slice(18)?;
        let mut beacon_message = heapless::String::new();
        for &b in raw_msg.iter().take_while(|&&b| b != 0) {
            beacon_message.push(b as char).map_err(|_| Error::InvalidLength)?;
        }
        Ok(BssSettings {
            aprs_ssid,
            aprs_symbol,
            location_share_interval_s,
            ptt_release_send_location: flags & 0x01 != 0,
            beacon_message,
            raw: payload.to_vec(),
        })
    }
}

/// GPS fix (`GET_POSITION` response body / `POSITION_CHANGE` event).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GpsPosition {
    pub latitude_microdeg: i32,
    pub longitude_microdeg: i32,
    pub altitude_m: i16,
    /// Ground speed in tenths of km/h.
    pub speed: u16,
    /// Course in degrees, 0..360.
    pub heading: u16,
    pub locked: bool,
}

impl GpsPosition {
    pub fn latitude(&self) -> f64 {
        f64::from(self.latitude_microdeg) / 1e6
    }

    pub fn longitude(&self) -> f64 {
        f64::from(self.longitude_microdeg) / 1e6
    }
}

impl<'a> FromBytes<'a> for GpsPosition {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let latitude_microdeg = bytes.read_u32_be()? as i32;
        let longitude_microdeg = bytes.read_u32_be()? as i32;
        let altitude_m = bytes.read_u16_be()? as i16;
        let speed = bytes.read_u16_be()?;
        let heading = bytes.read_u16_be()?;
        let locked = bytes.read_u8()? != 0;
        Ok(GpsPosition {
            latitude_microdeg,
            longitude_microdeg,
            altitude_m,
            speed,
            heading,
            locked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn ht_status_bits() {
        // B5: power_on | squelch_open | double_channel=1 | is_radio
        // B6: ch lower = 0b0011, gps_locked
        // B7: rssi = 0b1010, region upper nibble = 0b0001
        // B8: region lower = 0b10, ch upper = 0b0101
        let payload = [0, 0, 0, 0, 0, 0b1010_0101, 0b0011_1000, 0b1010_0001, 0b1001_0100];
        let st = HtStatus::from_payload(&payload).unwrap();
        assert!(st.power_on());
        assert!(!st.is_in_tx());
        assert!(st.squelch_open());
        assert!(!st.is_in_rx());
        assert_eq!(st.double_channel(), 1);
        assert!(!st.scan());
        assert!(st.is_radio());
        assert!(st.gps_locked());
        assert!(!st.hfp_connected());
        assert_eq!(st.rssi(), 0b1010);
        assert_eq!(st.curr_region(), 0b0001_10);
        assert_eq!(st.curr_channel_id(), (0b0101 << 4) | 0b0011);
        assert!(st.tnc_free());
    }

    #[test]
    fn ht_status_busy() {
        let mut payload = [0u8; 9];
        payload[5] = 0b1100_0000; // power_on + is_in_tx
        let st = HtStatus::from_payload(&payload).unwrap();
        assert!(!st.tnc_free());
    }

    #[test]
    fn rf_channel_roundtrip() {
        let ch = RfChannel {
            channel_id: 3,
            rx_freq_hz: 144_390_000,
            tx_freq_hz: 144_390_000,
            flags: ChannelFlags::SCAN | ChannelFlags::TX_MAX_POWER,
            name: ChannelName::from("APRS"),
        };
        let bytes = encode_to_vec(&ch, 32).unwrap();
        assert_eq!(bytes.len(), 20);
        let back = RfChannel::from_bytes(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(back, ch);
        assert!(back.is_aprs());
    }

    #[test]
    fn dev_info_decode() {
        let body = vec![5, 1, 30, 6, 0x00, 0x03];
        let info = DevInfo::from_bytes(&mut ByteReader::new(&body)).unwrap();
        assert_eq!(info.channel_count, 30);
        assert_eq!(info.region_count, 6);
        assert!(info.capabilities.contains(Capabilities::GPS | Capabilities::TNC));
    }
}
