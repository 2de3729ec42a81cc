//! The GAIA command/notification envelope spoken by the handheld radio.
//!
//! Every logical message on the wireless link is one envelope:
//!
//! ```notrust
//! MSB                                        LSB
//! +-----------+-------------+-----------------+
//! |  Group    |  Command    |     Payload     |
//! | (u16 BE)  |  (u16 BE)   |   (0+ bytes)    |
//! +-----------+-------------+-----------------+
//! ```
//!
//! The most significant bit of `Command` marks unsolicited notifications; requests and responses
//! share the command number with the bit clear. The transport below preserves packet boundaries,
//! so one link packet carries exactly one envelope.
//!
//! Command responses begin with a status octet (see [`StatusCode`]); the remaining payload layout
//! is command-specific and decoded in [`status`].
//!
//! [`StatusCode`]: enum.StatusCode.html
//! [`status`]: status/index.html

pub mod reassembly;
pub mod status;

use crate::bytes::*;
use crate::Error;
use alloc::vec::Vec;
use byteorder::BigEndian;
use zerocopy::{byteorder::U16, AsBytes, FromBytes as ZFromBytes, Unaligned};

/// Bit in the command field that marks a notification.
const NOTIFICATION_FLAG: u16 = 0x8000;

enum_with_unknown! {
    /// GAIA command group (vendor ID).
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Group(u16) {
        /// Basic command set; carries everything this stack uses.
        Basic = 2,
        /// Extended command set.
        Extended = 10
    }
}

enum_with_unknown! {
    /// Commands of the basic group used by the station.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum Command(u16) {
        GetDevInfo = 4,
        ReadStatus = 5,
        RegisterNotification = 6,
        EventNotification = 9,
        ReadSettings = 10,
        WriteSettings = 11,
        ReadRfCh = 13,
        WriteRfCh = 14,
        GetHtStatus = 20,
        GetVolume = 22,
        SetVolume = 23,
        HtSendData = 31,
        ReadBssSettings = 33,
        WriteBssSettings = 34,
        SetRegion = 60,
        GetPosition = 76
    }
}

enum_with_unknown! {
    /// Event types carried inside `EVENT_NOTIFICATION` and named in `REGISTER_NOTIFICATION`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum EventType(u8) {
        HtStatusChanged = 1,
        DataRxd = 2,
        HtChChanged = 5,
        HtSettingsChanged = 6,
        RadioStatusChanged = 8,
        PositionChange = 13
    }
}

enum_with_unknown! {
    /// Acknowledgement status octet leading every command response.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum StatusCode(u8) {
        Success = 0,
        NotSupported = 1,
        NotAuthenticated = 2,
        InsufficientResources = 3,
        Authenticating = 4,
        InvalidParameter = 5,
        IncorrectState = 6,
        InProgress = 7
    }
}

/// Fixed part of the envelope, kept in wire representation.
#[derive(ZFromBytes, AsBytes, Unaligned)]
#[repr(C)]
struct RawHeader {
    group: U16<BigEndian>,
    command: U16<BigEndian>,
}

/// One decoded GAIA envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaiaMessage {
    pub group: Group,
    /// Command number with the notification bit stripped.
    pub command: Command,
    pub is_notification: bool,
    pub payload: Vec<u8>,
}

impl GaiaMessage {
    /// Builds a request in the basic group.
    pub fn request(command: Command, payload: Vec<u8>) -> Self {
        GaiaMessage {
            group: Group::Basic,
            command,
            is_notification: false,
            payload,
        }
    }

    /// Returns the response status octet and the rest of the payload.
    ///
    /// Only meaningful for command responses.
    pub fn response_body(&self) -> Result<(StatusCode, &[u8]), Error> {
        let mut r = ByteReader::new(&self.payload);
        let status = StatusCode::from(r.read_u8()?);
        Ok((status, r.into_rest()))
    }
}

impl ToBytes for GaiaMessage {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let mut command = u16::from(self.command);
        if self.is_notification {
            command |= NOTIFICATION_FLAG;
        }
        writer.write_obj(&RawHeader {
            group: U16::new(u16::from(self.group)),
            command: U16::new(command),
        })?;
        writer.write_slice(&self.payload)
    }
}

impl<'a> FromBytes<'a> for GaiaMessage {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let header = bytes.read_obj::<RawHeader>()?;
        let raw_command = header.command.get();
        Ok(GaiaMessage {
            group: Group::from(header.group.get()),
            command: Command::from(raw_command & !NOTIFICATION_FLAG),
            is_notification: raw_command & NOTIFICATION_FLAG != 0,
            payload: bytes.read_rest().to_vec(),
        })
    }
}

/// Encodes an envelope into a fresh packet buffer.
pub fn encode_message(msg: &GaiaMessage) -> Vec<u8> {
    // 4 header bytes plus payload always fits.
    encode_to_vec(msg, msg.payload.len() + 4).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn envelope_roundtrip() {
        let msg = GaiaMessage::request(Command::ReadRfCh, vec![7]);
        let bytes = encode_message(&msg);
        assert_eq!(bytes, [0x00, 0x02, 0x00, 0x0D, 0x07]);
        let back = GaiaMessage::from_bytes(&mut ByteReader::new(&bytes)).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn notification_flag() {
        let bytes = [0x00, 0x02, 0x80, 0x09, 0x01, 0xAA];
        let msg = GaiaMessage::from_bytes(&mut ByteReader::new(&bytes)).unwrap();
        assert!(msg.is_notification);
        assert_eq!(msg.command, Command::EventNotification);
        assert_eq!(msg.payload, vec![0x01, 0xAA]);

        let reencoded = encode_message(&msg);
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn response_status() {
        let msg = GaiaMessage {
            group: Group::Basic,
            command: Command::HtSendData,
            is_notification: false,
            payload: vec![6],
        };
        let (status, rest) = msg.response_body().unwrap();
        assert_eq!(status, StatusCode::IncorrectState);
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_header() {
        let bytes = [0x00, 0x02, 0x00];
        assert!(GaiaMessage::from_bytes(&mut ByteReader::new(&bytes)).is_err());
    }
}
