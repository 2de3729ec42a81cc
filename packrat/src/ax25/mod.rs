//! The AX.25 data-link layer.
//!
//! The radio's TNC moves raw AX.25 frames over the air; everything above the GAIA transport is
//! implemented here. [`frame`] is the wire codec, [`session`] the per-peer connected-mode state
//! machine, [`seq_num`] the modular send/receive sequence arithmetic shared between them.
//!
//! Frames carry no FCS on this transport; the radio verifies and strips it.
//!
//! [`frame`]: frame/index.html
//! [`session`]: session/index.html
//! [`seq_num`]: seq_num/index.html

pub mod frame;
pub mod seq_num;
pub mod session;

use crate::bytes::*;
use crate::Error;
use alloc::vec::Vec;
use core::fmt;

/// A station identifier: 1–6 uppercase alphanumeric characters plus a 0–15 SSID.
///
/// The base is canonicalized to uppercase on construction, which makes equality case-insensitive.
/// The textual form is `BASE` or `BASE-SSID`, with a zero SSID omitted.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Callsign {
    base: heapless::String<6>,
    ssid: u8,
}

impl Callsign {
    /// Creates a callsign from a base and SSID.
    pub fn new(base: &str, ssid: u8) -> Result<Self, Error> {
        if base.is_empty() || base.len() > 6 || ssid > 15 {
            return Err(Error::InvalidValue);
        }
        let mut canonical = heapless::String::new();
        for c in base.chars() {
            if !c.is_ascii_alphanumeric() {
                return Err(Error::InvalidValue);
            }
            canonical
                .push(c.to_ascii_uppercase())
                .map_err(|_| Error::InvalidLength)?;
        }
        Ok(Callsign {
            base: canonical,
            ssid,
        })
    }

    /// Parses the textual form `BASE[-SSID]`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s.split_once('-') {
            Some((base, ssid)) => {
                let ssid: u8 = ssid.parse().map_err(|_| Error::InvalidValue)?;
                Self::new(base, ssid)
            }
            None => Self::new(s, 0),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Returns a copy with a different SSID.
    pub fn with_ssid(&self, ssid: u8) -> Result<Self, Error> {
        Self::new(&self.base, ssid)
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.base)
        } else {
            write!(f, "{}-{}", self.base, self.ssid)
        }
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// One entry of an AX.25 address field.
///
/// The top bit of the SSID octet is the command/response bit on the destination and source
/// entries, and the "has been repeated" bit on digipeater entries; both views are kept here and
/// the codec picks the right one by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Address {
    pub callsign: Callsign,
    /// C bit (destination/source entries).
    pub command: bool,
    /// H bit (digipeater entries).
    pub repeated: bool,
}

impl Ax25Address {
    pub fn new(callsign: Callsign) -> Self {
        Ax25Address {
            callsign,
            command: false,
            repeated: false,
        }
    }

    fn encode(&self, writer: &mut ByteWriter<'_>, last: bool) -> Result<(), Error> {
        let base = self.callsign.base.as_bytes();
        for i in 0..6 {
            let c = base.get(i).copied().unwrap_or(b' ');
            writer.write_u8(c << 1)?;
        }
        let mut ssid = 0b0110_0000 | (self.callsign.ssid << 1);
        if self.command || self.repeated {
            ssid |= 0x80;
        }
        if last {
            ssid |= 0x01;
        }
        writer.write_u8(ssid)
    }

    /// Decodes one 7-byte entry; returns the address and whether the end-of-list bit was set.
    fn decode(bytes: &mut ByteReader<'_>) -> Result<(Self, bool), Error> {
        let raw = bytes.read_slice(7)?;
        let mut base = heapless::String::new();
        for &b in &raw[..6] {
            let c = b >> 1;
            if c == b' ' {
                break;
            }
            if !c.is_ascii_alphanumeric() {
                return Err(Error::InvalidValue);
            }
            base.push(c.to_ascii_uppercase() as char)
                .map_err(|_| Error::InvalidLength)?;
        }
        if base.is_empty() {
            return Err(Error::InvalidValue);
        }
        let ssid_octet = raw[6];
        let top = ssid_octet & 0x80 != 0;
        Ok((
            Ax25Address {
                callsign: Callsign {
                    base,
                    ssid: (ssid_octet >> 1) & 0x0F,
                },
                command: top,
                repeated: top,
            },
            ssid_octet & 0x01 != 0,
        ))
    }
}

impl fmt::Display for Ax25Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.callsign)
    }
}

/// The ordered address field of a frame: destination, source, digipeater path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressField {
    pub destination: Ax25Address,
    pub source: Ax25Address,
    pub digipeaters: Vec<Ax25Address>,
}

impl AddressField {
    /// A path with no digipeaters, with the command bit set on the destination (the usual
    /// arrangement for commands sent by this station).
    pub fn direct(destination: Callsign, source: Callsign) -> Self {
        let mut destination = Ax25Address::new(destination);
        destination.command = true;
        AddressField {
            destination,
            source: Ax25Address::new(source),
            digipeaters: Vec::new(),
        }
    }

    /// Returns the field with destination and source swapped and path cleared, for replies.
    pub fn reversed(&self) -> Self {
        let mut destination = self.source.clone();
        let mut source = self.destination.clone();
        destination.command = !self.destination.command;
        destination.repeated = false;
        source.command = self.destination.command;
        source.repeated = false;
        AddressField {
            destination,
            source,
            digipeaters: Vec::new(),
        }
    }
}

impl ToBytes for AddressField {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        self.destination.encode(writer, false)?;
        self.source.encode(writer, self.digipeaters.is_empty())?;
        let last = self.digipeaters.len().wrapping_sub(1);
        for (i, digi) in self.digipeaters.iter().enumerate() {
            digi.encode(writer, i == last)?;
        }
        Ok(())
    }
}

impl<'a> FromBytes<'a> for AddressField {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let (destination, end) = Ax25Address::decode(bytes)?;
        if end {
            return Err(Error::InvalidLength);
        }
        let (source, mut end) = Ax25Address::decode(bytes)?;
        let mut digipeaters = Vec::new();
        while !end {
            if digipeaters.len() >= 8 {
                return Err(Error::InvalidLength);
            }
            let (digi, is_last) = Ax25Address::decode(bytes)?;
            digipeaters.push(digi);
            end = is_last;
        }
        Ok(AddressField {
            destination,
            source,
            digipeaters,
        })
    }
}

/// Identifies one AX.25 session: the pair of canonical local and remote callsigns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub local: Callsign,
    pub remote: Callsign,
}

impl SessionKey {
    pub fn new(local: Callsign, remote: Callsign) -> Self {
        SessionKey { local, remote }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local, self.remote)
    }
}
