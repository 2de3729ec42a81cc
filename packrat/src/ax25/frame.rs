//! AX.25 frame structures and the wire codec.
//!
//! A frame is the address field, a control field, an optional PID octet (I and UI frames only)
//! and the information payload. The control field is one octet in modulo-8 operation and, for I
//! and S frames, two octets in modulo-128 operation:
//!
//! ```notrust
//! mod 8         7   6   5   4   3   2   1   0
//!   I frame   |     N(R)    | P |   N(S)    | 0 |
//!   S frame   |     N(R)    |P/F| S   S | 0   1 |
//!   U frame   | M   M   M |P/F| M   M | 1   1 |
//!
//! mod 128 (I/S)    first octet        second octet
//!   I frame   |   N(S)        | 0 |  |   N(R)      | P |
//!   S frame   | 0 0 0 0 S S 0 1 |  |   N(R)      |P/F|
//! ```
//!
//! No FCS is present on this transport; the radio's TNC owns it.

use super::seq_num::{Modulus, SeqNum};
use super::AddressField;
use crate::bytes::*;
use crate::gaia::status::ChannelName;
use crate::Error;
use alloc::vec::Vec;

/// PID value for traffic with no layer-3 protocol (all of this stack's connected traffic).
pub const PID_NO_L3: u8 = 0xF0;

/// Supervisory frame kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SFormat {
    /// Receive Ready: acknowledgement, receiver not busy.
    Rr,
    /// Receive Not Ready: acknowledgement, receiver busy.
    Rnr,
    /// Reject: request retransmission starting at N(R).
    Rej,
    /// Selective Reject (decoded but never sent by this stack).
    Srej,
}

impl SFormat {
    fn bits(self) -> u8 {
        match self {
            SFormat::Rr => 0b00,
            SFormat::Rnr => 0b01,
            SFormat::Rej => 0b10,
            SFormat::Srej => 0b11,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => SFormat::Rr,
            0b01 => SFormat::Rnr,
            0b10 => SFormat::Rej,
            _ => SFormat::Srej,
        }
    }
}

/// Unnumbered frame kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UFormat {
    Sabm,
    Sabme,
    Ua,
    Disc,
    Dm,
    Ui,
    Frmr,
    Xid,
    Test,
}

impl UFormat {
    /// The control octet with the P/F bit cleared.
    fn base(self) -> u8 {
        match self {
            UFormat::Sabm => 0x2F,
            UFormat::Sabme => 0x6F,
            UFormat::Ua => 0x63,
            UFormat::Disc => 0x43,
            UFormat::Dm => 0x0F,
            UFormat::Ui => 0x03,
            UFormat::Frmr => 0x87,
            UFormat::Xid => 0xAF,
            UFormat::Test => 0xE3,
        }
    }

    fn from_base(base: u8) -> Result<Self, Error> {
        Ok(match base {
            0x2F => UFormat::Sabm,
            0x6F => UFormat::Sabme,
            0x63 => UFormat::Ua,
            0x43 => UFormat::Disc,
            0x0F => UFormat::Dm,
            0x03 => UFormat::Ui,
            0x87 => UFormat::Frmr,
            0xAF => UFormat::Xid,
            0xE3 => UFormat::Test,
            _ => return Err(Error::InvalidValue),
        })
    }
}

/// Decoded control field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Control {
    I {
        ns: SeqNum,
        nr: SeqNum,
        poll: bool,
    },
    S {
        format: SFormat,
        nr: SeqNum,
        poll_final: bool,
    },
    U {
        format: UFormat,
        poll_final: bool,
    },
}

impl Control {
    /// Whether a PID octet follows this control field.
    pub fn has_pid(&self) -> bool {
        match self {
            Control::I { .. } => true,
            Control::U {
                format: UFormat::Ui,
                ..
            } => true,
            _ => false,
        }
    }

    fn encode(&self, writer: &mut ByteWriter<'_>, modulus: Modulus) -> Result<(), Error> {
        match (*self, modulus) {
            (Control::I { ns, nr, poll }, Modulus::Eight) => writer.write_u8(
                (nr.value() << 5) | ((poll as u8) << 4) | (ns.value() << 1),
            ),
            (Control::I { ns, nr, poll }, Modulus::OneTwentyEight) => {
                writer.write_u8(ns.value() << 1)?;
                writer.write_u8((nr.value() << 1) | poll as u8)
            }
            (
                Control::S {
                    format,
                    nr,
                    poll_final,
                },
                Modulus::Eight,
            ) => writer.write_u8(
                (nr.value() << 5) | ((poll_final as u8) << 4) | (format.bits() << 2) | 0b01,
            ),
            (
                Control::S {
                    format,
                    nr,
                    poll_final,
                },
                Modulus::OneTwentyEight,
            ) => {
                writer.write_u8((format.bits() << 2) | 0b01)?;
                writer.write_u8((nr.value() << 1) | poll_final as u8)
            }
            (Control::U { format, poll_final }, _) => {
                writer.write_u8(format.base() | ((poll_final as u8) << 4))
            }
        }
    }

    fn decode(bytes: &mut ByteReader<'_>, modulus: Modulus) -> Result<Self, Error> {
        let first = bytes.read_u8()?;
        if first & 0b01 == 0 {
            // I frame
            return Ok(match modulus {
                Modulus::Eight => Control::I {
                    ns: SeqNum::new(first >> 1, modulus),
                    nr: SeqNum::new(first >> 5, modulus),
                    poll: first & 0x10 != 0,
                },
                Modulus::OneTwentyEight => {
                    let second = bytes.read_u8()?;
                    Control::I {
                        ns: SeqNum::new(first >> 1, modulus),
                        nr: SeqNum::new(second >> 1, modulus),
                        poll: second & 0x01 != 0,
                    }
                }
            });
        }
        if first & 0b11 == 0b01 {
            // S frame
            return Ok(match modulus {
                Modulus::Eight => Control::S {
                    format: SFormat::from_bits(first >> 2),
                    nr: SeqNum::new(first >> 5, modulus),
                    poll_final: first & 0x10 != 0,
                },
                Modulus::OneTwentyEight => {
                    let second = bytes.read_u8()?;
                    Control::S {
                        format: SFormat::from_bits(first >> 2),
                        nr: SeqNum::new(second >> 1, modulus),
                        poll_final: second & 0x01 != 0,
                    }
                }
            });
        }
        Ok(Control::U {
            format: UFormat::from_base(first & !0x10)?,
            poll_final: first & 0x10 != 0,
        })
    }
}

/// One decoded AX.25 frame, plus the local channel tag it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ax25Frame {
    pub addresses: AddressField,
    pub control: Control,
    /// Present on I and UI frames only.
    pub pid: Option<u8>,
    pub payload: Vec<u8>,
    /// VFO channel the frame arrived on (or should leave on). Not part of the wire format.
    pub channel_id: u8,
    /// Decoded channel name, informational.
    pub channel_name: ChannelName,
}

impl Ax25Frame {
    /// Builds a UI frame ("no layer 3" unless a PID is given).
    pub fn ui(addresses: AddressField, pid: u8, payload: Vec<u8>) -> Self {
        Ax25Frame {
            addresses,
            control: Control::U {
                format: UFormat::Ui,
                poll_final: false,
            },
            pid: Some(pid),
            payload,
            channel_id: 0,
            channel_name: ChannelName::new(),
        }
    }

    /// Builds a payload-less control frame.
    pub fn control(addresses: AddressField, control: Control) -> Self {
        let pid = if control.has_pid() {
            Some(PID_NO_L3)
        } else {
            None
        };
        Ax25Frame {
            addresses,
            control,
            pid,
            payload: Vec::new(),
            channel_id: 0,
            channel_name: ChannelName::new(),
        }
    }

    /// Parses a frame, interpreting sequenced control fields under `modulus`.
    pub fn parse(data: &[u8], modulus: Modulus) -> Result<Self, Error> {
        let mut r = ByteReader::new(data);
        let addresses = AddressField::from_bytes(&mut r)?;
        let control = Control::decode(&mut r, modulus)?;
        let pid = if control.has_pid() {
            Some(r.read_u8()?)
        } else {
            None
        };
        Ok(Ax25Frame {
            addresses,
            control,
            pid,
            payload: r.read_rest().to_vec(),
            channel_id: 0,
            channel_name: ChannelName::new(),
        })
    }

    /// Encodes the frame for the TNC under `modulus`.
    pub fn encode(&self, modulus: Modulus) -> Vec<u8> {
        struct Enc<'f>(&'f Ax25Frame, Modulus);
        impl ToBytes for Enc<'_> {
            fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
                self.0.addresses.to_bytes(writer)?;
                self.0.control.encode(writer, self.1)?;
                if let Some(pid) = self.0.pid {
                    writer.write_u8(pid)?;
                }
                writer.write_slice(&self.0.payload)
            }
        }

        let cap = 7 * (2 + self.addresses.digipeaters.len()) + 3 + self.payload.len();
        encode_to_vec(&Enc(self, modulus), cap).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::Callsign;

    fn addrs() -> AddressField {
        AddressField::direct(
            Callsign::parse("N0CALL-7").unwrap(),
            Callsign::parse("W1AW-2").unwrap(),
        )
    }

    fn sn(v: u8, m: Modulus) -> SeqNum {
        SeqNum::new(v, m)
    }

    #[test]
    fn u_frame_control_bytes() {
        for (format, base) in [
            (UFormat::Sabm, 0x2F),
            (UFormat::Sabme, 0x6F),
            (UFormat::Ua, 0x63),
            (UFormat::Disc, 0x43),
            (UFormat::Dm, 0x0F),
            (UFormat::Ui, 0x03),
            (UFormat::Frmr, 0x87),
            (UFormat::Xid, 0xAF),
            (UFormat::Test, 0xE3),
        ]
        .iter()
        {
            let frame = Ax25Frame::control(
                addrs(),
                Control::U {
                    format: *format,
                    poll_final: true,
                },
            );
            let bytes = frame.encode(Modulus::Eight);
            assert_eq!(bytes[14], *base | 0x10, "{:?}", format);
        }

        // UA with F=1 is the classic 0x73.
        let ua = Ax25Frame::control(
            addrs(),
            Control::U {
                format: UFormat::Ua,
                poll_final: true,
            },
        );
        assert_eq!(ua.encode(Modulus::Eight)[14], 0x73);
        // DISC with P=1 is 0x53.
        let disc = Ax25Frame::control(
            addrs(),
            Control::U {
                format: UFormat::Disc,
                poll_final: true,
            },
        );
        assert_eq!(disc.encode(Modulus::Eight)[14], 0x53);
    }

    #[test]
    fn roundtrip_all_mod8() {
        let m = Modulus::Eight;
        let mut frames = alloc::vec::Vec::new();
        for ns in 0..8 {
            for nr in 0..8 {
                for poll in [false, true].iter() {
                    frames.push(Ax25Frame {
                        addresses: addrs(),
                        control: Control::I {
                            ns: sn(ns, m),
                            nr: sn(nr, m),
                            poll: *poll,
                        },
                        pid: Some(PID_NO_L3),
                        payload: alloc::vec![ns, nr],
                        channel_id: 0,
                        channel_name: ChannelName::new(),
                    });
                }
            }
        }
        for format in [SFormat::Rr, SFormat::Rnr, SFormat::Rej, SFormat::Srej].iter() {
            for nr in 0..8 {
                frames.push(Ax25Frame::control(
                    addrs(),
                    Control::S {
                        format: *format,
                        nr: sn(nr, m),
                        poll_final: nr % 2 == 0,
                    },
                ));
            }
        }
        for frame in &frames {
            let bytes = frame.encode(m);
            assert_eq!(&Ax25Frame::parse(&bytes, m).unwrap(), frame);
        }
    }

    #[test]
    fn roundtrip_mod128() {
        let m = Modulus::OneTwentyEight;
        for ns in [0u8, 1, 63, 127].iter() {
            for nr in [0u8, 42, 127].iter() {
                let frame = Ax25Frame {
                    addresses: addrs(),
                    control: Control::I {
                        ns: sn(*ns, m),
                        nr: sn(*nr, m),
                        poll: ns == nr,
                    },
                    pid: Some(PID_NO_L3),
                    payload: alloc::vec![0xAA],
                    channel_id: 0,
                    channel_name: ChannelName::new(),
                };
                let bytes = frame.encode(m);
                assert_eq!(Ax25Frame::parse(&bytes, m).unwrap(), frame);
            }
        }

        let rej = Ax25Frame::control(
            addrs(),
            Control::S {
                format: SFormat::Rej,
                nr: sn(100, m),
                poll_final: true,
            },
        );
        let bytes = rej.encode(m);
        // Two-octet control: 0b1001 in the first, N(R)/F in the second.
        assert_eq!(bytes[14], 0b1001);
        assert_eq!(bytes[15], (100 << 1) | 1);
        assert_eq!(Ax25Frame::parse(&bytes, m).unwrap(), rej);
    }

    #[test]
    fn ui_frame_carries_pid() {
        let frame = Ax25Frame::ui(addrs(), PID_NO_L3, b"hello".to_vec());
        let bytes = frame.encode(Modulus::Eight);
        assert_eq!(bytes[14], 0x03);
        assert_eq!(bytes[15], 0xF0);
        assert_eq!(&bytes[16..], b"hello");
        let back = Ax25Frame::parse(&bytes, Modulus::Eight).unwrap();
        assert_eq!(back.payload, b"hello");
        assert_eq!(back.pid, Some(PID_NO_L3));
    }

    #[test]
    fn garbage_control_rejected() {
        let mut bytes = Ax25Frame::control(
            addrs(),
            Control::U {
                format: UFormat::Ua,
                poll_final: false,
            },
        )
        .encode(Modulus::Eight);
        bytes[14] = 0b0110_0111; // U frame with unassigned modifier
        assert!(Ax25Frame::parse(&bytes, Modulus::Eight).is_err());
    }
}
