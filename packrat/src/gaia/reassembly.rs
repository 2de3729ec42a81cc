//! TNC fragment (de)fragmentation for `DATA_RXD` and `HT_SEND_DATA`.
//!
//! The radio moves AX.25 frames over the link in fragments small enough for its packet size:
//!
//! ```notrust
//! +-----------------------------------------------+---------+------------------+
//! | final | with_channel_id | fragment_id(6 bits) | payload | [channel_id: u8] |
//! +-----------------------------------------------+---------+------------------+
//! ```
//!
//! A frame begins only at `fragment_id == 0` and fragments must arrive contiguously in order; any
//! out-of-sequence fragment restarts accumulation (keeping the new fragment only if it is another
//! frame start). The fragment with `final` set completes the frame.

use crate::bytes::*;
use crate::gaia::status::ChannelName;
use crate::Error;
use alloc::vec::Vec;

const FINAL_FLAG: u8 = 0x80;
const WITH_CHANNEL_FLAG: u8 = 0x40;
const FRAGMENT_ID_MASK: u8 = 0x3F;

/// Payload bytes per outbound fragment.
///
/// Conservative bound below the link packet size, leaving room for envelope and flags.
pub const FRAGMENT_MTU: usize = 50;

/// One TNC fragment, as carried in a `DATA_RXD` payload or an `HT_SEND_DATA` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TncFragment<'a> {
    pub is_final: bool,
    pub fragment_id: u8,
    pub payload: &'a [u8],
    pub channel_id: Option<u8>,
}

impl<'a> FromBytes<'a> for TncFragment<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let flags = bytes.read_u8()?;
        let with_channel = flags & WITH_CHANNEL_FLAG != 0;
        let rest = bytes.read_rest();
        let (payload, channel_id) = if with_channel {
            let (last, payload) = rest.split_last().ok_or(Error::Eof)?;
            (payload, Some(*last))
        } else {
            (rest, None)
        };
        Ok(TncFragment {
            is_final: flags & FINAL_FLAG != 0,
            fragment_id: flags & FRAGMENT_ID_MASK,
            payload,
            channel_id,
        })
    }
}

impl<'a> ToBytes for TncFragment<'a> {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let mut flags = self.fragment_id & FRAGMENT_ID_MASK;
        if self.is_final {
            flags |= FINAL_FLAG;
        }
        if self.channel_id.is_some() {
            flags |= WITH_CHANNEL_FLAG;
        }
        writer.write_u8(flags)?;
        writer.write_slice(self.payload)?;
        if let Some(ch) = self.channel_id {
            writer.write_u8(ch)?;
        }
        Ok(())
    }
}

/// Splits an outbound AX.25 frame into `HT_SEND_DATA` fragment payloads.
pub fn fragment(channel_id: u8, data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let chunks: Vec<&[u8]> = if data.is_empty() {
        alloc::vec![&data[..]]
    } else {
        data.chunks(FRAGMENT_MTU).collect()
    };
    let last = chunks.len() - 1;
    for (i, chunk) in chunks.iter().enumerate() {
        let frag = TncFragment {
            is_final: i == last,
            fragment_id: i as u8,
            payload: chunk,
            channel_id: Some(channel_id),
        };
        out.push(encode_to_vec(&frag, chunk.len() + 2).unwrap());
    }
    out
}

/// One fully reassembled over-the-air frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueDataFrame {
    pub channel_id: u8,
    /// Name of the VFO channel the frame arrived on, when known.
    pub channel_name: ChannelName,
    pub data: Vec<u8>,
}

/// Accumulates `DATA_RXD` fragments into whole frames.
pub struct Reassembler {
    buffer: Vec<u8>,
    next_id: Option<u8>,
    channel_id: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            buffer: Vec::new(),
            next_id: None,
            channel_id: None,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.next_id = None;
        self.channel_id = None;
    }

    /// Feeds one fragment; returns a completed frame when `final` closes one.
    ///
    /// The frame's `channel_name` is left empty here; the radio controller fills it in from its
    /// channel table.
    pub fn push(&mut self, frag: &TncFragment<'_>) -> Option<UniqueDataFrame> {
        match self.next_id {
            _ if frag.fragment_id == 0 => {
                // Frame start, unconditionally. An in-progress accumulation is abandoned.
                if self.next_id.unwrap_or(0) != 0 {
                    debug!("tnc reassembly restarted by new frame start");
                }
                self.reset();
            }
            Some(expect) if expect == frag.fragment_id => {}
            _ => {
                // Out of sequence and not a start: drop accumulation and the fragment.
                debug!("tnc fragment {} out of sequence", frag.fragment_id);
                self.reset();
                return None;
            }
        }

        self.buffer.extend_from_slice(frag.payload);
        self.next_id = Some(frag.fragment_id.wrapping_add(1) & FRAGMENT_ID_MASK);
        if frag.channel_id.is_some() {
            self.channel_id = frag.channel_id;
        }

        if frag.is_final {
            let frame = UniqueDataFrame {
                channel_id: self.channel_id.unwrap_or(0),
                channel_name: ChannelName::new(),
                data: core::mem::replace(&mut self.buffer, Vec::new()),
            };
            self.reset();
            Some(frame)
        } else {
            None
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
