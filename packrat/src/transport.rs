//! The wireless-link transport interface.
//!
//! The stack does not open or own the short-range link to the radio; the platform does. What the
//! stack needs is narrow: a way to hand a whole link packet to the wire, and a way to be told
//! about inbound packets and link loss. The latter two are ordinary method calls on
//! [`RadioController`] (`process_packet`, `link_closed`), so only the outbound half is a trait.
//!
//! The transport must deliver packets in order and without interpretation. Loss is surfaced only
//! as link closure; within an open link, delivery is assumed reliable.
//!
//! [`RadioController`]: ../radio/struct.RadioController.html

use crate::Error;

/// A writer for whole packets towards the radio.
///
/// Exactly one component writes to the transport: the [`RadioController`]. Everything else
/// (sessions, APRS, file transfer) funnels through its TNC queue.
///
/// [`RadioController`]: ../radio/struct.RadioController.html
pub trait Transport {
    /// Queues one whole packet for transmission on the link.
    ///
    /// Implementations may buffer internally but must preserve packet boundaries and order.
    /// Returns [`Error::TransportClosed`] once the link is gone.
    ///
    /// [`Error::TransportClosed`]: ../enum.Error.html
    fn write_packet(&mut self, packet: &[u8]) -> Result<(), Error>;
}

/// A `Transport` that records written packets, for tests and dry runs.
pub struct RecordingTransport {
    written: alloc::vec::Vec<alloc::vec::Vec<u8>>,
    closed: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        RecordingTransport {
            written: alloc::vec::Vec::new(),
            closed: false,
        }
    }

    /// Marks the link as closed; subsequent writes fail.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Takes all packets written so far.
    pub fn take_written(&mut self) -> alloc::vec::Vec<alloc::vec::Vec<u8>> {
        core::mem::replace(&mut self.written, alloc::vec::Vec::new())
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn write_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::TransportClosed);
        }
        self.written.push(packet.to_vec());
        Ok(())
    }
}
