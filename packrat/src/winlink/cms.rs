//! CMS relay plumbing.
//!
//! When a relay target is configured, the station bridges a connected radio peer to an
//! internet-side Common Message Server instead of serving mail locally. The stack never opens the
//! socket itself; it asks the embedder to (via `WinlinkEvent::RelayConnectRequested`) and then
//! exchanges opaque byte chunks in both directions.
//!
//! The only protocol awareness the bridge needs is the B2F *binary-mode switch*: after an
//! `FS ...Y...` line, the stream carries compressed blocks that must not be scanned for command
//! lines until an `FF`/`FQ` line ends the batch. [`BinarySwitch`] tracks that, per direction.
//!
//! [`BinarySwitch`]: struct.BinarySwitch.html

use alloc::string::String;
use alloc::vec::Vec;

/// Where the internet-side gateway lives. Connection handling is the embedder's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmsRelayConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// What a scanned chunk revealed about the stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamMark {
    /// Nothing of note; keep forwarding.
    None,
    /// A quit line (`FQ`) passed by; the session is over once it is delivered.
    Quit,
}

/// Watches one direction of a bridged B2F conversation.
pub struct BinarySwitch {
    binary: bool,
    line: Vec<u8>,
}

impl BinarySwitch {
    pub fn new() -> Self {
        BinarySwitch {
            binary: false,
            line: Vec::new(),
        }
    }

    pub fn in_binary(&self) -> bool {
        self.binary
    }

    /// Scans a forwarded chunk, updating the text/binary state.
    pub fn observe(&mut self, data: &[u8]) -> StreamMark {
        let mut mark = StreamMark::None;
        for &b in data {
            if b == b'\r' || b == b'\n' {
                match self.line_ended() {
                    StreamMark::None => {}
                    m => mark = m,
                }
                self.line.clear();
            } else {
                // In binary mode only a short window is kept, enough to recognize the
                // batch-terminating command at a line start.
                if self.binary && self.line.len() >= 8 {
                    self.line.clear();
                }
                self.line.push(b);
            }
        }
        mark
    }

    fn line_ended(&mut self) -> StreamMark {
        let line = &self.line[..];
        if self.binary {
            if line == b"FF" || line.starts_with(b"FQ") {
                self.binary = false;
                if line.starts_with(b"FQ") {
                    return StreamMark::Quit;
                }
            }
            return StreamMark::None;
        }
        if line.starts_with(b"FS ") && line.iter().any(|&b| b == b'Y' || b == b'y' || b == b'+') {
            self.binary = true;
        } else if line.starts_with(b"FQ") {
            return StreamMark::Quit;
        }
        StreamMark::None
    }
}

impl Default for BinarySwitch {
    fn default() -> Self {
        Self::new()
    }
}
