use core::fmt;

/// Errors returned by the station stack.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// Returned when an encoder tries to fit too much data into a fixed-size buffer, and when a
    /// decoder runs out of input prematurely.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,

    /// The wireless link to the radio is gone.
    ///
    /// All AX.25 sessions transition to `Disconnected` when this is reported.
    TransportClosed,

    /// An AX.25 retry budget (N2) was exhausted without a response from the peer.
    LinkTimeout,

    /// The peer answered a connection attempt with DM.
    PeerRefused,

    /// The peer reported RNR; I-frame transmission is suspended.
    PeerBusy,

    /// The radio's TNC is momentarily unable to accept a packet (`INCORRECT_STATE`).
    ///
    /// The packet is retained and retried on the next status change.
    RadioBusy,

    /// The radio rejected a packet for a non-transient reason; the packet was dropped.
    RadioRejected,

    /// A block checksum did not add up.
    ChecksumFailed,

    /// A CRC over a compressed payload did not match.
    CrcFailed,

    /// A secure-login response did not match the issued challenge.
    AuthFailed,

    /// The operation requires an established connection.
    NotConnected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
            Error::TransportClosed => "transport closed",
            Error::LinkTimeout => "no response from peer (N2 exhausted)",
            Error::PeerRefused => "connection refused by peer",
            Error::PeerBusy => "peer receiver busy",
            Error::RadioBusy => "radio TNC busy",
            Error::RadioRejected => "packet rejected by radio",
            Error::ChecksumFailed => "checksum mismatch",
            Error::CrcFailed => "CRC mismatch",
            Error::AuthFailed => "authentication failure",
            Error::NotConnected => "not connected",
        })
    }
}
