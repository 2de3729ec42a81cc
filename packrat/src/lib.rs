//! An unattended packet-radio station stack.
//!
//! Packrat turns a GAIA-speaking handheld transceiver into a multi-service packet node: an APRS
//! reporter, a connected-mode AX.25 endpoint for BBS-style services, a Winlink B2F mail endpoint
//! (with an optional bridge towards an internet CMS gateway), and a YAPP file-transfer peer.
//!
//! # Using the stack
//!
//! Packrat is runtime and hardware-agnostic: it performs no I/O of its own and never blocks. The
//! embedder provides a few platform services, bundled in a [`Config`] implementation:
//!
//! * A microsecond-precision [`Timer`].
//! * A [`Transport`] that delivers whole packets to the radio's wireless link.
//! * A [`Store`] for the station's persisted records (mail, connection logs).
//! * An [`RngCore`] source for login challenges and message-IDs.
//!
//! Inbound bytes are pushed into [`radio::RadioController`], decoded frames are routed by
//! [`dispatcher::Dispatcher`], and timer-driven work (AX.25 T1/T2/T3, TNC retry) is performed by
//! calling `update_timers` whenever the `Instant` returned by `next_update` is reached. Components
//! report through typed event enums drained with `pop_event`, which keeps the whole stack
//! deterministic under test: drive it with hand-built `Instant`s and recorded frames.
//!
//! [`Config`]: config/trait.Config.html
//! [`Timer`]: time/trait.Timer.html
//! [`Transport`]: transport/trait.Transport.html
//! [`Store`]: store/trait.Store.html
//! [`RngCore`]: https://docs.rs/rand_core/0.5/rand_core/trait.RngCore.html

#![no_std]

extern crate alloc;

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod aprs;
pub mod ax25;
pub mod bytes;
pub mod config;
pub mod dispatcher;
mod error;
pub mod gaia;
pub mod radio;
pub mod store;
#[cfg(test)]
mod testutil;
pub mod time;
pub mod transport;
pub mod winlink;
pub mod yapp;

pub use self::error::Error;
