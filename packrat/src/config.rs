//! Stack configuration trait.

use crate::{store::Store, time::Timer, transport::Transport};
use rand_core::RngCore;

// TODO: Use associated type defaults in the trait once stable

/// Trait for station stack configurations.
///
/// This trait bundles the platform capabilities used throughout the stack. Every application
/// defines one type implementing it and supplies that type to the generic components
/// ([`RadioController`], [`Dispatcher`]).
///
/// [`RadioController`]: ../radio/struct.RadioController.html
/// [`Dispatcher`]: ../dispatcher/struct.Dispatcher.html
pub trait Config {
    /// A time source with microsecond resolution.
    type Timer: Timer;

    /// The packet writer towards the radio's wireless link.
    type Transport: Transport;

    /// Persistence for the station's logical tables.
    type Store: Store;

    /// Randomness for login challenges and message-IDs.
    type Rng: RngCore;
}
