//! Time APIs for obtaining the current time and calculating with points in time and durations.
//!
//! These APIs are made for the station stack and are not meant to be general-purpose. They have
//! microsecond resolution and use 32-bit arithmetic wherever possible, which is plenty for the
//! protocol timers involved (the longest, the AX.25 idle probe T3, is a few minutes).

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with microsecond resolution.
///
/// This can represent a maximum duration of about 1 hour. Overflows will result in a panic, but
/// shouldn't happen since no protocol timer in this stack comes close.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u32);

impl Duration {
    /// Creates a `Duration` from a number of microseconds.
    pub const fn from_micros(micros: u32) -> Self {
        Duration(micros)
    }

    /// Creates a `Duration` representing the given number of milliseconds.
    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis * 1_000)
    }

    /// Creates a `Duration` representing a number of seconds.
    pub const fn from_secs(secs: u16) -> Self {
        Duration(secs as u32 * 1_000_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub fn whole_secs(&self) -> u32 {
        self.0 / 1_000_000
    }

    /// Returns the number of whole milliseconds that fit in `self`.
    pub fn whole_millis(&self) -> u32 {
        self.0 / 1_000
    }

    /// Returns the number of microseconds represented by `self`.
    pub fn as_micros(&self) -> u32 {
        self.0
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            let (secs, subsec_micros) = (self.0 / 1_000_000, self.0 % 1_000_000);
            if subsec_micros == 0 {
                write!(f, "{}s", secs)
            } else {
                write!(f, "{}.{:06}s", secs, subsec_micros)
            }
        } else if self.0 >= 1000 {
            let (millis, submilli_micros) = (self.0 / 1000, self.0 % 1000);
            if submilli_micros == 0 {
                write!(f, "{}ms", millis)
            } else {
                write!(f, "{}.{:03}ms", millis, submilli_micros)
            }
        } else {
            write!(f, "{}µs", self.0)
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// This has microsecond resolution and may wrap around after >1 hour. Apart from the wraparound, it
/// is monotonic.
///
/// `Instant`s are obtained from an implementation of [`Timer`]. `Instant`s created from different
/// [`Timer`] instances (even when using the same implementation) are not compatible, and mixing
/// them in operations causes unspecified results. [`Duration`]s are independent of the [`Timer`]
/// implementation and thus can be mixed freely.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instant(u32);

impl Instant {
    /// The maximum time between two `Instant`s that can be handled by [`Instant::duration_since`].
    ///
    /// Set to half an hour, comfortably above the longest protocol interval in the stack (T3 plus
    /// its retry budget).
    pub const MAX_TIME_BETWEEN: Duration = Duration(1_000_000 * 60 * 30);

    /// Creates an `Instant` from raw microseconds since an arbitrary implementation-defined
    /// reference point.
    ///
    /// This should only be called from a [`Timer`] implementation, or from tests that play the
    /// role of one.
    pub fn from_raw_micros(micros: u32) -> Self {
        Instant(micros)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub fn raw_micros(&self) -> u32 {
        self.0
    }

    /// Returns whether `self` lies at or after `deadline`.
    ///
    /// Works across wraparound as long as the two instants are within
    /// [`Instant::MAX_TIME_BETWEEN`] of each other.
    pub fn has_reached(&self, deadline: Instant) -> bool {
        self.0.wrapping_sub(deadline.0) <= Self::MAX_TIME_BETWEEN.0
    }

    /// Calculates the duration of time that has passed between `earlier` and `self`.
    ///
    /// The maximum duration that can be calculated by this method is defined as
    /// [`Instant::MAX_TIME_BETWEEN`]. Calling this method when the `Instant`s are further apart is
    /// an error and may panic, as a safeguard against wraparound producing nonsense durations.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        let micros_passed = self.0.wrapping_sub(earlier.0);
        debug_assert!(
            micros_passed <= Self::MAX_TIME_BETWEEN.0,
            "{}µs between instants {} and {}",
            micros_passed,
            earlier,
            self
        );

        Duration(micros_passed)
    }
}

/// [`Instant`]s can be subtracted, which computes the [`Duration`] between the rhs and lhs using
/// [`Instant::duration_since`].
impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

/// A [`Duration`] can be added to an [`Instant`], moving the [`Instant`] forwards in time.
impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.wrapping_add(d.as_micros()))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

/// A [`Duration`] can be subtracted from an [`Instant`], moving the [`Instant`] backwards in time.
impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(self.0.wrapping_sub(d.as_micros()))
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Duration(self.0))
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// When a component wants to be polled again.
///
/// Components with internal deadlines (AX.25 sessions, the TNC queue) report the earliest one via
/// `next_update`; the embedder arranges a wakeup and calls `update_timers` with the current time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NextUpdate {
    /// Keep the previously configured wakeup time.
    Keep,

    /// No deadline pending; disable the wakeup.
    Disable,

    /// Wake up at the given `Instant`, or as soon after it as practical.
    At(Instant),
}

impl NextUpdate {
    /// Merges two wakeup requirements, keeping the earlier deadline.
    pub fn merge(self, other: NextUpdate) -> NextUpdate {
        match (self, other) {
            (NextUpdate::At(a), NextUpdate::At(b)) => {
                // Compare via wrapping distance from the earlier one.
                if b.0.wrapping_sub(a.0) <= Instant::MAX_TIME_BETWEEN.0 {
                    NextUpdate::At(a)
                } else {
                    NextUpdate::At(b)
                }
            }
            (NextUpdate::At(a), _) => NextUpdate::At(a),
            (_, NextUpdate::At(b)) => NextUpdate::At(b),
            (NextUpdate::Keep, other) | (other, NextUpdate::Keep) => other,
            (NextUpdate::Disable, NextUpdate::Disable) => NextUpdate::Disable,
        }
    }
}

/// Trait for time providers.
///
/// The platform has to provide an implementation of `Timer` to the stack. The implementation must
/// have microsecond accuracy.
///
/// This trait can also be implemented by a mock timer for testing.
pub trait Timer {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards in time, except when
    /// the underlying value wraps around.
    fn now(&self) -> Instant;
}
