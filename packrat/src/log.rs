//! Internal logging shims.
//!
//! With the `log` cargo feature enabled these forward to the `log` crate. Without it they expand
//! to a discarded `format_args!`, so format strings and arguments stay type-checked either way.

#[cfg(feature = "log")]
macro_rules! error {
    ($($t:tt)*) => {{ log::error!($($t)*); }};
}
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($t:tt)*) => {{ let _ = format_args!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! warn {
    ($($t:tt)*) => {{ log::warn!($($t)*); }};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($t:tt)*) => {{ let _ = format_args!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! info {
    ($($t:tt)*) => {{ log::info!($($t)*); }};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($t:tt)*) => {{ let _ = format_args!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! debug {
    ($($t:tt)*) => {{ log::debug!($($t)*); }};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($t:tt)*) => {{ let _ = format_args!($($t)*); }};
}

#[cfg(feature = "log")]
macro_rules! trace {
    ($($t:tt)*) => {{ log::trace!($($t)*); }};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($t:tt)*) => {{ let _ = format_args!($($t)*); }};
}
