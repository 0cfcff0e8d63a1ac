//! Logging shim over `tracing`.
//!
//! With the `tracing-integration` feature the macros below are the `tracing`
//! macros. Without it they expand to nothing, so library code can log
//! unconditionally and pay nothing when logging is compiled out.

#[cfg(feature = "tracing-integration")]
#[allow(unused_imports)]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    // Named apart from `warn` and friends, which would clash with the
    // built-in lint attributes when re-exported under their own names.
    macro_rules! discard_event {
        ($($arg:tt)*) => {{}};
    }

    pub(crate) use discard_event;
}

#[cfg(not(feature = "tracing-integration"))]
#[allow(unused_imports)]
pub(crate) use noop::{
    discard_event as debug, discard_event as error, discard_event as info,
    discard_event as trace, discard_event as warn,
};
