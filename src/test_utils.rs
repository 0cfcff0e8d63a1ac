//! Test logging helpers shared by unit and integration tests.
//!
//! - [`init_test_logging`] installs a `tracing-subscriber` fmt subscriber that
//!   writes through the test harness, once per process. The level comes from
//!   the `TEST_LOG_LEVEL` environment variable (default `info`).
//! - [`test_phase!`](crate::test_phase), [`test_section!`](crate::test_section)
//!   and [`test_complete!`](crate::test_complete) mark test progress.
//! - [`assert_with_log!`](crate::assert_with_log) logs expected and actual
//!   values before asserting.
//!
//! Without the `tracing-integration` feature the subscriber is not installed
//! and the progress markers log nothing, but assertions behave the same.
//!
//! ```
//! use lockstep::test_utils::init_test_logging;
//!
//! init_test_logging();
//! lockstep::test_phase!("doc_example");
//! let value = 2 + 2;
//! lockstep::assert_with_log!(value == 4, "arithmetic", 4, value);
//! lockstep::test_complete!("doc_example", value = value);
//! ```

use std::sync::Once;

use crate::tracing_compat::{error, info, warn};

/// Environment variable selecting the test log level.
pub const TEST_LOG_LEVEL_ENV: &str = "TEST_LOG_LEVEL";

/// Logging verbosity for tests, least verbose first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TestLogLevel {
    /// Only errors and failures.
    Error,
    /// Order violations and other warnings.
    Warn,
    /// Test progress.
    #[default]
    Info,
    /// Retry and backoff decisions.
    Debug,
    /// Everything.
    Trace,
}

/// Spellings accepted in `TEST_LOG_LEVEL`, indexed by discriminant.
const LEVEL_NAMES: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// A `TEST_LOG_LEVEL` value that names no level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown test log level `{0}`")]
pub struct UnknownLogLevel(pub String);

impl TestLogLevel {
    const ALL: [Self; 5] = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

    #[cfg(feature = "tracing-integration")]
    const fn as_tracing(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

impl std::fmt::Display for TestLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(LEVEL_NAMES[*self as usize])
    }
}

impl std::str::FromStr for TestLogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        if wanted.eq_ignore_ascii_case("warning") {
            return Ok(Self::Warn);
        }
        Self::ALL
            .into_iter()
            .find(|level| LEVEL_NAMES[*level as usize].eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownLogLevel(s.to_owned()))
    }
}

/// Installs the test subscriber. Safe to call from every test.
///
/// An unset `TEST_LOG_LEVEL` means the default level. An unparsable one also
/// falls back to the default, and is reported once the subscriber is up.
#[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let requested = std::env::var(TEST_LOG_LEVEL_ENV)
            .ok()
            .map_or(Ok(TestLogLevel::default()), |value| value.parse());
        #[cfg(feature = "tracing-integration")]
        {
            let level = requested.clone().unwrap_or_default();
            let _ = tracing_subscriber::fmt()
                .with_max_level(level.as_tracing())
                .with_test_writer()
                .try_init();
        }
        if let Err(err) = requested {
            warn!(error = %err, "ignoring {TEST_LOG_LEVEL_ENV}");
        }
    });
}

#[doc(hidden)]
#[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
pub fn log_phase(name: &str) {
    info!(test = name, "=== TEST START ===");
}

#[doc(hidden)]
#[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
pub fn log_section(name: &str) {
    info!(section = name, "--- section ---");
}

#[doc(hidden)]
#[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
pub fn log_complete(name: &str, fields: &[(&str, String)]) {
    info!(test = name, fields = ?fields, "=== TEST COMPLETE ===");
}

#[doc(hidden)]
#[cfg_attr(not(feature = "tracing-integration"), allow(unused_variables))]
pub fn log_assertion_failure(message: &str, expected: &str, actual: &str) {
    error!(assertion = message, expected, actual, "assertion failed");
}

/// Marks the start of a test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        $crate::test_utils::log_phase($name)
    };
}

/// Marks a named section within a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        $crate::test_utils::log_section($name)
    };
}

/// Marks the successful end of a test, with optional `key = value` results.
#[macro_export]
macro_rules! test_complete {
    ($name:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::test_utils::log_complete(
            $name,
            &[$((stringify!($key), format!("{:?}", $value))),*],
        )
    };
}

/// Asserts `cond`, logging the expected and actual values when it fails.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            $crate::test_utils::log_assertion_failure(
                $msg,
                &format!("{:?}", $expected),
                &format!("{:?}", $actual),
            );
            panic!("{}: expected {:?}, got {:?}", $msg, $expected, $actual);
        }
    };
}
