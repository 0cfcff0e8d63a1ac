//! Configuration and tuning profiles for the synchronization primitives.
//!
//! This module provides:
//! - Hierarchical configuration types
//! - Profiles with sensible defaults
//! - Validation for guardrail invariants
//! - Layered loading (file + env + overrides)
//!
//! Note: File parsing is intentionally minimal: `[section]` headers and
//! `key = value` lines.
//!
//! ```
//! use lockstep::config::{ConfigLoader, OrderPolicy, Profile};
//!
//! let config = ConfigLoader::new()
//!     .profile(Profile::Testing)
//!     .override_value("LOCKSTEP_ORDERING_POLICY", "detect")
//!     .load()
//!     .unwrap();
//! assert_eq!(config.ordering.policy, OrderPolicy::Detect);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "LOCKSTEP_";

/// Top-level configuration shared by all primitives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Spin-wait tuning for [`SpinLock`](crate::SpinLock).
    pub spin: SpinConfig,
    /// Retry backoff for all-or-nothing multi-lock acquisition.
    pub backoff: BackoffConfig,
    /// Blocking-wait tuning.
    pub wait: WaitConfig,
    /// Lock-ordering enforcement.
    pub ordering: OrderingConfig,
}

impl SyncConfig {
    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spin.spins_before_yield == 0 {
            return Err(ConfigError::InvalidSpinLimit);
        }

        if self.backoff.initial_delay.is_zero() || self.backoff.max_delay < self.backoff.initial_delay
        {
            return Err(ConfigError::InvalidBackoffWindow);
        }

        if !(self.backoff.multiplier >= 1.0 && self.backoff.multiplier.is_finite()) {
            return Err(ConfigError::InvalidMultiplier(self.backoff.multiplier));
        }

        if self.backoff.max_attempts == Some(0) {
            return Err(ConfigError::InvalidMaxAttempts);
        }

        if self.wait.cancel_poll_interval < Duration::from_millis(1) {
            return Err(ConfigError::PollIntervalTooShort);
        }

        Ok(())
    }
}

/// Spin-wait tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinConfig {
    /// Spin iterations (with growing `spin_loop` bursts) before the spinning
    /// thread starts yielding its time slice.
    pub spins_before_yield: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self {
            spins_before_yield: 64,
        }
    }
}

/// Exponential backoff between multi-lock acquisition attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Attempts before giving up with `Timeout`. `None` retries until success.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_micros(50),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Returns the delay to apply after `attempt` failures (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let factor = self.multiplier.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss)]
        let scaled = self.initial_delay.as_nanos() as f64 * factor;
        #[allow(clippy::cast_precision_loss)]
        let cap = self.max_delay.as_nanos() as f64;
        if !scaled.is_finite() || scaled >= cap {
            self.max_delay
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Duration::from_nanos(scaled as u64)
        }
    }
}

/// Blocking-wait tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Longest a cancellable waiter sleeps before re-checking its token.
    pub cancel_poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            cancel_poll_interval: Duration::from_millis(5),
        }
    }
}

/// Lock-ordering enforcement settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingConfig {
    /// What to do when a lock is requested out of rank order.
    pub policy: OrderPolicy,
}

/// Reaction to an out-of-order lock request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderPolicy {
    /// Reject the request with `LockOrderViolation` before any wait occurs.
    #[default]
    Enforce,
    /// Log the violation, allow the request, and track the wait-for graph so
    /// real deadlocks can be reported.
    Detect,
}

/// Predefined tuning profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Profile {
    /// Library defaults.
    #[default]
    Default,
    /// Short backoff and polling for fast, deterministic-ish tests.
    Testing,
    /// Minimal waits; spin longer before yielding.
    LowLatency,
    /// Yield early and back off further under heavy contention.
    HighContention,
}

impl Profile {
    /// Builds the configuration for this profile.
    #[must_use]
    pub fn to_config(self) -> SyncConfig {
        match self {
            Self::Default => SyncConfig::default(),
            Self::Testing => SyncConfig {
                backoff: BackoffConfig {
                    initial_delay: Duration::from_micros(10),
                    max_delay: Duration::from_millis(1),
                    multiplier: 2.0,
                    max_attempts: Some(10_000),
                },
                wait: WaitConfig {
                    cancel_poll_interval: Duration::from_millis(1),
                },
                ..SyncConfig::default()
            },
            Self::LowLatency => SyncConfig {
                spin: SpinConfig {
                    spins_before_yield: 1024,
                },
                backoff: BackoffConfig {
                    initial_delay: Duration::from_micros(5),
                    max_delay: Duration::from_micros(500),
                    multiplier: 1.5,
                    max_attempts: None,
                },
                wait: WaitConfig {
                    cancel_poll_interval: Duration::from_millis(1),
                },
                ..SyncConfig::default()
            },
            Self::HighContention => SyncConfig {
                spin: SpinConfig {
                    spins_before_yield: 16,
                },
                backoff: BackoffConfig {
                    initial_delay: Duration::from_micros(200),
                    max_delay: Duration::from_millis(50),
                    multiplier: 2.0,
                    max_attempts: None,
                },
                ..SyncConfig::default()
            },
        }
    }
}

/// Configuration loader with layered sources.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    profile: Profile,
    file_path: Option<PathBuf>,
    overrides: BTreeMap<String, String>,
}

impl ConfigLoader {
    /// Creates a new loader with the default profile.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base profile.
    #[must_use]
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Sets a file path for config loading.
    #[must_use]
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Adds a programmatic override (highest precedence).
    ///
    /// Keys use the environment variable spelling, e.g.
    /// `LOCKSTEP_SPIN_SPINS_BEFORE_YIELD`.
    #[must_use]
    pub fn override_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Loads configuration with precedence:
    /// 1. Profile defaults (lowest)
    /// 2. File config
    /// 3. Environment variables
    /// 4. Programmatic overrides (highest)
    pub fn load(&self) -> Result<SyncConfig, ConfigError> {
        let mut config = if let Some(path) = &self.file_path {
            load_from_file(path, self.profile)?
        } else {
            self.profile.to_config()
        };

        apply_env_overrides(&mut config)?;
        apply_overrides(&mut config, &self.overrides)?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading configuration.
    #[error("config I/O error: {0}")]
    Io(String),
    /// Malformed line in a configuration file.
    #[error("config line {line}: {reason}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the line.
        reason: String,
    },
    /// A known setting given a value it cannot take.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Setting path, `section.key`.
        key: String,
        /// The rejected value as written.
        value: String,
    },
    /// `spins_before_yield` was zero.
    #[error("spins_before_yield must be > 0")]
    InvalidSpinLimit,
    /// Backoff delays were zero or inverted.
    #[error("backoff delays must satisfy 0 < initial_delay <= max_delay")]
    InvalidBackoffWindow,
    /// Backoff multiplier below 1 or not finite.
    #[error("backoff multiplier out of range: {0}")]
    InvalidMultiplier(f64),
    /// `max_attempts` was zero.
    #[error("max_attempts must be > 0 when set")]
    InvalidMaxAttempts,
    /// Cancellation polling interval below 1 ms.
    #[error("cancel_poll_interval must be >= 1ms")]
    PollIntervalTooShort,
    /// Override or environment key naming no setting.
    #[error("invalid override: {0}")]
    InvalidOverride(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

fn load_from_file(path: &Path, profile: Profile) -> Result<SyncConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents, profile.to_config())
}

fn apply_env_overrides(config: &mut SyncConfig) -> Result<(), ConfigError> {
    let overrides: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with(ENV_PREFIX))
        .collect();
    apply_overrides(config, &overrides)
}

fn apply_overrides(
    config: &mut SyncConfig,
    overrides: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    for (name, value) in overrides {
        let setting = Setting::from_env_name(name)
            .ok_or_else(|| ConfigError::InvalidOverride(name.clone()))?;
        setting.apply(config, value)?;
    }
    Ok(())
}

/// A tunable field, addressed as `key` under `[section]` in a file and as
/// `LOCKSTEP_<SECTION>_<KEY>` in the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setting {
    SpinsBeforeYield,
    BackoffInitialDelay,
    BackoffMaxDelay,
    BackoffMultiplier,
    BackoffMaxAttempts,
    CancelPollInterval,
    OrderingPolicy,
}

impl Setting {
    const ALL: [Self; 7] = [
        Self::SpinsBeforeYield,
        Self::BackoffInitialDelay,
        Self::BackoffMaxDelay,
        Self::BackoffMultiplier,
        Self::BackoffMaxAttempts,
        Self::CancelPollInterval,
        Self::OrderingPolicy,
    ];

    const fn path(self) -> (&'static str, &'static str) {
        match self {
            Self::SpinsBeforeYield => ("spin", "spins_before_yield"),
            Self::BackoffInitialDelay => ("backoff", "initial_delay_us"),
            Self::BackoffMaxDelay => ("backoff", "max_delay_us"),
            Self::BackoffMultiplier => ("backoff", "multiplier"),
            Self::BackoffMaxAttempts => ("backoff", "max_attempts"),
            Self::CancelPollInterval => ("wait", "cancel_poll_interval_ms"),
            Self::OrderingPolicy => ("ordering", "policy"),
        }
    }

    fn from_path(section: &str, key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|setting| setting.path() == (section, key))
    }

    fn from_env_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(ENV_PREFIX)?;
        Self::ALL.into_iter().find(|setting| {
            let (section, key) = setting.path();
            rest.split_at_checked(section.len())
                .filter(|(head, _)| head.eq_ignore_ascii_case(section))
                .and_then(|(_, tail)| tail.strip_prefix('_'))
                .is_some_and(|tail| tail.eq_ignore_ascii_case(key))
        })
    }

    fn apply(self, config: &mut SyncConfig, raw: &str) -> Result<(), ConfigError> {
        let value = raw.trim().trim_matches('"');
        let invalid = || {
            let (section, key) = self.path();
            ConfigError::InvalidValue {
                key: format!("{section}.{key}"),
                value: value.to_string(),
            }
        };
        let micros = || value.parse().map(Duration::from_micros).map_err(|_| invalid());
        match self {
            Self::SpinsBeforeYield => {
                config.spin.spins_before_yield = value.parse().map_err(|_| invalid())?;
            }
            Self::BackoffInitialDelay => config.backoff.initial_delay = micros()?,
            Self::BackoffMaxDelay => config.backoff.max_delay = micros()?,
            Self::BackoffMultiplier => {
                config.backoff.multiplier = value.parse().map_err(|_| invalid())?;
            }
            Self::BackoffMaxAttempts => {
                config.backoff.max_attempts = if ["", "none", "unbounded"]
                    .iter()
                    .any(|word| value.eq_ignore_ascii_case(word))
                {
                    None
                } else {
                    Some(value.parse().map_err(|_| invalid())?)
                };
            }
            Self::CancelPollInterval => {
                config.wait.cancel_poll_interval =
                    value.parse().map(Duration::from_millis).map_err(|_| invalid())?;
            }
            Self::OrderingPolicy => {
                config.ordering.policy = if value.eq_ignore_ascii_case("enforce") {
                    OrderPolicy::Enforce
                } else if value.eq_ignore_ascii_case("detect") {
                    OrderPolicy::Detect
                } else {
                    return Err(invalid());
                };
            }
        }
        Ok(())
    }
}

/// Applies a `[section]` / `key = value` file on top of `base`.
///
/// Blank lines and lines starting with `#` or `//` are skipped.
fn parse_config(contents: &str, base: SyncConfig) -> Result<SyncConfig, ConfigError> {
    let mut config = base;
    let mut section: Option<String> = None;

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        let parse_error = |reason: String| ConfigError::Parse {
            line: index + 1,
            reason,
        };
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            section = Some(header.trim().to_ascii_lowercase());
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(format!("expected `key = value`, found `{line}`")));
        };
        let key = key.trim();
        let Some(section) = section.as_deref() else {
            return Err(parse_error(format!("`{key}` appears before any [section]")));
        };
        let setting = Setting::from_path(section, key).ok_or_else(|| {
            if Setting::ALL.iter().any(|setting| setting.path().0 == section) {
                parse_error(format!("unknown key `{section}.{key}`"))
            } else {
                parse_error(format!("unknown section [{section}]"))
            }
        })?;
        setting.apply(&mut config, value)?;
    }

    Ok(config)
}
