// Reconnect backoff: capped exponential delays with jitter
//
// The sequence only knows how to grow and how to start over. Deciding when a
// session was healthy enough to forgive earlier failures belongs to the
// controller (see ReconnectPolicy::stable_period).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackoffError {
    #[error("Invalid backoff configuration: {0}")]
    InvalidConfig(String),
}

/// Multiplicative jitter applied to each nominal delay
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterRange {
    pub min_factor: f64,
    pub max_factor: f64,
}

impl JitterRange {
    /// No jitter: every delay is its nominal value
    pub const NONE: JitterRange = JitterRange {
        min_factor: 1.0,
        max_factor: 1.0,
    };
}

impl Default for JitterRange {
    fn default() -> Self {
        Self {
            min_factor: 0.85,
            max_factor: 1.15,
        }
    }
}

/// Backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay, and the delay after a reset
    pub initial: Duration,
    /// Upper bound for every returned delay
    pub cap: Duration,
    /// Random factor range applied before returning a delay
    pub jitter: JitterRange,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            cap: Duration::from_secs(15),
            jitter: JitterRange::default(),
        }
    }
}

impl BackoffConfig {
    /// Create a config with the default jitter range
    pub fn new(initial: Duration, cap: Duration) -> Result<Self, BackoffError> {
        let config = Self {
            initial,
            cap,
            jitter: JitterRange::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the jitter range
    pub fn with_jitter(mut self, jitter: JitterRange) -> Result<Self, BackoffError> {
        self.jitter = jitter;
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackoffError> {
        if self.cap < self.initial {
            return Err(BackoffError::InvalidConfig(
                "cap must be >= initial delay".to_string(),
            ));
        }
        let JitterRange {
            min_factor,
            max_factor,
        } = self.jitter;
        if !min_factor.is_finite() || !max_factor.is_finite() {
            return Err(BackoffError::InvalidConfig(
                "jitter factors must be finite".to_string(),
            ));
        }
        if min_factor < 0.0 || min_factor > max_factor {
            return Err(BackoffError::InvalidConfig(
                "jitter range must satisfy 0 <= min <= max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generator of successive reconnect delays
#[derive(Debug)]
pub struct BackoffSequence {
    config: BackoffConfig,
    current: Duration,
    rng: StdRng,
}

impl BackoffSequence {
    /// Create a sequence seeded from the OS
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffError> {
        config.validate()?;
        Ok(Self {
            current: config.initial,
            config,
            rng: StdRng::from_entropy(),
        })
    }

    /// Create a sequence with reproducible jitter
    pub fn with_seed(config: BackoffConfig, seed: u64) -> Result<Self, BackoffError> {
        config.validate()?;
        Ok(Self {
            current: config.initial,
            config,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Create a sequence that returns nominal delays only
    pub fn without_jitter(initial: Duration, cap: Duration) -> Result<Self, BackoffError> {
        let config = BackoffConfig::new(initial, cap)?.with_jitter(JitterRange::NONE)?;
        Self::new(config)
    }

    /// Next delay to wait. Grows the internal delay (doubling, capped).
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = self.current.saturating_mul(2).min(self.config.cap);

        let JitterRange {
            min_factor,
            max_factor,
        } = self.config.jitter;
        if min_factor == max_factor {
            if min_factor == 1.0 {
                return nominal;
            }
            return scaled(nominal, min_factor, self.config.cap);
        }
        let factor = self.rng.gen_range(min_factor..=max_factor);
        scaled(nominal, factor, self.config.cap)
    }

    /// The nominal (un-jittered) value the next call will be based on
    pub fn peek_nominal(&self) -> Duration {
        self.current
    }

    /// Start over from the initial delay
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }

    /// The configuration in use
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

/// `nominal * factor`, clamped to `cap` instead of overflowing
fn scaled(nominal: Duration, factor: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(nominal.as_secs_f64() * factor)
        .unwrap_or(cap)
        .min(cap)
}
