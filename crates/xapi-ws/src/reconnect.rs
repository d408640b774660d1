//! Reconnection policy for the socket wrapper
//!
//! The broker expects a dropped client to come back after a fixed pause:
//! by default the wrapper waits 3000 ms before every attempt and never gives
//! up. A jitter factor spreads the attempts of many clients restarting at
//! once.

use std::time::Duration;

/// Delay applied between an unexpected close and the next connect attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// Configuration for automatic reconnection
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Pause before each attempt
    pub delay: Duration,
    /// Random spread applied to `delay` (0.0 to 1.0)
    pub jitter: f64,
    /// Attempts allowed in a row without a successful open (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Unlimited attempts, `delay` apart
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            jitter: 0.0,
            max_attempts: None,
        }
    }

    /// Never reconnect
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Set the pause before each attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the jitter factor
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Cap consecutive attempts
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }

    /// Whether any reconnection will be attempted at all
    pub fn is_enabled(&self) -> bool {
        self.max_attempts != Some(0)
    }

    /// Whether another attempt may follow `failed` consecutive ones
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts.map_or(true, |max| failed < max)
    }

    /// Pause before the next attempt, jitter included
    pub fn next_delay(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.delay;
        }
        let spread = self.delay.as_secs_f64() * self.jitter;
        let offset = rand::random::<f64>() * 2.0 * spread - spread;
        Duration::from_secs_f64((self.delay.as_secs_f64() + offset).max(0.0))
    }
}
