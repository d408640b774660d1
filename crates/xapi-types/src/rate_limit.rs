//! Client-side rate limiting for the xAPI
//!
//! The broker tolerates at most a handful of frames per second per
//! connection and drops links that exceed it. Each connection keeps a
//! [`CapacityWindow`] of recent send timestamps; a send is admitted only when
//! the `sends_per_window`-th newest entry is at least `window` old.

use crate::error::{XapiError, XapiResult};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Server-imposed limits, all configurable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportLimits {
    /// Maximum serialized frame size in bytes
    pub max_payload_bytes: usize,
    /// Sends allowed per window
    pub sends_per_window: usize,
    /// Saturation window
    pub window: Duration,
    /// Window entries kept per connection
    pub retained_entries: usize,
    /// Age (from creation) at which a queued send is rejected
    pub queue_timeout: Duration,
    /// Delay between consecutive drained sends
    pub drain_spacing: Duration,
    /// Horizon for the routing load score
    pub load_horizon: Duration,
    /// Keepalive ping period
    pub keepalive_interval: Duration,
}

impl Default for TransportLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1000,
            sends_per_window: 5,
            window: Duration::from_millis(1000),
            retained_entries: 20,
            queue_timeout: Duration::from_millis(9000),
            drain_spacing: Duration::from_millis(250),
            load_horizon: Duration::from_millis(1500),
            keepalive_interval: Duration::from_millis(14_500),
        }
    }
}

impl TransportLimits {
    /// Set the payload cap
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Set the number of sends per window and the window length
    pub fn with_window(mut self, sends: usize, window: Duration) -> Self {
        self.sends_per_window = sends.max(1);
        self.retained_entries = self.retained_entries.max(self.sends_per_window);
        self.window = window;
        self
    }

    /// Set the queue ceiling
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Set the spacing between drained sends
    pub fn with_drain_spacing(mut self, spacing: Duration) -> Self {
        self.drain_spacing = spacing;
        self
    }

    /// Set the load-score horizon
    pub fn with_load_horizon(mut self, horizon: Duration) -> Self {
        self.load_horizon = horizon;
        self
    }

    /// Set the keepalive period
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Reject frames over the payload cap
    pub fn check_payload(&self, frame: &str) -> XapiResult<()> {
        if frame.len() > self.max_payload_bytes {
            return Err(XapiError::PayloadTooLarge {
                size: frame.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }
}

/// Recent send timestamps for one connection, newest first
#[derive(Debug, Clone)]
pub struct CapacityWindow {
    entries: VecDeque<Instant>,
    limits: TransportLimits,
}

impl CapacityWindow {
    /// Create an empty window
    pub fn new(limits: TransportLimits) -> Self {
        Self {
            entries: VecDeque::with_capacity(limits.retained_entries),
            limits,
        }
    }

    /// Record a transmission
    pub fn record(&mut self, at: Instant) {
        self.entries.push_front(at);
        self.entries.truncate(self.limits.retained_entries);
    }

    /// Time until the window admits another send, or `None` if it does now
    pub fn saturation_wait(&self, now: Instant) -> Option<Duration> {
        let oldest = self.entries.get(self.limits.sends_per_window - 1)?;
        let elapsed = now.saturating_duration_since(*oldest);
        (elapsed < self.limits.window).then(|| self.limits.window - elapsed)
    }

    /// Whether a send right now would be queued
    pub fn is_saturated(&self, now: Instant) -> bool {
        self.saturation_wait(now).is_some()
    }

    /// Routing score in milliseconds-ish units; lower is less loaded
    ///
    /// Counts entries younger than the load horizon. Once a full window's
    /// worth of recent entries exists, adds how far the oldest of them is from
    /// leaving the horizon, so nearly free connections rank ahead of
    /// saturated ones.
    pub fn load_score(&self, now: Instant) -> u64 {
        let horizon = self.limits.load_horizon;
        let recent = self
            .entries
            .iter()
            .take_while(|at| now.saturating_duration_since(**at) < horizon)
            .count();

        let mut score = recent as u64;
        if recent >= self.limits.sends_per_window {
            if let Some(at) = self.entries.get(self.limits.sends_per_window - 1) {
                let age = now.saturating_duration_since(*at);
                score += horizon.saturating_sub(age).as_millis() as u64;
            }
        }
        score
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been sent yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_saturates_after_five() {
        let mut window = CapacityWindow::new(TransportLimits::default());
        let start = Instant::now();

        for i in 0..5 {
            assert!(!window.is_saturated(start + Duration::from_millis(i * 10)));
            window.record(start + Duration::from_millis(i * 10));
        }

        // The 5th-newest entry is the first one, sent at `start`
        let now = start + Duration::from_millis(100);
        assert_eq!(window.saturation_wait(now), Some(Duration::from_millis(900)));
        assert!(!window.is_saturated(start + Duration::from_millis(1000)));
    }

    #[test]
    fn test_window_retains_twenty() {
        let mut window = CapacityWindow::new(TransportLimits::default());
        let start = Instant::now();
        for i in 0..30 {
            window.record(start + Duration::from_secs(i));
        }
        assert_eq!(window.len(), 20);
    }

    #[test]
    fn test_load_score() {
        let limits = TransportLimits::default();
        let start = Instant::now();

        let idle = CapacityWindow::new(limits);
        assert_eq!(idle.load_score(start), 0);

        let mut light = CapacityWindow::new(limits);
        light.record(start);
        light.record(start);
        assert_eq!(light.load_score(start + Duration::from_millis(100)), 2);

        let mut busy = CapacityWindow::new(limits);
        for _ in 0..5 {
            busy.record(start);
        }
        // 5 recent entries plus (1500 - 100)
        assert_eq!(busy.load_score(start + Duration::from_millis(100)), 1405);
        // Everything outside the horizon
        assert_eq!(busy.load_score(start + Duration::from_millis(1500)), 0);
    }

    #[test]
    fn test_payload_cap() {
        let limits = TransportLimits::default();
        assert!(limits.check_payload(&"x".repeat(1000)).is_ok());

        let err = limits.check_payload(&"x".repeat(1001)).unwrap_err();
        assert_eq!(
            err,
            XapiError::PayloadTooLarge {
                size: 1001,
                limit: 1000
            }
        );
    }

    #[test]
    fn test_limits_builder() {
        let limits = TransportLimits::default()
            .with_window(2, Duration::from_millis(500))
            .with_queue_timeout(Duration::from_secs(2));
        assert_eq!(limits.sends_per_window, 2);
        assert_eq!(limits.window, Duration::from_millis(500));
        assert_eq!(limits.queue_timeout, Duration::from_secs(2));
        assert_eq!(limits.keepalive_interval, Duration::from_millis(14_500));
    }
}
