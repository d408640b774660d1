//! Identifier generation
//!
//! Connection and transaction ids come from an injectable [`IdGenerator`] so
//! tests can use predictable values.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Source of unique identifiers
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Produce the next id
    fn next(&self) -> String;
}

/// Wall-clock milliseconds followed by a 4-digit counter
///
/// The counter wraps back to 0 after 1000, so ids stay unique as long as
/// fewer than ~1000 are generated within the same millisecond.
#[derive(Debug, Default)]
pub struct TimestampIdGenerator {
    counter: AtomicU32,
}

/// Counter value after which the suffix wraps
const COUNTER_WRAP: u32 = 1000;

impl TimestampIdGenerator {
    /// Create a generator with the counter at zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for TimestampIdGenerator {
    fn next(&self) -> String {
        let counter = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some(if c >= COUNTER_WRAP { 0 } else { c + 1 })
            })
            .unwrap_or_default();
        format!("{}{:04}", chrono::Utc::now().timestamp_millis(), counter)
    }
}

/// `prefix1`, `prefix2`, ... for deterministic tests
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    /// Create a generator whose first id is `{prefix}1`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_timestamp_ids_unique() {
        let ids = TimestampIdGenerator::new();
        let generated: HashSet<String> = (0..500).map(|_| ids.next()).collect();
        assert_eq!(generated.len(), 500);
    }

    #[test]
    fn test_timestamp_counter_wraps() {
        let ids = TimestampIdGenerator::new();
        let suffixes: Vec<String> = (0..1003)
            .map(|_| {
                let id = ids.next();
                id[id.len() - 4..].to_string()
            })
            .collect();
        assert_eq!(suffixes[0], "0000");
        assert_eq!(suffixes[1000], "1000");
        assert_eq!(suffixes[1001], "0000");
        assert_eq!(suffixes[1002], "0001");
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIdGenerator::new("tx");
        assert_eq!(ids.next(), "tx1");
        assert_eq!(ids.next(), "tx2");
    }
}
