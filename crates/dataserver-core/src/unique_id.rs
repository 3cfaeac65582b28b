use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

const COUNTER_WIDTH: usize = 6;
const COUNTER_MAX: u32 = 999_999;
const SEPARATOR: &str = "__";

/// Monotonic compound identifier `<timestamp>__<counter>`.
///
/// The timestamp is UTC with millisecond precision and the counter is
/// zero-padded, so lexical order is chronological order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UniqueId(String);

impl UniqueId {
    /// Wraps an existing id without validating it. Ids read back from disk go
    /// through here; comparison stays lexical either way.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn from_parts(millis: i64, counter: u32) -> Self {
        Self(format!(
            "{}{}{:0width$}",
            format_millis(millis),
            SEPARATOR,
            counter,
            width = COUNTER_WIDTH
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Milliseconds since the epoch encoded in the id, if it is well formed.
    pub fn timestamp_millis(&self) -> Option<i64> {
        let (ts, _) = self.0.split_once(SEPARATOR)?;
        DateTime::parse_from_rfc3339(ts)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UniqueId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_millis: i64,
    counter: u32,
}

/// Issues strictly increasing [`UniqueId`]s, even for bursts within one millisecond
/// or when the wall clock steps backwards.
#[derive(Debug, Default)]
pub struct UniqueIdGenerator {
    state: Mutex<GeneratorState>,
}

impl UniqueIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues after `last` so ids issued by a previous process are never reused.
    pub fn resume_after(last: Option<&UniqueId>) -> Self {
        let generator = Self::new();
        if let Some(last) = last {
            if let (Some(millis), Some(counter)) = (last.timestamp_millis(), parse_counter(last)) {
                let mut state = generator.state.lock();
                state.last_millis = millis;
                state.counter = counter;
            }
        }
        generator
    }

    pub fn next(&self) -> UniqueId {
        self.next_at(Utc::now().timestamp_millis())
    }

    pub fn next_at(&self, now_millis: i64) -> UniqueId {
        let mut state = self.state.lock();
        if now_millis > state.last_millis {
            state.last_millis = now_millis;
            state.counter = 1;
        } else if state.counter >= COUNTER_MAX {
            state.last_millis += 1;
            state.counter = 1;
        } else {
            state.counter += 1;
        }
        UniqueId::from_parts(state.last_millis, state.counter)
    }
}

fn parse_counter(id: &UniqueId) -> Option<u32> {
    id.as_str().split_once(SEPARATOR)?.1.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_millisecond_burst_is_monotonic() {
        let generator = UniqueIdGenerator::new();
        let ids: Vec<UniqueId> = (0..1000).map(|_| generator.next_at(1_700_000_000_000)).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn clock_regression_does_not_go_backwards() {
        let generator = UniqueIdGenerator::new();
        let a = generator.next_at(1_700_000_000_500);
        let b = generator.next_at(1_700_000_000_100);
        assert!(a < b);
        assert_eq!(b.timestamp_millis(), Some(1_700_000_000_500));
    }

    #[test]
    fn counter_overflow_borrows_next_millisecond() {
        let generator = UniqueIdGenerator::resume_after(Some(&UniqueId::from_parts(1_000, COUNTER_MAX)));
        let next = generator.next_at(1_000);
        assert_eq!(next, UniqueId::from_parts(1_001, 1));
    }

    #[test]
    fn lexical_order_matches_time_across_digits() {
        let early = UniqueId::from_parts(999, 999_999);
        let late = UniqueId::from_parts(1_000, 1);
        assert!(early < late);
        assert_eq!(late.as_str(), "1970-01-01T00:00:01.000Z__000001");
    }

    #[test]
    fn resume_continues_after_last_id() {
        let last = UniqueId::from_parts(5_000, 7);
        let generator = UniqueIdGenerator::resume_after(Some(&last));
        assert!(generator.next_at(4_000) > last);
    }
}
