//! Bounded replay buffer for one room

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Default maximum number of retained frames
pub const DEFAULT_MAX_BACKLOG: usize = 100;

/// Default maximum age of a retained frame
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Frames kept for late joiners.
///
/// Both bounds apply independently: a frame is evicted as soon as it is
/// older than `max_age` or when more than `max_count` newer frames exist.
#[derive(Debug, Clone)]
pub struct Backlog {
    entries: VecDeque<(Instant, String)>,
    max_count: usize,
    max_age: Duration,
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKLOG, DEFAULT_MAX_AGE)
    }
}

impl Backlog {
    /// Create an empty backlog with the given bounds
    pub fn new(max_count: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            max_count,
            max_age,
        }
    }

    /// Record a frame received at `now`.
    pub fn push(&mut self, frame: String, now: Instant) {
        self.entries.push_back((now, frame));
        self.prune(now);
    }

    /// Drop frames that violate either bound.
    pub fn prune(&mut self, now: Instant) {
        while self.entries.len() > self.max_count {
            self.entries.pop_front();
        }
        while let Some((at, _)) = self.entries.front() {
            if now.saturating_duration_since(*at) > self.max_age {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames still within bounds, oldest first.
    pub fn replay(&mut self, now: Instant) -> Vec<String> {
        self.prune(now);
        self.entries.iter().map(|(_, f)| f.clone()).collect()
    }

    /// Number of retained frames
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_bound() {
        let mut backlog = Backlog::new(3, Duration::from_secs(60));
        let now = Instant::now();
        for i in 0..5 {
            backlog.push(format!("f{}", i), now);
        }
        assert_eq!(backlog.replay(now), vec!["f2", "f3", "f4"]);
    }

    #[test]
    fn test_age_bound() {
        let mut backlog = Backlog::new(100, Duration::from_secs(10));
        let start = Instant::now();
        backlog.push("old".to_string(), start);
        backlog.push("new".to_string(), start + Duration::from_secs(8));

        assert_eq!(
            backlog.replay(start + Duration::from_secs(9)),
            vec!["old", "new"]
        );
        assert_eq!(backlog.replay(start + Duration::from_secs(11)), vec!["new"]);
        assert!(backlog.replay(start + Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_both_bounds_apply() {
        let mut backlog = Backlog::new(2, Duration::from_secs(10));
        let start = Instant::now();
        backlog.push("a".to_string(), start);
        backlog.push("b".to_string(), start + Duration::from_secs(5));
        backlog.push("c".to_string(), start + Duration::from_secs(6));
        assert_eq!(backlog.len(), 2);

        // "b" ages out even though the count bound is satisfied
        assert_eq!(backlog.replay(start + Duration::from_secs(15)), vec!["c"]);
    }

    #[test]
    fn test_defaults() {
        let backlog = Backlog::default();
        assert!(backlog.is_empty());
        assert_eq!(backlog.max_count, 100);
        assert_eq!(backlog.max_age, Duration::from_secs(300));
    }
}
