//! A set whose entries expire after a fixed age.
//!
//! Used for the unsubscribe-dedup window and for heartbeat liveness.
//! Re-adding an entry refreshes its deadline. Expiry is driven by the
//! owner calling `process_expired` from its tick.

use std::collections::VecDeque;
use std::hash::Hash;
use std::time::{Duration, Instant};

use ahash::AHashMap;

pub struct TimeoutList<T: Eq + Hash + Clone> {
    /// Insertion-ordered entries; stale duplicates are skipped on expiry.
    queue: VecDeque<(T, Instant)>,
    /// Latest deadline basis per entry.
    latest: AHashMap<T, Instant>,
}

impl<T: Eq + Hash + Clone> TimeoutList<T> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            latest: AHashMap::new(),
        }
    }

    /// Add or refresh an entry.
    pub fn add(&mut self, value: T) {
        self.add_at(value, Instant::now());
    }

    pub(crate) fn add_at(&mut self, value: T, now: Instant) {
        self.latest.insert(value.clone(), now);
        self.queue.push_back((value, now));
    }

    pub fn contains(&self, value: &T) -> bool {
        self.latest.contains_key(value)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.latest.clear();
    }

    /// Remove an entry before it expires.
    pub fn remove(&mut self, value: &T) -> bool {
        // Queue entries for it become stale and are dropped on expiry.
        self.latest.remove(value).is_some()
    }

    /// Expire entries older than `timeout`, invoking `expired` for each.
    pub fn process_expired(&mut self, timeout: Duration, mut expired: impl FnMut(T)) {
        self.process_expired_at(timeout, Instant::now(), &mut expired);
    }

    pub(crate) fn process_expired_at(
        &mut self,
        timeout: Duration,
        now: Instant,
        expired: &mut impl FnMut(T),
    ) {
        while let Some((value, added)) = self.queue.front() {
            if now.duration_since(*added) < timeout {
                break;
            }
            let (value, added) = (value.clone(), *added);
            self.queue.pop_front();
            // Only the newest queue entry for a value speaks for it.
            if self.latest.get(&value) == Some(&added) {
                self.latest.remove(&value);
                expired(value);
            }
        }
    }
}

impl<T: Eq + Hash + Clone> Default for TimeoutList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_in_order() {
        let start = Instant::now();
        let mut list = TimeoutList::new();
        list.add_at(1u64, start);
        list.add_at(2u64, start + Duration::from_millis(500));

        let mut expired = Vec::new();
        list.process_expired_at(
            Duration::from_secs(1),
            start + Duration::from_millis(1100),
            &mut |v| expired.push(v),
        );
        assert_eq!(expired, vec![1]);
        assert!(!list.contains(&1));
        assert!(list.contains(&2));
    }

    #[test]
    fn test_readd_refreshes_deadline() {
        let start = Instant::now();
        let mut list = TimeoutList::new();
        list.add_at(7u64, start);
        list.add_at(7u64, start + Duration::from_millis(900));

        let mut expired = Vec::new();
        list.process_expired_at(
            Duration::from_secs(1),
            start + Duration::from_millis(1100),
            &mut |v| expired.push(v),
        );
        // The first entry is stale; the refreshed one has not timed out.
        assert!(expired.is_empty());
        assert!(list.contains(&7));

        list.process_expired_at(
            Duration::from_secs(1),
            start + Duration::from_millis(2000),
            &mut |v| expired.push(v),
        );
        assert_eq!(expired, vec![7]);
    }

    #[test]
    fn test_remove_suppresses_expiry() {
        let start = Instant::now();
        let mut list = TimeoutList::new();
        list.add_at(3u64, start);
        assert!(list.remove(&3));
        assert!(!list.remove(&3));

        let mut expired = Vec::new();
        list.process_expired_at(Duration::ZERO, start + Duration::from_secs(5), &mut |v| {
            expired.push(v)
        });
        assert!(expired.is_empty());
    }
}
