//! The log routing capability: which log backs a topic.

use conveyor_core::LogID;
use xxhash_rust::xxh64::Xxh64;

/// Maps topics onto backing logs. The mapping must be stable: a topic's
/// records all live in one log.
pub trait LogRouter: Send + Sync {
    fn log_id(&self, namespace_id: &[u8], topic: &[u8]) -> LogID;
}

/// Hashes topics onto a fixed range of logs.
pub struct HashLogRouter {
    num_logs: u64,
}

impl HashLogRouter {
    pub fn new(num_logs: u64) -> Self {
        assert!(num_logs > 0);
        Self { num_logs }
    }
}

impl LogRouter for HashLogRouter {
    fn log_id(&self, namespace_id: &[u8], topic: &[u8]) -> LogID {
        let mut hasher = Xxh64::new(0);
        hasher.update(namespace_id);
        hasher.update(topic);
        hasher.digest() % self.num_logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_is_stable_and_in_range() {
        let router = HashLogRouter::new(8);
        let a = router.log_id(b"ns", b"topic");
        assert_eq!(a, router.log_id(b"ns", b"topic"));
        assert!(a < 8);
        // Namespace participates in the key.
        let b = router.log_id(b"other", b"topic");
        let c = router.log_id(b"ns", b"topic2");
        assert!(a < 8 && b < 8 && c < 8);
    }
}
