//! The router capability: topic to shard to server host.

use conveyor_core::{HostId, ShardID};
use xxhash_rust::xxh64::xxh64;

/// Maps topics to shards and shards to server hosts.
///
/// The version increments whenever the mapping changes; subscribers poll
/// it from their tick and reconnect when it moves.
pub trait SubscriptionRouter: Send + Sync {
    /// Current version of the routing configuration.
    fn version(&self) -> u64;

    /// Shard owning the given topic.
    fn shard(&self, namespace_id: &[u8], topic: &[u8]) -> ShardID;

    /// Server currently hosting the shard, if any.
    fn host_for(&self, shard: ShardID) -> Option<HostId>;
}

/// Router for a fixed single-host deployment: topics hash onto
/// `num_shards` shards, all served by one host.
pub struct FixedRouter {
    host: HostId,
    num_shards: u32,
}

impl FixedRouter {
    pub fn new(host: HostId, num_shards: u32) -> Self {
        assert!(num_shards > 0);
        Self { host, num_shards }
    }
}

impl SubscriptionRouter for FixedRouter {
    fn version(&self) -> u64 {
        1
    }

    fn shard(&self, namespace_id: &[u8], topic: &[u8]) -> ShardID {
        let mut key = Vec::with_capacity(namespace_id.len() + topic.len());
        key.extend_from_slice(namespace_id);
        key.extend_from_slice(topic);
        (xxh64(&key, 0) % self.num_shards as u64) as ShardID
    }

    fn host_for(&self, _shard: ShardID) -> Option<HostId> {
        Some(self.host.clone())
    }
}
