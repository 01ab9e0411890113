//! Fundamental types shared across the client and server.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

/// Multi-tenant isolation key.
pub type TenantID = u16;

/// Reserved tenant that no valid message may carry.
pub const INVALID_TENANT: TenantID = 0;

/// Default tenant for callers that do not care about isolation.
pub const GUEST_TENANT: TenantID = 1;

/// Per-tenant byte-string key partitioning the topic space.
pub type NamespaceID = Bytes;

/// Byte-string topic name within a namespace.
pub type Topic = Bytes;

/// Monotonically increasing position within one log.
pub type SequenceNumber = u64;

/// Identifier of an append-only log in external storage.
pub type LogID = u64;

/// A partition of the topic space owned by one client worker and mapped to
/// one server.
pub type ShardID = u32;

/// Identifies a logical stream. A stream is a pair of unidirectional
/// channels, one in each direction; messages flowing in one direction are
/// linearly ordered. The ID is unique within a single connection only.
pub type StreamID = u64;

/// Identifies a subscription within one worker process. The high bits of a
/// handle encode the owning worker; the low bits come from a per-worker
/// monotone counter.
pub type SubscriptionID = u64;

/// Reserved subscription ID that does not represent any valid subscription.
pub const NULL_SUBSCRIPTION_ID: SubscriptionID = 0;

/// A (namespace, topic) pair. Total order is lexicographic on the pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicKey {
    pub namespace_id: NamespaceID,
    pub topic: Topic,
}

impl TopicKey {
    pub fn new(namespace_id: impl Into<NamespaceID>, topic: impl Into<Topic>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            topic: topic.into(),
        }
    }
}

/// Everything needed to start a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionParameters {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    /// First sequence number to deliver; 0 means "from the tail".
    pub start_seqno: SequenceNumber,
}

/// A 16-byte globally unique message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MsgId(pub [u8; 16]);

impl MsgId {
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Classification of a sequence-number range with no deliverable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GapType {
    /// A gap the storage layer recognises as harmless (e.g. records for
    /// other topics in the same log).
    Benign = 0,
    /// The storage layer lost data, or a payload failed to decode.
    DataLoss = 1,
    /// Data aged out of the retention window.
    Retention = 2,
}

impl TryFrom<u8> for GapType {
    type Error = crate::error::ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(GapType::Benign),
            1 => Ok(GapType::DataLoss),
            2 => Ok(GapType::Retention),
            _ => Err(crate::error::ProtocolError::InvalidEnum {
                what: "GapType",
                value,
            }),
        }
    }
}

/// Address of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostId {
    pub hostname: String,
    pub port: u16,
}

impl HostId {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            hostname: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// A (source, seqno) position within a topic. Sources identify independent
/// sequences that a subscription may read from; the empty source is the
/// topic's default sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cursor {
    pub source: Bytes,
    pub seqno: SequenceNumber,
}

impl Cursor {
    pub fn new(source: impl Into<Bytes>, seqno: SequenceNumber) -> Self {
        Self {
            source: source.into(),
            seqno,
        }
    }
}
