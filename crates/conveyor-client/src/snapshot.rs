//! Persisted subscription state.
//!
//! A snapshot holds one record per active subscription: tenant, topic and
//! the seqno to resume from (last acknowledged plus one, or the original
//! start). On disk a snapshot is a sequence of length-prefixed records.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use conveyor_core::coding::{put_fixed16, put_length_prefixed, put_topic_id, put_varint64, Decoder};
use conveyor_core::{NamespaceID, SequenceNumber, TenantID, Topic};
use parking_lot::Mutex;

use crate::error::{ClientError, Result};

/// One persisted subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    /// Seqno to resume the subscription from.
    pub seqno: SequenceNumber,
}

/// All subscriptions of a client at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub records: Vec<SubscriptionRecord>,
}

impl SubscriptionSnapshot {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for record in &self.records {
            let mut body = Vec::new();
            put_fixed16(&mut body, record.tenant_id);
            put_topic_id(&mut body, &record.namespace_id, &record.topic);
            put_varint64(&mut body, record.seqno);
            put_length_prefixed(&mut out, &body);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(buf);
        let mut records = Vec::new();
        while !dec.is_empty() {
            let body = dec.get_length_prefixed("snapshot record")?;
            let mut body_dec = Decoder::new(body);
            let tenant_id = body_dec.get_fixed16("tenant")?;
            let (namespace_id, topic) = body_dec.get_topic_id("topic id")?;
            let seqno = body_dec.get_seqno("seqno")?;
            records.push(SubscriptionRecord {
                tenant_id,
                namespace_id,
                topic,
                seqno,
            });
        }
        Ok(Self { records })
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.encode())?;
        file.sync_all()
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Self::decode(&buf)
    }
}

/// Callback invoked once a snapshot has been gathered from every worker.
pub type SaveSubscriptionsCallback = Box<dyn FnOnce(Result<SubscriptionSnapshot>) + Send>;

struct CollectorInner {
    records: Vec<SubscriptionRecord>,
    remaining: usize,
    failed: bool,
    callback: Option<SaveSubscriptionsCallback>,
}

/// Gathers per-worker snapshot fragments; fires the callback when the
/// last worker reports.
#[derive(Clone)]
pub struct SnapshotCollector {
    inner: Arc<Mutex<CollectorInner>>,
}

impl SnapshotCollector {
    pub fn new(workers: usize, callback: SaveSubscriptionsCallback) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CollectorInner {
                records: Vec::new(),
                remaining: workers,
                failed: false,
                callback: Some(callback),
            })),
        }
    }

    /// A worker contributed its records.
    pub fn complete(&self, records: Vec<SubscriptionRecord>) {
        let mut inner = self.inner.lock();
        inner.records.extend(records);
        Self::finish_one(&mut inner);
    }

    /// A worker could not be reached.
    pub fn fail(&self) {
        let mut inner = self.inner.lock();
        inner.failed = true;
        Self::finish_one(&mut inner);
    }

    fn finish_one(inner: &mut CollectorInner) {
        debug_assert!(inner.remaining > 0);
        inner.remaining -= 1;
        if inner.remaining > 0 {
            return;
        }
        if let Some(callback) = inner.callback.take() {
            let result = if inner.failed {
                Err(ClientError::QueueFull)
            } else {
                Ok(SubscriptionSnapshot {
                    records: std::mem::take(&mut inner.records),
                })
            };
            callback(result);
        }
    }
}
