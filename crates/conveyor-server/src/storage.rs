//! The log storage capability.
//!
//! Storage is external; the tower consumes it through these traits. An
//! in-memory implementation is provided for tests and local development.
//!
//! Callback contract: `on_record`/`on_gap` run on storage threads and
//! return false when the receiver cannot take the record right now, in
//! which case the storage layer keeps it and redelivers later.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use log::trace;
use parking_lot::Mutex;

use conveyor_core::{GapType, LogID, SequenceNumber};

use crate::error::{Result, ServerError};

/// One record read from a log. Seqnos within a log start at 1.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub log_id: LogID,
    pub seqno: SequenceNumber,
    pub payload: Bytes,
}

/// Invoked with (reader id, record); false means "retry later".
pub type RecordCallback = Arc<dyn Fn(usize, LogRecord) -> bool + Send + Sync>;

/// Invoked with (reader id, log, gap type, from, to); false means "retry".
pub type GapCallback =
    Arc<dyn Fn(usize, LogID, GapType, SequenceNumber, SequenceNumber) -> bool + Send + Sync>;

/// A reader of one or more logs.
pub trait AsyncLogReader: Send {
    /// Start reading a log at `start`; records arrive via the callbacks.
    fn open(&mut self, log_id: LogID, start: SequenceNumber) -> Result<()>;

    /// Stop reading a log.
    fn close(&mut self, log_id: LogID) -> Result<()>;
}

/// The storage capability consumed by the tower.
pub trait LogStorage: Send + Sync {
    /// Create `count` readers sharing the given callbacks; each reader is
    /// identified by its index.
    fn create_readers(
        &self,
        count: usize,
        on_record: RecordCallback,
        on_gap: GapCallback,
    ) -> Result<Vec<Box<dyn AsyncLogReader>>>;

    /// Find the seqno one past the last written record of a log. The
    /// callback may run on a storage thread.
    fn find_latest_seqno(
        &self,
        log_id: LogID,
        callback: Box<dyn FnOnce(Result<SequenceNumber>) + Send>,
    );
}

struct MemoryReader {
    on_record: RecordCallback,
    /// Next seqno to deliver per open log. A refused delivery leaves the
    /// position unchanged, so redelivery resumes exactly there.
    positions: AHashMap<LogID, SequenceNumber>,
}

struct MemoryInner {
    logs: AHashMap<LogID, Vec<Bytes>>,
    readers: Vec<MemoryReader>,
}

/// In-memory log storage. Records are delivered to readers synchronously
/// from `append` (the appending thread acts as the storage thread), so
/// callbacks must not call back into the storage.
#[derive(Clone)]
pub struct MemoryLogStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                logs: AHashMap::new(),
                readers: Vec::new(),
            })),
        }
    }

    /// Append a payload; returns its seqno (1-based).
    pub fn append(&self, log_id: LogID, payload: impl Into<Bytes>) -> SequenceNumber {
        let mut inner = self.inner.lock();
        let log = inner.logs.entry(log_id).or_default();
        log.push(payload.into());
        let seqno = log.len() as SequenceNumber;
        Self::pump(&mut inner, log_id);
        seqno
    }

    /// Redeliver records that a callback previously refused.
    pub fn redeliver(&self) {
        let mut inner = self.inner.lock();
        for index in 0..inner.readers.len() {
            let log_ids: Vec<LogID> = inner.readers[index].positions.keys().copied().collect();
            for log_id in log_ids {
                Self::pump_reader(&mut inner, index, log_id);
            }
        }
    }

    /// Drive delivery for every reader positioned on `log_id`.
    fn pump(inner: &mut MemoryInner, log_id: LogID) {
        for index in 0..inner.readers.len() {
            Self::pump_reader(inner, index, log_id);
        }
    }

    fn pump_reader(inner: &mut MemoryInner, index: usize, log_id: LogID) {
        loop {
            let (position, payload) = {
                let Some(&position) = inner.readers[index].positions.get(&log_id) else {
                    return;
                };
                let Some(log) = inner.logs.get(&log_id) else {
                    return;
                };
                let Some(payload) = log.get(position as usize - 1) else {
                    return;
                };
                (position, payload.clone())
            };

            let record = LogRecord {
                log_id,
                seqno: position,
                payload,
            };
            let reader = &mut inner.readers[index];
            if (reader.on_record)(index, record) {
                reader.positions.insert(log_id, position + 1);
                trace!("reader {} delivered log {} seqno {}", index, log_id, position);
            } else {
                return;
            }
        }
    }
}

impl Default for MemoryLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryReaderHandle {
    index: usize,
    inner: Arc<Mutex<MemoryInner>>,
}

impl AsyncLogReader for MemoryReaderHandle {
    fn open(&mut self, log_id: LogID, start: SequenceNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let position = start.max(1);
        inner.readers[self.index].positions.insert(log_id, position);
        MemoryLogStorage::pump_reader(&mut inner, self.index, log_id);
        Ok(())
    }

    fn close(&mut self, log_id: LogID) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.readers[self.index].positions.remove(&log_id).is_none() {
            return Err(ServerError::UnknownLog(log_id));
        }
        Ok(())
    }
}

impl LogStorage for MemoryLogStorage {
    fn create_readers(
        &self,
        count: usize,
        on_record: RecordCallback,
        _on_gap: GapCallback,
    ) -> Result<Vec<Box<dyn AsyncLogReader>>> {
        let mut inner = self.inner.lock();
        let mut handles: Vec<Box<dyn AsyncLogReader>> = Vec::with_capacity(count);
        for _ in 0..count {
            let index = inner.readers.len();
            inner.readers.push(MemoryReader {
                on_record: on_record.clone(),
                positions: AHashMap::new(),
            });
            handles.push(Box::new(MemoryReaderHandle {
                index,
                inner: self.inner.clone(),
            }));
        }
        Ok(handles)
    }

    fn find_latest_seqno(
        &self,
        log_id: LogID,
        callback: Box<dyn FnOnce(Result<SequenceNumber>) + Send>,
    ) {
        let next = {
            let inner = self.inner.lock();
            inner
                .logs
                .get(&log_id)
                .map(|log| log.len() as SequenceNumber + 1)
                .unwrap_or(1)
        };
        callback(Ok(next));
    }
}
