//! Log tailer: reads logs from storage and emits ordered records.
//!
//! Storage callbacks run on storage threads; they convert each record
//! into a typed event and forward it towards the owning loop through a
//! caller-supplied hop that reports backpressure (a refused forward makes
//! the storage layer keep the record and retry). The in-loop half then
//! enforces per-(reader, log) ordering: records on unopened logs and
//! records that do not carry exactly the next expected seqno are dropped
//! and counted, which keeps redeliveries from ever reordering a log.
//!
//! A payload that fails to decode becomes a data-loss gap covering its
//! single seqno.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, error, info, warn};
use rand::Rng;

use conveyor_core::{DataMessageType, GapType, LogID, MessageData, SequenceNumber};

use crate::error::{Result, ServerError};
use crate::options::LogTailerOptions;
use crate::storage::{AsyncLogReader, GapCallback, LogStorage, RecordCallback};

/// An event forwarded from a storage thread to the owning loop.
#[derive(Debug)]
pub enum TailerEvent {
    Record {
        reader_id: usize,
        log_id: LogID,
        message: MessageData,
    },
    Gap {
        reader_id: usize,
        log_id: LogID,
        gap_type: GapType,
        from: SequenceNumber,
        to: SequenceNumber,
    },
}

/// Ordered record sink, invoked on the owning loop.
pub type OnRecord = Box<dyn FnMut(MessageData, LogID, usize) + Send>;

/// Ordered gap sink, invoked on the owning loop.
pub type OnGap = Box<dyn FnMut(LogID, GapType, SequenceNumber, SequenceNumber, usize) + Send>;

/// Counters for records rejected by the ordering checks.
#[derive(Default)]
pub struct TailerStats {
    pub records_out_of_order: AtomicU64,
    pub gaps_out_of_order: AtomicU64,
}

struct ReaderState {
    reader: Box<dyn AsyncLogReader>,
    /// Next expected seqno per open log.
    log_state: AHashMap<LogID, SequenceNumber>,
}

pub struct LogTailer {
    storage: Arc<dyn LogStorage>,
    readers: Vec<ReaderState>,
    on_record: OnRecord,
    on_gap: OnGap,
    stats: Arc<TailerStats>,
}

impl LogTailer {
    /// Open readers against the storage. `forward` hops a `TailerEvent`
    /// to the loop that owns this tailer and returns false when the hop
    /// is full; the storage layer will then redeliver.
    pub fn initialize(
        storage: Arc<dyn LogStorage>,
        options: LogTailerOptions,
        forward: impl Fn(TailerEvent) -> bool + Send + Sync + 'static,
        on_record: OnRecord,
        on_gap: OnGap,
    ) -> Result<Self> {
        if options.num_readers == 0 {
            return Err(ServerError::NotInitialized("num_readers must be positive"));
        }
        let forward = Arc::new(forward);
        let failure_probability = options.forward_failure_probability;

        let record_forward = forward.clone();
        let record_callback: RecordCallback = Arc::new(move |reader_id, record| {
            if failure_probability > 0.0
                && rand::thread_rng().gen::<f64>() < failure_probability
            {
                debug!("injected forward failure for log {}", record.log_id);
                return false;
            }
            let log_id = record.log_id;
            let seqno = record.seqno;
            match MessageData::decode_storage(&record.payload, DataMessageType::Deliver) {
                Ok(mut message) => {
                    message.set_sequence_numbers(seqno.saturating_sub(1), seqno);
                    record_forward(TailerEvent::Record {
                        reader_id,
                        log_id,
                        message,
                    })
                }
                Err(e) => {
                    error!(
                        "failed to decode record in log {} at {}: {}",
                        log_id, seqno, e
                    );
                    // Corrupt data becomes a data-loss gap for that seqno.
                    record_forward(TailerEvent::Gap {
                        reader_id,
                        log_id,
                        gap_type: GapType::DataLoss,
                        from: seqno,
                        to: seqno,
                    })
                }
            }
        });

        let gap_forward = forward.clone();
        let gap_callback: GapCallback = Arc::new(move |reader_id, log_id, gap_type, from, to| {
            gap_forward(TailerEvent::Gap {
                reader_id,
                log_id,
                gap_type,
                from,
                to,
            })
        });

        let readers = storage
            .create_readers(options.num_readers, record_callback, gap_callback)?
            .into_iter()
            .map(|reader| ReaderState {
                reader,
                log_state: AHashMap::new(),
            })
            .collect();

        Ok(Self {
            storage,
            readers,
            on_record,
            on_gap,
            stats: Arc::new(TailerStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<TailerStats> {
        self.stats.clone()
    }

    /// Start tailing a log on one reader, expecting `start` first.
    pub fn open_log(
        &mut self,
        reader_id: usize,
        log_id: LogID,
        start: SequenceNumber,
    ) -> Result<()> {
        let reader = self
            .readers
            .get_mut(reader_id)
            .ok_or(ServerError::UnknownReader(reader_id))?;
        reader.log_state.insert(log_id, start.max(1));
        reader.reader.open(log_id, start.max(1))?;
        info!("reader {} opened log {} at {}", reader_id, log_id, start);
        Ok(())
    }

    /// Stop tailing a log on one reader.
    pub fn close_log(&mut self, reader_id: usize, log_id: LogID) -> Result<()> {
        let reader = self
            .readers
            .get_mut(reader_id)
            .ok_or(ServerError::UnknownReader(reader_id))?;
        reader.log_state.remove(&log_id);
        reader.reader.close(log_id)?;
        info!("reader {} closed log {}", reader_id, log_id);
        Ok(())
    }

    /// Process a forwarded event on the owning loop. Out-of-order and
    /// unopened-log events are dropped here.
    pub fn on_event(&mut self, event: TailerEvent) {
        match event {
            TailerEvent::Record {
                reader_id,
                log_id,
                message,
            } => {
                let seqno = message.seqno;
                let Some(expected) = self.expected(reader_id, log_id) else {
                    debug!(
                        "reader {} received record on unopened log {}",
                        reader_id, log_id
                    );
                    self.stats.records_out_of_order.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                if expected != seqno {
                    debug!(
                        "reader {} received record out of order on log {}: expected {}, got {}",
                        reader_id, log_id, expected, seqno
                    );
                    self.stats.records_out_of_order.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.set_expected(reader_id, log_id, seqno + 1);
                (self.on_record)(message, log_id, reader_id);
            }
            TailerEvent::Gap {
                reader_id,
                log_id,
                gap_type,
                from,
                to,
            } => {
                match gap_type {
                    GapType::DataLoss => {
                        warn!("data loss in log {} from {} to {}", log_id, from, to)
                    }
                    GapType::Retention => {
                        warn!("retention gap in log {} from {} to {}", log_id, from, to)
                    }
                    GapType::Benign => {
                        debug!("benign gap in log {} from {} to {}", log_id, from, to)
                    }
                }
                let Some(expected) = self.expected(reader_id, log_id) else {
                    debug!(
                        "reader {} received gap on unopened log {}",
                        reader_id, log_id
                    );
                    self.stats.gaps_out_of_order.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                if expected != from {
                    debug!(
                        "reader {} received gap out of order on log {}: expected {}, got {}",
                        reader_id, log_id, expected, from
                    );
                    self.stats.gaps_out_of_order.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.set_expected(reader_id, log_id, to + 1);
                (self.on_gap)(log_id, gap_type, from, to, reader_id);
            }
        }
    }

    /// Ask storage for the seqno one past the current tail. The callback
    /// runs on a storage thread; hop back to your own loop.
    pub fn find_latest_seqno(
        &self,
        log_id: LogID,
        callback: Box<dyn FnOnce(Result<SequenceNumber>) + Send>,
    ) {
        self.storage.find_latest_seqno(log_id, callback);
    }

    fn expected(&self, reader_id: usize, log_id: LogID) -> Option<SequenceNumber> {
        self.readers
            .get(reader_id)
            .and_then(|reader| reader.log_state.get(&log_id))
            .copied()
    }

    fn set_expected(&mut self, reader_id: usize, log_id: LogID, seqno: SequenceNumber) {
        if let Some(reader) = self.readers.get_mut(reader_id) {
            reader.log_state.insert(log_id, seqno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStorage;
    use bytes::Bytes;
    use conveyor_core::MsgId;
    use parking_lot::Mutex;

    fn storage_bytes(topic: &str, payload: &str) -> Bytes {
        let data = MessageData::new(
            DataMessageType::Publish,
            102,
            Bytes::from_static(b"102"),
            Bytes::copy_from_slice(topic.as_bytes()),
            MsgId([7u8; 16]),
            Bytes::copy_from_slice(payload.as_bytes()),
        );
        let mut out = Vec::new();
        data.encode_storage(&mut out);
        Bytes::from(out)
    }

    struct Captured {
        records: Arc<Mutex<Vec<(LogID, SequenceNumber)>>>,
        gaps: Arc<Mutex<Vec<(LogID, SequenceNumber, SequenceNumber)>>>,
    }

    /// Tailer with a channel hop standing in for the owning loop's queue;
    /// `drain` plays the loop's role.
    fn make_tailer(
        storage: &MemoryLogStorage,
    ) -> (LogTailer, crossbeam_channel::Receiver<TailerEvent>, Captured) {
        let records = Arc::new(Mutex::new(Vec::new()));
        let gaps = Arc::new(Mutex::new(Vec::new()));
        let (records_clone, gaps_clone) = (records.clone(), gaps.clone());

        let (tx, rx) = crossbeam_channel::unbounded();
        let tailer = LogTailer::initialize(
            Arc::new(storage.clone()),
            LogTailerOptions::default(),
            move |event| tx.send(event).is_ok(),
            Box::new(move |message, log_id, _| {
                records_clone.lock().push((log_id, message.seqno));
            }),
            Box::new(move |log_id, _, from, to, _| {
                gaps_clone.lock().push((log_id, from, to));
            }),
        )
        .unwrap();
        (tailer, rx, Captured { records, gaps })
    }

    fn drain(tailer: &mut LogTailer, rx: &crossbeam_channel::Receiver<TailerEvent>) {
        while let Ok(event) = rx.try_recv() {
            tailer.on_event(event);
        }
    }

    #[test]
    fn test_records_flow_in_order() {
        let storage = MemoryLogStorage::new();
        let (mut tailer, rx, captured) = make_tailer(&storage);
        tailer.open_log(0, 9, 1).unwrap();

        storage.append(9, storage_bytes("t", "one"));
        storage.append(9, storage_bytes("t", "two"));
        drain(&mut tailer, &rx);
        assert_eq!(*captured.records.lock(), vec![(9, 1), (9, 2)]);
    }

    #[test]
    fn test_out_of_order_records_are_dropped() {
        let storage = MemoryLogStorage::new();
        let (mut tailer, _rx, captured) = make_tailer(&storage);
        tailer.open_log(0, 5, 10).unwrap();

        let record = |seqno| {
            let mut message =
                MessageData::decode_storage(&storage_bytes("t", "x"), DataMessageType::Deliver)
                    .unwrap();
            message.set_sequence_numbers(seqno - 1, seqno);
            TailerEvent::Record {
                reader_id: 0,
                log_id: 5,
                message,
            }
        };
        // Arrival order 10, 12, 11: only 10 passes, 12 and 11 drop.
        tailer.on_event(record(10));
        tailer.on_event(record(12));
        tailer.on_event(record(11));
        assert_eq!(
            tailer.stats().records_out_of_order.load(Ordering::Relaxed),
            2
        );
        assert_eq!(*captured.records.lock(), vec![(5, 10)]);
    }

    #[test]
    fn test_unopened_log_records_are_dropped() {
        let storage = MemoryLogStorage::new();
        let (mut tailer, _rx, captured) = make_tailer(&storage);
        let mut message =
            MessageData::decode_storage(&storage_bytes("t", "x"), DataMessageType::Deliver)
                .unwrap();
        message.set_sequence_numbers(0, 1);
        tailer.on_event(TailerEvent::Record {
            reader_id: 0,
            log_id: 404,
            message,
        });
        assert_eq!(
            tailer.stats().records_out_of_order.load(Ordering::Relaxed),
            1
        );
        assert!(captured.records.lock().is_empty());
    }

    #[test]
    fn test_gap_advances_expected() {
        let storage = MemoryLogStorage::new();
        let (mut tailer, _rx, captured) = make_tailer(&storage);
        tailer.open_log(0, 2, 1).unwrap();
        tailer.on_event(TailerEvent::Gap {
            reader_id: 0,
            log_id: 2,
            gap_type: GapType::Retention,
            from: 1,
            to: 9,
        });
        // A record at the post-gap position is accepted.
        let mut message =
            MessageData::decode_storage(&storage_bytes("t", "x"), DataMessageType::Deliver)
                .unwrap();
        message.set_sequence_numbers(9, 10);
        tailer.on_event(TailerEvent::Record {
            reader_id: 0,
            log_id: 2,
            message,
        });
        assert_eq!(*captured.gaps.lock(), vec![(2, 1, 9)]);
        assert_eq!(*captured.records.lock(), vec![(2, 10)]);
    }

    #[test]
    fn test_corrupt_payload_becomes_data_loss_gap() {
        let storage = MemoryLogStorage::new();
        let (mut tailer, rx, captured) = make_tailer(&storage);
        tailer.open_log(0, 3, 1).unwrap();

        storage.append(3, Bytes::from_static(b"\xFF\xFFgarbage"));
        drain(&mut tailer, &rx);
        assert_eq!(*captured.gaps.lock(), vec![(3, 1, 1)]);
        assert!(captured.records.lock().is_empty());
    }
}
