//! Control room: the fan-out worker.
//!
//! A room consumes a single typed command queue. Data commands carry a
//! record from the tailer together with its log; the record is serialised
//! once and a copy goes to every subscriber host of its topic, after
//! which the log's last-read seqno advances. Metadata commands carry
//! subscribe/unsubscribe requests from downstream hosts; they mutate the
//! topic manager, tell the tower when a log needs tailing (first
//! subscriber) or can stop (last one), and echo an acknowledgement to the
//! origin host.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};

use conveyor_core::{
    Cursor, HostId, LogID, Message, MessageData, MessageSubAck, MessageUnsubscribe,
    SequenceNumber, SubscriptionID, TenantID, UnsubscribeReason,
};

use crate::options::ControlRoomOptions;
use crate::router::LogRouter;
use crate::topic_manager::{HostMap, TopicManager, TopicUUID};

/// Commands processed by a room.
pub enum RoomCommand {
    /// A record from the tailer.
    Data {
        log_id: LogID,
        message: MessageData,
    },
    /// A subscribe request from a downstream host.
    Subscribe {
        origin: HostId,
        log_id: LogID,
        tenant_id: TenantID,
        topic: TopicUUID,
        sub_id: SubscriptionID,
        start_seqno: SequenceNumber,
    },
    /// An unsubscribe request from a downstream host.
    Unsubscribe {
        origin: HostId,
        log_id: LogID,
        tenant_id: TenantID,
        topic: TopicUUID,
        sub_id: SubscriptionID,
    },
    Stop,
}

/// Outbound side of a room: delivers serialised messages to hosts.
pub trait RoomSender: Send {
    /// Send bytes to a host. Returns false on backpressure; the room
    /// counts the miss and moves on (the subscriber catches up from the
    /// log on resubscribe).
    fn send_to(&mut self, host: &HostId, bytes: &[u8]) -> bool;
}

/// Tells the tower to start or stop tailing logs as subscriber sets
/// transition between empty and non-empty.
pub trait TailControl: Send {
    fn start_tailing(&mut self, log_id: LogID, start: SequenceNumber);
    fn stop_tailing(&mut self, log_id: LogID);
}

pub struct ControlRoom {
    room_number: u32,
    topic_map: TopicManager,
    host_map: Arc<HostMap>,
    /// When set, subscribe requests are checked against the topic-to-log
    /// mapping.
    log_router: Option<Arc<dyn LogRouter>>,
    /// Seqno of the last record processed per log.
    last_read: AHashMap<LogID, SequenceNumber>,
}

impl ControlRoom {
    pub fn new(room_number: u32, host_map: Arc<HostMap>) -> Self {
        Self {
            room_number,
            topic_map: TopicManager::new(),
            host_map,
            log_router: None,
            last_read: AHashMap::new(),
        }
    }

    pub fn with_log_router(mut self, log_router: Arc<dyn LogRouter>) -> Self {
        self.log_router = Some(log_router);
        self
    }

    pub fn last_read(&self, log_id: LogID) -> Option<SequenceNumber> {
        self.last_read.get(&log_id).copied()
    }

    /// Process one command.
    pub fn process(
        &mut self,
        command: RoomCommand,
        sink: &mut dyn RoomSender,
        tail: &mut dyn TailControl,
    ) {
        match command {
            RoomCommand::Data { log_id, message } => self.process_data(log_id, message, sink),
            RoomCommand::Subscribe {
                origin,
                log_id,
                tenant_id,
                topic,
                sub_id,
                start_seqno,
            } => {
                if let Some(log_router) = &self.log_router {
                    debug_assert_eq!(
                        log_router.log_id(&topic.namespace_id, &topic.topic),
                        log_id,
                        "topic routed to the wrong log"
                    );
                }
                let hostnum = self.host_map.insert(&origin);
                if self.topic_map.add_subscriber(&topic, start_seqno, hostnum) {
                    tail.start_tailing(log_id, start_seqno);
                }
                debug!(
                    "room {}: host {} subscribed to {:?} at {}",
                    self.room_number, origin, topic.topic, start_seqno
                );
                let ack = Message::SubAck(MessageSubAck {
                    tenant_id,
                    namespace_id: topic.namespace_id,
                    topic: topic.topic,
                    sub_id,
                    cursors: vec![Cursor::new(bytes::Bytes::new(), start_seqno)],
                });
                if !sink.send_to(&origin, &ack.encode_to_vec()) {
                    info!("room {}: could not ack subscribe to {}", self.room_number, origin);
                }
            }
            RoomCommand::Unsubscribe {
                origin,
                log_id,
                tenant_id,
                topic,
                sub_id,
            } => {
                let Some(hostnum) = self.host_map.lookup(&origin) else {
                    warn!("room {}: unsubscribe from unknown host {}", self.room_number, origin);
                    return;
                };
                if self.topic_map.remove_subscriber(&topic, hostnum) {
                    tail.stop_tailing(log_id);
                }
                debug!(
                    "room {}: host {} unsubscribed from {:?}",
                    self.room_number, origin, topic.topic
                );
                let ack = Message::Unsubscribe(MessageUnsubscribe {
                    tenant_id,
                    sub_id,
                    reason: UnsubscribeReason::Requested,
                    namespace_id: topic.namespace_id,
                    topic: topic.topic,
                });
                if !sink.send_to(&origin, &ack.encode_to_vec()) {
                    info!(
                        "room {}: could not ack unsubscribe to {}",
                        self.room_number, origin
                    );
                }
            }
            RoomCommand::Stop => {}
        }
    }

    fn process_data(&mut self, log_id: LogID, message: MessageData, sink: &mut dyn RoomSender) {
        let seqno = message.seqno;
        let topic = TopicUUID::new(message.namespace_id.clone(), message.topic.clone());

        // Serialise once; every subscriber gets the same bytes.
        let serialised = Message::Data(message).encode_to_vec();

        let host_map = &self.host_map;
        self.topic_map.visit_subscribers(&topic, 0, seqno, |sub| {
            let Some(host) = host_map.host(sub.hostnum()) else {
                warn!("no host for host number {}", sub.hostnum());
                return;
            };
            if sink.send_to(&host, &serialised) {
                sub.set_seqno(seqno + 1);
            } else {
                debug!("fan-out to {} refused, subscriber stays at {}", host, sub.seqno());
            }
        });

        self.last_read.insert(log_id, seqno);
    }
}

/// Cloneable sender half of a room's command queue, for the tailer and
/// the subscription endpoint to feed the room from their own threads.
#[derive(Clone)]
pub struct RoomForwarder {
    tx: Sender<RoomCommand>,
}

impl RoomForwarder {
    /// Forward a command to the room. Returns false when the queue is
    /// full; the caller retries (for tailer data, the storage layer
    /// redelivers).
    pub fn forward(&self, command: RoomCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Handle to a spawned room worker.
pub struct RoomHandle {
    tx: Sender<RoomCommand>,
    join: Option<JoinHandle<ControlRoom>>,
}

impl RoomHandle {
    /// Forward a command to the room; see [`RoomForwarder::forward`].
    pub fn forward(&self, command: RoomCommand) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// A cloneable forwarder onto this room's queue.
    pub fn forwarder(&self) -> RoomForwarder {
        RoomForwarder {
            tx: self.tx.clone(),
        }
    }

    /// Stop the worker and get the room state back.
    pub fn stop(mut self) -> Option<ControlRoom> {
        // A blocking send: stop must not be droppable.
        let _ = self.tx.send(RoomCommand::Stop);
        self.join.take().and_then(|join| join.join().ok())
    }
}

/// Spawn a room worker draining a bounded command queue.
pub fn spawn_room(
    room_number: u32,
    options: ControlRoomOptions,
    host_map: Arc<HostMap>,
    mut sink: Box<dyn RoomSender>,
    mut tail: Box<dyn TailControl>,
) -> RoomHandle {
    let (tx, rx): (Sender<RoomCommand>, Receiver<RoomCommand>) = bounded(options.queue_size);
    let join = thread::Builder::new()
        .name(format!("conveyor-room-{}", room_number))
        .spawn(move || {
            let mut room = ControlRoom::new(room_number, host_map);
            info!("room {} running", room_number);
            while let Ok(command) = rx.recv() {
                if let RoomCommand::Stop = command {
                    break;
                }
                room.process(command, sink.as_mut(), tail.as_mut());
            }
            info!("room {} stopped", room_number);
            room
        })
        .expect("failed to spawn room thread");
    RoomHandle {
        tx,
        join: Some(join),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conveyor_core::{DataMessageType, MsgId};
    use parking_lot::Mutex;

    /// Sink recording (host, decoded message) pairs.
    struct RecordingSink {
        sent: Arc<Mutex<Vec<(HostId, Message)>>>,
        refuse: bool,
    }

    impl RoomSender for RecordingSink {
        fn send_to(&mut self, host: &HostId, bytes: &[u8]) -> bool {
            if self.refuse {
                return false;
            }
            let message = Message::decode(bytes).unwrap();
            self.sent.lock().push((host.clone(), message));
            true
        }
    }

    #[derive(Default)]
    struct RecordingTail {
        started: Vec<(LogID, SequenceNumber)>,
        stopped: Vec<LogID>,
    }

    impl TailControl for RecordingTail {
        fn start_tailing(&mut self, log_id: LogID, start: SequenceNumber) {
            self.started.push((log_id, start));
        }

        fn stop_tailing(&mut self, log_id: LogID) {
            self.stopped.push(log_id);
        }
    }

    fn data(topic: &str, seqno: SequenceNumber) -> MessageData {
        let mut message = MessageData::new(
            DataMessageType::Deliver,
            102,
            Bytes::from_static(b"102"),
            Bytes::copy_from_slice(topic.as_bytes()),
            MsgId([3u8; 16]),
            Bytes::from_static(b"payload"),
        );
        message.set_sequence_numbers(seqno - 1, seqno);
        message
    }

    fn subscribe(host: &HostId, topic: &str, start: SequenceNumber) -> RoomCommand {
        RoomCommand::Subscribe {
            origin: host.clone(),
            log_id: 11,
            tenant_id: 102,
            topic: TopicUUID::new(
                Bytes::from_static(b"102"),
                Bytes::copy_from_slice(topic.as_bytes()),
            ),
            sub_id: 1,
            start_seqno: start,
        }
    }

    #[test]
    fn test_first_subscriber_starts_tailing() {
        let mut room = ControlRoom::new(0, Arc::new(HostMap::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sink = RecordingSink {
            sent: sent.clone(),
            refuse: false,
        };
        let mut tail = RecordingTail::default();

        let host_a = HostId::new("a", 1);
        let host_b = HostId::new("b", 2);
        room.process(subscribe(&host_a, "t", 1), &mut sink, &mut tail);
        room.process(subscribe(&host_b, "t", 1), &mut sink, &mut tail);
        assert_eq!(tail.started, vec![(11, 1)]);

        // Both hosts received a subscribe ack.
        let acks = sent.lock();
        assert_eq!(acks.len(), 2);
        assert!(matches!(acks[0].1, Message::SubAck(_)));
    }

    #[test]
    fn test_data_fans_out_once_per_subscriber() {
        let mut room = ControlRoom::new(0, Arc::new(HostMap::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sink = RecordingSink {
            sent: sent.clone(),
            refuse: false,
        };
        let mut tail = RecordingTail::default();

        let host_a = HostId::new("a", 1);
        let host_b = HostId::new("b", 2);
        room.process(subscribe(&host_a, "t", 1), &mut sink, &mut tail);
        room.process(subscribe(&host_b, "t", 1), &mut sink, &mut tail);
        sent.lock().clear();

        room.process(
            RoomCommand::Data {
                log_id: 11,
                message: data("t", 1),
            },
            &mut sink,
            &mut tail,
        );

        let delivered = sent.lock();
        let mut hosts: Vec<&str> = delivered
            .iter()
            .map(|(host, _)| host.hostname.as_str())
            .collect();
        hosts.sort_unstable();
        assert_eq!(hosts, vec!["a", "b"]);
        for (_, message) in delivered.iter() {
            match message {
                Message::Data(data) => assert_eq!(data.seqno, 1),
                other => panic!("wrong message: {:?}", other),
            }
        }
        assert_eq!(room.last_read(11), Some(1));
    }

    #[test]
    fn test_data_for_topic_without_subscribers_advances_last_read() {
        let mut room = ControlRoom::new(0, Arc::new(HostMap::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sink = RecordingSink {
            sent,
            refuse: false,
        };
        let mut tail = RecordingTail::default();

        room.process(
            RoomCommand::Data {
                log_id: 4,
                message: data("silent", 7),
            },
            &mut sink,
            &mut tail,
        );
        assert_eq!(room.last_read(4), Some(7));
    }

    #[test]
    fn test_last_unsubscribe_stops_tailing() {
        let mut room = ControlRoom::new(0, Arc::new(HostMap::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut sink = RecordingSink {
            sent: sent.clone(),
            refuse: false,
        };
        let mut tail = RecordingTail::default();

        let host = HostId::new("a", 1);
        room.process(subscribe(&host, "t", 1), &mut sink, &mut tail);
        room.process(
            RoomCommand::Unsubscribe {
                origin: host.clone(),
                log_id: 11,
                tenant_id: 102,
                topic: TopicUUID::new(Bytes::from_static(b"102"), Bytes::from_static(b"t")),
                sub_id: 1,
            },
            &mut sink,
            &mut tail,
        );
        assert_eq!(tail.stopped, vec![11]);
        // The unsubscribe was acknowledged.
        assert!(matches!(
            sent.lock().last().unwrap().1,
            Message::Unsubscribe(_)
        ));
    }

    #[test]
    fn test_refused_fanout_leaves_subscriber_position() {
        let mut room = ControlRoom::new(0, Arc::new(HostMap::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut tail = RecordingTail::default();

        let host = HostId::new("a", 1);
        {
            let mut sink = RecordingSink {
                sent: sent.clone(),
                refuse: false,
            };
            room.process(subscribe(&host, "t", 1), &mut sink, &mut tail);
        }

        // Delivery refused: the subscriber's expected seqno must stay put
        // so a later resubscribe resumes from it.
        let mut refusing = RecordingSink {
            sent: sent.clone(),
            refuse: true,
        };
        room.process(
            RoomCommand::Data {
                log_id: 11,
                message: data("t", 1),
            },
            &mut refusing,
            &mut tail,
        );

        let topic = TopicUUID::new(Bytes::from_static(b"102"), Bytes::from_static(b"t"));
        let mut positions = Vec::new();
        room.topic_map
            .visit_subscribers(&topic, 0, u64::MAX, |s| positions.push(s.seqno()));
        assert_eq!(positions, vec![1]);
    }

    #[test]
    fn test_spawned_room_processes_commands() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(RecordingSink {
            sent: sent.clone(),
            refuse: false,
        });
        let handle = spawn_room(
            3,
            ControlRoomOptions::default(),
            Arc::new(HostMap::new()),
            sink,
            Box::new(RecordingTail::default()),
        );

        let host = HostId::new("a", 1);
        assert!(handle.forward(subscribe(&host, "t", 1)));
        assert!(handle.forward(RoomCommand::Data {
            log_id: 11,
            message: data("t", 1),
        }));

        let room = handle.stop().expect("room thread panicked");
        assert_eq!(room.last_read(11), Some(1));
        assert_eq!(sent.lock().len(), 2);
    }
}
