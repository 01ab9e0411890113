//! Stream-multiplexing socket.
//!
//! One `SocketEvent` carries many logical streams over a single TCP
//! connection. The read path accumulates a frame header then the body,
//! translates the wire stream ID to the local one and surfaces decoded
//! messages to the owner; goodbyes and heartbeats are handled here.
//! The write path queues encoded frames and drains them with vectored
//! writes of up to [`MAX_IOVECS`] chunks whenever the socket is writable.
//!
//! Heartbeats are aggregated: per-stream liveness ticks captured during a
//! period are flushed as a single `Heartbeat`, or as a `HeartbeatDelta`
//! against the previously sent set. The receiving side keeps a per-stream
//! timeout list; silent streams are reported unhealthy but never closed
//! from here.
//!
//! Wire stream ID 0 is reserved for socket-level control messages
//! (heartbeats and pings); it never maps to a logical stream.

use std::collections::{BTreeSet, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, trace, warn};
use mio::net::TcpStream;

use crate::error::{Error, ProtocolError, Result};
use crate::frame::{self, FrameHeader, FRAME_HEADER_SIZE};
use crate::message::{
    GoodbyeCode, Message, MessageHeartbeat, MessageHeartbeatDelta, MessagePing, PingType,
};
use crate::stream::StreamAllocator;
use crate::timeout_list::TimeoutList;
use crate::types::{ShardID, StreamID};

/// Maximum number of iovecs per vectored write. The iovec array lives on
/// the stack, so this must stay modest.
pub const MAX_IOVECS: usize = 256;

/// Queued bytes beyond which `write_message` reports no room.
const SEND_QUEUE_SOFT_LIMIT: usize = 1024 * 1024;

/// Wire stream ID carrying socket-level control messages.
const CONTROL_STREAM: StreamID = 0;

/// Why a socket is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureReason {
    Error,
    Graceful,
}

/// Events surfaced to the socket owner.
#[derive(Debug)]
pub enum WireEvent {
    /// The peer opened a new inbound stream; its first message follows.
    StreamOpened { stream: StreamID },
    /// A message arrived on a known stream.
    Message { stream: StreamID, message: Message },
    /// The stream is gone: the peer said goodbye, or the socket died and
    /// a goodbye was synthesised locally.
    StreamClosed { stream: StreamID, code: GoodbyeCode },
}

/// Incremental frame parser. Feed it raw bytes; complete frames come out.
struct FrameReader {
    hdr_buf: [u8; FRAME_HEADER_SIZE],
    hdr_filled: usize,
    header: Option<FrameHeader>,
    body: Vec<u8>,
}

impl FrameReader {
    fn new() -> Self {
        Self {
            hdr_buf: [0u8; FRAME_HEADER_SIZE],
            hdr_filled: 0,
            header: None,
            body: Vec::new(),
        }
    }

    fn feed(
        &mut self,
        mut data: &[u8],
        out: &mut Vec<(StreamID, Message)>,
    ) -> std::result::Result<(), ProtocolError> {
        loop {
            match self.header {
                None => {
                    if data.is_empty() {
                        return Ok(());
                    }
                    let take = (FRAME_HEADER_SIZE - self.hdr_filled).min(data.len());
                    self.hdr_buf[self.hdr_filled..self.hdr_filled + take]
                        .copy_from_slice(&data[..take]);
                    self.hdr_filled += take;
                    data = &data[take..];
                    if self.hdr_filled == FRAME_HEADER_SIZE {
                        self.header = Some(frame::decode_header(&self.hdr_buf)?);
                        self.hdr_filled = 0;
                        self.body.clear();
                    }
                }
                Some(header) => {
                    let missing = header.body_len - self.body.len();
                    if missing > 0 {
                        if data.is_empty() {
                            return Ok(());
                        }
                        let take = missing.min(data.len());
                        self.body.extend_from_slice(&data[..take]);
                        data = &data[take..];
                    }
                    if self.body.len() == header.body_len {
                        out.push(frame::decode_body(&self.body)?);
                        self.header = None;
                        self.body.clear();
                    }
                }
            }
        }
    }
}

/// Outbound chunk queue with partial-write tracking.
struct SendQueue {
    chunks: VecDeque<Bytes>,
    /// Bytes of the front chunk already written.
    partial: usize,
    queued_bytes: usize,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            partial: 0,
            queued_bytes: 0,
        }
    }

    fn push(&mut self, chunk: Bytes) {
        self.queued_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn has_room(&self) -> bool {
        self.queued_bytes < SEND_QUEUE_SOFT_LIMIT
    }

    fn fill_io_slices<'a>(&'a self, bufs: &mut Vec<IoSlice<'a>>) {
        bufs.clear();
        for (i, chunk) in self.chunks.iter().take(MAX_IOVECS).enumerate() {
            let start = if i == 0 { self.partial } else { 0 };
            bufs.push(IoSlice::new(&chunk[start..]));
        }
    }

    fn consume(&mut self, mut n: usize) {
        self.queued_bytes -= n;
        while n > 0 {
            let front_len = self.chunks.front().map(Bytes::len).unwrap_or(0);
            let available = front_len - self.partial;
            if n >= available {
                self.chunks.pop_front();
                self.partial = 0;
                n -= available;
            } else {
                self.partial += n;
                n = 0;
            }
        }
    }
}

/// A connection multiplexing logical streams.
pub struct SocketEvent {
    stream: TcpStream,
    peer: SocketAddr,
    is_inbound: bool,
    protocol_version: u8,
    use_heartbeat_deltas: bool,

    reader: FrameReader,
    send_queue: SendQueue,

    /// Wire stream ID (as the peer knows it) to local stream ID.
    wire_to_local: AHashMap<StreamID, StreamID>,
    local_to_wire: AHashMap<StreamID, StreamID>,
    /// Set when the last stream leaves; cleared when one arrives.
    without_streams_since: Option<Instant>,

    /// Shard liveness ticks captured since the last heartbeat flush.
    captured_heartbeats: Vec<ShardID>,
    previous_sent_heartbeats: BTreeSet<ShardID>,
    previous_recv_heartbeats: BTreeSet<ShardID>,
    /// Local streams interested in each shard's heartbeat.
    streams_of_shard: AHashMap<ShardID, Vec<StreamID>>,
    hb_timeout_list: TimeoutList<StreamID>,

    closing: bool,
}

impl SocketEvent {
    /// Open an outbound connection. The connect completes asynchronously;
    /// queued frames flush once the socket becomes writable.
    pub fn connect(
        addr: SocketAddr,
        protocol_version: u8,
        use_heartbeat_deltas: bool,
    ) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Ok(Self::with_stream(
            stream,
            addr,
            protocol_version,
            use_heartbeat_deltas,
            false,
        ))
    }

    /// Wrap an accepted inbound connection.
    pub fn from_accepted(
        stream: TcpStream,
        peer: SocketAddr,
        protocol_version: u8,
        use_heartbeat_deltas: bool,
    ) -> Self {
        Self::with_stream(stream, peer, protocol_version, use_heartbeat_deltas, true)
    }

    fn with_stream(
        stream: TcpStream,
        peer: SocketAddr,
        protocol_version: u8,
        use_heartbeat_deltas: bool,
        is_inbound: bool,
    ) -> Self {
        Self {
            stream,
            peer,
            is_inbound,
            protocol_version,
            use_heartbeat_deltas,
            reader: FrameReader::new(),
            send_queue: SendQueue::new(),
            wire_to_local: AHashMap::new(),
            local_to_wire: AHashMap::new(),
            without_streams_since: Some(Instant::now()),
            captured_heartbeats: Vec::new(),
            previous_sent_heartbeats: BTreeSet::new(),
            previous_recv_heartbeats: BTreeSet::new(),
            streams_of_shard: AHashMap::new(),
            hb_timeout_list: TimeoutList::new(),
            closing: false,
        }
    }

    pub fn tcp_stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_inbound(&self) -> bool {
        self.is_inbound
    }

    pub fn stream_count(&self) -> usize {
        self.local_to_wire.len()
    }

    /// True if the socket has carried no streams for longer than `window`.
    pub fn is_without_streams_longer_than(&self, window: Duration) -> bool {
        match self.without_streams_since {
            Some(since) => since.elapsed() > window,
            None => false,
        }
    }

    /// Register a locally opened stream. The wire ID equals the local ID
    /// because the opener names the stream.
    pub fn open_stream(&mut self, local: StreamID) {
        debug_assert_ne!(local, CONTROL_STREAM);
        self.wire_to_local.insert(local, local);
        self.local_to_wire.insert(local, local);
        self.without_streams_since = None;
        self.hb_timeout_list.add(local);
    }

    /// Associate a local stream with a shard for heartbeat liveness.
    pub fn bind_stream_shard(&mut self, local: StreamID, shard: ShardID) {
        self.streams_of_shard.entry(shard).or_default().push(local);
    }

    /// Drop a stream without telling the peer (a goodbye message is the
    /// caller's business).
    pub fn close_stream(&mut self, local: StreamID) {
        if let Some(wire) = self.local_to_wire.remove(&local) {
            self.wire_to_local.remove(&wire);
        }
        self.hb_timeout_list.remove(&local);
        for streams in self.streams_of_shard.values_mut() {
            streams.retain(|s| *s != local);
        }
        if self.local_to_wire.is_empty() {
            self.without_streams_since = Some(Instant::now());
        }
    }

    /// Queue a message for a local stream. Returns whether the queue still
    /// has room; a false return is backpressure, not failure.
    pub fn write_message(&mut self, local: StreamID, message: &Message) -> Result<bool> {
        if self.closing {
            return Ok(false);
        }
        let wire = *self
            .local_to_wire
            .get(&local)
            .ok_or_else(|| Error::NotFound(format!("stream {}", local)))?;
        self.enqueue_frame(wire, message);
        Ok(self.send_queue.has_room())
    }

    fn write_control(&mut self, message: &Message) {
        self.enqueue_frame(CONTROL_STREAM, message);
    }

    fn enqueue_frame(&mut self, wire: StreamID, message: &Message) {
        let encoded = frame::encode_frame(self.protocol_version, wire, message);
        trace!(
            "queueing {:?} ({} bytes) for stream {} to {}",
            message.message_type(),
            encoded.len(),
            wire,
            self.peer
        );
        self.send_queue.push(Bytes::from(encoded));
    }

    pub fn has_room(&self) -> bool {
        self.send_queue.has_room()
    }

    /// True if there is pending output, i.e. the owner should keep write
    /// interest registered.
    pub fn wants_write(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Drain the send queue as far as the socket allows. Returns true when
    /// the queue is empty.
    pub fn flush_pending(&mut self) -> io::Result<bool> {
        while !self.send_queue.is_empty() {
            let mut bufs: Vec<IoSlice<'_>> = Vec::with_capacity(
                self.send_queue.chunks.len().min(MAX_IOVECS),
            );
            self.send_queue.fill_io_slices(&mut bufs);
            let written = match self.stream.write_vectored(&bufs) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ))
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            drop(bufs);
            self.send_queue.consume(written);
        }
        Ok(true)
    }

    /// Read everything the socket has, decode frames and surface events.
    /// Inbound streams unknown so far are given local IDs from `streams`.
    pub fn on_readable(
        &mut self,
        streams: &mut StreamAllocator,
        out: &mut Vec<WireEvent>,
    ) -> Result<()> {
        let mut buf = [0u8; 16384];
        let mut frames = Vec::new();
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(n) => {
                    frames.clear();
                    self.reader.feed(&buf[..n], &mut frames)?;
                    for (wire, message) in frames.drain(..) {
                        self.receive(wire, message, streams, out);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn receive(
        &mut self,
        wire: StreamID,
        message: Message,
        streams: &mut StreamAllocator,
        out: &mut Vec<WireEvent>,
    ) {
        if wire == CONTROL_STREAM {
            self.receive_control(message);
            return;
        }

        let local = match self.wire_to_local.get(&wire) {
            Some(local) => *local,
            None => {
                if let Message::Goodbye(_) = message {
                    // Goodbye for a stream we already forgot.
                    return;
                }
                // First message on a stream the peer just opened.
                let local = streams.next();
                self.wire_to_local.insert(wire, local);
                self.local_to_wire.insert(local, wire);
                self.without_streams_since = None;
                out.push(WireEvent::StreamOpened { stream: local });
                local
            }
        };

        // Any traffic on a stream proves it alive.
        self.hb_timeout_list.add(local);

        if let Message::Goodbye(goodbye) = &message {
            let code = goodbye.code;
            self.close_stream(local);
            out.push(WireEvent::StreamClosed {
                stream: local,
                code,
            });
            return;
        }

        out.push(WireEvent::Message {
            stream: local,
            message,
        });
    }

    fn receive_control(&mut self, message: Message) {
        match message {
            Message::Heartbeat(heartbeat) => {
                let set: BTreeSet<ShardID> = heartbeat.healthy_shards.iter().copied().collect();
                self.deliver_heartbeats(&set);
                self.previous_recv_heartbeats = set;
            }
            Message::HeartbeatDelta(delta) => {
                for shard in &delta.added_healthy {
                    self.previous_recv_heartbeats.insert(*shard);
                }
                for shard in &delta.removed_healthy {
                    self.previous_recv_heartbeats.remove(shard);
                }
                let set = self.previous_recv_heartbeats.clone();
                self.deliver_heartbeats(&set);
            }
            Message::Ping(ping) if ping.ping_type == PingType::Request => {
                self.write_control(&Message::Ping(MessagePing {
                    tenant_id: ping.tenant_id,
                    ping_type: PingType::Response,
                    cookie: ping.cookie,
                }));
            }
            Message::Ping(_) => {}
            other => {
                warn!(
                    "dropping {:?} on control stream from {}",
                    other.message_type(),
                    self.peer
                );
            }
        }
    }

    fn deliver_heartbeats(&mut self, shards: &BTreeSet<ShardID>) {
        for shard in shards {
            if let Some(streams) = self.streams_of_shard.get(shard) {
                for stream in streams.clone() {
                    self.hb_timeout_list.add(stream);
                }
            }
        }
    }

    /// Record a liveness tick for a shard; flushed in aggregate later.
    pub fn capture_heartbeat(&mut self, shard: ShardID) {
        self.captured_heartbeats.push(shard);
    }

    /// Emit one aggregated heartbeat covering all ticks captured since the
    /// previous flush.
    pub fn flush_captured_heartbeats(&mut self, timestamp_ms: u64) {
        let current: BTreeSet<ShardID> = self.captured_heartbeats.drain(..).collect();
        if current.is_empty() && self.previous_sent_heartbeats.is_empty() {
            return;
        }

        if self.use_heartbeat_deltas {
            let added: Vec<ShardID> = current
                .difference(&self.previous_sent_heartbeats)
                .copied()
                .collect();
            let removed: Vec<ShardID> = self
                .previous_sent_heartbeats
                .difference(&current)
                .copied()
                .collect();
            if !added.is_empty() || !removed.is_empty() {
                self.write_control(&Message::HeartbeatDelta(MessageHeartbeatDelta {
                    tenant_id: 0,
                    timestamp_ms,
                    added_healthy: added,
                    removed_healthy: removed,
                }));
            }
        } else {
            self.write_control(&Message::Heartbeat(MessageHeartbeat {
                tenant_id: 0,
                timestamp_ms,
                healthy_shards: current.iter().copied().collect(),
            }));
        }
        self.previous_sent_heartbeats = current;
    }

    /// Return streams that have been silent for longer than `timeout`.
    /// They are reported once per silence period and never closed here.
    pub fn check_heartbeats(&mut self, timeout: Duration) -> Vec<StreamID> {
        let mut unhealthy = Vec::new();
        self.hb_timeout_list
            .process_expired(timeout, |stream| unhealthy.push(stream));
        unhealthy
    }

    /// Close the socket. No goodbye reaches the peer; instead every local
    /// stream receives a synthetic one, returned as events for the owner.
    pub fn close(&mut self, reason: ClosureReason) -> Vec<WireEvent> {
        self.closing = true;
        let code = match reason {
            ClosureReason::Graceful => GoodbyeCode::Graceful,
            ClosureReason::Error => GoodbyeCode::SocketError,
        };
        let locals: Vec<StreamID> = self.local_to_wire.keys().copied().collect();
        let mut events = Vec::with_capacity(locals.len());
        for local in locals {
            self.close_stream(local);
            events.push(WireEvent::StreamClosed {
                stream: local,
                code,
            });
        }
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            debug!("shutdown of {} failed: {}", self.peer, e);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PROTOCOL_VERSION;
    use crate::message::{MessageGoodbye, OriginType};
    use crate::types::GUEST_TENANT;

    fn goodbye() -> Message {
        Message::Goodbye(MessageGoodbye {
            tenant_id: GUEST_TENANT,
            code: GoodbyeCode::Graceful,
            origin_type: OriginType::Client,
        })
    }

    #[test]
    fn test_frame_reader_handles_split_frames() {
        let frame_a = frame::encode_frame(PROTOCOL_VERSION, 7, &goodbye());
        let frame_b = frame::encode_frame(PROTOCOL_VERSION, 8, &goodbye());
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame_a);
        wire.extend_from_slice(&frame_b);

        // Feed one byte at a time; both frames must still come out whole.
        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        for byte in &wire {
            reader.feed(std::slice::from_ref(byte), &mut out).unwrap();
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0, 7);
        assert_eq!(out[1].0, 8);
    }

    #[test]
    fn test_frame_reader_rejects_bad_version() {
        let mut frame = frame::encode_frame(PROTOCOL_VERSION, 1, &goodbye());
        frame[0] = 0x42;
        let mut reader = FrameReader::new();
        let mut out = Vec::new();
        assert!(reader.feed(&frame, &mut out).is_err());
    }

    #[test]
    fn test_send_queue_partial_consume() {
        let mut queue = SendQueue::new();
        queue.push(Bytes::from_static(b"hello"));
        queue.push(Bytes::from_static(b"world"));
        assert_eq!(queue.queued_bytes, 10);

        queue.consume(3);
        let mut bufs = Vec::new();
        queue.fill_io_slices(&mut bufs);
        assert_eq!(&*bufs[0], b"lo");
        assert_eq!(&*bufs[1], b"world");

        queue.consume(7);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes, 0);
    }

    fn socket_pair() -> (SocketEvent, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = SocketEvent::connect(addr, PROTOCOL_VERSION, true).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (socket, accepted)
    }

    #[test]
    fn test_heartbeat_aggregation_deltas() {
        let (mut socket, _peer) = socket_pair();

        socket.capture_heartbeat(3);
        socket.capture_heartbeat(1);
        socket.capture_heartbeat(3);
        socket.flush_captured_heartbeats(1000);

        // One delta frame: everything added, nothing removed.
        assert_eq!(socket.send_queue.chunks.len(), 1);
        let body = &socket.send_queue.chunks[0][FRAME_HEADER_SIZE..];
        let (stream, message) = frame::decode_body(body).unwrap();
        assert_eq!(stream, CONTROL_STREAM);
        match message {
            Message::HeartbeatDelta(delta) => {
                assert_eq!(delta.added_healthy, vec![1, 3]);
                assert!(delta.removed_healthy.is_empty());
            }
            other => panic!("wrong message: {:?}", other),
        }

        // Next period: shard 3 went silent, shard 5 appeared.
        socket.capture_heartbeat(1);
        socket.capture_heartbeat(5);
        socket.flush_captured_heartbeats(2000);
        assert_eq!(socket.send_queue.chunks.len(), 2);
        let body = &socket.send_queue.chunks[1][FRAME_HEADER_SIZE..];
        let (_, message) = frame::decode_body(body).unwrap();
        match message {
            Message::HeartbeatDelta(delta) => {
                assert_eq!(delta.added_healthy, vec![5]);
                assert_eq!(delta.removed_healthy, vec![3]);
            }
            other => panic!("wrong message: {:?}", other),
        }

        // Unchanged set: no frame at all.
        socket.capture_heartbeat(1);
        socket.capture_heartbeat(5);
        socket.flush_captured_heartbeats(3000);
        assert_eq!(socket.send_queue.chunks.len(), 2);
    }

    #[test]
    fn test_close_synthesises_goodbyes() {
        let (mut socket, _peer) = socket_pair();
        socket.open_stream(10);
        socket.open_stream(11);

        let events = socket.close(ClosureReason::Error);
        assert_eq!(events.len(), 2);
        for event in events {
            match event {
                WireEvent::StreamClosed { code, .. } => {
                    assert_eq!(code, GoodbyeCode::SocketError)
                }
                other => panic!("wrong event: {:?}", other),
            }
        }
        assert_eq!(socket.stream_count(), 0);
        // Writes after close are dropped with no room reported.
        assert!(matches!(socket.write_message(10, &goodbye()), Ok(false)));
    }

    #[test]
    fn test_keepalive_window_tracking() {
        let (mut socket, _peer) = socket_pair();
        socket.open_stream(1);
        assert!(!socket.is_without_streams_longer_than(Duration::ZERO));
        socket.close_stream(1);
        std::thread::sleep(Duration::from_millis(2));
        assert!(socket.is_without_streams_longer_than(Duration::from_millis(1)));
    }
}
