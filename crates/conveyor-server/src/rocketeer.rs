//! Rocketeer server: the generic subscription endpoint.
//!
//! Applications implement [`Rocketeer`] to learn about subscriptions and
//! produce deliveries through the thread-safe [`RocketeerServer`] handle.
//! The communication layer owns the sockets, keeps one
//! `InboundSubscription` per (stream, subscription) and enforces seqno
//! monotonicity on deliveries and advances; reordered calls are dropped
//! and counted, never sent.
//!
//! One rocketeer is registered per worker; an acceptor thread hands fresh
//! connections out round-robin. `deliver`/`advance`/`terminate` enqueue
//! onto the owning worker's bounded queue and report overflow by
//! returning false.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use bytes::Bytes;
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use conveyor_core::event_loop::{EventLoop, LoopEvent, LoopHandle};
use conveyor_core::frame::PROTOCOL_VERSION;
use conveyor_core::socket::{ClosureReason, SocketEvent, WireEvent};
use conveyor_core::stream::StreamAllocator;
use conveyor_core::{
    Cursor, GapType, Message, MessageDeliverData, MessageDeliverGap, MessageSubAck,
    MessageSubscribe, MessageUnsubscribe, MsgId, NamespaceID, SequenceNumber, ShardID, StreamID,
    SubscriptionID, SubscriptionParameters, TenantID, Topic, UnsubscribeReason,
};

use crate::error::{Result, ServerError};
use crate::options::RocketeerOptions;

/// Names an inbound subscription: stream, subscription and owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InboundID {
    pub stream: StreamID,
    pub sub_id: SubscriptionID,
    pub worker_id: usize,
}

/// Which side ended a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSource {
    /// The subscriber unsubscribed or its connection went away.
    Subscriber,
    /// The application terminated it via the server handle.
    Rocketeer,
}

/// Application-defined producer of deliveries.
///
/// Callbacks run on the worker thread owning the subscription; they must
/// not block. Deliveries are produced through the server handle, which is
/// safe to call from anywhere, including from inside these callbacks.
pub trait Rocketeer: Send + Sync {
    fn handle_new_subscription(&mut self, inbound_id: InboundID, parameters: SubscriptionParameters);

    fn handle_termination(&mut self, inbound_id: InboundID, source: TerminationSource);
}

/// Server-side counters.
#[derive(Default)]
pub struct RocketeerStats {
    pub subscribes: AtomicU64,
    pub unsubscribes: AtomicU64,
    pub terminations: AtomicU64,
    pub inbound_subscriptions: AtomicU64,
    pub dropped_reordered: AtomicU64,
}

struct InboundSubscription {
    tenant_id: TenantID,
    /// Seqno of the last delivery; deliveries must exceed it.
    prev_seqno: SequenceNumber,
    namespace_id: NamespaceID,
    topic: Topic,
}

enum ServerCommand {
    Deliver {
        inbound: InboundID,
        seqno: SequenceNumber,
        payload: Bytes,
        msg_id: MsgId,
    },
    Advance {
        inbound: InboundID,
        seqno: SequenceNumber,
    },
    Terminate {
        inbound: InboundID,
        reason: UnsubscribeReason,
    },
    NewConnection {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Stop,
}

struct AcceptorHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// The subscription server.
pub struct RocketeerServer {
    options: RocketeerOptions,
    /// Rocketeers registered before start, one per worker.
    rocketeers: Vec<Box<dyn Rocketeer>>,
    workers: Vec<LoopHandle<ServerCommand>>,
    worker_joins: Vec<JoinHandle<()>>,
    acceptor: Option<AcceptorHandle>,
    local_addr: Option<SocketAddr>,
    stats: Arc<RocketeerStats>,
}

impl RocketeerServer {
    pub fn new(options: RocketeerOptions) -> Self {
        Self {
            options,
            rocketeers: Vec::new(),
            workers: Vec::new(),
            worker_joins: Vec::new(),
            acceptor: None,
            local_addr: None,
            stats: Arc::new(RocketeerStats::default()),
        }
    }

    /// Register the rocketeer for the next worker. Must happen before
    /// `start`; returns the worker index it will run on.
    pub fn register(&mut self, rocketeer: Box<dyn Rocketeer>) -> usize {
        debug_assert!(self.workers.is_empty(), "register before start");
        self.rocketeers.push(rocketeer);
        self.rocketeers.len() - 1
    }

    /// Bind the listener and bring up the workers.
    pub fn start(&mut self) -> Result<()> {
        if self.rocketeers.is_empty() {
            return Err(ServerError::NotInitialized("no rocketeers registered"));
        }
        if !self.workers.is_empty() {
            return Err(ServerError::NotInitialized("already started"));
        }

        let mut listener = TcpListener::bind(self.options.listen)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let num_workers = self.rocketeers.len();
        let allocators = StreamAllocator::new().divide(num_workers);
        let rocketeers: Vec<Box<dyn Rocketeer>> = self.rocketeers.drain(..).collect();
        for ((index, rocketeer), streams) in
            rocketeers.into_iter().enumerate().zip(allocators)
        {
            let event_loop = EventLoop::new(self.options.queue_size, self.options.tick_interval)?;
            self.workers.push(event_loop.handle());
            let worker = ServerWorker {
                index,
                options: self.options.clone(),
                event_loop,
                streams,
                sockets: AHashMap::new(),
                stream_to_token: AHashMap::new(),
                token_streams: AHashMap::new(),
                stream_shards: AHashMap::new(),
                inbound: AHashMap::new(),
                rocketeer,
                stats: self.stats.clone(),
                last_heartbeat_flush: Instant::now(),
            };
            let join = thread::Builder::new()
                .name(format!("conveyor-rocketeer-{}", index))
                .spawn(move || worker.run())?;
            self.worker_joins.push(join);
        }

        // Acceptor: distributes fresh connections round-robin.
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let worker_handles = self.workers.clone();
        let join = thread::Builder::new()
            .name("conveyor-acceptor".to_string())
            .spawn(move || {
                const LISTENER: Token = Token(0);
                let mut poll = match Poll::new() {
                    Ok(poll) => poll,
                    Err(e) => {
                        error!("acceptor poll failed: {}", e);
                        return;
                    }
                };
                if let Err(e) =
                    poll.registry()
                        .register(&mut listener, LISTENER, Interest::READABLE)
                {
                    error!("acceptor register failed: {}", e);
                    return;
                }
                let mut events = Events::with_capacity(64);
                let mut next_worker = 0usize;
                info!("rocketeer server listening on {}", local_addr);
                while !shutdown_clone.load(Ordering::SeqCst) {
                    if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(100))) {
                        if e.kind() != std::io::ErrorKind::Interrupted {
                            error!("acceptor poll failed: {}", e);
                            return;
                        }
                    }
                    loop {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                let handle = &worker_handles[next_worker % worker_handles.len()];
                                next_worker += 1;
                                if !handle.send(ServerCommand::NewConnection { stream, peer }) {
                                    warn!("worker queue full, dropping connection from {}", peer);
                                }
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                warn!("accept failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            })?;
        self.acceptor = Some(AcceptorHandle {
            shutdown,
            join: Some(join),
        });
        Ok(())
    }

    /// Address the server is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Deliver a record on an inbound subscription. Returns false when
    /// the owning worker's queue is full; retry after backing off.
    pub fn deliver(&self, inbound: InboundID, seqno: SequenceNumber, payload: Bytes) -> bool {
        self.deliver_with_id(inbound, seqno, payload, MsgId::default())
    }

    pub fn deliver_with_id(
        &self,
        inbound: InboundID,
        seqno: SequenceNumber,
        payload: Bytes,
        msg_id: MsgId,
    ) -> bool {
        match self.workers.get(inbound.worker_id) {
            Some(handle) => handle.send(ServerCommand::Deliver {
                inbound,
                seqno,
                payload,
                msg_id,
            }),
            None => false,
        }
    }

    /// Advance a subscription past a seqno range without data; the
    /// subscriber sees a benign gap.
    pub fn advance(&self, inbound: InboundID, seqno: SequenceNumber) -> bool {
        match self.workers.get(inbound.worker_id) {
            Some(handle) => handle.send(ServerCommand::Advance { inbound, seqno }),
            None => false,
        }
    }

    /// Terminate an inbound subscription with the given reason.
    pub fn terminate(&self, inbound: InboundID, reason: UnsubscribeReason) -> bool {
        match self.workers.get(inbound.worker_id) {
            Some(handle) => handle.send(ServerCommand::Terminate { inbound, reason }),
            None => false,
        }
    }

    pub fn stats(&self) -> Arc<RocketeerStats> {
        self.stats.clone()
    }

    /// Stop the acceptor and every worker. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.shutdown.store(true, Ordering::SeqCst);
            if let Some(join) = acceptor.join.take() {
                let _ = join.join();
            }
        }
        for handle in &self.workers {
            for _ in 0..64 {
                if handle.send(ServerCommand::Stop) {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        for join in self.worker_joins.drain(..) {
            let _ = join.join();
        }
        self.workers.clear();
    }
}

impl Drop for RocketeerServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One worker: event loop, inbound sockets and their subscriptions.
struct ServerWorker {
    index: usize,
    options: RocketeerOptions,
    event_loop: EventLoop<ServerCommand>,
    streams: StreamAllocator,
    sockets: AHashMap<Token, SocketEvent>,
    stream_to_token: AHashMap<StreamID, Token>,
    token_streams: AHashMap<Token, Vec<StreamID>>,
    /// Shard a stream declared in its introduction, for heartbeats.
    stream_shards: AHashMap<StreamID, ShardID>,
    inbound: AHashMap<StreamID, AHashMap<SubscriptionID, InboundSubscription>>,
    rocketeer: Box<dyn Rocketeer>,
    stats: Arc<RocketeerStats>,
    last_heartbeat_flush: Instant,
}

impl ServerWorker {
    fn run(mut self) {
        let mut events = Vec::new();
        'outer: loop {
            events.clear();
            if let Err(e) = self.event_loop.poll_once(&mut events) {
                error!("rocketeer worker {} poll failed: {}", self.index, e);
                break;
            }
            for event in events.drain(..) {
                match event {
                    LoopEvent::Readable(token) => self.on_readable(token),
                    LoopEvent::Writable(token) => self.flush(token),
                    LoopEvent::Closed(token) => self.close_socket(token, ClosureReason::Error),
                    LoopEvent::Tick => self.tick(),
                    LoopEvent::Command(command) => match command {
                        ServerCommand::NewConnection { stream, peer } => {
                            self.accept(stream, peer)
                        }
                        ServerCommand::Deliver {
                            inbound,
                            seqno,
                            payload,
                            msg_id,
                        } => self.deliver(inbound, seqno, payload, msg_id),
                        ServerCommand::Advance { inbound, seqno } => {
                            self.advance(inbound, seqno)
                        }
                        ServerCommand::Terminate { inbound, reason } => {
                            self.terminate(inbound, reason)
                        }
                        ServerCommand::Stop => break 'outer,
                    },
                }
            }
        }
        debug!("rocketeer worker {} stopped", self.index);
    }

    fn accept(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let token = self.event_loop.next_token();
        if let Err(e) = self.event_loop.register_read(&mut stream, token) {
            warn!("worker {}: register of {} failed: {}", self.index, peer, e);
            return;
        }
        let socket = SocketEvent::from_accepted(stream, peer, PROTOCOL_VERSION, true);
        self.sockets.insert(token, socket);
        debug!("worker {}: accepted {}", self.index, peer);
    }

    fn on_readable(&mut self, token: Token) {
        let mut events = Vec::new();
        let failed = match self.sockets.get_mut(&token) {
            Some(socket) => socket.on_readable(&mut self.streams, &mut events).is_err(),
            None => return,
        };
        for event in events {
            self.handle_wire_event(token, event);
        }
        if failed {
            self.close_socket(token, ClosureReason::Error);
        } else {
            self.flush(token);
        }
    }

    fn handle_wire_event(&mut self, token: Token, event: WireEvent) {
        match event {
            WireEvent::StreamOpened { stream } => {
                self.stream_to_token.insert(stream, token);
                self.token_streams.entry(token).or_default().push(stream);
            }
            WireEvent::Message { stream, message } => match message {
                Message::Subscribe(subscribe) => self.handle_subscribe(stream, subscribe),
                Message::Unsubscribe(unsubscribe) => {
                    self.handle_unsubscribe(stream, unsubscribe)
                }
                Message::Introduction(introduction) => {
                    let shard = introduction
                        .stream_properties
                        .iter()
                        .find(|(key, _)| &key[..] == b"shard")
                        .and_then(|(_, value)| std::str::from_utf8(value).ok())
                        .and_then(|value| value.parse::<ShardID>().ok());
                    if let Some(shard) = shard {
                        self.stream_shards.insert(stream, shard);
                        if let Some(socket) = self.sockets.get_mut(&token) {
                            socket.bind_stream_shard(stream, shard);
                        }
                    }
                }
                other => {
                    debug!(
                        "worker {}: ignoring {:?} on stream {}",
                        self.index,
                        other.message_type(),
                        stream
                    );
                }
            },
            WireEvent::StreamClosed { stream, .. } => self.stream_closed(stream),
        }
    }

    fn handle_subscribe(&mut self, stream: StreamID, subscribe: MessageSubscribe) {
        let start_seqno = subscribe.start.first().map(|c| c.seqno).unwrap_or(0);
        let subscriptions = self.inbound.entry(stream).or_default();
        if subscriptions.contains_key(&subscribe.sub_id) {
            warn!(
                "worker {}: duplicate subscription {} on stream {}",
                self.index, subscribe.sub_id, stream
            );
            return;
        }
        subscriptions.insert(
            subscribe.sub_id,
            InboundSubscription {
                tenant_id: subscribe.tenant_id,
                prev_seqno: if start_seqno == 0 { 0 } else { start_seqno - 1 },
                namespace_id: subscribe.namespace_id.clone(),
                topic: subscribe.topic.clone(),
            },
        );
        self.stats.subscribes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .inbound_subscriptions
            .fetch_add(1, Ordering::Relaxed);

        let ack = Message::SubAck(MessageSubAck {
            tenant_id: subscribe.tenant_id,
            namespace_id: subscribe.namespace_id.clone(),
            topic: subscribe.topic.clone(),
            sub_id: subscribe.sub_id,
            cursors: vec![Cursor::new(Bytes::new(), start_seqno)],
        });
        self.send_on_stream(stream, &ack);

        self.rocketeer.handle_new_subscription(
            InboundID {
                stream,
                sub_id: subscribe.sub_id,
                worker_id: self.index,
            },
            SubscriptionParameters {
                tenant_id: subscribe.tenant_id,
                namespace_id: subscribe.namespace_id,
                topic: subscribe.topic,
                start_seqno,
            },
        );
    }

    fn handle_unsubscribe(&mut self, stream: StreamID, unsubscribe: MessageUnsubscribe) {
        let removed = self
            .inbound
            .get_mut(&stream)
            .and_then(|subscriptions| subscriptions.remove(&unsubscribe.sub_id));
        if removed.is_none() {
            warn!(
                "worker {}: unsubscribe for missing subscription {} on stream {}",
                self.index, unsubscribe.sub_id, stream
            );
            return;
        }
        if self
            .inbound
            .get(&stream)
            .map(|subscriptions| subscriptions.is_empty())
            .unwrap_or(false)
        {
            self.inbound.remove(&stream);
        }
        self.stats.unsubscribes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .inbound_subscriptions
            .fetch_sub(1, Ordering::Relaxed);
        self.rocketeer.handle_termination(
            InboundID {
                stream,
                sub_id: unsubscribe.sub_id,
                worker_id: self.index,
            },
            TerminationSource::Subscriber,
        );
    }

    fn stream_closed(&mut self, stream: StreamID) {
        if let Some(subscriptions) = self.inbound.remove(&stream) {
            for (sub_id, _) in subscriptions {
                self.stats.unsubscribes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .inbound_subscriptions
                    .fetch_sub(1, Ordering::Relaxed);
                self.rocketeer.handle_termination(
                    InboundID {
                        stream,
                        sub_id,
                        worker_id: self.index,
                    },
                    TerminationSource::Subscriber,
                );
            }
        }
        if let Some(token) = self.stream_to_token.remove(&stream) {
            if let Some(streams) = self.token_streams.get_mut(&token) {
                streams.retain(|s| *s != stream);
            }
        }
        self.stream_shards.remove(&stream);
    }

    fn deliver(
        &mut self,
        inbound: InboundID,
        seqno: SequenceNumber,
        payload: Bytes,
        msg_id: MsgId,
    ) {
        let Some(sub) = self
            .inbound
            .get_mut(&inbound.stream)
            .and_then(|subscriptions| subscriptions.get_mut(&inbound.sub_id))
        else {
            warn!(
                "worker {}: deliver on missing subscription {} (stream {})",
                self.index, inbound.sub_id, inbound.stream
            );
            return;
        };
        if sub.prev_seqno >= seqno {
            self.stats.dropped_reordered.fetch_add(1, Ordering::Relaxed);
            warn!(
                "worker {}: attempted to deliver at {}, but subscription has previous seqno {}",
                self.index, seqno, sub.prev_seqno
            );
            return;
        }
        let msg_id = if msg_id.is_empty() {
            MsgId(rand::random())
        } else {
            msg_id
        };
        let message = Message::DeliverData(MessageDeliverData {
            tenant_id: sub.tenant_id,
            sub_id: inbound.sub_id,
            prev_seqno: sub.prev_seqno,
            seqno,
            msg_id,
            payload,
            namespace_id: sub.namespace_id.clone(),
            topic: sub.topic.clone(),
            source: Bytes::new(),
        });
        sub.prev_seqno = seqno;
        self.send_on_stream(inbound.stream, &message);
    }

    fn advance(&mut self, inbound: InboundID, seqno: SequenceNumber) {
        let Some(sub) = self
            .inbound
            .get_mut(&inbound.stream)
            .and_then(|subscriptions| subscriptions.get_mut(&inbound.sub_id))
        else {
            warn!(
                "worker {}: advance on missing subscription {} (stream {})",
                self.index, inbound.sub_id, inbound.stream
            );
            return;
        };
        if sub.prev_seqno >= seqno {
            self.stats.dropped_reordered.fetch_add(1, Ordering::Relaxed);
            warn!(
                "worker {}: attempted to advance to {}, but subscription has previous seqno {}",
                self.index, seqno, sub.prev_seqno
            );
            return;
        }
        let message = Message::DeliverGap(MessageDeliverGap {
            tenant_id: sub.tenant_id,
            sub_id: inbound.sub_id,
            prev_seqno: sub.prev_seqno,
            seqno,
            gap_type: GapType::Benign,
            namespace_id: sub.namespace_id.clone(),
            topic: sub.topic.clone(),
            source: Bytes::new(),
        });
        sub.prev_seqno = seqno;
        self.send_on_stream(inbound.stream, &message);
    }

    fn terminate(&mut self, inbound: InboundID, reason: UnsubscribeReason) {
        let Some(sub) = self
            .inbound
            .get_mut(&inbound.stream)
            .and_then(|subscriptions| subscriptions.remove(&inbound.sub_id))
        else {
            warn!(
                "worker {}: terminate of missing subscription {} (stream {})",
                self.index, inbound.sub_id, inbound.stream
            );
            return;
        };
        self.stats.terminations.fetch_add(1, Ordering::Relaxed);
        self.stats
            .inbound_subscriptions
            .fetch_sub(1, Ordering::Relaxed);
        self.rocketeer
            .handle_termination(inbound, TerminationSource::Rocketeer);
        let message = Message::Unsubscribe(MessageUnsubscribe {
            tenant_id: sub.tenant_id,
            sub_id: inbound.sub_id,
            reason,
            namespace_id: sub.namespace_id,
            topic: sub.topic,
        });
        self.send_on_stream(inbound.stream, &message);
    }

    fn send_on_stream(&mut self, stream: StreamID, message: &Message) -> bool {
        let Some(&token) = self.stream_to_token.get(&stream) else {
            debug!("worker {}: no socket for stream {}", self.index, stream);
            return false;
        };
        let has_room = match self.sockets.get_mut(&token) {
            Some(socket) => match socket.write_message(stream, message) {
                Ok(has_room) => has_room,
                Err(e) => {
                    debug!("worker {}: write failed: {}", self.index, e);
                    false
                }
            },
            None => return false,
        };
        self.flush(token);
        has_room
    }

    fn flush(&mut self, token: Token) {
        let result = match self.sockets.get_mut(&token) {
            Some(socket) => {
                let result = socket.flush_pending();
                if let Ok(drained) = &result {
                    let _ = self.event_loop.set_write_interest(
                        socket.tcp_stream_mut(),
                        token,
                        !*drained,
                    );
                }
                result
            }
            None => return,
        };
        if let Err(e) = result {
            debug!("worker {}: flush failed: {}", self.index, e);
            self.close_socket(token, ClosureReason::Error);
        }
    }

    fn close_socket(&mut self, token: Token, reason: ClosureReason) {
        let Some(mut socket) = self.sockets.remove(&token) else {
            return;
        };
        let _ = self.event_loop.registry().deregister(socket.tcp_stream_mut());
        let events = socket.close(reason);
        for event in events {
            if let WireEvent::StreamClosed { stream, .. } = event {
                self.stream_closed(stream);
            }
        }
        self.token_streams.remove(&token);
        debug!("worker {}: closed {}", self.index, socket.peer());
    }

    fn tick(&mut self) {
        if self.last_heartbeat_flush.elapsed() >= self.options.heartbeat_period {
            self.last_heartbeat_flush = Instant::now();
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            for (token, streams) in self.token_streams.iter() {
                let Some(socket) = self.sockets.get_mut(token) else {
                    continue;
                };
                for stream in streams {
                    if let Some(&shard) = self.stream_shards.get(stream) {
                        socket.capture_heartbeat(shard);
                    }
                }
                socket.flush_captured_heartbeats(now_ms);
                let unhealthy = socket.check_heartbeats(self.options.heartbeat_timeout);
                if !unhealthy.is_empty() {
                    warn!(
                        "worker {}: {} stream(s) without heartbeat on {}",
                        self.index,
                        unhealthy.len(),
                        socket.peer()
                    );
                }
            }
        }

        // Reap sockets that have carried no streams for too long.
        let idle: Vec<Token> = self
            .sockets
            .iter()
            .filter(|(_, socket)| {
                socket.stream_count() == 0
                    && socket.is_without_streams_longer_than(
                        self.options.connection_without_streams_keepalive,
                    )
            })
            .map(|(&token, _)| token)
            .collect();
        for token in idle {
            info!("worker {}: closing idle connection", self.index);
            self.close_socket(token, ClosureReason::Graceful);
        }

        let tokens: Vec<Token> = self.sockets.keys().copied().collect();
        for token in tokens {
            self.flush(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::frame::{self, FRAME_HEADER_SIZE};
    use parking_lot::Mutex;
    use std::io::{Read, Write};

    #[derive(Debug)]
    enum AppEvent {
        New(InboundID, SequenceNumber),
        Terminated(InboundID, TerminationSource),
    }

    struct RecordingRocketeer {
        events: Arc<Mutex<Vec<AppEvent>>>,
    }

    impl Rocketeer for RecordingRocketeer {
        fn handle_new_subscription(
            &mut self,
            inbound_id: InboundID,
            parameters: SubscriptionParameters,
        ) {
            self.events
                .lock()
                .push(AppEvent::New(inbound_id, parameters.start_seqno));
        }

        fn handle_termination(&mut self, inbound_id: InboundID, source: TerminationSource) {
            self.events.lock().push(AppEvent::Terminated(inbound_id, source));
        }
    }

    fn read_frame(stream: &mut std::net::TcpStream) -> (StreamID, Message) {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header).unwrap();
        let header = frame::decode_header(&header).unwrap();
        let mut body = vec![0u8; header.body_len];
        stream.read_exact(&mut body).unwrap();
        frame::decode_body(&body).unwrap()
    }

    fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
        for _ in 0..500 {
            if let Some(value) = probe() {
                return value;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for condition");
    }

    #[test]
    fn test_subscribe_deliver_terminate_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let events: Arc<Mutex<Vec<AppEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let mut server = RocketeerServer::new(RocketeerOptions {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..RocketeerOptions::default()
        });
        server.register(Box::new(RecordingRocketeer {
            events: events.clone(),
        }));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // Subscribe on stream 1 starting at seqno 1.
        let subscribe = Message::Subscribe(MessageSubscribe {
            tenant_id: 102,
            namespace_id: Bytes::from_static(b"102"),
            topic: Bytes::from_static(b"test_topic"),
            sub_id: 7,
            start: vec![Cursor::new(Bytes::new(), 1)],
        });
        client
            .write_all(&frame::encode_frame(PROTOCOL_VERSION, 1, &subscribe))
            .unwrap();

        // The subscription is acknowledged.
        let (stream, message) = read_frame(&mut client);
        assert_eq!(stream, 1);
        match message {
            Message::SubAck(ack) => assert_eq!(ack.sub_id, 7),
            other => panic!("wrong message: {:?}", other),
        }

        // The application saw the subscription.
        let inbound = wait_for(|| {
            events.lock().iter().find_map(|event| match event {
                AppEvent::New(inbound, start) => {
                    assert_eq!(*start, 1);
                    Some(*inbound)
                }
                _ => None,
            })
        });
        assert_eq!(inbound.sub_id, 7);

        // Deliver seqno 2, then a reordered seqno 1 which must be
        // dropped, then terminate.
        assert!(server.deliver(inbound, 2, Bytes::from_static(b"second")));
        assert!(server.deliver(inbound, 1, Bytes::from_static(b"first")));
        assert!(server.terminate(inbound, UnsubscribeReason::Requested));

        let (_, message) = read_frame(&mut client);
        match message {
            Message::DeliverData(deliver) => {
                assert_eq!(deliver.prev_seqno, 0);
                assert_eq!(deliver.seqno, 2);
                assert_eq!(&deliver.payload[..], b"second");
            }
            other => panic!("wrong message: {:?}", other),
        }

        // The reordered delivery never made it onto the wire; the next
        // frame is already the unsubscribe.
        let (_, message) = read_frame(&mut client);
        match message {
            Message::Unsubscribe(unsubscribe) => {
                assert_eq!(unsubscribe.sub_id, 7);
                assert_eq!(unsubscribe.reason, UnsubscribeReason::Requested);
            }
            other => panic!("wrong message: {:?}", other),
        }
        assert_eq!(server.stats().dropped_reordered.load(Ordering::Relaxed), 1);

        wait_for(|| {
            events
                .lock()
                .iter()
                .any(|event| {
                    matches!(event, AppEvent::Terminated(_, TerminationSource::Rocketeer))
                })
                .then_some(())
        });

        server.stop();
    }

    #[test]
    fn test_connection_drop_terminates_subscriptions() {
        let events: Arc<Mutex<Vec<AppEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let mut server = RocketeerServer::new(RocketeerOptions {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..RocketeerOptions::default()
        });
        server.register(Box::new(RecordingRocketeer {
            events: events.clone(),
        }));
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let subscribe = Message::Subscribe(MessageSubscribe {
            tenant_id: 1,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            sub_id: 3,
            start: vec![Cursor::new(Bytes::new(), 0)],
        });
        client
            .write_all(&frame::encode_frame(PROTOCOL_VERSION, 1, &subscribe))
            .unwrap();

        wait_for(|| {
            events
                .lock()
                .iter()
                .any(|event| matches!(event, AppEvent::New(_, 0)))
                .then_some(())
        });

        // Dropping the connection terminates the subscription with the
        // subscriber as the source.
        drop(client);
        wait_for(|| {
            events
                .lock()
                .iter()
                .any(|event| {
                    matches!(
                        event,
                        AppEvent::Terminated(_, TerminationSource::Subscriber)
                    )
                })
                .then_some(())
        });
        server.stop();
    }
}
