//! Single-shard subscriber: one server connection, its subscriptions,
//! reconnection and resubscription.
//!
//! The subscriber owns the socket to the server currently hosting its
//! shard. Subscriptions to establish sit in a pending set that drains
//! while the stream has room. On connection loss every subscription goes
//! back to pending and a reconnect is scheduled with exponential backoff;
//! on reconnect each subscription resubscribes from its last acknowledged
//! seqno plus one, or from its original start point if nothing was acked.
//! Duplicate deliveries after a reconnect are dropped by the per
//! subscription acceptance policy.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use log::{debug, info, warn};
use mio::{Interest, Registry, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use conveyor_core::frame::PROTOCOL_VERSION;
use conveyor_core::socket::{ClosureReason, SocketEvent, WireEvent};
use conveyor_core::stream::StreamAllocator;
use conveyor_core::timeout_list::TimeoutList;
use conveyor_core::{
    Cursor, Message, MessageIntroduction, MessageSubscribe, MessageUnsubscribe, NamespaceID,
    SequenceNumber, ShardID, StreamID, SubscriptionID, SubscriptionParameters, Topic,
    UnsubscribeReason, GUEST_TENANT,
};

use crate::config::{ClientConfig, RateLimitConfig};
use crate::flyweight::FlyweightFactory;
use crate::observer::{Observer, TerminationReason};
use crate::snapshot::SubscriptionRecord;
use crate::stats::SubscriberStats;
use crate::subscription::{DeliverPayload, ReceiveOutcome, SubscriptionState};

/// Allocates mio tokens for a worker's sockets.
pub struct TokenAllocator {
    next: usize,
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next(&mut self) -> Token {
        let token = Token(self.next);
        self.next += 1;
        token
    }
}

impl Default for TokenAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-owned resources a subscriber needs to touch sockets.
pub struct SubscriberContext<'a> {
    pub registry: &'a Registry,
    pub streams: &'a mut StreamAllocator,
    pub tokens: &'a mut TokenAllocator,
}

/// The interface shared by all subscriber layers.
///
/// A common interface keeps the collapsing overlay and the multi-shard
/// dispatcher independent of each other and testable in isolation.
pub trait SubscriberIf: Send {
    /// Establish a subscription; data, gaps and termination reach the
    /// observer.
    fn start_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
        parameters: SubscriptionParameters,
        observer: Box<dyn Observer>,
    );

    /// Mark `seqno` acknowledged; resubscription resumes after it.
    fn acknowledge(&mut self, sub_id: SubscriptionID, seqno: SequenceNumber);

    /// Terminate a previously established subscription.
    fn terminate_subscription(&mut self, ctx: &mut SubscriberContext<'_>, sub_id: SubscriptionID);

    /// True iff no subscriptions remain.
    fn is_empty(&self) -> bool;

    /// Append one record per active subscription to `out`.
    fn save_state(&self, out: &mut Vec<SubscriptionRecord>);

    /// Token of the server socket, if connected.
    fn socket_token(&self) -> Option<Token>;

    fn on_readable(&mut self, ctx: &mut SubscriberContext<'_>);

    fn on_writable(&mut self, ctx: &mut SubscriberContext<'_>);

    fn on_socket_closed(&mut self, ctx: &mut SubscriberContext<'_>);

    fn tick(&mut self, ctx: &mut SubscriberContext<'_>);

    /// Subscriptions the server terminated since the last call; the
    /// caller drops its bookkeeping for them.
    fn drain_removed(&mut self) -> Vec<SubscriptionID>;

    /// Graceful teardown of the server connection before drop.
    fn shutdown(&mut self, ctx: &mut SubscriberContext<'_>);
}

/// FIFO set of subscriptions awaiting a subscribe message.
struct PendingSet {
    queue: VecDeque<SubscriptionID>,
    members: AHashSet<SubscriptionID>,
}

impl PendingSet {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            members: AHashSet::new(),
        }
    }

    fn add(&mut self, sub_id: SubscriptionID) {
        if self.members.insert(sub_id) {
            self.queue.push_back(sub_id);
        }
    }

    fn pop(&mut self) -> Option<SubscriptionID> {
        while let Some(sub_id) = self.queue.pop_front() {
            if self.members.remove(&sub_id) {
                return Some(sub_id);
            }
        }
        None
    }

    fn remove(&mut self, sub_id: &SubscriptionID) {
        self.members.remove(sub_id);
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Token bucket guarding outgoing subscribe messages.
struct RateLimiter {
    tokens: f64,
    rate: f64,
    burst: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            rate: config.tokens_per_second,
            burst: config.burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The connection to the server currently hosting the shard.
struct ServerStream {
    socket: SocketEvent,
    token: Token,
    stream: StreamID,
    /// False until the first writable event; nothing flushes before that.
    connected: bool,
}

/// A subscriber managing subscriptions on a single shard.
pub struct Subscriber {
    config: Arc<ClientConfig>,
    client_id: String,
    shard: ShardID,
    router: Arc<dyn crate::router::SubscriptionRouter>,
    stats: Arc<SubscriberStats>,
    flyweights: FlyweightFactory,

    subscriptions: AHashMap<SubscriptionID, SubscriptionState>,
    /// Seqno at the last acknowledge, kept separately so persisted state
    /// resumes after the last processed message rather than the last
    /// delivered one.
    last_acks: AHashMap<SubscriptionID, SequenceNumber>,
    pending_subscriptions: PendingSet,
    /// Recently terminated subscriptions, for deduplicating the
    /// unsubscribe we send back when deliveries keep arriving.
    recent_terminations: TimeoutList<SubscriptionID>,
    /// Server-terminated subscriptions not yet reaped by the layer above.
    server_removals: Vec<(SubscriptionID, NamespaceID, Topic)>,

    server: Option<ServerStream>,
    backoff_until: Option<Instant>,
    consecutive_goodbyes: u32,
    last_router_version: u64,
    rate_limiter: Option<RateLimiter>,
    rng: StdRng,
    last_heartbeat_flush: Instant,
}

impl Subscriber {
    pub fn new(
        config: Arc<ClientConfig>,
        client_id: String,
        shard: ShardID,
        router: Arc<dyn crate::router::SubscriptionRouter>,
        stats: Arc<SubscriberStats>,
        flyweights: FlyweightFactory,
    ) -> Self {
        let rate_limiter = config.subscription_rate_limit.as_ref().map(RateLimiter::new);
        let last_router_version = router.version();
        Self {
            config,
            client_id,
            shard,
            router,
            stats,
            flyweights,
            subscriptions: AHashMap::new(),
            last_acks: AHashMap::new(),
            pending_subscriptions: PendingSet::new(),
            recent_terminations: TimeoutList::new(),
            server_removals: Vec::new(),
            server: None,
            backoff_until: None,
            consecutive_goodbyes: 0,
            last_router_version,
            rate_limiter,
            rng: StdRng::from_entropy(),
            last_heartbeat_flush: Instant::now(),
        }
    }

    /// Key of a live subscription, for the topic map above this layer.
    pub(crate) fn subscription_key(
        &self,
        sub_id: SubscriptionID,
    ) -> Option<(NamespaceID, Topic)> {
        self.subscriptions
            .get(&sub_id)
            .map(|state| (state.namespace_id().clone(), state.topic().clone()))
    }

    /// Seqno a (re)subscribe message should ask for.
    fn subscribe_seqno(&self, sub_id: SubscriptionID, state: &SubscriptionState) -> SequenceNumber {
        self.last_acks
            .get(&sub_id)
            .map(|acked| acked + 1)
            .unwrap_or_else(|| state.start_seqno())
    }

    fn process_pending(&mut self, ctx: &mut SubscriberContext<'_>) {
        if self.pending_subscriptions.is_empty() {
            return;
        }
        if let Some(until) = self.backoff_until {
            if Instant::now() < until {
                return;
            }
            self.backoff_until = None;
        }
        if self.server.is_none() {
            self.restore_server_stream(ctx);
        }

        loop {
            let has_room = match self.server.as_ref() {
                Some(server) => server.socket.has_room(),
                None => return,
            };
            if !has_room {
                break;
            }
            if let Some(limiter) = self.rate_limiter.as_mut() {
                if !limiter.try_acquire() {
                    break;
                }
            }
            let Some(sub_id) = self.pending_subscriptions.pop() else {
                break;
            };
            let Some(state) = self.subscriptions.get(&sub_id) else {
                continue;
            };
            let message = Message::Subscribe(MessageSubscribe {
                tenant_id: state.tenant(),
                namespace_id: state.namespace_id().clone(),
                topic: state.topic().clone(),
                sub_id,
                start: vec![Cursor::new(Bytes::new(), self.subscribe_seqno(sub_id, state))],
            });
            let server = self.server.as_mut().expect("checked above");
            if let Err(e) = server.socket.write_message(server.stream, &message) {
                warn!("shard {}: failed to queue subscribe: {}", self.shard, e);
            }
        }
        self.flush(ctx);
    }

    fn restore_server_stream(&mut self, ctx: &mut SubscriberContext<'_>) {
        let version = self.router.version();
        let Some(host) = self.router.host_for(self.shard) else {
            debug!("shard {}: no server in routing config", self.shard);
            self.schedule_reconnect();
            return;
        };
        let addr: Option<SocketAddr> = (host.hostname.as_str(), host.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next());
        let Some(addr) = addr else {
            warn!("shard {}: cannot resolve {}", self.shard, host);
            self.schedule_reconnect();
            return;
        };

        let mut socket = match SocketEvent::connect(addr, PROTOCOL_VERSION, true) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("shard {}: connect to {} failed: {}", self.shard, host, e);
                SubscriberStats::inc(&self.stats.connection_failures);
                self.schedule_reconnect();
                return;
            }
        };

        let token = ctx.tokens.next();
        if let Err(e) = ctx.registry.register(
            socket.tcp_stream_mut(),
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("shard {}: register failed: {}", self.shard, e);
            self.schedule_reconnect();
            return;
        }

        let stream = ctx.streams.next();
        socket.open_stream(stream);
        socket.bind_stream_shard(stream, self.shard);

        let introduction = Message::Introduction(MessageIntroduction {
            tenant_id: GUEST_TENANT,
            stream_properties: vec![(
                Bytes::from_static(b"shard"),
                Bytes::from(self.shard.to_string()),
            )],
            client_properties: vec![(
                Bytes::from_static(b"client_id"),
                Bytes::from(self.client_id.clone()),
            )],
        });
        let _ = socket.write_message(stream, &introduction);

        info!("shard {}: connecting to {}", self.shard, host);
        SubscriberStats::inc(&self.stats.connections_opened);
        self.server = Some(ServerStream {
            socket,
            token,
            stream,
            connected: false,
        });
        self.last_router_version = version;
    }

    fn schedule_reconnect(&mut self) {
        self.consecutive_goodbyes += 1;
        let n = self.consecutive_goodbyes;
        let exp = self
            .config
            .backoff
            .base
            .saturating_mul(1u32 << (n - 1).min(16));
        let capped = exp.min(self.config.backoff.cap);
        let factor = 1.0 + self.config.backoff.jitter * (self.rng.gen::<f64>() * 2.0 - 1.0);
        let delay = capped.mul_f64(factor.max(0.0));
        self.backoff_until = Some(Instant::now() + delay);
        debug!(
            "shard {}: reconnect in {:?} (attempt {})",
            self.shard, delay, n
        );
    }

    /// Tear down the connection, put every subscription back into the
    /// pending set and schedule a reconnect.
    fn connection_lost(&mut self, ctx: &mut SubscriberContext<'_>) {
        if let Some(mut server) = self.server.take() {
            let _ = ctx.registry.deregister(server.socket.tcp_stream_mut());
            let _ = server.socket.close(ClosureReason::Error);
            SubscriberStats::inc(&self.stats.connection_failures);
        }
        for (&sub_id, _) in self.subscriptions.iter() {
            self.pending_subscriptions.add(sub_id);
        }
        self.schedule_reconnect();
    }

    fn flush(&mut self, ctx: &mut SubscriberContext<'_>) {
        let result = match self.server.as_mut() {
            Some(server) if server.connected => {
                let result = server.socket.flush_pending();
                if let Ok(drained) = &result {
                    let interest = if *drained {
                        Interest::READABLE
                    } else {
                        Interest::READABLE | Interest::WRITABLE
                    };
                    let token = server.token;
                    let _ = ctx
                        .registry
                        .reregister(server.socket.tcp_stream_mut(), token, interest);
                }
                result
            }
            _ => return,
        };
        if let Err(e) = result {
            debug!("shard {}: flush failed: {}", self.shard, e);
            self.connection_lost(ctx);
        }
    }

    fn check_router_version(&mut self, ctx: &mut SubscriberContext<'_>) {
        let version = self.router.version();
        if version == self.last_router_version {
            return;
        }
        info!(
            "shard {}: router version {} -> {}, reconnecting",
            self.shard, self.last_router_version, version
        );
        if let Some(server) = self.server.as_mut() {
            let goodbye = Message::Goodbye(conveyor_core::MessageGoodbye {
                tenant_id: GUEST_TENANT,
                code: conveyor_core::GoodbyeCode::Graceful,
                origin_type: conveyor_core::OriginType::Client,
            });
            let _ = server.socket.write_message(server.stream, &goodbye);
            let _ = server.socket.flush_pending();
        }
        self.connection_lost(ctx);
        // The routing change is not a failure of the new host.
        self.consecutive_goodbyes = 0;
        self.backoff_until = None;
        self.last_router_version = version;
    }

    fn handle_wire_event(&mut self, ctx: &mut SubscriberContext<'_>, event: WireEvent) {
        match event {
            WireEvent::Message { message, .. } => match message {
                Message::DeliverData(deliver) => self.on_deliver(
                    deliver.sub_id,
                    deliver.prev_seqno,
                    deliver.seqno,
                    DeliverPayload::Data {
                        msg_id: deliver.msg_id,
                        payload: deliver.payload,
                    },
                ),
                Message::DeliverGap(gap) => self.on_deliver(
                    gap.sub_id,
                    gap.prev_seqno,
                    gap.seqno,
                    DeliverPayload::Gap {
                        gap_type: gap.gap_type,
                    },
                ),
                Message::DeliverBatch(batch) => {
                    for deliver in batch.messages {
                        self.on_deliver(
                            deliver.sub_id,
                            deliver.prev_seqno,
                            deliver.seqno,
                            DeliverPayload::Data {
                                msg_id: deliver.msg_id,
                                payload: deliver.payload,
                            },
                        );
                    }
                }
                Message::Unsubscribe(unsubscribe) => self.on_server_unsubscribe(unsubscribe),
                Message::SubAck(ack) => {
                    debug!("shard {}: subscription {} acked", self.shard, ack.sub_id);
                }
                Message::TailSeqno(tail) => {
                    debug!(
                        "shard {}: tail of {:?} is {}",
                        self.shard, tail.topic, tail.seqno
                    );
                }
                other => {
                    debug!(
                        "shard {}: ignoring {:?}",
                        self.shard,
                        other.message_type()
                    );
                }
            },
            WireEvent::StreamClosed { code, .. } => {
                info!("shard {}: server said goodbye ({:?})", self.shard, code);
                self.connection_lost(ctx);
            }
            WireEvent::StreamOpened { stream } => {
                warn!(
                    "shard {}: unexpected inbound stream {}",
                    self.shard, stream
                );
            }
        }
    }

    fn on_deliver(
        &mut self,
        sub_id: SubscriptionID,
        prev_seqno: SequenceNumber,
        seqno: SequenceNumber,
        payload: DeliverPayload,
    ) {
        let Some(state) = self.subscriptions.get_mut(&sub_id) else {
            self.unsubscribe_unknown(sub_id);
            return;
        };
        match state.receive(sub_id, prev_seqno, seqno, payload) {
            ReceiveOutcome::Delivered => {}
            ReceiveOutcome::Stale => SubscriberStats::inc(&self.stats.dropped_stale),
            ReceiveOutcome::Unexpected => {
                SubscriberStats::inc(&self.stats.dropped_unexpected);
                // The stream is ahead of us; ask to start over.
                self.pending_subscriptions.add(sub_id);
            }
        }
    }

    /// Deliveries on unknown subscriptions get an unsubscribe back, at
    /// most once per dedup window.
    fn unsubscribe_unknown(&mut self, sub_id: SubscriptionID) {
        if self.recent_terminations.contains(&sub_id) {
            return;
        }
        self.recent_terminations.add(sub_id);
        SubscriberStats::inc(&self.stats.unsubscribes_sent);
        if let Some(server) = self.server.as_mut() {
            let message = Message::Unsubscribe(MessageUnsubscribe {
                tenant_id: GUEST_TENANT,
                sub_id,
                reason: UnsubscribeReason::Invalid,
                namespace_id: Bytes::new(),
                topic: Bytes::new(),
            });
            if let Err(e) = server.socket.write_message(server.stream, &message) {
                debug!("shard {}: failed to queue unsubscribe: {}", self.shard, e);
            }
        }
    }

    fn on_server_unsubscribe(&mut self, unsubscribe: MessageUnsubscribe) {
        let sub_id = unsubscribe.sub_id;
        let Some(state) = self.subscriptions.remove(&sub_id) else {
            debug!("shard {}: unsubscribe for unknown {}", self.shard, sub_id);
            return;
        };
        self.pending_subscriptions.remove(&sub_id);
        self.last_acks.remove(&sub_id);
        SubscriberStats::dec(&self.stats.active_subscriptions);
        self.server_removals.push((
            sub_id,
            state.namespace_id().clone(),
            state.topic().clone(),
        ));
        let reason = match unsubscribe.reason {
            UnsubscribeReason::Requested => TerminationReason::Requested,
            UnsubscribeReason::Invalid => TerminationReason::Invalid,
            UnsubscribeReason::BackOff => TerminationReason::BackOff,
        };
        state.terminate(reason);
    }

    /// Server-terminated subscriptions with their keys, for the
    /// collapsing overlay's bookkeeping.
    pub(crate) fn take_server_removals(
        &mut self,
    ) -> Vec<(SubscriptionID, NamespaceID, Topic)> {
        std::mem::take(&mut self.server_removals)
    }

    /// Inject a data delivery directly, bypassing the socket.
    #[cfg(test)]
    pub(crate) fn test_deliver(
        &mut self,
        sub_id: SubscriptionID,
        prev_seqno: SequenceNumber,
        seqno: SequenceNumber,
        payload: &'static [u8],
    ) {
        self.on_deliver(
            sub_id,
            prev_seqno,
            seqno,
            DeliverPayload::Data {
                msg_id: conveyor_core::MsgId::default(),
                payload: Bytes::from_static(payload),
            },
        );
    }

    fn unix_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl SubscriberIf for Subscriber {
    fn start_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
        parameters: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) {
        if self.subscriptions.contains_key(&sub_id) {
            warn!("shard {}: duplicate subscription {}", self.shard, sub_id);
            return;
        }
        let tenant_and_namespace = self
            .flyweights
            .get(parameters.tenant_id, parameters.namespace_id);
        let state = SubscriptionState::new(
            tenant_and_namespace,
            parameters.topic,
            parameters.start_seqno,
            observer,
        );
        self.subscriptions.insert(sub_id, state);
        SubscriberStats::inc(&self.stats.active_subscriptions);
        self.pending_subscriptions.add(sub_id);
        self.process_pending(ctx);
    }

    fn acknowledge(&mut self, sub_id: SubscriptionID, seqno: SequenceNumber) {
        if !self.subscriptions.contains_key(&sub_id) {
            return;
        }
        let entry = self.last_acks.entry(sub_id).or_insert(seqno);
        *entry = (*entry).max(seqno);
    }

    fn terminate_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
    ) {
        let Some(state) = self.subscriptions.remove(&sub_id) else {
            debug!("shard {}: terminate of unknown {}", self.shard, sub_id);
            return;
        };
        self.pending_subscriptions.remove(&sub_id);
        self.last_acks.remove(&sub_id);
        SubscriberStats::dec(&self.stats.active_subscriptions);
        self.recent_terminations.add(sub_id);
        if let Some(server) = self.server.as_mut() {
            let message = Message::Unsubscribe(MessageUnsubscribe {
                tenant_id: state.tenant(),
                sub_id,
                reason: UnsubscribeReason::Requested,
                namespace_id: state.namespace_id().clone(),
                topic: state.topic().clone(),
            });
            if let Err(e) = server.socket.write_message(server.stream, &message) {
                debug!("shard {}: failed to queue unsubscribe: {}", self.shard, e);
            }
        }
        state.terminate(TerminationReason::Requested);
        self.flush(ctx);
    }

    fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn save_state(&self, out: &mut Vec<SubscriptionRecord>) {
        for (&sub_id, state) in self.subscriptions.iter() {
            out.push(SubscriptionRecord {
                tenant_id: state.tenant(),
                namespace_id: state.namespace_id().clone(),
                topic: state.topic().clone(),
                seqno: self.subscribe_seqno(sub_id, state),
            });
        }
    }

    fn socket_token(&self) -> Option<Token> {
        self.server.as_ref().map(|server| server.token)
    }

    fn on_readable(&mut self, ctx: &mut SubscriberContext<'_>) {
        let mut events = Vec::new();
        {
            let Some(server) = self.server.as_mut() else {
                return;
            };
            if let Err(e) = server.socket.on_readable(ctx.streams, &mut events) {
                debug!("shard {}: read failed: {}", self.shard, e);
                self.connection_lost(ctx);
                return;
            }
        }
        for event in events {
            self.handle_wire_event(ctx, event);
        }
        self.flush(ctx);
        self.process_pending(ctx);
    }

    fn on_writable(&mut self, ctx: &mut SubscriberContext<'_>) {
        if let Some(server) = self.server.as_mut() {
            if !server.connected {
                server.connected = true;
                self.consecutive_goodbyes = 0;
            }
        }
        self.flush(ctx);
        self.process_pending(ctx);
    }

    fn on_socket_closed(&mut self, ctx: &mut SubscriberContext<'_>) {
        debug!("shard {}: connection closed", self.shard);
        self.connection_lost(ctx);
    }

    fn tick(&mut self, ctx: &mut SubscriberContext<'_>) {
        self.recent_terminations
            .process_expired(self.config.unsubscribe_dedup_window, |_| {});
        self.check_router_version(ctx);

        if self.last_heartbeat_flush.elapsed() >= self.config.heartbeat_period {
            self.last_heartbeat_flush = Instant::now();
            if let Some(server) = self.server.as_mut() {
                if server.connected {
                    server.socket.capture_heartbeat(self.shard);
                    server
                        .socket
                        .flush_captured_heartbeats(Self::unix_millis());
                    let unhealthy = server.socket.check_heartbeats(self.config.heartbeat_timeout);
                    if !unhealthy.is_empty() {
                        warn!(
                            "shard {}: {} stream(s) without heartbeat",
                            self.shard,
                            unhealthy.len()
                        );
                        SubscriberStats::inc(&self.stats.unhealthy_stream_reports);
                    }
                }
            }
        }

        self.process_pending(ctx);
        self.flush(ctx);
    }

    fn drain_removed(&mut self) -> Vec<SubscriptionID> {
        self.take_server_removals()
            .into_iter()
            .map(|(sub_id, _, _)| sub_id)
            .collect()
    }

    fn shutdown(&mut self, ctx: &mut SubscriberContext<'_>) {
        if let Some(mut server) = self.server.take() {
            let goodbye = Message::Goodbye(conveyor_core::MessageGoodbye {
                tenant_id: GUEST_TENANT,
                code: conveyor_core::GoodbyeCode::Graceful,
                origin_type: conveyor_core::OriginType::Client,
            });
            let _ = server.socket.write_message(server.stream, &goodbye);
            if server.connected {
                let _ = server.socket.flush_pending();
            }
            let _ = ctx.registry.deregister(server.socket.tcp_stream_mut());
            let _ = server.socket.close(ClosureReason::Graceful);
        }
    }
}
