//! Tail-subscription collapsing.
//!
//! All downstream subscriptions on one topic that start at the tail are
//! served from a single upstream subscription; a shared multicast
//! observer fans deliveries out to every downstream observer. Only tail
//! subscriptions (start seqno 0) collapse: a subscription asking for an
//! earlier start point needs its own upstream position and stays
//! independent.
//!
//! The upstream keeps the ID of the downstream that created it. When that
//! downstream unsubscribes while others still share the upstream, the
//! upstream simply lives on under its original ID; it is torn down when
//! the last downstream leaves.

use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use conveyor_core::{SequenceNumber, SubscriptionID, SubscriptionParameters};
use mio::Token;

use crate::observer::{MessageReceived, Observer, TerminationReason};
use crate::snapshot::SubscriptionRecord;
use crate::subscriber::{Subscriber, SubscriberContext, SubscriberIf};
use crate::topic_map::TopicToSubscriptionMap;

/// Downstream observers sharing one upstream subscription.
type SharedSinks = Arc<Mutex<Vec<(SubscriptionID, Box<dyn Observer>)>>>;

/// Observer installed on a collapsed upstream subscription; multicasts to
/// every downstream observer, rewriting the subscription ID so each
/// downstream sees its own handle.
struct TailCollapsingObserver {
    sinks: SharedSinks,
}

impl Observer for TailCollapsingObserver {
    fn on_data(&mut self, message: MessageReceived) {
        let mut sinks = self.sinks.lock();
        for (sub_id, observer) in sinks.iter_mut() {
            let mut copy = message.clone();
            copy.sub_id = *sub_id;
            observer.on_data(copy);
        }
    }

    fn on_gap(
        &mut self,
        from: SequenceNumber,
        to: SequenceNumber,
        gap_type: conveyor_core::GapType,
    ) {
        let mut sinks = self.sinks.lock();
        for (_, observer) in sinks.iter_mut() {
            observer.on_gap(from, to, gap_type);
        }
    }

    fn on_terminated(&mut self, reason: TerminationReason) {
        // The upstream is gone; every downstream terminates exactly once.
        let mut sinks = self.sinks.lock();
        for (_, mut observer) in sinks.drain(..) {
            observer.on_terminated(reason);
        }
    }
}

/// A subscriber adaptor that collapses tail subscriptions per topic.
pub struct TailCollapsingSubscriber {
    subscriber: Subscriber,
    /// Downstream subscription to the upstream serving it; collapsed
    /// subscriptions only.
    downstream_to_upstream: AHashMap<SubscriptionID, SubscriptionID>,
    /// Observer sink lists keyed by upstream subscription.
    shared_sinks: AHashMap<SubscriptionID, SharedSinks>,
    /// Finds the upstream subscription for a topic.
    upstream_subscriptions: TopicToSubscriptionMap,
}

impl TailCollapsingSubscriber {
    pub fn new(subscriber: Subscriber) -> Self {
        Self {
            subscriber,
            downstream_to_upstream: AHashMap::new(),
            shared_sinks: AHashMap::new(),
            upstream_subscriptions: TopicToSubscriptionMap::new(),
        }
    }

    /// Drop collapsing state for upstreams the server terminated. The
    /// shared observer has already notified every downstream.
    fn reap_server_removals(&mut self) -> Vec<SubscriptionID> {
        let removals = self.subscriber.take_server_removals();
        let mut removed = Vec::new();
        for (upstream, namespace_id, topic) in removals {
            if self.shared_sinks.remove(&upstream).is_some() {
                let subscriber = &self.subscriber;
                let keys =
                    |sub_id: SubscriptionID| subscriber.subscription_key(sub_id);
                self.upstream_subscriptions
                    .remove(&namespace_id, &topic, upstream, &keys);
                self.downstream_to_upstream.retain(|downstream, up| {
                    if *up == upstream {
                        removed.push(*downstream);
                        false
                    } else {
                        true
                    }
                });
            } else {
                removed.push(upstream);
            }
        }
        removed
    }
}

impl SubscriberIf for TailCollapsingSubscriber {
    fn start_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
        parameters: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) {
        if parameters.start_seqno != 0 {
            // Not at tail; cannot share an upstream position.
            self.subscriber
                .start_subscription(ctx, sub_id, parameters, observer);
            return;
        }

        let existing = {
            let subscriber = &self.subscriber;
            let keys = |id: SubscriptionID| subscriber.subscription_key(id);
            self.upstream_subscriptions
                .find(&parameters.namespace_id, &parameters.topic, &keys)
        };

        if let Some(upstream) = existing {
            let Some(sinks) = self.shared_sinks.get(&upstream) else {
                warn!("upstream {} has no sink list", upstream);
                return;
            };
            sinks.lock().push((sub_id, observer));
            self.downstream_to_upstream.insert(sub_id, upstream);
            debug!("collapsed subscription {} onto {}", sub_id, upstream);
            return;
        }

        // First tail subscription on this topic: it becomes the upstream.
        let sinks: SharedSinks = Arc::new(Mutex::new(vec![(sub_id, observer)]));
        self.shared_sinks.insert(sub_id, sinks.clone());
        self.downstream_to_upstream.insert(sub_id, sub_id);
        let namespace_id = parameters.namespace_id.clone();
        let topic = parameters.topic.clone();
        self.subscriber.start_subscription(
            ctx,
            sub_id,
            parameters,
            Box::new(TailCollapsingObserver { sinks }),
        );
        let subscriber = &self.subscriber;
        let keys = |id: SubscriptionID| subscriber.subscription_key(id);
        self.upstream_subscriptions
            .insert(&namespace_id, &topic, sub_id, &keys);
    }

    fn acknowledge(&mut self, sub_id: SubscriptionID, seqno: SequenceNumber) {
        let target = self
            .downstream_to_upstream
            .get(&sub_id)
            .copied()
            .unwrap_or(sub_id);
        self.subscriber.acknowledge(target, seqno);
    }

    fn terminate_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
    ) {
        let Some(upstream) = self.downstream_to_upstream.remove(&sub_id) else {
            // Independent subscription.
            self.subscriber.terminate_subscription(ctx, sub_id);
            return;
        };

        let Some(sinks) = self.shared_sinks.get(&upstream) else {
            debug!("upstream {} already gone", upstream);
            return;
        };

        let remaining = {
            let mut sinks = sinks.lock();
            if let Some(index) = sinks.iter().position(|(id, _)| *id == sub_id) {
                let (_, mut observer) = sinks.remove(index);
                observer.on_terminated(TerminationReason::Requested);
            }
            sinks.len()
        };

        if remaining == 0 {
            self.shared_sinks.remove(&upstream);
            if let Some((namespace_id, topic)) = self.subscriber.subscription_key(upstream) {
                let subscriber = &self.subscriber;
                let keys = |id: SubscriptionID| subscriber.subscription_key(id);
                self.upstream_subscriptions
                    .remove(&namespace_id, &topic, upstream, &keys);
            }
            self.subscriber.terminate_subscription(ctx, upstream);
        }
    }

    fn is_empty(&self) -> bool {
        self.subscriber.is_empty()
    }

    fn save_state(&self, out: &mut Vec<SubscriptionRecord>) {
        self.subscriber.save_state(out);
    }

    fn socket_token(&self) -> Option<Token> {
        self.subscriber.socket_token()
    }

    fn on_readable(&mut self, ctx: &mut SubscriberContext<'_>) {
        self.subscriber.on_readable(ctx);
    }

    fn on_writable(&mut self, ctx: &mut SubscriberContext<'_>) {
        self.subscriber.on_writable(ctx);
    }

    fn on_socket_closed(&mut self, ctx: &mut SubscriberContext<'_>) {
        self.subscriber.on_socket_closed(ctx);
    }

    fn tick(&mut self, ctx: &mut SubscriberContext<'_>) {
        self.subscriber.tick(ctx);
    }

    fn drain_removed(&mut self) -> Vec<SubscriptionID> {
        self.reap_server_removals()
    }

    fn shutdown(&mut self, ctx: &mut SubscriberContext<'_>) {
        self.subscriber.shutdown(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::flyweight::FlyweightFactory;
    use crate::router::FixedRouter;
    use crate::stats::SubscriberStats;
    use crate::subscriber::TokenAllocator;
    use bytes::Bytes;
    use conveyor_core::event_loop::EventLoop;
    use conveyor_core::stream::StreamAllocator;
    use conveyor_core::HostId;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Recorder {
        seen: Arc<StdMutex<Vec<(SubscriptionID, SequenceNumber)>>>,
        id: SubscriptionID,
    }

    impl Observer for Recorder {
        fn on_data(&mut self, message: MessageReceived) {
            assert_eq!(message.sub_id, self.id);
            self.seen.lock().unwrap().push((message.sub_id, message.seqno));
        }
    }

    struct Harness {
        event_loop: EventLoop<()>,
        streams: StreamAllocator,
        tokens: TokenAllocator,
        collapsing: TailCollapsingSubscriber,
        _listener: std::net::TcpListener,
    }

    impl Harness {
        fn new() -> Self {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let router = Arc::new(FixedRouter::new(HostId::new("127.0.0.1", port), 1));
            let subscriber = Subscriber::new(
                Arc::new(ClientConfig::default()),
                "collapse-test".to_string(),
                0,
                router,
                Arc::new(SubscriberStats::new()),
                FlyweightFactory::new(),
            );
            Self {
                event_loop: EventLoop::new(16, Duration::from_millis(100)).unwrap(),
                streams: StreamAllocator::new(),
                tokens: TokenAllocator::new(),
                collapsing: TailCollapsingSubscriber::new(subscriber),
                _listener: listener,
            }
        }

        fn ctx(&mut self) -> (SubscriberContext<'_>, &mut TailCollapsingSubscriber) {
            (
                SubscriberContext {
                    registry: self.event_loop.registry(),
                    streams: &mut self.streams,
                    tokens: &mut self.tokens,
                },
                &mut self.collapsing,
            )
        }
    }

    fn tail_parameters() -> SubscriptionParameters {
        SubscriptionParameters {
            tenant_id: 102,
            namespace_id: Bytes::from_static(b"102"),
            topic: Bytes::from_static(b"collapsed"),
            start_seqno: 0,
        }
    }

    #[test]
    fn test_two_tail_subscriptions_share_one_upstream() {
        let mut harness = Harness::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (mut ctx, collapsing) = harness.ctx();

        collapsing.start_subscription(
            &mut ctx,
            1,
            tail_parameters(),
            Box::new(Recorder { seen: seen.clone(), id: 1 }),
        );
        collapsing.start_subscription(
            &mut ctx,
            2,
            tail_parameters(),
            Box::new(Recorder { seen: seen.clone(), id: 2 }),
        );

        // Exactly one upstream subscription exists in the base subscriber.
        assert_eq!(collapsing.upstream_subscriptions.len(), 1);
        assert_eq!(collapsing.downstream_to_upstream.get(&2), Some(&1));

        // A delivery on the upstream reaches both observers exactly once,
        // each under its own handle.
        collapsing.subscriber.test_deliver(1, 0, 42, b"payload");
        let mut recorded = seen.lock().unwrap().clone();
        recorded.sort_unstable();
        assert_eq!(recorded, vec![(1, 42), (2, 42)]);
    }

    #[test]
    fn test_non_tail_subscription_stays_independent() {
        let mut harness = Harness::new();
        let (mut ctx, collapsing) = harness.ctx();

        let mut early = tail_parameters();
        early.start_seqno = 5;
        collapsing.start_subscription(
            &mut ctx,
            1,
            tail_parameters(),
            Box::new(Recorder {
                seen: Arc::new(StdMutex::new(Vec::new())),
                id: 1,
            }),
        );
        collapsing.start_subscription(
            &mut ctx,
            2,
            early,
            Box::new(Recorder {
                seen: Arc::new(StdMutex::new(Vec::new())),
                id: 2,
            }),
        );

        assert_eq!(collapsing.upstream_subscriptions.len(), 1);
        assert!(!collapsing.downstream_to_upstream.contains_key(&2));
    }

    #[test]
    fn test_owner_unsubscribe_keeps_upstream_alive() {
        let mut harness = Harness::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (mut ctx, collapsing) = harness.ctx();

        collapsing.start_subscription(
            &mut ctx,
            1,
            tail_parameters(),
            Box::new(Recorder { seen: seen.clone(), id: 1 }),
        );
        collapsing.start_subscription(
            &mut ctx,
            2,
            tail_parameters(),
            Box::new(Recorder { seen: seen.clone(), id: 2 }),
        );

        // The creating downstream goes away; the upstream survives for
        // the other one.
        collapsing.terminate_subscription(&mut ctx, 1);
        assert!(!collapsing.is_empty());
        assert_eq!(collapsing.upstream_subscriptions.len(), 1);

        collapsing.subscriber.test_deliver(1, 0, 7, b"x");
        assert_eq!(seen.lock().unwrap().clone(), vec![(2, 7)]);

        // Last downstream leaves; the upstream goes too.
        collapsing.terminate_subscription(&mut ctx, 2);
        assert!(collapsing.is_empty());
        assert_eq!(collapsing.upstream_subscriptions.len(), 0);
    }
}
