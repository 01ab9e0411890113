//! Multi-shard subscriber: routes subscriptions to per-shard subscribers.
//!
//! Shard subscribers come up lazily on the first subscription and are
//! torn down once empty. Every shard subscriber is wrapped in the
//! tail-collapsing overlay, so tail subscriptions on one topic always
//! share a single upstream subscription. Socket readiness events are
//! routed by token; a worker typically serves a handful of shards, so a
//! linear scan is fine.

use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use mio::Token;

use conveyor_core::{SequenceNumber, ShardID, SubscriptionID, SubscriptionParameters};

use crate::collapsing::TailCollapsingSubscriber;
use crate::config::ClientConfig;
use crate::flyweight::FlyweightFactory;
use crate::observer::Observer;
use crate::router::SubscriptionRouter;
use crate::snapshot::SubscriptionRecord;
use crate::stats::SubscriberStats;
use crate::subscriber::{Subscriber, SubscriberContext, SubscriberIf};

pub struct MultiShardSubscriber {
    config: Arc<ClientConfig>,
    client_id: String,
    router: Arc<dyn SubscriptionRouter>,
    stats: Arc<SubscriberStats>,
    flyweights: FlyweightFactory,

    /// One subscriber per shard with active subscriptions.
    subscribers: AHashMap<ShardID, Box<dyn SubscriberIf>>,
    subscription_to_shard: AHashMap<SubscriptionID, ShardID>,
}

impl MultiShardSubscriber {
    pub fn new(
        config: Arc<ClientConfig>,
        client_id: String,
        router: Arc<dyn SubscriptionRouter>,
        stats: Arc<SubscriberStats>,
        flyweights: FlyweightFactory,
    ) -> Self {
        Self {
            config,
            client_id,
            router,
            stats,
            flyweights,
            subscribers: AHashMap::new(),
            subscription_to_shard: AHashMap::new(),
        }
    }

    pub fn start_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
        parameters: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) {
        let shard = self
            .router
            .shard(&parameters.namespace_id, &parameters.topic);
        let config = self.config.clone();
        let client_id = self.client_id.clone();
        let router = self.router.clone();
        let stats = self.stats.clone();
        let flyweights = self.flyweights.clone();
        let subscriber = self.subscribers.entry(shard).or_insert_with(|| {
            let base = Subscriber::new(config, client_id, shard, router, stats, flyweights);
            Box::new(TailCollapsingSubscriber::new(base))
        });
        subscriber.start_subscription(ctx, sub_id, parameters, observer);
        self.subscription_to_shard.insert(sub_id, shard);
    }

    pub fn acknowledge(&mut self, sub_id: SubscriptionID, seqno: SequenceNumber) {
        let Some(shard) = self.subscription_to_shard.get(&sub_id) else {
            debug!("acknowledge for unknown subscription {}", sub_id);
            return;
        };
        if let Some(subscriber) = self.subscribers.get_mut(shard) {
            subscriber.acknowledge(sub_id, seqno);
        }
    }

    pub fn terminate_subscription(
        &mut self,
        ctx: &mut SubscriberContext<'_>,
        sub_id: SubscriptionID,
    ) {
        let Some(shard) = self.subscription_to_shard.remove(&sub_id) else {
            debug!("terminate for unknown subscription {}", sub_id);
            return;
        };
        if let Some(subscriber) = self.subscribers.get_mut(&shard) {
            subscriber.terminate_subscription(ctx, sub_id);
        }
        self.reap(ctx, shard);
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn save_state(&self, out: &mut Vec<SubscriptionRecord>) {
        for subscriber in self.subscribers.values() {
            subscriber.save_state(out);
        }
    }

    pub fn on_readable(&mut self, ctx: &mut SubscriberContext<'_>, token: Token) {
        if let Some(shard) = self.shard_of_token(token) {
            if let Some(subscriber) = self.subscribers.get_mut(&shard) {
                subscriber.on_readable(ctx);
            }
            self.reap(ctx, shard);
        }
    }

    pub fn on_writable(&mut self, ctx: &mut SubscriberContext<'_>, token: Token) {
        if let Some(shard) = self.shard_of_token(token) {
            if let Some(subscriber) = self.subscribers.get_mut(&shard) {
                subscriber.on_writable(ctx);
            }
        }
    }

    pub fn on_socket_closed(&mut self, ctx: &mut SubscriberContext<'_>, token: Token) {
        if let Some(shard) = self.shard_of_token(token) {
            if let Some(subscriber) = self.subscribers.get_mut(&shard) {
                subscriber.on_socket_closed(ctx);
            }
        }
    }

    pub fn tick(&mut self, ctx: &mut SubscriberContext<'_>) {
        let shards: Vec<ShardID> = self.subscribers.keys().copied().collect();
        for shard in shards {
            if let Some(subscriber) = self.subscribers.get_mut(&shard) {
                subscriber.tick(ctx);
            }
            self.reap(ctx, shard);
        }
    }

    pub fn shutdown(&mut self, ctx: &mut SubscriberContext<'_>) {
        for subscriber in self.subscribers.values_mut() {
            subscriber.shutdown(ctx);
        }
        self.subscribers.clear();
        self.subscription_to_shard.clear();
    }

    fn shard_of_token(&self, token: Token) -> Option<ShardID> {
        self.subscribers
            .iter()
            .find(|(_, subscriber)| subscriber.socket_token() == Some(token))
            .map(|(&shard, _)| shard)
    }

    /// Clean up after server-side terminations and drop empty shard
    /// subscribers.
    fn reap(&mut self, ctx: &mut SubscriberContext<'_>, shard: ShardID) {
        let Some(subscriber) = self.subscribers.get_mut(&shard) else {
            return;
        };
        for sub_id in subscriber.drain_removed() {
            self.subscription_to_shard.remove(&sub_id);
        }
        if subscriber.is_empty() {
            subscriber.shutdown(ctx);
            self.subscribers.remove(&shard);
        }
    }
}
