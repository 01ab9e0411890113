//! The public, thread-safe client.
//!
//! A client owns `num_workers` worker threads; each worker runs one event
//! loop and one multi-shard subscriber. Subscription handles encode the
//! owning worker in their top byte, so any thread can route a call to the
//! right worker without shared state. All public calls are non-blocking
//! enqueues onto bounded queues: a full queue returns the null handle (or
//! false) and the caller retries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};

use conveyor_core::event_loop::{EventLoop, LoopEvent, LoopHandle};
use conveyor_core::stream::StreamAllocator;
use conveyor_core::{SequenceNumber, SubscriptionID, SubscriptionParameters, NULL_SUBSCRIPTION_ID};

use crate::config::ClientConfig;
use crate::error::Result;
use crate::flyweight::FlyweightFactory;
use crate::multi_shard::MultiShardSubscriber;
use crate::observer::{MessageReceived, Observer};
use crate::router::SubscriptionRouter;
use crate::snapshot::{SaveSubscriptionsCallback, SnapshotCollector};
use crate::stats::{SubscriberStats, SubscriberStatsSnapshot};
use crate::subscriber::{SubscriberContext, TokenAllocator};

/// Opaque handle of an established subscription. The null handle (0)
/// means the call must be retried.
pub type SubscriptionHandle = SubscriptionID;

/// Bits below the worker index in a subscription handle.
const WORKER_SHIFT: u32 = 56;

/// Commands processed by worker threads.
enum WorkerCommand {
    StartSubscription {
        sub_id: SubscriptionID,
        parameters: SubscriptionParameters,
        observer: Box<dyn Observer>,
    },
    Acknowledge {
        sub_id: SubscriptionID,
        seqno: SequenceNumber,
    },
    TerminateSubscription {
        sub_id: SubscriptionID,
    },
    SaveState {
        collector: SnapshotCollector,
    },
    Stop,
}

struct WorkerHandle {
    handle: LoopHandle<WorkerCommand>,
    /// Low bits of the next handle; the worker index fills the top byte.
    next_sub_seed: AtomicU64,
    join: Option<JoinHandle<()>>,
}

/// A multi-threaded conveyor subscriber client.
pub struct Client {
    workers: Vec<WorkerHandle>,
    next_worker: AtomicUsize,
    stats: Arc<SubscriberStats>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        router: Arc<dyn SubscriptionRouter>,
    ) -> Result<Self> {
        let num_workers = config.num_workers;
        assert!(
            num_workers >= 1 && num_workers <= 256,
            "num_workers must be in 1..=256"
        );

        let config = Arc::new(config);
        let stats = Arc::new(SubscriberStats::new());
        let flyweights = FlyweightFactory::new();
        let allocators = StreamAllocator::new().divide(num_workers);

        let mut workers = Vec::with_capacity(num_workers);
        for (index, streams) in allocators.into_iter().enumerate() {
            let event_loop = EventLoop::new(config.queue_size, config.tick_interval)?;
            let handle = event_loop.handle();
            let client_id = format!("{}-{}", config.client_id, index as u8);
            let worker = ClientWorker {
                event_loop,
                streams,
                tokens: TokenAllocator::new(),
                subscriber: MultiShardSubscriber::new(
                    config.clone(),
                    client_id,
                    router.clone(),
                    stats.clone(),
                    flyweights.clone(),
                ),
            };
            let join = thread::Builder::new()
                .name(format!("conveyor-client-{}", index))
                .spawn(move || worker.run())?;
            workers.push(WorkerHandle {
                handle,
                next_sub_seed: AtomicU64::new(1),
                join: Some(join),
            });
        }

        Ok(Self {
            workers,
            next_worker: AtomicUsize::new(0),
            stats,
        })
    }

    /// Establish a subscription. Returns the null handle when the target
    /// worker's queue is full; retry after backing off.
    pub fn subscribe(
        &self,
        parameters: SubscriptionParameters,
        observer: Box<dyn Observer>,
    ) -> SubscriptionHandle {
        let worker_index =
            self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[worker_index];
        let seed = worker.next_sub_seed.fetch_add(1, Ordering::Relaxed);
        if seed >= 1u64 << WORKER_SHIFT {
            // 2^56 subscriptions on one worker: the ID space is spent.
            return NULL_SUBSCRIPTION_ID;
        }
        let sub_id = ((worker_index as u64) << WORKER_SHIFT) | seed;
        if worker.handle.send(WorkerCommand::StartSubscription {
            sub_id,
            parameters,
            observer,
        }) {
            sub_id
        } else {
            NULL_SUBSCRIPTION_ID
        }
    }

    /// Terminate a subscription. Returns false when the call must be
    /// retried (or the handle is invalid).
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some(worker) = self.worker_of(handle) else {
            return false;
        };
        worker
            .handle
            .send(WorkerCommand::TerminateSubscription { sub_id: handle })
    }

    /// Acknowledge a received message; resubscription after a reconnect
    /// resumes past it. Returns false when the call must be retried.
    pub fn acknowledge(&self, message: &MessageReceived) -> bool {
        let Some(worker) = self.worker_of(message.sub_id) else {
            return false;
        };
        worker.handle.send(WorkerCommand::Acknowledge {
            sub_id: message.sub_id,
            seqno: message.seqno,
        })
    }

    /// Snapshot every worker's subscriptions; the callback fires once all
    /// workers have reported (with an error if any could not be reached).
    pub fn save_subscriptions(&self, callback: SaveSubscriptionsCallback) {
        let collector = SnapshotCollector::new(self.workers.len(), callback);
        for worker in &self.workers {
            let sent = worker.handle.send(WorkerCommand::SaveState {
                collector: collector.clone(),
            });
            if !sent {
                collector.fail();
            }
        }
    }

    pub fn stats(&self) -> SubscriberStatsSnapshot {
        self.stats.snapshot()
    }

    fn worker_of(&self, handle: SubscriptionHandle) -> Option<&WorkerHandle> {
        if handle == NULL_SUBSCRIPTION_ID {
            return None;
        }
        let index = (handle >> WORKER_SHIFT) as usize;
        self.workers.get(index)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for worker in &self.workers {
            // The queue may be briefly full; the worker drains it every
            // iteration, so a short retry loop suffices.
            for _ in 0..64 {
                if worker.handle.send(WorkerCommand::Stop) {
                    break;
                }
                thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

/// One worker thread: event loop plus multi-shard subscriber.
struct ClientWorker {
    event_loop: EventLoop<WorkerCommand>,
    streams: StreamAllocator,
    tokens: TokenAllocator,
    subscriber: MultiShardSubscriber,
}

impl ClientWorker {
    fn run(mut self) {
        let mut events = Vec::new();
        'outer: loop {
            events.clear();
            if let Err(e) = self.event_loop.poll_once(&mut events) {
                error!("client worker poll failed: {}", e);
                break;
            }
            for event in events.drain(..) {
                let mut ctx = SubscriberContext {
                    registry: self.event_loop.registry(),
                    streams: &mut self.streams,
                    tokens: &mut self.tokens,
                };
                match event {
                    LoopEvent::Readable(token) => self.subscriber.on_readable(&mut ctx, token),
                    LoopEvent::Writable(token) => self.subscriber.on_writable(&mut ctx, token),
                    LoopEvent::Closed(token) => {
                        self.subscriber.on_socket_closed(&mut ctx, token)
                    }
                    LoopEvent::Tick => self.subscriber.tick(&mut ctx),
                    LoopEvent::Command(command) => match command {
                        WorkerCommand::StartSubscription {
                            sub_id,
                            parameters,
                            observer,
                        } => {
                            self.subscriber
                                .start_subscription(&mut ctx, sub_id, parameters, observer);
                        }
                        WorkerCommand::Acknowledge { sub_id, seqno } => {
                            self.subscriber.acknowledge(sub_id, seqno);
                        }
                        WorkerCommand::TerminateSubscription { sub_id } => {
                            self.subscriber.terminate_subscription(&mut ctx, sub_id);
                        }
                        WorkerCommand::SaveState { collector } => {
                            let mut records = Vec::new();
                            self.subscriber.save_state(&mut records);
                            collector.complete(records);
                        }
                        WorkerCommand::Stop => break 'outer,
                    },
                }
            }
        }
        let mut ctx = SubscriberContext {
            registry: self.event_loop.registry(),
            streams: &mut self.streams,
            tokens: &mut self.tokens,
        };
        self.subscriber.shutdown(&mut ctx);
        debug!("client worker stopped");
    }
}
