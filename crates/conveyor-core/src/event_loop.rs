//! Cooperative event loop for worker threads.
//!
//! Each worker owns one loop: a mio poll, a bounded command queue and a
//! periodic tick. The loop never blocks past the next tick deadline and
//! never pre-empts: readiness events, commands and ticks are surfaced to
//! the owner, which processes them to completion one at a time.
//!
//! Commands sent from one thread arrive in order; across senders the order
//! is unspecified. An enqueue that would block fails immediately so the
//! caller can apply backpressure instead of stalling.

use std::io;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

/// Default cadence of the periodic tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// What a single loop iteration produced.
#[derive(Debug)]
pub enum LoopEvent<C> {
    /// A registered source became readable.
    Readable(Token),
    /// A registered source became writable.
    Writable(Token),
    /// The peer closed or errored a registered source.
    Closed(Token),
    /// A command arrived on the queue.
    Command(C),
    /// The periodic tick fired.
    Tick,
}

/// Thread-safe handle for enqueueing commands onto a loop.
pub struct LoopHandle<C> {
    tx: Sender<C>,
}

impl<C> Clone for LoopHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> LoopHandle<C> {
    /// Enqueue a command. Returns false when the queue is full or the loop
    /// is gone; the caller must retry later.
    pub fn send(&self, command: C) -> bool {
        match self.tx.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// One worker's event loop.
pub struct EventLoop<C> {
    poll: Poll,
    events: Events,
    tx: Sender<C>,
    rx: Receiver<C>,
    tick_interval: Duration,
    last_tick: Instant,
    next_token: usize,
}

impl<C> EventLoop<C> {
    pub fn new(queue_size: usize, tick_interval: Duration) -> io::Result<Self> {
        let (tx, rx) = bounded(queue_size);
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            tx,
            rx,
            tick_interval,
            last_tick: Instant::now(),
            next_token: 0,
        })
    }

    /// A cloneable handle for other threads to enqueue commands.
    pub fn handle(&self) -> LoopHandle<C> {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// The registry for registering sources directly.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Allocate a fresh token for a new source.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Register a source for readability; writability is added by the
    /// owner when it has pending output.
    pub fn register_read(&mut self, source: &mut impl Source, token: Token) -> io::Result<()> {
        self.poll.registry().register(source, token, Interest::READABLE)
    }

    /// Enable or disable write interest in addition to read interest.
    pub fn set_write_interest(
        &self,
        source: &mut impl Source,
        token: Token,
        enabled: bool,
    ) -> io::Result<()> {
        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut impl Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Run one iteration: wait for readiness (bounded by the next tick
    /// deadline), then append readiness events, queued commands and at
    /// most one tick to `out`.
    pub fn poll_once(&mut self, out: &mut Vec<LoopEvent<C>>) -> io::Result<()> {
        let elapsed = self.last_tick.elapsed();
        let timeout = self.tick_interval.saturating_sub(elapsed);

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let token = event.token();
            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                out.push(LoopEvent::Closed(token));
                continue;
            }
            if event.is_readable() {
                out.push(LoopEvent::Readable(token));
            }
            if event.is_writable() {
                out.push(LoopEvent::Writable(token));
            }
        }

        while let Ok(command) = self.rx.try_recv() {
            out.push(LoopEvent::Command(command));
        }

        if self.last_tick.elapsed() >= self.tick_interval {
            self.last_tick = Instant::now();
            out.push(LoopEvent::Tick);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commands_are_fifo_per_sender() {
        let mut event_loop: EventLoop<u32> =
            EventLoop::new(16, Duration::from_millis(5)).unwrap();
        let handle = event_loop.handle();
        for i in 0..10 {
            assert!(handle.send(i));
        }

        let mut seen = Vec::new();
        let mut out = Vec::new();
        event_loop.poll_once(&mut out).unwrap();
        for event in out {
            if let LoopEvent::Command(i) = event {
                seen.push(i);
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_queue_reports_failure() {
        let event_loop: EventLoop<u32> = EventLoop::new(2, DEFAULT_TICK_INTERVAL).unwrap();
        let handle = event_loop.handle();
        assert!(handle.send(1));
        assert!(handle.send(2));
        assert!(!handle.send(3));
    }

    #[test]
    fn test_tick_fires() {
        let mut event_loop: EventLoop<u32> =
            EventLoop::new(1, Duration::from_millis(1)).unwrap();
        let mut out = Vec::new();
        std::thread::sleep(Duration::from_millis(5));
        event_loop.poll_once(&mut out).unwrap();
        assert!(out.iter().any(|e| matches!(e, LoopEvent::Tick)));
    }
}
