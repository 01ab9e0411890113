//! Per-subscription state and the delivery acceptance policy.

use bytes::Bytes;
use conveyor_core::{
    GapType, MsgId, NamespaceID, SequenceNumber, SubscriptionID, TenantID, Topic,
};
use log::trace;

use crate::flyweight::Flyweight;
use crate::observer::{MessageReceived, Observer, TerminationReason};

/// Payload of a delivery, after the shared header.
pub enum DeliverPayload {
    Data { msg_id: MsgId, payload: Bytes },
    Gap { gap_type: GapType },
}

/// What `SubscriptionState::receive` did with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// In order; the observer saw it and the expected seqno advanced.
    Delivered,
    /// Older than the expected seqno; dropped (reconnect redelivery).
    Stale,
    /// Starts past the expected seqno; dropped, caller should resubscribe.
    Unexpected,
}

/// State of one active subscription. Mutated only on the owning worker.
pub struct SubscriptionState {
    tenant_and_namespace: Flyweight,
    topic: Topic,
    /// The seqno the subscription was started from; 0 means tail.
    start_seqno: SequenceNumber,
    /// Next seqno expected; monotonically non-decreasing. 0 until a tail
    /// subscription sees its first delivery.
    expected_seqno: SequenceNumber,
    observer: Box<dyn Observer>,
}

impl SubscriptionState {
    pub fn new(
        tenant_and_namespace: Flyweight,
        topic: Topic,
        start_seqno: SequenceNumber,
        observer: Box<dyn Observer>,
    ) -> Self {
        Self {
            tenant_and_namespace,
            topic,
            start_seqno,
            expected_seqno: start_seqno,
            observer,
        }
    }

    pub fn tenant(&self) -> TenantID {
        self.tenant_and_namespace.tenant_id
    }

    pub fn namespace_id(&self) -> &NamespaceID {
        &self.tenant_and_namespace.namespace_id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn start_seqno(&self) -> SequenceNumber {
        self.start_seqno
    }

    /// Lower bound on the seqno of the next expected message.
    pub fn expected_seqno(&self) -> SequenceNumber {
        self.expected_seqno
    }

    pub fn swap_observer(&mut self, observer: &mut Box<dyn Observer>) {
        std::mem::swap(&mut self.observer, observer);
    }

    /// Apply a delivery covering `(prev_seqno, seqno]`.
    ///
    /// Accepted iff the range reaches the expected seqno, i.e.
    /// `prev_seqno <= expected && seqno >= expected`. A tail subscription
    /// (`expected == 0`) accepts only deliveries with `prev_seqno == 0`,
    /// which mark the current tail position.
    pub fn receive(
        &mut self,
        sub_id: SubscriptionID,
        prev_seqno: SequenceNumber,
        seqno: SequenceNumber,
        payload: DeliverPayload,
    ) -> ReceiveOutcome {
        debug_assert!(seqno >= prev_seqno);
        let expected = self.expected_seqno;
        if seqno < expected {
            trace!(
                "subscription {} dropping stale delivery {} (expected {})",
                sub_id,
                seqno,
                expected
            );
            return ReceiveOutcome::Stale;
        }
        if prev_seqno > expected {
            trace!(
                "subscription {} dropping unexpected delivery ({}, {}] (expected {})",
                sub_id,
                prev_seqno,
                seqno,
                expected
            );
            return ReceiveOutcome::Unexpected;
        }

        self.expected_seqno = seqno + 1;
        match payload {
            DeliverPayload::Data { payload, .. } => {
                self.observer.on_data(MessageReceived {
                    sub_id,
                    namespace_id: self.tenant_and_namespace.namespace_id.clone(),
                    topic: self.topic.clone(),
                    seqno,
                    payload,
                });
            }
            DeliverPayload::Gap { gap_type } => {
                let from = expected.max(prev_seqno + 1);
                self.observer.on_gap(from, seqno, gap_type);
            }
        }
        ReceiveOutcome::Delivered
    }

    /// Terminate the subscription and notify the application.
    pub fn terminate(mut self, reason: TerminationReason) {
        self.observer.on_terminated(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flyweight::FlyweightFactory;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        data: Vec<SequenceNumber>,
        gaps: Vec<(SequenceNumber, SequenceNumber)>,
        terminated: Vec<TerminationReason>,
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Recorded>>);

    impl Observer for Recorder {
        fn on_data(&mut self, message: MessageReceived) {
            self.0.lock().unwrap().data.push(message.seqno);
        }

        fn on_gap(&mut self, from: SequenceNumber, to: SequenceNumber, _gap_type: GapType) {
            self.0.lock().unwrap().gaps.push((from, to));
        }

        fn on_terminated(&mut self, reason: TerminationReason) {
            self.0.lock().unwrap().terminated.push(reason);
        }
    }

    fn state(start: SequenceNumber) -> (SubscriptionState, Recorder) {
        let recorder = Recorder::default();
        let factory = FlyweightFactory::new();
        let state = SubscriptionState::new(
            factory.get(1, Bytes::from_static(b"ns")),
            Bytes::from_static(b"topic"),
            start,
            Box::new(recorder.clone()),
        );
        (state, recorder)
    }

    fn data() -> DeliverPayload {
        DeliverPayload::Data {
            msg_id: MsgId::default(),
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn test_in_order_delivery_advances() {
        let (mut state, recorder) = state(1);
        assert_eq!(state.receive(5, 0, 1, data()), ReceiveOutcome::Delivered);
        assert_eq!(state.receive(5, 1, 2, data()), ReceiveOutcome::Delivered);
        assert_eq!(state.expected_seqno(), 3);
        assert_eq!(recorder.0.lock().unwrap().data, vec![1, 2]);
    }

    #[test]
    fn test_stale_delivery_dropped() {
        let (mut state, recorder) = state(1);
        state.receive(5, 0, 3, data());
        assert_eq!(state.receive(5, 2, 3, data()), ReceiveOutcome::Stale);
        assert_eq!(state.expected_seqno(), 4);
        assert_eq!(recorder.0.lock().unwrap().data, vec![3]);
    }

    #[test]
    fn test_unexpected_delivery_dropped() {
        let (mut state, recorder) = state(1);
        // Nothing delivered yet; a delivery starting at 7 skips 1..=7.
        assert_eq!(state.receive(5, 7, 8, data()), ReceiveOutcome::Unexpected);
        assert_eq!(state.expected_seqno(), 1);
        assert!(recorder.0.lock().unwrap().data.is_empty());
    }

    #[test]
    fn test_tail_subscription_accepts_first_marker() {
        let (mut state, recorder) = state(0);
        // The tail marker has prev 0 and positions the subscription.
        assert_eq!(state.receive(5, 0, 42, data()), ReceiveOutcome::Delivered);
        assert_eq!(state.expected_seqno(), 43);
        // Deliveries not anchored at the tail marker are rejected.
        let (mut fresh, _) = state_pair_helper();
        assert_eq!(fresh.receive(5, 41, 42, data()), ReceiveOutcome::Unexpected);
        assert_eq!(recorder.0.lock().unwrap().data, vec![42]);
    }

    fn state_pair_helper() -> (SubscriptionState, Recorder) {
        state(0)
    }

    #[test]
    fn test_gap_emits_range() {
        let (mut state, recorder) = state(5);
        assert_eq!(
            state.receive(9, 4, 9, DeliverPayload::Gap { gap_type: GapType::Benign }),
            ReceiveOutcome::Delivered
        );
        assert_eq!(state.expected_seqno(), 10);
        assert_eq!(recorder.0.lock().unwrap().gaps, vec![(5, 9)]);
    }

    #[test]
    fn test_strict_monotonicity_across_mixed_deliveries() {
        let (mut state, recorder) = state(1);
        state.receive(5, 0, 1, data());
        state.receive(5, 1, 2, data());
        state.receive(5, 2, 5, DeliverPayload::Gap { gap_type: GapType::Retention });
        state.receive(5, 5, 6, data());
        // Duplicate redelivery after a reconnect.
        state.receive(5, 1, 2, data());
        state.receive(5, 6, 7, data());

        let recorded = recorder.0.lock().unwrap();
        assert_eq!(recorded.data, vec![1, 2, 6, 7]);
        let mut all: Vec<SequenceNumber> = recorded.data.clone();
        all.extend(recorded.gaps.iter().map(|(_, to)| *to));
        let mut sorted = all.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(all.len(), sorted.len());
    }

    #[test]
    fn test_terminate_notifies_observer() {
        let (state, recorder) = state(1);
        state.terminate(TerminationReason::Requested);
        assert_eq!(
            recorder.0.lock().unwrap().terminated,
            vec![TerminationReason::Requested]
        );
    }
}
