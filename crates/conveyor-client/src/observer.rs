//! The observer capability: how delivered records reach the application.

use bytes::Bytes;
use conveyor_core::{GapType, NamespaceID, SequenceNumber, SubscriptionID, Topic};

/// A record delivered on a subscription.
#[derive(Debug, Clone)]
pub struct MessageReceived {
    /// Handle of the subscription this record arrived on. Pass it back to
    /// `Client::acknowledge`.
    pub sub_id: SubscriptionID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub seqno: SequenceNumber,
    pub payload: Bytes,
}

/// Why a subscription terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The application unsubscribed.
    Requested,
    /// The server does not recognise the subscription.
    Invalid,
    /// The server shed the subscription under load.
    BackOff,
}

/// Application-supplied sink for one subscription.
///
/// All three callbacks run on the worker thread that owns the
/// subscription; they must not block.
pub trait Observer: Send {
    /// A record arrived, in order.
    fn on_data(&mut self, message: MessageReceived);

    /// The range `[from, to]` contains no deliverable data.
    fn on_gap(&mut self, from: SequenceNumber, to: SequenceNumber, gap_type: GapType) {
        let _ = (from, to, gap_type);
    }

    /// The subscription is gone and no further callbacks will fire.
    fn on_terminated(&mut self, reason: TerminationReason) {
        let _ = reason;
    }
}

/// Observer built from closures, for callers that do not want a type.
pub struct FnObserver<D> {
    on_data: D,
}

impl<D: FnMut(MessageReceived) + Send> FnObserver<D> {
    pub fn new(on_data: D) -> Self {
        Self { on_data }
    }
}

impl<D: FnMut(MessageReceived) + Send> Observer for FnObserver<D> {
    fn on_data(&mut self, message: MessageReceived) {
        (self.on_data)(message);
    }
}
