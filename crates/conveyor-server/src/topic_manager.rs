//! Per-topic subscriber sets and the host map.

use ahash::AHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;

use conveyor_core::{HostId, NamespaceID, SequenceNumber, Topic};

/// Compact integer naming a host, bijective with `HostId` via `HostMap`.
pub type HostNumber = u32;

/// Full name of a topic: namespace plus topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicUUID {
    pub namespace_id: NamespaceID,
    pub topic: Topic,
}

impl TopicUUID {
    pub fn new(namespace_id: impl Into<NamespaceID>, topic: impl Into<Topic>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            topic: topic.into(),
        }
    }
}

struct HostMapInner {
    hosts: Vec<HostId>,
    index: AHashMap<HostId, HostNumber>,
}

/// Bidirectional host naming, shared across rooms. Write-mostly at boot,
/// read by every fan-out.
pub struct HostMap {
    inner: RwLock<HostMapInner>,
}

impl HostMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HostMapInner {
                hosts: Vec::new(),
                index: AHashMap::new(),
            }),
        }
    }

    pub fn lookup(&self, host: &HostId) -> Option<HostNumber> {
        self.inner.read().index.get(host).copied()
    }

    /// Name a host, assigning the next number on first sight.
    pub fn insert(&self, host: &HostId) -> HostNumber {
        if let Some(hostnum) = self.lookup(host) {
            return hostnum;
        }
        let mut inner = self.inner.write();
        if let Some(&hostnum) = inner.index.get(host) {
            return hostnum;
        }
        let hostnum = inner.hosts.len() as HostNumber;
        inner.hosts.push(host.clone());
        inner.index.insert(host.clone(), hostnum);
        hostnum
    }

    pub fn host(&self, hostnum: HostNumber) -> Option<HostId> {
        self.inner.read().hosts.get(hostnum as usize).cloned()
    }
}

impl Default for HostMap {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber of a topic: who, and the next seqno they expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicSubscription {
    hostnum: HostNumber,
    seqno: SequenceNumber,
}

impl TopicSubscription {
    pub fn new(hostnum: HostNumber, seqno: SequenceNumber) -> Self {
        Self { hostnum, seqno }
    }

    pub fn hostnum(&self) -> HostNumber {
        self.hostnum
    }

    pub fn seqno(&self) -> SequenceNumber {
        self.seqno
    }

    pub fn set_seqno(&mut self, seqno: SequenceNumber) {
        self.seqno = seqno;
    }
}

/// Most topics have exactly one subscriber; in the worst case the list
/// holds one entry per downstream host, so linear scans are fine and
/// memory matters more.
pub type TopicList = SmallVec<[TopicSubscription; 1]>;

/// Maps topics to their subscriber lists.
pub struct TopicManager {
    topic_map: AHashMap<TopicUUID, TopicList>,
}

impl TopicManager {
    pub fn new() -> Self {
        Self {
            topic_map: AHashMap::new(),
        }
    }

    /// Add a subscriber. Returns true iff the topic previously had none,
    /// i.e. the caller should start tailing the backing log. A host that
    /// is already subscribed just has its position updated.
    pub fn add_subscriber(
        &mut self,
        topic: &TopicUUID,
        start: SequenceNumber,
        subscriber: HostNumber,
    ) -> bool {
        match self.topic_map.get_mut(topic) {
            Some(list) => {
                if let Some(existing) = list.iter_mut().find(|s| s.hostnum == subscriber) {
                    existing.seqno = start;
                } else {
                    list.push(TopicSubscription::new(subscriber, start));
                }
                false
            }
            None => {
                let mut list = TopicList::new();
                list.push(TopicSubscription::new(subscriber, start));
                self.topic_map.insert(topic.clone(), list);
                true
            }
        }
    }

    /// Remove a subscriber. Returns true iff the topic now has none,
    /// i.e. the caller should stop tailing.
    pub fn remove_subscriber(&mut self, topic: &TopicUUID, subscriber: HostNumber) -> bool {
        let Some(list) = self.topic_map.get_mut(topic) else {
            return false;
        };
        list.retain(|s| s.hostnum != subscriber);
        if list.is_empty() {
            self.topic_map.remove(topic);
            true
        } else {
            false
        }
    }

    /// Visit subscribers whose next expected seqno lies in `[from, to]`.
    /// The visitor may advance the seqno. Visitation order is
    /// unspecified.
    pub fn visit_subscribers(
        &mut self,
        topic: &TopicUUID,
        from: SequenceNumber,
        to: SequenceNumber,
        mut visitor: impl FnMut(&mut TopicSubscription),
    ) {
        if let Some(list) = self.topic_map.get_mut(topic) {
            for subscription in list.iter_mut() {
                if subscription.seqno >= from && subscription.seqno <= to {
                    visitor(subscription);
                }
            }
        }
    }

    /// Visit every topic that has subscribers.
    pub fn visit_topics(&self, mut visitor: impl FnMut(&TopicUUID)) {
        for topic in self.topic_map.keys() {
            visitor(topic);
        }
    }

    pub fn num_topics(&self) -> usize {
        self.topic_map.len()
    }
}

impl Default for TopicManager {
    fn default() -> Self {
        Self::new()
    }
}
