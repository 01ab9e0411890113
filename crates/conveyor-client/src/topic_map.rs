//! Open-addressed map from (namespace, topic) to the upstream
//! subscription serving that topic.
//!
//! The table stores bare subscription IDs; the key of an entry is
//! recovered through a caller-supplied lookup, so topic bytes are never
//! duplicated here. Deletion uses backward shifting, which maintains the
//! invariant that no entry is separated from its optimal slot by a gap,
//! so the table needs no tombstones and lookups stop at the first gap.

use conveyor_core::{NamespaceID, SubscriptionID, Topic, NULL_SUBSCRIPTION_ID};
use xxhash_rust::xxh64::Xxh64;

const HASH_SEED: u64 = 0x57933C4A28A735B0;
const MIN_SIZE: usize = 16;
const LOAD_LOW: f64 = 0.25;
const LOAD_HIGH: f64 = 0.5;
const LOAD_OPT: f64 = (LOAD_LOW + LOAD_HIGH) / 2.0;

/// Resolves a subscription ID to its (namespace, topic) key. Returns
/// `None` only for IDs that are no longer known, which the map treats as
/// a key mismatch.
pub trait KeyOf {
    fn key_of(&self, sub_id: SubscriptionID) -> Option<(NamespaceID, Topic)>;
}

impl<F> KeyOf for F
where
    F: Fn(SubscriptionID) -> Option<(NamespaceID, Topic)>,
{
    fn key_of(&self, sub_id: SubscriptionID) -> Option<(NamespaceID, Topic)> {
        self(sub_id)
    }
}

pub struct TopicToSubscriptionMap {
    slots: Vec<SubscriptionID>,
    /// Cached load bounds for the current table size.
    count_low: usize,
    count_high: usize,
    count: usize,
}

impl TopicToSubscriptionMap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            count_low: 0,
            count_high: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Find the subscription for a topic, if any.
    pub fn find(
        &self,
        namespace_id: &[u8],
        topic: &[u8],
        keys: &impl KeyOf,
    ) -> Option<SubscriptionID> {
        if self.slots.is_empty() {
            return None;
        }

        let optimal = self.optimal_position(namespace_id, topic);
        let mut position = optimal;
        loop {
            let sub_id = self.slots[position];
            if sub_id == NULL_SUBSCRIPTION_ID {
                // Reached a gap: the key is not here.
                return None;
            }
            if let Some((ns, t)) = keys.key_of(sub_id) {
                if ns == namespace_id && t == topic {
                    return Some(sub_id);
                }
            }
            position = (position + 1) % self.slots.len();
            if position == optimal {
                // Walked the entire table.
                return None;
            }
        }
    }

    /// Insert an entry. Inserting a key that is already present is a
    /// contract violation; it is asserted in debug builds and dropped in
    /// release builds.
    pub fn insert(
        &mut self,
        namespace_id: &[u8],
        topic: &[u8],
        sub_id: SubscriptionID,
        keys: &impl KeyOf,
    ) {
        debug_assert_ne!(sub_id, NULL_SUBSCRIPTION_ID);
        self.rehash_if_needed(keys);
        self.insert_internal(namespace_id, topic, sub_id);
    }

    fn insert_internal(&mut self, namespace_id: &[u8], topic: &[u8], sub_id: SubscriptionID) {
        debug_assert!(self.count < self.count_high);
        debug_assert!(self.count < self.slots.len());

        let optimal = self.optimal_position(namespace_id, topic);
        let mut position = optimal;
        loop {
            if self.slots[position] == sub_id {
                // Duplicate insertion; contract violation.
                debug_assert!(false, "duplicate insertion of subscription {}", sub_id);
                return;
            }
            if self.slots[position] == NULL_SUBSCRIPTION_ID {
                self.slots[position] = sub_id;
                self.count += 1;
                return;
            }
            position = (position + 1) % self.slots.len();
            if position == optimal {
                // No gap found despite the load bound; the table is corrupt.
                debug_assert!(false, "no free slot found");
                return;
            }
        }
    }

    /// Remove an entry, returning false when it is not present.
    pub fn remove(
        &mut self,
        namespace_id: &[u8],
        topic: &[u8],
        sub_id: SubscriptionID,
        keys: &impl KeyOf,
    ) -> bool {
        debug_assert_ne!(sub_id, NULL_SUBSCRIPTION_ID);
        if self.slots.is_empty() {
            return false;
        }

        // Find the slot holding this ID.
        let mut position = {
            let optimal = self.optimal_position(namespace_id, topic);
            let mut position = optimal;
            loop {
                if self.slots[position] == NULL_SUBSCRIPTION_ID
                    || self.slots[position] == sub_id
                {
                    break;
                }
                position = (position + 1) % self.slots.len();
                if position == optimal {
                    break;
                }
            }
            if self.slots[position] != sub_id {
                return false;
            }
            position
        };

        debug_assert!(self.count > 0);
        self.count -= 1;

        // Backward shift: ensure no element ends up separated from its
        // optimal slot by a gap. Only elements between the removed slot
        // and the next gap can be affected.
        let mut current = position;
        loop {
            self.slots[position] = NULL_SUBSCRIPTION_ID;
            current = (current + 1) % self.slots.len();

            let current_id = self.slots[current];
            if current_id == NULL_SUBSCRIPTION_ID {
                break;
            }

            let (ns, t) = match keys.key_of(current_id) {
                Some(key) => key,
                None => break,
            };
            let x = self.optimal_position(&ns, &t);
            let in_between = if position <= current {
                position < x && x <= current
            } else {
                position < x || x <= current
            };
            if in_between {
                continue;
            }

            self.slots[position] = current_id;
            position = current;
        }

        self.rehash_if_needed(keys);
        true
    }

    fn optimal_position(&self, namespace_id: &[u8], topic: &[u8]) -> usize {
        debug_assert!(!self.slots.is_empty());
        let mut hasher = Xxh64::new(HASH_SEED);
        hasher.update(namespace_id);
        hasher.update(topic);
        (hasher.digest() % self.slots.len() as u64) as usize
    }

    fn needs_rehash(&self) -> bool {
        self.count_low > self.count || self.count >= self.count_high
    }

    fn rehash_if_needed(&mut self, keys: &impl KeyOf) {
        if !self.needs_rehash() {
            return;
        }

        let mut new_size = (self.count as f64 / LOAD_OPT) as usize;
        self.count_low = (new_size as f64 * LOAD_LOW) as usize;
        if new_size <= MIN_SIZE {
            new_size = MIN_SIZE;
            self.count_low = 0;
        }
        self.count_high = (new_size as f64 * LOAD_HIGH) as usize;

        let old_slots = std::mem::replace(&mut self.slots, vec![NULL_SUBSCRIPTION_ID; new_size]);
        let old_count = self.count;
        self.count = 0;
        for sub_id in old_slots {
            if sub_id == NULL_SUBSCRIPTION_ID {
                continue;
            }
            match keys.key_of(sub_id) {
                Some((ns, t)) => self.insert_internal(&ns, &t, sub_id),
                None => debug_assert!(false, "no key for subscription {}", sub_id),
            }
        }

        debug_assert_eq!(self.count, old_count);
        debug_assert!(self.count_low <= self.count_high);
        debug_assert!(self.count_high < self.slots.len());
        debug_assert!(!self.needs_rehash());
    }

    #[cfg(test)]
    fn check_invariants(&self, keys: &impl KeyOf) {
        assert!(self.slots.len() >= MIN_SIZE || self.slots.is_empty());
        assert!(self.count >= self.count_low);
        assert!(self.count < self.count_high || self.slots.is_empty());

        // No entry may be separated from its optimal slot by a gap.
        for (position, &sub_id) in self.slots.iter().enumerate() {
            if sub_id == NULL_SUBSCRIPTION_ID {
                continue;
            }
            let (ns, t) = keys.key_of(sub_id).expect("entry without key");
            let mut walk = self.optimal_position(&ns, &t);
            while walk != position {
                assert_ne!(
                    self.slots[walk], NULL_SUBSCRIPTION_ID,
                    "gap between optimal slot and entry for {}",
                    sub_id
                );
                walk = (walk + 1) % self.slots.len();
            }
        }
    }
}

impl Default for TopicToSubscriptionMap {
    fn default() -> Self {
        Self::new()
    }
}
