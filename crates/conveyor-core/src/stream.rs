//! Stream identity allocation.
//!
//! Stream IDs only need to be unique per connection, but allocating them
//! from per-loop partitions of the 64-bit space keeps IDs picked by
//! different workers disjoint without any coordination, which in turn lets
//! a proxy forward streams between loops without remapping.

use crate::types::StreamID;

/// Allocates stream IDs from a half-open range of the 64-bit space.
#[derive(Debug)]
pub struct StreamAllocator {
    start: StreamID,
    next: StreamID,
    end: StreamID,
}

impl StreamAllocator {
    /// An allocator over the entire ID space except ID 0, which is
    /// reserved for socket-level control messages.
    pub fn new() -> Self {
        Self {
            start: 1,
            next: 1,
            end: StreamID::MAX,
        }
    }

    fn with_range(start: StreamID, end: StreamID) -> Self {
        Self {
            start,
            next: start,
            end,
        }
    }

    /// Split the remaining range into `pieces` disjoint allocators, one per
    /// worker. The original allocator is consumed by the split.
    pub fn divide(self, pieces: usize) -> Vec<StreamAllocator> {
        assert!(pieces > 0);
        let span = (self.end - self.next) / pieces as StreamID;
        (0..pieces)
            .map(|i| {
                let start = self.next + span * i as StreamID;
                let end = if i + 1 == pieces {
                    self.end
                } else {
                    start + span
                };
                StreamAllocator::with_range(start, end)
            })
            .collect()
    }

    /// Allocate the next ID from this partition.
    pub fn next(&mut self) -> StreamID {
        debug_assert!(self.next < self.end, "stream ID partition exhausted");
        let id = self.next;
        self.next += 1;
        id
    }

    /// True if `id` was allocated from this partition.
    pub fn contains(&self, id: StreamID) -> bool {
        id >= self.start && id < self.next
    }
}

impl Default for StreamAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divide_is_disjoint() {
        let mut allocators = StreamAllocator::new().divide(4);
        let mut seen = std::collections::HashSet::new();
        for alloc in allocators.iter_mut() {
            for _ in 0..1000 {
                assert!(seen.insert(alloc.next()));
            }
        }
    }

    #[test]
    fn test_sequential_within_partition() {
        let mut alloc = StreamAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert_eq!(b, a + 1);
    }
}
