// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded in-memory record cache: a FIFO list of fixed-capacity buckets.

use std::collections::VecDeque;

use crate::source::ChangeRecord;

/// An ordered batch of up to `batch_size` records, plus their aggregated
/// serialized byte size and this reader's bucket sequence number.
#[derive(Debug)]
pub struct Bucket {
    pub seq: u64,
    pub records: Vec<ChangeRecord>,
    pub byte_size: usize,
    capacity: usize,
}

impl Bucket {
    fn new(seq: u64, capacity: usize) -> Self {
        Bucket { seq, records: Vec::with_capacity(capacity), byte_size: 0, capacity }
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    fn push(&mut self, record: ChangeRecord) {
        self.byte_size += record.byte_len();
        self.records.push(record);
    }

    pub fn rec_count(&self) -> usize {
        self.records.len()
    }
}

/// FIFO list of pending buckets for one reader. Capacity is
/// `batch_size * max_buckets`; `total_cached` is the sum of `rec_count`
/// across every bucket currently queued (buckets already handed out to a
/// consumer no longer count, since ownership has transferred).
pub struct RecordCache {
    batch_size: usize,
    max_buckets: usize,
    buckets: VecDeque<Bucket>,
    next_seq: u64,
    total_cached: usize,
}

impl RecordCache {
    pub fn new(batch_size: usize, max_buckets: usize) -> Self {
        RecordCache {
            batch_size: batch_size.max(1),
            max_buckets: max_buckets.max(1),
            buckets: VecDeque::new(),
            next_seq: 0,
            total_cached: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.batch_size * self.max_buckets
    }

    pub fn total_cached(&self) -> usize {
        self.total_cached
    }

    pub fn is_full(&self) -> bool {
        self.total_cached >= self.capacity()
    }

    /// Append a record to the tail bucket, allocating a fresh bucket if the
    /// current tail is full or absent. Caller must check [`is_full`] first;
    /// pushing past capacity still succeeds (the enqueue phase is expected
    /// to yield rather than ever call this once full).
    pub fn push(&mut self, record: ChangeRecord) {
        if self.buckets.back().map(|b| b.is_full()).unwrap_or(true) {
            self.buckets.push_back(Bucket::new(self.next_seq, self.batch_size));
            self.next_seq += 1;
        }
        self.buckets.back_mut().unwrap().push(record);
        self.total_cached += 1;
    }

    /// Detach and return the head bucket, if any. Ownership transfers to
    /// the caller (a consumer's `current_bucket`).
    pub fn pop(&mut self) -> Option<Bucket> {
        let bucket = self.buckets.pop_front()?;
        self.total_cached -= bucket.rec_count();
        Some(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(index: u64) -> ChangeRecord {
        ChangeRecord { index, type_tag: 0, timestamp: 0, flags: 0, name: Vec::new() }
    }

    #[test]
    fn push_fills_buckets_to_batch_size_then_rolls_over() {
        let mut cache = RecordCache::new(2, 4);
        for i in 1..=5 {
            cache.push(rec(i));
        }
        assert_eq!(cache.total_cached(), 5);
        let first = cache.pop().unwrap();
        assert_eq!(first.rec_count(), 2);
        assert_eq!(first.records[0].index, 1);
        let second = cache.pop().unwrap();
        assert_eq!(second.rec_count(), 2);
        let third = cache.pop().unwrap();
        assert_eq!(third.rec_count(), 1);
        assert!(cache.pop().is_none());
    }

    #[test]
    fn capacity_enforced_is_full() {
        let mut cache = RecordCache::new(2, 2); // capacity 4
        for i in 1..=4 {
            cache.push(rec(i));
        }
        assert!(cache.is_full());
    }

    #[test]
    fn pop_on_empty_cache_is_none() {
        let mut cache = RecordCache::new(4, 4);
        assert!(cache.pop().is_none());
    }
}
