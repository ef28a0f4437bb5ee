// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lock-free bounded MPMC ring buffer, shared by every reader (producer,
// one per MDT) and every worker thread (consumer) in load-balancer mode.
// Capacity must be a power of two; cursors are cache-line padded to keep
// producer and consumer traffic off each other's line.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default capacity for a load-balancer ring when none is configured.
pub const DEFAULT_CAPACITY: usize = 1 << 15;

#[repr(C)]
struct PaddedCounter {
    value: AtomicU64,
    _pad: [u8; 64 - 8],
}

impl PaddedCounter {
    fn new(v: u64) -> Self {
        PaddedCounter { value: AtomicU64::new(v), _pad: [0; 64 - 8] }
    }
}

struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Inner<T> {
    buffer: Box<[Slot<T>]>,
    mask: u64,
    enqueue_pos: PaddedCounter,
    dequeue_pos: PaddedCounter,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn push(&self, item: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.value.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - pos as i64;
            if diff == 0 {
                match self.enqueue_pos.value.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(item) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(observed) => pos = observed,
                }
            } else if diff < 0 {
                return Err(item); // ring is full
            } else {
                pos = self.enqueue_pos.value.load(Ordering::Relaxed);
            }
        }
    }

    fn pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.value.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(pos & self.mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as i64 - (pos.wrapping_add(1)) as i64;
            if diff == 0 {
                match self.dequeue_pos.value.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let item = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence.store(pos.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
                        return Some(item);
                    }
                    Err(observed) => pos = observed,
                }
            } else if diff < 0 {
                return None; // ring is empty
            } else {
                pos = self.dequeue_pos.value.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut pos = self.dequeue_pos.value.load(Ordering::Relaxed);
        let tail = self.enqueue_pos.value.load(Ordering::Relaxed);
        while pos != tail {
            let slot = &self.buffer[(pos & self.mask) as usize];
            unsafe { ptr::drop_in_place((*slot.value.get()).as_mut_ptr()) };
            pos = pos.wrapping_add(1);
        }
    }
}

/// A bounded MPMC ring. Producer/consumer capabilities are obtained
/// explicitly via [`Ring::producer`]/[`Ring::consumer`] and handed to the
/// threads that use them, rather than relying on thread-local state.
pub struct Ring<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Ring<T> {
    /// `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let buffer: Box<[Slot<T>]> = (0..capacity)
            .map(|i| Slot { sequence: AtomicU64::new(i as u64), value: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect();
        let inner = Inner {
            buffer,
            mask: (capacity - 1) as u64,
            enqueue_pos: PaddedCounter::new(0),
            dequeue_pos: PaddedCounter::new(0),
        };
        Ring { inner: Arc::new(inner) }
    }

    pub fn producer(&self) -> ProducerHandle<T> {
        ProducerHandle { inner: self.inner.clone() }
    }

    pub fn consumer(&self) -> ConsumerHandle<T> {
        ConsumerHandle { inner: self.inner.clone() }
    }
}

/// A single MDT reader's write capability on the shared ring.
pub struct ProducerHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> ProducerHandle<T> {
    /// Returns `Err(item)` if the ring was full at the time of the call.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.push(item)
    }
}

impl<T> Clone for ProducerHandle<T> {
    fn clone(&self) -> Self {
        ProducerHandle { inner: self.inner.clone() }
    }
}

/// A single worker thread's read capability on the shared ring.
pub struct ConsumerHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> ConsumerHandle<T> {
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }
}

impl<T> Clone for ConsumerHandle<T> {
    fn clone(&self) -> Self {
        ConsumerHandle { inner: self.inner.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_thread_push_pop_preserves_order() {
        let ring: Ring<u32> = Ring::with_capacity(4);
        let p = ring.producer();
        let c = ring.consumer();
        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(c.pop(), Some(1));
        assert_eq!(c.pop(), Some(2));
        assert_eq!(c.pop(), None);
    }

    #[test]
    fn push_fails_when_full() {
        let ring: Ring<u32> = Ring::with_capacity(2);
        let p = ring.producer();
        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(p.push(3), Err(3));
    }

    #[test]
    fn multiple_producers_and_consumers_see_every_item_exactly_once() {
        let ring: Ring<u32> = Ring::with_capacity(1024);
        let producers: Vec<_> = (0..4).map(|_| ring.producer()).collect();
        let consumers: Vec<_> = (0..4).map(|_| ring.consumer()).collect();

        let writers: Vec<_> = producers
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                thread::spawn(move || {
                    for n in 0..100u32 {
                        let mut item = i as u32 * 1000 + n;
                        while let Err(back) = p.push(item) {
                            item = back;
                        }
                    }
                })
            })
            .collect();

        let popped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let readers: Vec<_> = consumers
            .into_iter()
            .map(|c| {
                let popped = popped.clone();
                thread::spawn(move || {
                    let mut count = 0;
                    while popped.load(Ordering::Relaxed) < 400 {
                        if c.pop().is_some() {
                            count += 1;
                            popped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    count
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        let mut total = 0;
        for r in readers {
            total += r.join().unwrap();
        }
        assert_eq!(total, 400);
    }
}
