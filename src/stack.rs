//! Lock-free LIFO stack.
//!
//! [`LockFreeStack`] is a Treiber stack whose nodes live in an append-only
//! arena. Each node is addressed by a 32-bit index, and the stack head packs
//! that index together with a 32-bit version tag into a single `AtomicU64`.
//! Every successful head update bumps the tag, so a pop that read the head,
//! stalled, and then tries to install a stale successor fails its CAS even if
//! the same node index was popped and pushed back in the meantime (the ABA
//! problem).
//!
//! Popped nodes are not freed: they go onto a second tagged stack, the free
//! list, and are reused by later pushes. Node memory is released only when the
//! stack itself is dropped, so a racing pop may always read the `next` link of
//! any node it has seen.
//!
//! ```
//! use lockstep::LockFreeStack;
//!
//! let stack = LockFreeStack::new();
//! stack.push(1);
//! stack.push(2);
//! assert_eq!(stack.pop(), Some(2));
//! assert_eq!(stack.len(), 1);
//! ```

#![allow(unsafe_code)]

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::atomic::AtomicCounter;

/// Nodes in the first arena segment; each later segment doubles.
const FIRST_SEGMENT_LEN: usize = 32;
/// Enough segments to address every index representable in a link.
const SEGMENTS: usize = 27;
/// Total node slots across all segments.
const CAPACITY: usize = FIRST_SEGMENT_LEN * ((1 << SEGMENTS) - 1);

/// A node link: node index plus one, with zero meaning "none".
type Link = u32;
const NIL: Link = 0;

#[inline]
const fn pack(tag: u32, link: Link) -> u64 {
    ((tag as u64) << 32) | link as u64
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(word: u64) -> (u32, Link) {
    ((word >> 32) as u32, word as u32)
}

/// Maps a node index to its segment and offset within the segment.
#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn locate(index: usize) -> (usize, usize) {
    let bucket = index / FIRST_SEGMENT_LEN + 1;
    let segment = (usize::BITS - 1 - bucket.leading_zeros()) as usize;
    let base = FIRST_SEGMENT_LEN * ((1 << segment) - 1);
    (segment, index - base)
}

#[inline]
const fn segment_len(segment: usize) -> usize {
    FIRST_SEGMENT_LEN << segment
}

struct Node<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    next: AtomicU32,
}

impl<T> Node<T> {
    fn empty() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicU32::new(NIL),
        }
    }
}

/// A lock-free, multi-producer multi-consumer LIFO stack.
pub struct LockFreeStack<T> {
    /// Tagged link to the top node.
    head: CachePadded<AtomicU64>,
    /// Tagged link to the first recycled node.
    free: CachePadded<AtomicU64>,
    /// Next never-used arena index.
    fresh: AtomicUsize,
    segments: [AtomicPtr<Node<T>>; SEGMENTS],
    len: AtomicCounter,
    _owns: PhantomData<T>,
}

// Safety: values are moved in by `push` and out by `pop`, each exactly once,
// with the head CAS ordering the handoff between threads.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    /// Creates an empty stack. No memory is allocated until the first push.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            free: CachePadded::new(AtomicU64::new(pack(0, NIL))),
            fresh: AtomicUsize::new(0),
            segments: [const { AtomicPtr::new(ptr::null_mut()) }; SEGMENTS],
            len: AtomicCounter::new(0),
            _owns: PhantomData,
        }
    }

    /// Pushes `value` onto the top of the stack.
    ///
    /// # Panics
    ///
    /// Panics if the stack has ever held more than about four billion
    /// elements at once.
    pub fn push(&self, value: T) {
        let index = self.take_node();
        let node = self.node(index);
        // Safety: the node was just taken off the free list or freshly
        // allocated, so no other thread can reach it until it is linked.
        unsafe { (*node.value.get()).write(value) };
        self.push_link(&self.head, index);
        self.len.increment();
    }

    /// Removes and returns the top of the stack, or `None` if it is empty.
    pub fn pop(&self) -> Option<T> {
        let index = self.pop_link(&self.head)?;
        let node = self.node(index);
        // Safety: the successful head CAS made this thread the node's only
        // owner, and the value was initialized by the push that linked it.
        let value = unsafe { (*node.value.get()).assume_init_read() };
        self.len.decrement();
        self.push_link(&self.free, index);
        Some(value)
    }

    /// Returns the number of elements.
    ///
    /// Under concurrent pushes and pops this is a snapshot that may already be
    /// stale when it returns.
    #[must_use]
    pub fn len(&self) -> usize {
        usize::try_from(self.len.get()).unwrap_or(0)
    }

    /// Returns true if the stack holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let (_, top) = unpack(self.head.load(Ordering::Acquire));
        top == NIL
    }

    /// Returns the number of node slots allocated so far.
    #[must_use]
    pub fn allocated_nodes(&self) -> usize {
        self.fresh.load(Ordering::Relaxed).min(CAPACITY)
    }

    fn take_node(&self) -> usize {
        if let Some(index) = self.pop_link(&self.free) {
            return index;
        }
        let index = self.fresh.fetch_add(1, Ordering::Relaxed);
        assert!(index < CAPACITY, "lock-free stack capacity exhausted");
        let (segment, _) = locate(index);
        self.ensure_segment(segment);
        index
    }

    fn ensure_segment(&self, segment: usize) {
        let slot = &self.segments[segment];
        if !slot.load(Ordering::Acquire).is_null() {
            return;
        }

        let nodes: Box<[Node<T>]> = (0..segment_len(segment)).map(|_| Node::empty()).collect();
        let fresh = Box::into_raw(nodes).cast::<Node<T>>();
        if slot
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another thread installed the segment first.
            // Safety: `fresh` came from `Box::into_raw` above with this length
            // and was never shared.
            drop(unsafe {
                Box::from_raw(ptr::slice_from_raw_parts_mut(fresh, segment_len(segment)))
            });
        }
    }

    fn node(&self, index: usize) -> &Node<T> {
        let (segment, offset) = locate(index);
        let base = self.segments[segment].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "node {index} in unallocated segment");
        // Safety: an index is only handed out after its segment is installed,
        // segments are never freed before the stack, and `offset` is within
        // the segment by construction of `locate`.
        unsafe { &*base.add(offset) }
    }

    /// Links node `index` in as the new top of the tagged list at `top`.
    fn push_link(&self, top: &AtomicU64, index: usize) {
        let node = self.node(index);
        let link = Link::try_from(index + 1).unwrap_or(NIL);
        debug_assert_ne!(link, NIL, "node index fits in a link");
        let mut current = top.load(Ordering::Relaxed);
        loop {
            let (tag, first) = unpack(current);
            node.next.store(first, Ordering::Relaxed);
            match top.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), link),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Unlinks and returns the top node index of the tagged list at `top`.
    fn pop_link(&self, top: &AtomicU64) -> Option<usize> {
        let mut current = top.load(Ordering::Acquire);
        loop {
            let (tag, first) = unpack(current);
            if first == NIL {
                return None;
            }
            let index = first as usize - 1;
            // May be stale if the node was popped and relinked meanwhile; the
            // tag makes the CAS below fail in that case.
            let next = self.node(index).next.load(Ordering::Relaxed);
            match top.compare_exchange_weak(
                current,
                pack(tag.wrapping_add(1), next),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(observed) => current = observed,
            }
        }
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("len", &self.len())
            .field("allocated_nodes", &self.allocated_nodes())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        for (segment, slot) in self.segments.iter_mut().enumerate() {
            let base = *slot.get_mut();
            if base.is_null() {
                continue;
            }
            // Safety: installed by `ensure_segment` from a boxed slice of this
            // length; every value has been moved out above.
            drop(unsafe {
                Box::from_raw(ptr::slice_from_raw_parts_mut(base, segment_len(segment)))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn locate_spans_doubling_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(31), (0, 31));
        assert_eq!(locate(32), (1, 0));
        assert_eq!(locate(95), (1, 63));
        assert_eq!(locate(96), (2, 0));
        assert_eq!(locate(CAPACITY - 1), (SEGMENTS - 1, segment_len(SEGMENTS - 1) - 1));
        assert!(u32::try_from(CAPACITY).is_ok());
    }

    #[test]
    fn pack_round_trips_tag_and_link() {
        assert_eq!(unpack(pack(7, 42)), (7, 42));
        assert_eq!(unpack(pack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
    }

    #[test]
    fn pop_empty_returns_none() {
        let stack: LockFreeStack<u8> = LockFreeStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.len(), 0);
    }

    #[test]
    fn lifo_order() {
        let stack = LockFreeStack::new();
        for value in 1..=3 {
            stack.push(value);
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn popped_nodes_are_recycled() {
        let stack = LockFreeStack::new();
        for round in 0..10 {
            for value in 0..20 {
                stack.push(round * 100 + value);
            }
            while stack.pop().is_some() {}
        }
        assert_eq!(stack.allocated_nodes(), 20);
    }

    #[test]
    fn grows_across_segments() {
        let stack = LockFreeStack::new();
        for value in 0..1_000 {
            stack.push(value);
        }
        assert_eq!(stack.len(), 1_000);
        for expected in (0..1_000).rev() {
            assert_eq!(stack.pop(), Some(expected));
        }
    }

    #[test]
    fn drop_releases_remaining_values() {
        let marker = Arc::new(());
        {
            let stack = LockFreeStack::new();
            for _ in 0..50 {
                stack.push(Arc::clone(&marker));
            }
            drop(stack.pop());
            assert_eq!(Arc::strong_count(&marker), 50);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn concurrent_push_pop_preserves_multiset() {
        let stack = Arc::new(LockFreeStack::new());
        let threads = 4_usize;
        let per_thread = 2_000_usize;

        let producers: Vec<_> = (0..threads)
            .map(|t| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        stack.push(t * per_thread + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..threads)
            .map(|_| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    let mut taken = Vec::new();
                    for _ in 0..per_thread / 2 {
                        if let Some(value) = stack.pop() {
                            taken.push(value);
                        }
                    }
                    taken
                })
            })
            .collect();

        for producer in producers {
            producer.join().expect("producer join");
        }
        let mut seen = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().expect("consumer join") {
                assert!(seen.insert(value), "value {value} popped twice");
            }
        }
        while let Some(value) = stack.pop() {
            assert!(seen.insert(value), "value {value} popped twice");
        }
        assert_eq!(seen.len(), threads * per_thread);
        assert!(stack.is_empty());
    }
}
