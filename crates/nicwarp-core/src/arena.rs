//! Fixed-capacity slot arena.
//!
//! Every software queue in nicwarp is built on a [`SlotArena`]: a pool of
//! `capacity` slots addressed by small integer indices, one LIFO free list and
//! any number of FIFO queues. All lists share a single `next` chain, so a slot
//! can only ever sit in one list at a time.
//!
//! The arena knows nothing about message contents. Callers keep payload storage
//! in a parallel array indexed by [`SlotId::index`] and own a slot's storage
//! exactly while they hold its id (between `alloc`/`dequeue` and
//! `enqueue`/`release`).
//!
//! None of the operations block or allocate. Callers that need to wait put the
//! arena behind a lock and pair it with a condition variable.

use std::fmt;

/// End-of-list marker in the `next` chain.
const NONE: u32 = u32::MAX;

/// Index of a slot in a [`SlotArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    /// Creates a slot id from a raw index.
    pub const fn new(index: u32) -> Self {
        SlotId(index)
    }

    /// Returns the slot index as `usize`, for indexing parallel storage.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw slot index.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a named queue inside a [`SlotArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);

/// Which list, if any, currently holds a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SlotTag {
    Free,
    CheckedOut,
    Queued(usize),
}

#[derive(Copy, Clone, Debug)]
struct QueueEnds {
    head: u32,
    tail: u32,
    len: usize,
}

impl QueueEnds {
    const EMPTY: QueueEnds = QueueEnds { head: NONE, tail: NONE, len: 0 };
}

/// Pool of indexed slots with one free list and `queue_count` FIFO queues.
pub struct SlotArena {
    next: Box<[u32]>,
    tags: Box<[SlotTag]>,
    free_head: u32,
    free_len: usize,
    queues: Box<[QueueEnds]>,
}

impl SlotArena {
    /// Creates an arena of `capacity` slots, all free, and `queue_count` empty queues.
    ///
    /// The free list is initialised in index order, so the first allocations return
    /// slot 0, 1, 2, ...
    pub fn new(capacity: usize, queue_count: usize) -> Self {
        assert!(capacity < NONE as usize, "arena capacity exceeds index space");

        let next: Box<[u32]> = (0..capacity)
            .map(|i| if i + 1 < capacity { (i + 1) as u32 } else { NONE })
            .collect();

        SlotArena {
            next,
            tags: vec![SlotTag::Free; capacity].into_boxed_slice(),
            free_head: if capacity == 0 { NONE } else { 0 },
            free_len: capacity,
            queues: vec![QueueEnds::EMPTY; queue_count].into_boxed_slice(),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.next.len()
    }

    /// Number of named queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Number of slots on the free list.
    pub fn free_len(&self) -> usize {
        self.free_len
    }

    /// Returns true when no slot can be allocated.
    pub fn is_exhausted(&self) -> bool {
        self.free_head == NONE
    }

    /// Pops a slot from the free list. `None` means no capacity.
    pub fn alloc(&mut self) -> Option<SlotId> {
        if self.free_head == NONE {
            return None;
        }
        let slot = self.free_head;
        self.free_head = self.next[slot as usize];
        self.next[slot as usize] = NONE;
        self.free_len -= 1;

        debug_assert_eq!(self.tags[slot as usize], SlotTag::Free, "free list corrupted at {}", slot);
        self.tags[slot as usize] = SlotTag::CheckedOut;
        Some(SlotId(slot))
    }

    /// Pushes a slot back onto the free list.
    ///
    /// The caller must have obtained `slot` from `alloc` or `dequeue` and must
    /// release it exactly once. Releasing a free or queued slot corrupts the lists;
    /// debug builds catch it.
    pub fn release(&mut self, slot: SlotId) {
        let idx = slot.index();
        debug_assert_eq!(
            self.tags[idx],
            SlotTag::CheckedOut,
            "release of slot {} that is not checked out",
            slot
        );
        self.tags[idx] = SlotTag::Free;
        self.next[idx] = self.free_head;
        self.free_head = slot.0;
        self.free_len += 1;
    }

    /// Appends a checked-out slot to the tail of `queue`.
    pub fn enqueue(&mut self, queue: QueueId, slot: SlotId) {
        let idx = slot.index();
        debug_assert_eq!(
            self.tags[idx],
            SlotTag::CheckedOut,
            "enqueue of slot {} that is not checked out",
            slot
        );
        self.tags[idx] = SlotTag::Queued(queue.0);
        self.next[idx] = NONE;

        let ends = &mut self.queues[queue.0];
        if ends.tail == NONE {
            ends.head = slot.0;
        } else {
            self.next[ends.tail as usize] = slot.0;
        }
        ends.tail = slot.0;
        ends.len += 1;
    }

    /// Pops the head of `queue`. `None` means the queue is empty.
    pub fn dequeue(&mut self, queue: QueueId) -> Option<SlotId> {
        let ends = &mut self.queues[queue.0];
        if ends.head == NONE {
            return None;
        }
        let slot = ends.head;
        ends.head = self.next[slot as usize];
        if ends.head == NONE {
            ends.tail = NONE;
        }
        ends.len -= 1;
        self.next[slot as usize] = NONE;

        debug_assert_eq!(self.tags[slot as usize], SlotTag::Queued(queue.0));
        self.tags[slot as usize] = SlotTag::CheckedOut;
        Some(SlotId(slot))
    }

    /// Returns the slot at the head of `queue` without removing it.
    pub fn peek(&self, queue: QueueId) -> Option<SlotId> {
        let head = self.queues[queue.0].head;
        (head != NONE).then_some(SlotId(head))
    }

    /// Returns true if `queue` holds at least one slot.
    #[inline]
    pub fn queue_nonempty(&self, queue: QueueId) -> bool {
        self.queues[queue.0].head != NONE
    }

    /// Number of slots in `queue`.
    pub fn queue_len(&self, queue: QueueId) -> usize {
        self.queues[queue.0].len
    }

    /// Number of slots currently held by callers (neither free nor queued).
    pub fn checked_out(&self) -> usize {
        let queued: usize = self.queues.iter().map(|q| q.len).sum();
        self.capacity() - self.free_len - queued
    }
}

impl fmt::Debug for SlotArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotArena")
            .field("capacity", &self.capacity())
            .field("free", &self.free_len)
            .field("queues", &self.queues.iter().map(|q| q.len).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: QueueId = QueueId(0);

    #[test]
    fn test_fifo_then_lifo_reuse() {
        let mut arena = SlotArena::new(4, 1);

        let a = arena.alloc().unwrap();
        arena.enqueue(Q, a);
        let b = arena.alloc().unwrap();
        arena.enqueue(Q, b);
        assert_eq!(a, SlotId::new(0));
        assert_eq!(b, SlotId::new(1));

        assert_eq!(arena.dequeue(Q), Some(SlotId::new(0)));
        assert_eq!(arena.dequeue(Q), Some(SlotId::new(1)));
        assert_eq!(arena.dequeue(Q), None);

        arena.release(SlotId::new(0));
        assert_eq!(arena.alloc(), Some(SlotId::new(0)));
    }

    #[test]
    fn test_exhaustion_is_not_empty_queue() {
        let mut arena = SlotArena::new(2, 2);
        let a = arena.alloc().unwrap();
        let b = arena.alloc().unwrap();

        assert!(arena.is_exhausted());
        assert_eq!(arena.alloc(), None);
        assert!(!arena.queue_nonempty(QueueId(1)));
        assert_eq!(arena.dequeue(QueueId(1)), None);

        arena.enqueue(QueueId(1), a);
        arena.release(b);
        assert_eq!(arena.free_len(), 1);
        assert_eq!(arena.queue_len(QueueId(1)), 1);
        assert_eq!(arena.checked_out(), 0);
    }

    #[test]
    fn test_queues_are_independent() {
        let mut arena = SlotArena::new(6, 3);
        for q in [0usize, 1, 2, 0, 1, 2] {
            let slot = arena.alloc().unwrap();
            arena.enqueue(QueueId(q), slot);
        }

        assert_eq!(arena.dequeue(QueueId(1)), Some(SlotId::new(1)));
        assert_eq!(arena.dequeue(QueueId(0)), Some(SlotId::new(0)));
        assert_eq!(arena.peek(QueueId(0)), Some(SlotId::new(3)));
        assert_eq!(arena.dequeue(QueueId(1)), Some(SlotId::new(4)));
        assert!(!arena.queue_nonempty(QueueId(1)));
        assert_eq!(arena.queue_len(QueueId(2)), 2);
    }

    #[test]
    fn test_zero_capacity() {
        let mut arena = SlotArena::new(0, 1);
        assert!(arena.is_exhausted());
        assert_eq!(arena.alloc(), None);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not checked out")]
    fn test_double_release_detected() {
        let mut arena = SlotArena::new(2, 0);
        let slot = arena.alloc().unwrap();
        arena.release(slot);
        arena.release(slot);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not checked out")]
    fn test_release_of_queued_slot_detected() {
        let mut arena = SlotArena::new(2, 1);
        let slot = arena.alloc().unwrap();
        arena.enqueue(Q, slot);
        arena.release(slot);
    }
}
