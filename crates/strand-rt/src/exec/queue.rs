// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Lock-free MPMC queue over a pooled node ring.
//!
//! Michael-Scott list with a persistent sentinel. Cells are drawn from a
//! resizable pool by a monotonic counter taken modulo the pool size; the
//! pool doubles under a mutex and never shrinks. Links are generation-tagged
//! cell indices packed into `AtomicU64`, so a stale CAS cannot succeed
//! against a recycled cell. A per-cell claim flag keeps slot handout
//! exclusive, and the ring doubles once more than half its cells are live,
//! which keeps the reuse distance of any cell at least half the pool.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// A link is a 32-bit generation tag over a 32-bit slot reference.
/// Slot part 0 is null; slot `i` is stored as `i + 1`.
type Link = u64;

const SLOT_MASK: u64 = 0xFFFF_FFFF;
/// Highest usable cell index (slot references are stored `+ 1`).
const MAX_SLOTS: usize = (SLOT_MASK - 1) as usize;

fn pack(slot: usize, tag: u32) -> Link {
    ((tag as u64) << 32) | (slot as u64 + 1)
}

fn null_link(tag: u32) -> Link {
    (tag as u64) << 32
}

fn is_null(link: Link) -> bool {
    link & SLOT_MASK == 0
}

/// Slot index of a link the caller knows to be non-null (`head`, `tail`,
/// or a `next` that compared non-null).
fn index_of(link: Link) -> usize {
    (link & SLOT_MASK) as usize - 1
}

fn tag_of(link: Link) -> u32 {
    (link >> 32) as u32
}

struct Node<T> {
    next: AtomicU64,
    claimed: AtomicBool,
    data: UnsafeCell<Option<T>>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
            data: UnsafeCell::new(None),
        }
    }
}

/// Published snapshot of the pool index. Tables only ever append, so a slot
/// reference resolved through an old table stays valid forever.
struct SlotTable<T> {
    nodes: Box<[*mut Node<T>]>,
}

/// Growth-side state, serialized by the pool mutex. Owns every node ever
/// allocated; nothing is freed until the queue drops.
struct Pool<T> {
    nodes: Vec<*mut Node<T>>,
    retired_tables: Vec<*mut SlotTable<T>>,
}

/// Bounded-contention multi-producer multi-consumer FIFO queue.
///
/// `push` never blocks a caller on another caller; it can block briefly
/// against pool growth. `try_pop` is non-blocking and may spuriously report
/// empty under contention — callers that need to sleep re-check under their
/// own mutex and condition variable.
pub struct MpmcQueue<T> {
    head: AtomicU64,
    tail: AtomicU64,
    /// Monotonic pool cursor; effective slot is `cursor % pool_size`.
    next_slot: AtomicUsize,
    /// Cells currently claimed (sentinel included).
    live: AtomicUsize,
    table: AtomicPtr<SlotTable<T>>,
    pool: Mutex<Pool<T>>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Create a queue with `initial_pool_size` pre-allocated cells. One cell
    /// is claimed immediately as the list sentinel.
    pub fn new(initial_pool_size: usize) -> Self {
        let cap = initial_pool_size.max(2);
        assert!(cap <= MAX_SLOTS, "queue pool exceeds slot address space");

        let nodes: Vec<*mut Node<T>> = (0..cap)
            .map(|_| Box::into_raw(Box::new(Node::new())))
            .collect();
        // Slot 0 becomes the sentinel.
        unsafe { (*nodes[0]).claimed.store(true, Ordering::Relaxed) };

        let table = Box::into_raw(Box::new(SlotTable {
            nodes: nodes.clone().into_boxed_slice(),
        }));

        Self {
            head: AtomicU64::new(pack(0, 0)),
            tail: AtomicU64::new(pack(0, 0)),
            next_slot: AtomicUsize::new(1),
            live: AtomicUsize::new(1),
            table: AtomicPtr::new(table),
            pool: Mutex::new(Pool {
                nodes,
                retired_tables: Vec::new(),
            }),
        }
    }

    /// Current pool capacity in cells.
    pub fn pool_size(&self) -> usize {
        // SAFETY: the published table is valid until the queue drops.
        unsafe { (&(*self.table.load(Ordering::Acquire)).nodes).len() }
    }

    /// True when the list holds no value cells. Advisory only: concurrent
    /// pushes and pops can change the answer before it is observed.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        is_null(self.node(index_of(head)).next.load(Ordering::Acquire))
    }

    /// Append `value` at the tail.
    pub fn push(&self, value: T) {
        let slot = self.allocate();
        let node = self.node(slot);
        // SAFETY: the claim CAS in allocate() made this cell exclusively
        // ours; no reader dereferences data before the link CAS below
        // publishes it.
        unsafe { *node.data.get() = Some(value) };

        loop {
            let tail_l = self.tail.load(Ordering::Acquire);
            let tail_n = self.node(index_of(tail_l));
            let next_l = tail_n.next.load(Ordering::Acquire);
            if tail_l != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if is_null(next_l) {
                let link = pack(slot, tag_of(next_l).wrapping_add(1));
                if tail_n
                    .next
                    .compare_exchange_weak(next_l, link, Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail_l,
                        pack(slot, tag_of(tail_l).wrapping_add(1)),
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                // Tail lagged behind a finished link; help it forward.
                let _ = self.tail.compare_exchange(
                    tail_l,
                    pack(index_of(next_l), tag_of(tail_l).wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Acquire,
                );
            }
        }
    }

    /// Detach and return the head value, or `None` if the queue is observed
    /// empty.
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let head_l = self.head.load(Ordering::Acquire);
            let head_n = self.node(index_of(head_l));
            let next_l = head_n.next.load(Ordering::Acquire);
            if head_l != self.head.load(Ordering::Acquire) {
                continue;
            }
            if is_null(next_l) {
                return None;
            }
            let next_slot = index_of(next_l);

            let tail_l = self.tail.load(Ordering::Acquire);
            if index_of(tail_l) == index_of(head_l) {
                // A pusher linked a node but has not swung the tail yet.
                let _ = self.tail.compare_exchange(
                    tail_l,
                    pack(next_slot, tag_of(tail_l).wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }

            if self
                .head
                .compare_exchange_weak(
                    head_l,
                    pack(next_slot, tag_of(head_l).wrapping_add(1)),
                    Ordering::Release,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: winning the head CAS detached the old sentinel;
                // the new head's data was published by the pusher's link
                // CAS, which our acquire load of `next` synchronized with.
                let value = unsafe { (*self.node(next_slot).data.get()).take() };
                self.release(index_of(head_l));
                return value;
            }
        }
    }

    /// Grow the pool to at least `new_size` cells. No-op when `new_size`
    /// does not exceed the current capacity; the pool never shrinks.
    pub fn resize_pool(&self, new_size: usize) {
        let mut pool = self.pool.lock().unwrap();
        let current = pool.nodes.len();
        if new_size <= current {
            return;
        }
        assert!(new_size <= MAX_SLOTS, "queue pool exceeds slot address space");

        for _ in current..new_size {
            pool.nodes.push(Box::into_raw(Box::new(Node::new())));
        }
        let table = Box::into_raw(Box::new(SlotTable {
            nodes: pool.nodes.clone().into_boxed_slice(),
        }));
        // Publish the bigger index; the old one stays readable for threads
        // still holding it and is reclaimed when the queue drops.
        let old = self.table.swap(table, Ordering::AcqRel);
        pool.retired_tables.push(old);
    }

    /// Resolve a slot index against the published table.
    fn node(&self, slot: usize) -> &Node<T> {
        loop {
            // SAFETY: tables are only retired at drop; node pointers are
            // stable for the queue's lifetime.
            let table = unsafe { &*self.table.load(Ordering::Acquire) };
            if let Some(&ptr) = table.nodes.get(slot) {
                return unsafe { &*ptr };
            }
            // The slot was added by a growth this snapshot predates.
            std::hint::spin_loop();
        }
    }

    /// Claim a free cell, growing the ring when it runs hot.
    fn allocate(&self) -> usize {
        let mut misses = 0usize;
        loop {
            let idx = self.next_slot.fetch_add(1, Ordering::Relaxed);
            let cap = self.pool_size();
            let slot = idx % cap;
            let node = self.node(slot);
            if node
                .claimed
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
                if live * 2 > cap {
                    // Keep the ring at most half full so a detached cell
                    // rests for at least cap/2 allocations before reuse.
                    self.resize_pool(cap * 2);
                }
                // Reset the link with a fresh generation before publication.
                let old = node.next.load(Ordering::Relaxed);
                node.next
                    .store(null_link(tag_of(old).wrapping_add(1)), Ordering::Relaxed);
                return slot;
            }
            misses += 1;
            if misses >= cap {
                // Scanned a full ring of claimed cells.
                self.resize_pool(cap * 2);
                misses = 0;
            }
        }
    }

    /// Return a detached cell to the ring.
    fn release(&self, slot: usize) {
        let node = self.node(slot);
        self.live.fetch_sub(1, Ordering::Relaxed);
        node.claimed.store(false, Ordering::Release);
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap();
        for &node in &pool.nodes {
            // SAFETY: exclusive access; every node was Box-allocated by this
            // queue and never freed before now. Dropping the box drops any
            // payload still parked in the cell.
            unsafe { drop(Box::from_raw(node)) };
        }
        pool.nodes.clear();
        for &table in &pool.retired_tables {
            unsafe { drop(Box::from_raw(table)) };
        }
        pool.retired_tables.clear();
        unsafe { drop(Box::from_raw(self.table.load(Ordering::Relaxed))) };
    }
}
