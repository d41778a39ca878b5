//! STPC: the sequenced-tail-pointer proxy collector variant.
//!
//! Grounded on `original_source/stpc/stpc.c`'s `stpcGetProxyNodeReference`,
//! `_queueNode` ("monkey through the trees queuing trick" in the source's
//! own comment — a plain CAS-retry loop on the tail word, not a walk
//! through already-linked nodes) and `stpcDropProxyNodeReference`.
//! `acquire_reference` never touches `node.count` directly: it
//! CAS-increments the *tail word's* sequence field, batching the debt the
//! same way RCPC batches acquires against its global `sequence` counter.
//! That accumulated debt is settled in one step, in `queue_node`, when a
//! node stops being tail — mirroring `rcpc.rs`'s `close_node` rather than
//! reverse-engineering the source's `GUARD_BIT + 2*REFERENCE` initial
//! credit and `oldTail.sequence - GUARD_BIT` settlement arithmetic, which
//! depends on the same suspect `GUARD_BIT`/`REFERENCE` coupling flagged
//! for RCPC (see `DESIGN.md`). Unlike RCPC, STPC has no latency parameter:
//! a node is retired as soon as the *next* `defer_delete` call appends
//! past it, not after an `N`-node lag. The tail's 16-bit sequence field
//! doubles as both the ABA-defeating ward on the pointer CAS and the
//! accumulated-debt counter, which caps a single node's tenure to at most
//! `u16::MAX / REFERENCE_UNIT` acquires before the packed field wraps —
//! see `DESIGN.md`. Every node but the bootstrap one is published with
//! `GUARD_UNIT + REFERENCE_UNIT` of starting credit (set in `queue_node`,
//! overwriting the placeholder `Node::new`/`reset` leave in `count`): one
//! unit for being tail, one for the predecessor's forward link that now
//! points at it. The predecessor's own retirement cascades a
//! `REFERENCE_UNIT` debit forward to settle that second unit, landing the
//! new node back at the same `GUARD_UNIT` baseline the bootstrap node
//! starts at — without this, a node's count goes permanently negative the
//! moment it is linked and its deferred action never runs.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI64, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use log::trace;

use crate::cache_padded::CachePadded;
use crate::config::ConfigError;

use super::{DeferredAction, GUARD_UNIT, REFERENCE_UNIT};

const SEQ_BITS: u32 = 16;
const PTR_MASK: u64 = (1u64 << (64 - SEQ_BITS)) - 1;

fn pack(seq: u16, ptr: *mut Node) -> u64 {
    (ptr as u64 & PTR_MASK) | ((seq as u64) << (64 - SEQ_BITS))
}

fn unpack(word: u64) -> (u16, *mut Node) {
    let seq = (word >> (64 - SEQ_BITS)) as u16;
    let ptr = (word & PTR_MASK) as *mut Node;
    (seq, ptr)
}

struct Node {
    next: AtomicPtr<Node>,
    free_next: AtomicPtr<Node>,
    count: AtomicI64,
    action: std::cell::UnsafeCell<Option<DeferredAction>>,
}

unsafe impl Send for Node {}
unsafe impl Sync for Node {}

impl Node {
    /// `count` here is a placeholder; `queue_node` overwrites it with the
    /// node's real starting credit right before publishing it.
    fn new() -> Box<Node> {
        Box::new(Node {
            next: AtomicPtr::new(std::ptr::null_mut()),
            free_next: AtomicPtr::new(std::ptr::null_mut()),
            count: AtomicI64::new(GUARD_UNIT),
            action: std::cell::UnsafeCell::new(None),
        })
    }

    fn reset(&self) {
        self.next.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.free_next.store(std::ptr::null_mut(), Ordering::Relaxed);
        self.count.store(GUARD_UNIT, Ordering::Relaxed);
    }
}

pub struct StpcNodeRef(NonNull<Node>);

unsafe impl Send for StpcNodeRef {}

#[derive(Debug, Default, Clone, Copy)]
pub struct StpcStatsSnapshot {
    pub acquires: u64,
    pub drops: u64,
    pub defers: u64,
    pub frees: u64,
    pub node_allocs: u64,
    pub node_reuses: u64,
    pub add_node_retries: u64,
}

#[derive(Default)]
struct Stats {
    acquires: AtomicU64,
    drops: AtomicU64,
    defers: AtomicU64,
    frees: AtomicU64,
    node_allocs: AtomicU64,
    node_reuses: AtomicU64,
    add_node_retries: AtomicU64,
}

impl Stats {
    fn snapshot(&self) -> StpcStatsSnapshot {
        StpcStatsSnapshot {
            acquires: self.acquires.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            defers: self.defers.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            node_allocs: self.node_allocs.load(Ordering::Relaxed),
            node_reuses: self.node_reuses.load(Ordering::Relaxed),
            add_node_retries: self.add_node_retries.load(Ordering::Relaxed),
        }
    }
}

/// Builder for [`Stpc`]. There is no `latency` knob here — see module docs.
pub struct StpcConfig {
    max_nodes: Option<usize>,
}

impl Default for StpcConfig {
    fn default() -> StpcConfig {
        StpcConfig { max_nodes: None }
    }
}

impl StpcConfig {
    pub fn new() -> StpcConfig {
        StpcConfig::default()
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> StpcConfig {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn build(self) -> Result<Stpc, ConfigError> {
        if let Some(max) = self.max_nodes {
            if max < 2 {
                return Err(ConfigError::MaxNodesTooSmall(max));
            }
        }
        Ok(Stpc::from_config(self))
    }
}

/// The STPC proxy collector: a sequenced tail pointer over a chain of
/// epoch nodes, with no latency-window batching.
pub struct Stpc {
    tail: AtomicU64,
    free_head: AtomicPtr<Node>,
    max_nodes: Option<usize>,
    num_nodes: CachePadded<AtomicUsize>,
    allocated: Mutex<Vec<*mut Node>>,
    stats: Stats,
}

unsafe impl Send for Stpc {}
unsafe impl Sync for Stpc {}

impl Stpc {
    fn from_config(config: StpcConfig) -> Stpc {
        let proxy = Stpc {
            tail: AtomicU64::new(0),
            free_head: AtomicPtr::new(std::ptr::null_mut()),
            max_nodes: config.max_nodes,
            num_nodes: CachePadded::new(AtomicUsize::new(0)),
            allocated: Mutex::new(Vec::new()),
            stats: Stats::default(),
        };
        let initial = proxy.alloc_node().expect("initial STPC node allocation cannot fail");
        proxy.tail.store(pack(0, initial.as_ptr()), Ordering::Release);
        proxy
    }

    pub fn stats(&self) -> StpcStatsSnapshot {
        self.stats.snapshot()
    }

    /// Takes a reference on whatever node the tail currently names.
    /// Borrows against the tail word's sequence field rather than the
    /// node's own count — the debt is settled in one batch, in
    /// `queue_node`, once this node stops being tail.
    pub fn acquire_reference(&self) -> StpcNodeRef {
        self.stats.acquires.fetch_add(1, Ordering::Relaxed);
        loop {
            let word = self.tail.load(Ordering::Relaxed);
            let (seq, ptr) = unpack(word);
            let new_seq = seq.wrapping_add(REFERENCE_UNIT as u16);
            let new_word = pack(new_seq, ptr);
            if self
                .tail
                .compare_exchange_weak(word, new_word, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return StpcNodeRef(unsafe { NonNull::new_unchecked(ptr) });
            }
        }
    }

    pub fn drop_reference(&self, node_ref: StpcNodeRef) {
        self.stats.drops.fetch_add(1, Ordering::Relaxed);
        self.cascade_drop(node_ref.0, REFERENCE_UNIT);
    }

    /// Appends a node carrying `action`, swinging the tail forward. Only
    /// allocation failure retries here (with `backoff`); the tail swing
    /// itself always lands via `queue_node`'s own CAS-retry loop — the
    /// "monkey through the trees queuing trick" the source's own comment
    /// names it.
    pub fn defer_delete(&self, action: DeferredAction, mut backoff: impl FnMut(u32)) {
        self.stats.defers.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 0u32;
        let new_node = loop {
            match self.new_node() {
                Some(n) => break n,
                None => {
                    backoff(attempt);
                    attempt += 1;
                }
            }
        };
        unsafe {
            *new_node.as_ref().action.get() = Some(action);
        }
        self.queue_node(new_node);
    }

    pub fn try_delete_nodes(&self, _count: usize) -> usize {
        0
    }

    /// CAS-retries the tail word from `{seq, old_node}` to `{0, new_node}`
    /// until it lands, then links `old_node.next` and settles `old_node`:
    /// credits it for every acquire borrowed against its tenure (`seq`,
    /// in `REFERENCE_UNIT` units already) so each of those acquires' later
    /// `drop_reference` calls can debit it individually, then drops the
    /// guard unit it held as tail.
    fn queue_node(&self, new_node: NonNull<Node>) {
        // Not yet reachable from `tail` or any `next` link, so a plain
        // store is safe here. A freshly queued node inherits an implicit
        // reference through the predecessor's `next` pointer (relinquished
        // as a REFERENCE_UNIT cascade when the predecessor retires below) on
        // top of its own GUARD_UNIT as tail; crediting both up front keeps
        // every node's baseline at GUARD_UNIT once that cascade lands,
        // whether or not it ever arrives.
        unsafe { new_node.as_ref() }.count.store(GUARD_UNIT + REFERENCE_UNIT, Ordering::Relaxed);
        loop {
            let word = self.tail.load(Ordering::Acquire);
            let (seq, ptr) = unpack(word);
            let new_word = pack(0, new_node.as_ptr());
            if self
                .tail
                .compare_exchange(word, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.stats.add_node_retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let node = unsafe { NonNull::new_unchecked(ptr) };
            let control = unsafe { node.as_ref() };
            control.next.store(new_node.as_ptr(), Ordering::Release);
            trace!("stpc: appended node");

            let borrowed = seq as i64;
            if borrowed != 0 {
                self.cascade_drop(node, -borrowed);
            }
            self.cascade_drop(node, GUARD_UNIT);
            return;
        }
    }

    fn cascade_drop(&self, mut node: NonNull<Node>, amount: i64) {
        let mut amount = amount;
        loop {
            let control = unsafe { node.as_ref() };
            let old = control.count.fetch_sub(amount, Ordering::AcqRel);
            if old - amount != 0 {
                return;
            }
            fence(Ordering::Acquire);
            let next = control.next.load(Ordering::Acquire);
            if let Some(action) = unsafe { (*control.action.get()).take() } {
                self.stats.frees.fetch_add(1, Ordering::Relaxed);
                action();
            }
            self.push_free(node);
            match NonNull::new(next) {
                Some(next_node) => {
                    node = next_node;
                    amount = REFERENCE_UNIT;
                }
                None => return,
            }
        }
    }

    fn new_node(&self) -> Option<NonNull<Node>> {
        if let Some(node) = self.pop_free() {
            self.stats.node_reuses.fetch_add(1, Ordering::Relaxed);
            unsafe { node.as_ref() }.reset();
            return Some(node);
        }
        self.alloc_node()
    }

    fn alloc_node(&self) -> Option<NonNull<Node>> {
        if let Some(max) = self.max_nodes {
            loop {
                let current = self.num_nodes.load(Ordering::Relaxed);
                if current >= max {
                    return None;
                }
                if self
                    .num_nodes
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        } else {
            self.num_nodes.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.node_allocs.fetch_add(1, Ordering::Relaxed);
        let boxed = Node::new();
        let ptr = Box::leak(boxed) as *mut Node;
        self.allocated.lock().unwrap().push(ptr);
        Some(unsafe { NonNull::new_unchecked(ptr) })
    }

    fn push_free(&self, node: NonNull<Node>) {
        let control = unsafe { node.as_ref() };
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            control.free_next.store(head, Ordering::Relaxed);
            if self
                .free_head
                .compare_exchange_weak(head, node.as_ptr(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop_free(&self) -> Option<NonNull<Node>> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            let head = NonNull::new(head)?;
            let next = unsafe { head.as_ref() }.free_next.load(Ordering::Acquire);
            if self
                .free_head
                .compare_exchange_weak(head.as_ptr(), next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(head);
            }
        }
    }
}

impl Drop for Stpc {
    fn drop(&mut self) {
        for ptr in self.allocated.lock().unwrap().drain(..) {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }
    }
}
