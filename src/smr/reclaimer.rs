//! The SMR context: thread registry, deferred-work queue, and the
//! background poller thread that drives reclamation.
//!
//! Grounded on `original_source/fastsmr/smrscan.c` (`smr_acquire`,
//! `smr_release`, `smr_startup`, `smr_shutdown`) and `fastsmr.c`'s
//! `rcu_poll_mutex`/`rcu_cvar` poll loop. The source's single process-wide
//! set of statics becomes one `Reclaimer` value, reachable either through
//! the crate's `lazy_static`-backed default context (mirroring
//! `mem::epoch::global::EpochState`'s singleton shape in
//! `mem/epoch/global.rs`) or as a value of its own for tests that want an
//! isolated instance.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use lazy_static::lazy_static;
use log::debug;

use crate::config::ConfigError;

use super::defer::DeferredWork;
use super::hazard::{protect, HazardGuard, SmrNode};
use super::poller::{drain_unconditionally, scan_once};
use super::queue::DeferQueue;

/// Builder for a [`Reclaimer`]. Mirrors `rcu_minWait` in `fastsmr.c` —
/// the minimum interval the poller sleeps between scans.
pub struct SmrConfig {
    min_wait: Duration,
}

impl Default for SmrConfig {
    fn default() -> SmrConfig {
        SmrConfig { min_wait: Duration::from_micros(50_000) }
    }
}

impl SmrConfig {
    pub fn new() -> SmrConfig {
        SmrConfig::default()
    }

    pub fn with_min_wait(mut self, min_wait: Duration) -> SmrConfig {
        self.min_wait = min_wait;
        self
    }

    pub fn build(self) -> Result<Reclaimer, ConfigError> {
        if self.min_wait.is_zero() {
            return Err(ConfigError::MinWaitZero);
        }
        Ok(Reclaimer::from_config(self))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SmrStatsSnapshot {
    pub reclaimed: u64,
    pub scans: u64,
    pub short_circuit_drains: u64,
}

#[derive(Default)]
struct Stats {
    reclaimed: AtomicU64,
    scans: AtomicU64,
    short_circuit_drains: AtomicU64,
}

/// State shared between a `Reclaimer` and every thread registered with
/// it. Kept alive independently of `Reclaimer` itself (which additionally
/// owns the poller `JoinHandle`) so a thread's thread-local registration
/// can hold a plain `Arc<Shared>` without caring whether the `Reclaimer`
/// value it came from is still in scope.
struct Shared {
    nodes: Mutex<Vec<Arc<SmrNode>>>,
    queue: DeferQueue,
    shutdown: AtomicBool,
    wake: Condvar,
    wake_lock: Mutex<()>,
    stats: Stats,
}

impl Shared {
    fn register(&self, node: Arc<SmrNode>) {
        self.nodes.lock().unwrap().push(node);
    }

    fn deregister(&self, node: &Arc<SmrNode>) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(pos) = nodes.iter().position(|n| Arc::ptr_eq(n, node)) {
            nodes.remove(pos);
        }
        // Last thread gone: nothing can ever protect anything again, so
        // every deferred action is safe to run immediately rather than
        // waiting on a poller pass that would otherwise have nothing new
        // to learn. Mirrors `smr_release`'s `smr_node_queue == NULL` case.
        if nodes.is_empty() {
            drop(nodes);
            let n = drain_unconditionally(&self.queue);
            if n > 0 {
                self.stats.short_circuit_drains.fetch_add(1, Ordering::Relaxed);
                self.stats.reclaimed.fetch_add(n as u64, Ordering::Relaxed);
            }
        }
        self.wake.notify_all();
    }
}

/// A safe-memory-reclamation context: a thread registry, a deferred-work
/// queue, and the poller thread that drains it.
pub struct Reclaimer {
    shared: Arc<Shared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    fn from_config(config: SmrConfig) -> Reclaimer {
        let shared = Arc::new(Shared {
            nodes: Mutex::new(Vec::new()),
            queue: DeferQueue::new(),
            shutdown: AtomicBool::new(false),
            wake: Condvar::new(),
            wake_lock: Mutex::new(()),
            stats: Stats::default(),
        });

        let poller_shared = shared.clone();
        let min_wait = config.min_wait;
        let handle = std::thread::spawn(move || poll_loop(poller_shared, min_wait));

        debug!("smr: reclaimer started, min_wait={:?}", config.min_wait);
        Reclaimer { shared, poller: Mutex::new(Some(handle)) }
    }

    pub fn stats(&self) -> SmrStatsSnapshot {
        SmrStatsSnapshot {
            reclaimed: self.shared.stats.reclaimed.load(Ordering::Relaxed),
            scans: self.shared.stats.scans.load(Ordering::Relaxed),
            short_circuit_drains: self.shared.stats.short_circuit_drains.load(Ordering::Relaxed),
        }
    }

    /// Claims a hazard pointer over `ptr` on the current thread, valid for
    /// the lifetime of the returned guard.
    pub fn protect<T>(&self, ptr: *mut T) -> HazardGuard<'static> {
        let node = with_registered_node(&self.shared);
        // SAFETY: `node` is an `Arc<SmrNode>` kept alive both by the
        // thread-local registration table (dropped only at thread exit,
        // which deregisters it first) and by `self.shared.nodes`, so the
        // allocation outlives any guard a caller can construct from it.
        let node_ref: &'static SmrNode = unsafe { &*Arc::as_ptr(&node) };
        protect(node_ref, ptr)
    }

    /// Schedules `action` to run once no hazard pointer anywhere names
    /// `ptr`.
    pub fn defer_fifo<T>(&self, ptr: *mut T, action: impl FnOnce() + Send + 'static) {
        self.shared.queue.enqueue(DeferredWork::fifo(ptr as *mut (), Box::new(action)));
        self.shared.wake.notify_all();
    }

    /// Schedules `action` to run once `still_reachable` reports `false`,
    /// independent of hazard-pointer identity. `ptr` is retained for
    /// diagnostics/ordering but plays no role in the liveness check.
    pub fn defer_trace<T>(
        &self,
        ptr: *mut T,
        action: impl FnOnce() + Send + 'static,
        still_reachable: impl Fn() -> bool + Send + 'static,
    ) {
        self.shared
            .queue
            .enqueue(DeferredWork::trace(ptr as *mut (), Box::new(action), Box::new(still_reachable)));
        self.shared.wake.notify_all();
    }

    /// Forces an immediate scan pass rather than waiting for the poller's
    /// next wakeup. Useful in tests and for callers wanting a synchronous
    /// upper bound on reclamation latency.
    pub fn poll_now(&self) {
        let nodes = self.shared.nodes.lock().unwrap().clone();
        scan_once(&nodes, &self.shared.queue);
        self.shared.stats.scans.fetch_add(1, Ordering::Relaxed);
    }

    /// `true` iff the calling thread currently holds an outstanding
    /// hazard pointer on this reclaimer. Mirrors `smr_check` — a debug
    /// leak detector, not part of the reclamation protocol itself.
    pub fn smr_check(&self) -> bool {
        CURRENT.with(|regs| {
            regs.table
                .borrow()
                .iter()
                .find(|(shared, _)| Arc::ptr_eq(shared, &self.shared))
                .map(|(_, node)| node.has_outstanding())
                .unwrap_or(false)
        })
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = self.poller.lock().unwrap().take() {
            let _ = handle.join();
        }
        // Final drain: shutdown is only safe to call once every
        // protected reader has stopped running, so nothing remains to
        // defend.
        drain_unconditionally(&self.shared.queue);
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: Arc<Shared>, min_wait: Duration) {
    loop {
        let guard = shared.wake_lock.lock().unwrap();
        let _guard = shared
            .wake
            .wait_timeout_while(guard, min_wait, |_| !shared.shutdown.load(Ordering::SeqCst))
            .unwrap();
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let nodes = shared.nodes.lock().unwrap().clone();
        if !shared.queue.is_empty() {
            scan_once(&nodes, &shared.queue);
            shared.stats.scans.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-thread table of (reclaimer, registered node) pairs. Most threads
/// only ever touch `default_reclaimer()` and this holds exactly one
/// entry, but a thread is free to use several independent `Reclaimer`
/// instances (as the tests below do), each getting its own hazard-pointer
/// pair. Deregisters every entry when the thread exits.
type RegistrationTable = Vec<(Arc<Shared>, Arc<SmrNode>)>;

struct Registrations {
    table: RefCell<RegistrationTable>,
}

impl Drop for Registrations {
    fn drop(&mut self) {
        for (shared, node) in self.table.borrow_mut().drain(..) {
            shared.deregister(&node);
        }
    }
}

thread_local! {
    static CURRENT: Registrations = Registrations { table: RefCell::new(Vec::new()) };
}

fn with_registered_node(shared: &Arc<Shared>) -> Arc<SmrNode> {
    CURRENT.with(|regs| {
        let mut table = regs.table.borrow_mut();
        if let Some((_, node)) = table.iter().find(|(s, _)| Arc::ptr_eq(s, shared)) {
            return node.clone();
        }
        let node = Arc::new(SmrNode::new());
        shared.register(node.clone());
        table.push((shared.clone(), node.clone()));
        node
    })
}

lazy_static! {
    static ref DEFAULT: Reclaimer = SmrConfig::new().build().expect("default SMR config is always valid");
}

/// The process-wide default reclamation context, lazily started on first
/// use. Mirrors `mem::epoch::global::EpochState`'s singleton shape.
pub fn default_reclaimer() -> &'static Reclaimer {
    &DEFAULT
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool as AB, AtomicUsize, Ordering as O};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration as D;

    #[test]
    fn fifo_reclaims_once_unprotected() {
        let reclaimer = SmrConfig::new().with_min_wait(D::from_millis(5)).build().unwrap();
        let mut value = 42i32;
        let ran = Arc::new(AB::new(false));
        let r = ran.clone();
        reclaimer.defer_fifo(&mut value as *mut i32, move || r.store(true, O::SeqCst));
        reclaimer.poll_now();
        assert!(ran.load(O::SeqCst));
    }

    #[test]
    fn fifo_requeued_while_hazard_held() {
        let reclaimer = SmrConfig::new().with_min_wait(D::from_millis(5)).build().unwrap();
        let mut value = 7i32;
        let ptr = &mut value as *mut i32;
        let ran = Arc::new(AB::new(false));
        let r = ran.clone();

        let guard = reclaimer.protect(ptr);
        reclaimer.defer_fifo(ptr, move || r.store(true, O::SeqCst));
        reclaimer.poll_now();
        assert!(!ran.load(O::SeqCst));
        drop(guard);
        reclaimer.poll_now();
        assert!(ran.load(O::SeqCst));
    }

    #[test]
    fn fifo_cohort_holds_back_younger_unprotected_item() {
        // Two FIFO defers, oldest first: `a` stays hazarded, `b` never is.
        // `b` must not reclaim ahead of `a` even though nothing protects
        // it directly — and once `a` clears, both run in enqueue order.
        let reclaimer = SmrConfig::new().with_min_wait(D::from_millis(5)).build().unwrap();
        let mut a = 1i32;
        let mut b = 2i32;
        let ptr_a = &mut a as *mut i32;
        let ptr_b = &mut b as *mut i32;
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard_a = reclaimer.protect(ptr_a);
        let order_a = order.clone();
        reclaimer.defer_fifo(ptr_a, move || order_a.lock().unwrap().push('a'));
        let order_b = order.clone();
        reclaimer.defer_fifo(ptr_b, move || order_b.lock().unwrap().push('b'));

        reclaimer.poll_now();
        assert!(
            order.lock().unwrap().is_empty(),
            "younger FIFO item reclaimed while an older cohort member was still hazarded"
        );

        drop(guard_a);
        reclaimer.poll_now();
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b']);
    }

    #[test]
    fn trace_mode_waits_on_predicate() {
        let reclaimer = SmrConfig::new().with_min_wait(D::from_millis(5)).build().unwrap();
        let mut value = 1i32;
        let ptr = &mut value as *mut i32;
        let reachable = Arc::new(AB::new(true));
        let reachable_check = reachable.clone();
        let ran = Arc::new(AB::new(false));
        let r = ran.clone();

        reclaimer.defer_trace(ptr, move || r.store(true, O::SeqCst), move || reachable_check.load(O::SeqCst));
        reclaimer.poll_now();
        assert!(!ran.load(O::SeqCst));
        reachable.store(false, O::SeqCst);
        reclaimer.poll_now();
        assert!(ran.load(O::SeqCst));
    }

    /// A singly linked list guarded by one hazard pointer on its head; a
    /// writer unlinks the tail node and defers it in trace mode with a
    /// `still_reachable` predicate that walks `next` from the (possibly
    /// stale) head the reader is protecting.
    #[test]
    fn linked_list_trace_scenario() {
        struct Node {
            next: *mut Node,
        }

        let reclaimer = SmrConfig::new().with_min_wait(D::from_millis(5)).build().unwrap();

        let tail = Box::into_raw(Box::new(Node { next: std::ptr::null_mut() }));
        let head = Box::into_raw(Box::new(Node { next: tail }));
        // `defer_trace`'s closures must be `'static`: the poller may run
        // them long after this function returns, so the state they touch
        // has to be independently owned, not borrowed from this stack
        // frame — unlike the reader thread below, which `thread::scope`
        // guarantees joins before this function returns and so can
        // borrow `reclaimer`/`head_cell` directly.
        let head_cell = Arc::new(std::sync::atomic::AtomicPtr::new(head));
        let reclaimed = Arc::new(AB::new(false));

        std::thread::scope(|scope| {
            // Reader protects the current head and walks to the tail,
            // verifying every pointer in the chain stays valid to read.
            scope.spawn(|| {
                for _ in 0..200 {
                    let h = head_cell.load(O::Acquire);
                    let _guard = reclaimer.protect(h);
                    let node = unsafe { &*h };
                    if !node.next.is_null() {
                        let _ = unsafe { &*node.next };
                    }
                    thread::yield_now();
                }
            });

            // Writer unlinks the tail and defers its reclamation in
            // trace mode: reclaim only once it's no longer reachable by
            // walking `next` from whatever head is currently live. Raw
            // pointers aren't `Send`, so they cross the `'static` closure
            // boundary as plain addresses and get cast back inside.
            unsafe { (*head).next = std::ptr::null_mut() };
            let tail_addr = tail as usize;
            let reachability_cell = head_cell.clone();
            let reclaimed_flag = reclaimed.clone();
            reclaimer.defer_trace(
                tail,
                move || {
                    reclaimed_flag.store(true, O::SeqCst);
                    unsafe { drop(Box::from_raw(tail_addr as *mut Node)) };
                },
                move || {
                    let h = reachability_cell.load(O::Acquire);
                    if h.is_null() {
                        return false;
                    }
                    let node = unsafe { &*h };
                    node.next as usize == tail_addr
                },
            );
        });

        reclaimer.poll_now();
        assert!(reclaimed.load(O::SeqCst));

        unsafe { drop(Box::from_raw(head)) };
    }

    #[test]
    fn shutdown_drains_remaining_work() {
        let reclaimer = SmrConfig::new().with_min_wait(D::from_millis(5)).build().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let r = ran.clone();
            let mut v = 0i32;
            reclaimer.defer_fifo(&mut v as *mut i32, move || {
                r.fetch_add(1, O::SeqCst);
            });
        }
        drop(reclaimer);
        assert_eq!(ran.load(O::SeqCst), 10);
    }

    #[test]
    fn last_thread_deregistering_short_circuits_queue() {
        let reclaimer = Arc::new(SmrConfig::new().with_min_wait(D::from_secs(3600)).build().unwrap());
        let ran = Arc::new(AB::new(false));
        let r = ran.clone();
        let proxy = reclaimer.clone();

        thread::spawn(move || {
            let mut v = 9i32;
            let _guard = proxy.protect(&mut v as *mut i32);
            proxy.defer_fifo(&mut v as *mut i32, move || r.store(true, O::SeqCst));
            // guard and thread-local registration drop here, deregistering.
        })
        .join()
        .unwrap();

        assert!(ran.load(O::SeqCst));
    }
}
