//! Execution-time accounting for a single computer.
//!
//! Tracks the current scheduler slice and the cumulative time a machine has
//! run since it last yielded. The flags escalate: `paused` is advisory (the
//! scheduler would like the machine to yield so others can run),
//! `soft_abort` means the cumulative budget is spent and the machine should
//! wind down, `hard_abort` means the grace period is gone and listeners are
//! told to stop the machine at the next opportunity. Everything here is
//! cooperative; the monitor thread handles machines that ignore it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use once_cell::sync::Lazy;
use polyvm_api::machine::TimeoutToken;

use crate::config::TimeoutConfig;

/// The message displayed when a computer is aborted for running too long.
pub const ABORT_MESSAGE: &str = "Too long without yielding";

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since the process epoch.
pub(crate) fn nano_time() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

type Listener = Arc<dyn Fn() + Send + Sync>;

pub struct TimeoutState {
    timeout_ns: u64,
    abort_ns: u64,
    /// Whether the scheduler has other work waiting, making a pause useful.
    should_pause: Box<dyn Fn() -> bool + Send + Sync>,

    paused: AtomicBool,
    soft_abort: AtomicBool,
    hard_abort: AtomicBool,

    /// When the current slice began.
    current_start: AtomicU64,
    /// When the current slice's share of the latency period is spent.
    current_deadline: AtomicU64,
    /// Time accumulated in previous slices since the last full stop.
    cumulative_elapsed: AtomicU64,

    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

impl TimeoutState {
    pub fn new(
        config: TimeoutConfig,
        should_pause: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        TimeoutState {
            timeout_ns: config.timeout_nanos(),
            abort_ns: config.abort_nanos(),
            should_pause: Box::new(should_pause),
            paused: AtomicBool::new(false),
            soft_abort: AtomicBool::new(false),
            hard_abort: AtomicBool::new(false),
            current_start: AtomicU64::new(0),
            current_deadline: AtomicU64::new(0),
            cumulative_elapsed: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    pub(crate) fn timeout_nanos(&self) -> u64 {
        self.timeout_ns
    }

    pub(crate) fn abort_nanos(&self) -> u64 {
        self.abort_ns
    }

    /// Begin a slice with the given share of the scheduler's period.
    pub fn start_timer(&self, slice_ns: u64) {
        let now = nano_time();
        self.current_start.store(now, Ordering::Relaxed);
        self.current_deadline.store(now + slice_ns, Ordering::Relaxed);
    }

    /// End a slice which will resume later, banking its elapsed time.
    pub fn pause_timer(&self) {
        let elapsed = self.current_slice_nanos();
        self.cumulative_elapsed.fetch_add(elapsed, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
    }

    /// End a run entirely, resetting all accounting and flags.
    pub fn stop_timer(&self) {
        self.cumulative_elapsed.store(0, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
        self.soft_abort.store(false, Ordering::Relaxed);
        self.hard_abort.store(false, Ordering::Relaxed);
    }

    /// Recompute the pause and soft-abort flags. Called periodically while
    /// the machine executes; flags only ever go from clear to set within a
    /// slice.
    pub fn refresh(&self) {
        let now = nano_time();
        if !self.paused.load(Ordering::Relaxed)
            && now >= self.current_deadline.load(Ordering::Relaxed)
            && (self.should_pause)()
        {
            self.paused.store(true, Ordering::Relaxed);
        }
        if !self.soft_abort.load(Ordering::Relaxed) && self.nanos_cumulative() >= self.timeout_ns {
            self.soft_abort.store(true, Ordering::Relaxed);
        }
    }

    /// Escalate to a hard abort, notifying listeners exactly once.
    pub fn hard_abort(&self) {
        self.soft_abort.store(true, Ordering::Relaxed);
        if !self.hard_abort.swap(true, Ordering::Relaxed) {
            let listeners: Vec<Listener> =
                lock(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
            for listener in listeners {
                listener();
            }
        }
    }

    /// Total time this run has executed, current slice included.
    pub fn nanos_cumulative(&self) -> u64 {
        self.cumulative_elapsed.load(Ordering::Relaxed) + self.current_slice_nanos()
    }

    /// Time spent in the current slice.
    pub fn current_slice_nanos(&self) -> u64 {
        nano_time().saturating_sub(self.current_start.load(Ordering::Relaxed))
    }

    /// Budget left before the soft abort. Only meaningful between slices.
    pub fn get_remaining_time(&self) -> u64 {
        self.timeout_ns
            .saturating_sub(self.cumulative_elapsed.load(Ordering::Relaxed))
    }

    /// Restore the budget saved by [`Self::get_remaining_time`] before
    /// resuming a paused run, or set a full budget for a fresh event.
    pub fn set_remaining_time(&self, remaining_ns: u64) {
        self.cumulative_elapsed
            .store(self.timeout_ns.saturating_sub(remaining_ns), Ordering::Relaxed);
    }

    pub fn add_listener(&self, listener: Listener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        lock(&self.listeners).retain(|(other, _)| *other != id);
    }
}

impl TimeoutToken for TimeoutState {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn is_soft_aborted(&self) -> bool {
        self.soft_abort.load(Ordering::Relaxed)
    }

    fn is_hard_aborted(&self) -> bool {
        self.hard_abort.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
