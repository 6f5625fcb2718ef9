//! Runs computers across a small pool of worker threads.
//!
//! Each executor tracks a virtual runtime: the time it has used on an
//! imaginary machine which shares work evenly among all runnable computers.
//! The runnable set is ordered by `(virtual_runtime, id)` and workers always
//! pick the executor which has had the least, so busy computers cannot starve
//! quiet ones. New executors start one scaled period behind the watermark and
//! computers that slept get a small boost, bounded to half the latency so
//! they cannot hoard credit.
//!
//! A monitor thread watches executing workers and escalates: refresh the
//! timeout flags, then hard-abort, then declare the worker dead, force its
//! task to completion, and spawn a replacement. Threads are never killed; an
//! unresponsive worker is simply abandoned to finish on its own.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use polyvm_api::env::{Metric, MetricsObserver};

use crate::config::TimeoutConfig;
use crate::computer::timeout::{nano_time, TimeoutState};

/// How often the monitor wakes up when no computer is contended.
const MONITOR_WAKEUP: Duration = Duration::from_millis(100);

/// The ideal latency between a computer becoming runnable and running, when
/// there is one worker thread.
const DEFAULT_LATENCY_NS: u64 = 50_000_000;

/// The minimum slice a computer runs for before pausing, however long the
/// queue is.
const DEFAULT_MIN_PERIOD_NS: u64 = 5_000_000;

/// The queue depth at which slices bottom out at the minimum period.
const LATENCY_MAX_TASKS: u64 = DEFAULT_LATENCY_NS / DEFAULT_MIN_PERIOD_NS;

/// Minimum interval between timeout reports from one worker.
const REPORT_DEBOUNCE_NS: u64 = 1_000_000_000;

const RUN_RUNNING: u8 = 0;
const RUN_STOPPING: u8 = 1;
const RUN_CLOSED: u8 = 2;

// Ownership token values for an executor. An executor is either idle, on the
// queue, running, or running with more work queued behind it; exactly one
// worker may hold it in the running states.
const STATE_IDLE: u8 = 0;
const STATE_ON_QUEUE: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_REPEAT: u8 = 3;

/// A unit of schedulable work: one computer, as seen by the scheduler.
pub trait Worker: Send + Sync {
    /// Run one slice of work. Expected to pause or stop the executor's
    /// timeout timer before returning.
    fn work(&self);

    fn computer_id(&self) -> i32;

    /// Append diagnostic state for timeout reports.
    fn write_state(&self, out: &mut String);

    /// The computer ran too long and must be stopped.
    fn abort_with_timeout(&self);

    /// The computer misbehaved (panicked) and must be stopped.
    fn abort_with_error(&self);

    /// The scheduler is stopping; wind down for good.
    fn unload(&self);
}

pub struct ComputerThread {
    shared: Arc<Shared>,
}

struct Shared {
    latency_ns: u64,
    min_period_ns: u64,
    timeout_config: TimeoutConfig,

    state: AtomicU8,

    comp: Mutex<RunQueue>,
    worker_wakeup: Condvar,
    monitor_wakeup: Condvar,

    threads: Mutex<ThreadPool>,
    shutdown: Condvar,

    idle_workers: AtomicUsize,
    queue_size: AtomicUsize,
    next_executor: AtomicU64,
}

struct RunQueue {
    queue: BTreeSet<QueueEntry>,
    /// A watermark tracking the virtual runtime of the least-executed
    /// runnable computer, so newly queued computers start from a fair
    /// baseline rather than zero.
    minimum_virtual_runtime: u64,
}

struct ThreadPool {
    workers: Vec<Option<Arc<WorkerHandle>>>,
    running_count: usize,
    monitor: Option<thread::JoinHandle<()>>,
}

struct QueueEntry {
    runtime: u64,
    id: u64,
    executor: Arc<Executor>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.runtime == other.runtime && self.id == other.id
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.runtime, self.id).cmp(&(other.runtime, other.id))
    }
}

struct WorkerHandle {
    index: usize,
    /// Cleared when the worker terminates, or when the monitor abandons it.
    running: AtomicBool,
    current: Mutex<Option<Arc<Executor>>>,
    /// Nanosecond timestamp of the last timeout report; `u64::MAX` is never.
    last_report: AtomicU64,
}

/// A computer's handle into the scheduler.
pub struct Executor {
    shared: Arc<Shared>,
    id: u64,
    worker: Arc<dyn Worker>,
    metrics: Arc<dyn MetricsObserver>,
    timeout: Arc<TimeoutState>,
    state: AtomicU8,
    virtual_runtime: AtomicU64,
    /// When `virtual_runtime` was last brought up to date.
    vruntime_start: AtomicU64,
}

impl ComputerThread {
    pub fn new(thread_count: usize, timeout_config: TimeoutConfig) -> Self {
        let thread_count = thread_count.max(1);
        // More worker threads means more work per real-time second, so scale
        // up the latency and slices to match: 1 + floor(log2(threads)).
        let factor = 64 - (thread_count as u64).leading_zeros() as u64;
        ComputerThread {
            shared: Arc::new(Shared {
                latency_ns: DEFAULT_LATENCY_NS * factor,
                min_period_ns: DEFAULT_MIN_PERIOD_NS * factor,
                timeout_config,
                state: AtomicU8::new(RUN_RUNNING),
                comp: Mutex::new(RunQueue {
                    queue: BTreeSet::new(),
                    minimum_virtual_runtime: 0,
                }),
                worker_wakeup: Condvar::new(),
                monitor_wakeup: Condvar::new(),
                threads: Mutex::new(ThreadPool {
                    workers: (0..thread_count).map(|_| None).collect(),
                    running_count: 0,
                    monitor: None,
                }),
                shutdown: Condvar::new(),
                idle_workers: AtomicUsize::new(0),
                queue_size: AtomicUsize::new(0),
                next_executor: AtomicU64::new(0),
            }),
        }
    }

    /// Register a computer, returning its scheduler handle.
    pub fn create_executor(
        &self,
        worker: Arc<dyn Worker>,
        metrics: Arc<dyn MetricsObserver>,
    ) -> Arc<Executor> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let timeout = Arc::new(TimeoutState::new(self.shared.timeout_config, move || {
            weak.upgrade().is_some_and(|shared| shared.has_pending_work())
        }));
        Arc::new(Executor {
            shared: self.shared.clone(),
            id: self.shared.next_executor.fetch_add(1, Ordering::Relaxed),
            worker,
            metrics,
            timeout,
            state: AtomicU8::new(STATE_IDLE),
            virtual_runtime: AtomicU64::new(0),
            vruntime_start: AtomicU64::new(0),
        })
    }

    pub fn has_pending_work(&self) -> bool {
        self.shared.has_pending_work()
    }

    /// Stop the scheduler: hard-abort running computers, drain the queue
    /// (executors get an unload call), and wait for workers to exit. Returns
    /// false if workers were still running when the timeout expired.
    pub fn stop(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        shared.advance_state(RUN_STOPPING);

        // Encourage currently running computers to bail out.
        {
            let pool = lock(&shared.threads);
            for worker in pool.workers.iter().flatten() {
                if let Some(executor) = lock(&worker.current).clone() {
                    executor.timeout.hard_abort();
                }
            }
        }

        {
            let _comp = lock(&shared.comp);
            shared.worker_wakeup.notify_all();
        }

        let deadline = Instant::now() + timeout;
        let mut pool = lock(&shared.threads);
        while pool.running_count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pool = match shared.shutdown.wait_timeout(pool, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        drop(pool);

        shared.advance_state(RUN_CLOSED);
        // Wake the monitor so it notices, but don't wait for it.
        {
            let _comp = lock(&shared.comp);
            shared.monitor_wakeup.notify_one();
        }
        true
    }
}

impl Executor {
    /// Mark this executor as having work. Safe to call from any thread, any
    /// number of times; it lands on the queue at most once.
    pub fn submit(self: &Arc<Self>) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            let next = match state {
                STATE_IDLE | STATE_ON_QUEUE => STATE_ON_QUEUE,
                _ => STATE_REPEAT,
            };
            if state == next {
                return;
            }
            if self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if state == STATE_IDLE {
                    Shared::queue(&self.shared, self.clone());
                }
                return;
            }
        }
    }

    pub fn timeout_state(&self) -> &Arc<TimeoutState> {
        &self.timeout
    }

    fn before_work(&self) {
        self.vruntime_start.store(nano_time(), Ordering::Relaxed);
        self.timeout.start_timer(self.shared.scaled_period());
    }

    /// Record metrics and release the running token. Returns whether more
    /// work was queued while we ran.
    fn after_work(&self) -> bool {
        self.metrics.observe(
            Metric::ComputerTasks,
            Duration::from_nanos(self.timeout.current_slice_nanos()),
        );

        loop {
            let state = self.state.load(Ordering::Acquire);
            let (next, repeat) = match state {
                STATE_RUNNING => (STATE_IDLE, false),
                STATE_REPEAT => (STATE_ON_QUEUE, true),
                _ => {
                    log::error!(
                        "Impossible scheduler state {state} for computer #{} after work.",
                        self.worker.computer_id()
                    );
                    (STATE_ON_QUEUE, false)
                }
            };
            if self
                .state
                .compare_exchange(state, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return repeat;
            }
        }
    }

    /// Advance `virtual_runtime` by the executor's share of the wall time
    /// since the last update, returning the new value.
    fn bump_runtime(&self, now: u64, tasks: u64) -> u64 {
        let start = self.vruntime_start.swap(now, Ordering::Relaxed);
        let delta = now.saturating_sub(start) / tasks;
        self.virtual_runtime.fetch_add(delta, Ordering::Relaxed) + delta
    }
}

impl Shared {
    fn advance_state(&self, target: u8) {
        self.state.fetch_max(target, Ordering::AcqRel);
    }

    fn has_pending_work(&self) -> bool {
        self.queue_size.load(Ordering::Relaxed) > 0
    }

    /// More work queued than idle workers to take it.
    fn is_busy(&self) -> bool {
        self.queue_size.load(Ordering::Relaxed) > self.idle_workers.load(Ordering::Relaxed)
    }

    /// The slice length for one task: an even share of the latency period,
    /// floored at the minimum period.
    fn scaled_period(&self) -> u64 {
        // +1 to include the current task.
        let count = 1 + self.queue_size.load(Ordering::Relaxed) as u64;
        if count < LATENCY_MAX_TASKS {
            self.latency_ns / count
        } else {
            self.min_period_ns
        }
    }

    fn queue(shared: &Arc<Shared>, executor: Arc<Executor>) {
        let mut comp = lock(&shared.comp);
        if shared.state.load(Ordering::Acquire) != RUN_RUNNING {
            log::warn!(
                "Computer #{} queued while the scheduler is stopping; dropping.",
                executor.worker.computer_id()
            );
            return;
        }

        Shared::ensure_running(shared);
        Shared::update_runtimes(shared, &mut comp, None);

        // Not currently on the queue, so bring the runtime up to at least
        // the watermark: new computers are slowed by one period, sleepers
        // get a boost of at most half the latency.
        let current = executor.virtual_runtime.load(Ordering::Relaxed);
        let new_runtime = if current == 0 {
            comp.minimum_virtual_runtime + shared.scaled_period()
        } else {
            comp.minimum_virtual_runtime
                .saturating_sub(shared.latency_ns / 2)
        };
        let runtime = new_runtime.max(current);
        executor.virtual_runtime.store(runtime, Ordering::Relaxed);

        let was_busy = shared.is_busy();
        comp.queue.insert(QueueEntry { runtime, id: executor.id, executor });
        shared.queue_size.fetch_add(1, Ordering::Relaxed);
        shared.worker_wakeup.notify_one();

        // If this made us busy, the monitor needs to switch to its
        // fine-grained pause interval.
        if !was_busy && shared.is_busy() {
            shared.monitor_wakeup.notify_one();
        }
    }

    /// Advance the virtual runtime of every executing computer and raise the
    /// watermark. Must be called with the queue lock held.
    fn update_runtimes(shared: &Arc<Shared>, comp: &mut RunQueue, current: Option<&Arc<Executor>>) {
        let mut min_runtime = u64::MAX;
        if let Some(first) = comp.queue.first() {
            min_runtime = first.runtime;
        }

        let now = nano_time();
        let tasks = 1 + comp.queue.len() as u64;
        let workers: Vec<Arc<WorkerHandle>> =
            lock(&shared.threads).workers.iter().flatten().cloned().collect();
        for worker in workers {
            let executing = lock(&worker.current).clone();
            if let Some(executor) = executing {
                min_runtime = min_runtime.min(executor.bump_runtime(now, tasks));
            }
        }
        if let Some(executor) = current {
            min_runtime = min_runtime.min(executor.bump_runtime(now, tasks));
        }

        if min_runtime > comp.minimum_virtual_runtime && min_runtime < u64::MAX {
            comp.minimum_virtual_runtime = min_runtime;
        }
    }

    /// Requeue an executor a worker has just finished with.
    fn after_work(shared: &Arc<Shared>, executor: &Arc<Executor>) {
        let mut comp = lock(&shared.comp);
        Shared::update_runtimes(shared, &mut comp, Some(executor));

        if !executor.after_work() || shared.state.load(Ordering::Acquire) != RUN_RUNNING {
            return;
        }

        let runtime = executor.virtual_runtime.load(Ordering::Relaxed);
        comp.queue.insert(QueueEntry { runtime, id: executor.id, executor: executor.clone() });
        shared.queue_size.fetch_add(1, Ordering::Relaxed);
        shared.worker_wakeup.notify_one();
    }

    /// Make sure the monitor is alive and a worker will pick up new work.
    /// Must be called with the queue lock held.
    fn ensure_running(shared: &Arc<Shared>) {
        let mut pool = lock(&shared.threads);

        if pool.monitor.as_ref().is_none_or(|m| m.is_finished()) {
            let monitor_shared = shared.clone();
            match thread::Builder::new()
                .name("computer-monitor".to_owned())
                .spawn(move || monitor_run(monitor_shared))
            {
                Ok(handle) => pool.monitor = Some(handle),
                Err(err) => log::error!("Failed to spawn monitor thread: {err}"),
            }
        }

        if shared.idle_workers.load(Ordering::Relaxed) > 0 {
            return;
        }
        if let Some(index) = pool.workers.iter().position(Option::is_none) {
            Shared::add_worker(shared, &mut pool, index);
        }
    }

    fn add_worker(shared: &Arc<Shared>, pool: &mut ThreadPool, index: usize) {
        let handle = Arc::new(WorkerHandle {
            index,
            running: AtomicBool::new(true),
            current: Mutex::new(None),
            last_report: AtomicU64::new(u64::MAX),
        });
        let worker_shared = shared.clone();
        let me = handle.clone();
        match thread::Builder::new()
            .name(format!("computer-worker-{index}"))
            .spawn(move || {
                worker_run(&worker_shared, &me);
                worker_finished(&worker_shared, &me);
            }) {
            Ok(_) => {
                log::trace!("Spawned worker {index}.");
                pool.workers[index] = Some(handle);
                pool.running_count += 1;
            }
            Err(err) => log::error!("Failed to spawn worker thread: {err}"),
        }
    }
}

fn worker_run(shared: &Arc<Shared>, me: &Arc<WorkerHandle>) {
    while me.running.load(Ordering::Acquire) {
        // Wait for something runnable.
        let executor = {
            let mut comp = lock(&shared.comp);
            shared.idle_workers.fetch_add(1, Ordering::SeqCst);
            let executor = loop {
                if let Some(entry) = comp.queue.pop_first() {
                    shared.queue_size.fetch_sub(1, Ordering::Relaxed);
                    break Some(entry.executor);
                }
                if shared.state.load(Ordering::Acquire) >= RUN_STOPPING {
                    break None;
                }
                comp = match shared.worker_wakeup.wait(comp) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            };
            shared.idle_workers.fetch_sub(1, Ordering::SeqCst);
            match executor {
                Some(executor) => executor,
                None => return,
            }
        };

        // Take exclusive ownership of the executor.
        if executor
            .state
            .compare_exchange(STATE_ON_QUEUE, STATE_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let mut state = String::new();
            executor.worker.write_state(&mut state);
            log::error!(
                "Computer #{} is already running on another thread. This is a serious bug.\n{state}",
                executor.worker.computer_id()
            );
            executor.worker.abort_with_error();
        }

        // When stopping, the only thing this executor should do is shut down.
        if shared.state.load(Ordering::Acquire) >= RUN_STOPPING {
            executor.worker.unload();
        }

        executor.before_work();
        *lock(&me.current) = Some(executor.clone());

        let result = catch_unwind(AssertUnwindSafe(|| executor.worker.work()));
        if result.is_err() {
            log::error!("Computer #{} panicked while running.", executor.worker.computer_id());
            // No guarantee it's well-behaved from now on; tear it down.
            executor.worker.abort_with_error();
        }

        // The monitor may have taken the executor from us if it declared
        // this worker dead; only finish the bookkeeping if it is still ours.
        let ours = lock(&me.current).take();
        if ours.is_some() {
            Shared::after_work(shared, &executor);
        }
    }
}

/// A worker terminated, or the monitor gave up on it. Spawn a replacement if
/// the scheduler still needs one.
fn worker_finished(shared: &Arc<Shared>, me: &Arc<WorkerHandle>) {
    if !me.running.swap(false, Ordering::AcqRel) {
        return;
    }
    log::trace!("Worker {} finished.", me.index);

    let executor = lock(&me.current).take();
    if let Some(executor) = executor {
        // Release the ownership token; any repeat work is dropped.
        executor.after_work();
    }

    let mut pool = lock(&shared.threads);
    pool.running_count -= 1;

    let ours = pool.workers[me.index].as_ref().is_some_and(|w| Arc::ptr_eq(w, me));
    let state = shared.state.load(Ordering::Acquire);
    if !ours {
        log::error!("Worker {} closed, but a replacement is already running.", me.index);
    } else if state == RUN_RUNNING || (state == RUN_STOPPING && shared.has_pending_work()) {
        pool.workers[me.index] = None;
        Shared::add_worker(shared, &mut pool, me.index);
    } else {
        pool.workers[me.index] = None;
    }

    shared.shutdown.notify_all();
}

fn monitor_run(shared: Arc<Shared>) {
    log::trace!("Monitor starting.");
    while shared.state.load(Ordering::Acquire) < RUN_CLOSED {
        {
            let comp = lock(&shared.comp);
            // Busy means a task will need pausing soon, so wake at slice
            // granularity; otherwise the coarse abort checks are enough.
            let wait = if shared.is_busy() {
                Duration::from_nanos(shared.scaled_period())
            } else {
                MONITOR_WAKEUP
            };
            let _unused = match shared.monitor_wakeup.wait_timeout(comp, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        check_runners(&shared);
    }
    log::trace!("Monitor shutting down.");
}

fn check_runners(shared: &Arc<Shared>) {
    let workers: Vec<Arc<WorkerHandle>> =
        lock(&shared.threads).workers.iter().flatten().cloned().collect();

    for worker in workers {
        let Some(executor) = lock(&worker.current).clone() else { continue };

        // Update the pause/soft-abort flags.
        executor.timeout.refresh();

        let timeout = &executor.timeout;
        let remaining = timeout.timeout_nanos() as i128 - timeout.nanos_cumulative() as i128;
        let abort = timeout.abort_nanos() as i128;
        // remaining > 0: executing normally. remaining in (-abort, 0]: soft
        // aborted, still within grace. Beyond that we escalate.
        let after_hard_abort = -remaining - abort;
        if after_hard_abort < 0 {
            continue;
        }

        timeout.hard_abort();
        executor.worker.abort_with_timeout();

        if after_hard_abort >= abort {
            // Hard abort has had a full grace period and the worker still
            // has not come back: declare it dead, finish its bookkeeping and
            // let a replacement take over. The thread itself is abandoned.
            report_timeout(&worker, &executor, remaining);
            worker_finished(shared, &worker);
        }
    }
}

fn report_timeout(worker: &WorkerHandle, executor: &Executor, remaining_ns: i128) {
    // Debounce: one report per worker per second is plenty.
    let now = nano_time();
    let then = worker.last_report.load(Ordering::Relaxed);
    if then != u64::MAX && now.saturating_sub(then) <= REPORT_DEBOUNCE_NS {
        return;
    }
    if worker
        .last_report
        .compare_exchange(then, now, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let mut state = String::new();
    executor.worker.write_state(&mut state);
    log::warn!(
        "Terminating computer #{} due to timeout (ran over by {:.2}s) on worker {}. \
         This is not a bug, but may mean a computer is misbehaving.\n{state}",
        executor.worker.computer_id(),
        -(remaining_ns as f64) * 1e-9,
        worker.index
    );
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
