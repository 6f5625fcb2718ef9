//! Budgeted execution of computer tasks on the embedder's main thread.
//!
//! Computers may push small tasks (label changes, world queries) onto the
//! host's own thread via [`MainThread::tick`]. Each computer gets a
//! per-tick time budget and the whole scheduler gets a global one; a
//! computer that overruns its budget goes hot and must cool back down to a
//! full budget before it runs again, so one greedy computer cannot starve
//! the rest or stall the host. Ordering between computers uses the same
//! least-virtual-time-first rule as the worker scheduler.

use std::collections::{BTreeSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use polyvm_api::env::{Metric, MetricsObserver};

use crate::computer::timeout::nano_time;
use crate::config::MainThreadConfig;

/// The most tasks a single computer may have queued for the main thread.
const MAX_TASKS: usize = 5_000;

pub type MainThreadTask = Box<dyn FnOnce() + Send>;

pub struct MainThread {
    shared: Arc<MainShared>,
}

struct MainShared {
    config: MainThreadConfig,
    current_tick: AtomicU32,
    next_id: AtomicU64,
    queue: Mutex<MainQueue>,
    /// Executors which overran their budget and are waiting to cool.
    cooling: Mutex<Vec<Arc<MainThreadExecutor>>>,
}

struct MainQueue {
    executors: BTreeSet<QueueEntry>,
    /// Watermark for the virtual time of newly queued executors.
    minimum_time: u64,
    /// Global time left this tick; negative once overrun.
    budget: i64,
    can_execute: bool,
}

struct QueueEntry {
    time: u64,
    id: u64,
    executor: Arc<MainThreadExecutor>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
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
        (self.time, self.id).cmp(&(other.time, other.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoolState {
    /// Has budget, may run tasks.
    Cool,
    /// Overran its budget this tick.
    Hot,
    /// Replenishing; runs nothing until the budget is full again.
    Cooling,
}

pub struct MainThreadExecutor {
    id: u64,
    shared: Arc<MainShared>,
    metrics: Arc<dyn MetricsObserver>,
    state: Mutex<ExecutorState>,
}

struct ExecutorState {
    tasks: VecDeque<MainThreadTask>,
    on_queue: bool,
    virtual_time: u64,
    /// Per-tick budget; negative once overrun.
    budget: i64,
    /// The tick `budget` was last reset on.
    current_tick: Option<u32>,
    cool: CoolState,
}

impl MainThread {
    pub fn new(config: MainThreadConfig) -> MainThread {
        MainThread {
            shared: Arc::new(MainShared {
                config,
                current_tick: AtomicU32::new(0),
                next_id: AtomicU64::new(0),
                queue: Mutex::new(MainQueue {
                    executors: BTreeSet::new(),
                    minimum_time: 0,
                    budget: 0,
                    can_execute: true,
                }),
                cooling: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn create_executor(&self, metrics: Arc<dyn MetricsObserver>) -> Arc<MainThreadExecutor> {
        Arc::new(MainThreadExecutor {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            shared: self.shared.clone(),
            metrics,
            state: Mutex::new(ExecutorState {
                tasks: VecDeque::new(),
                on_queue: false,
                virtual_time: 0,
                budget: 0,
                current_tick: None,
                cool: CoolState::Cool,
            }),
        })
    }

    /// Run queued tasks until this tick's global budget is spent. Call once
    /// per host tick, from the host's own thread.
    pub fn tick(&self) {
        let shared = &self.shared;
        let tick = shared.current_tick.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        // Replenish the global budget; any time allocated at all means we
        // run, so overruns accumulate into eventually skipping a whole tick.
        let budget = {
            let mut queue = lock(&shared.queue);
            let max_global = shared.config.max_global_time().as_nanos() as i64;
            queue.budget = (queue.budget + max_global).min(max_global);
            queue.can_execute = queue.budget > 0;
            if queue.can_execute {
                queue.budget
            } else {
                0
            }
        };

        // Cool down any warm computers.
        let cooling = std::mem::take(&mut *lock(&shared.cooling));
        let mut still_cooling: Vec<Arc<MainThreadExecutor>> =
            cooling.into_iter().filter(|e| !e.tick_cooling(tick)).collect();
        lock(&shared.cooling).append(&mut still_cooling);

        if budget == 0 {
            return;
        }

        let start = nano_time();
        let deadline = start + budget as u64;
        loop {
            let Some(entry) = lock(&shared.queue).executors.pop_first() else { break };
            let executor = entry.executor;

            let task_start = nano_time();
            executor.execute();
            let task_stop = nano_time();

            let requeue = executor.after_execute(task_stop.saturating_sub(task_start));
            {
                let mut queue = lock(&shared.queue);
                let time = executor.virtual_time();
                if requeue {
                    queue.executors.insert(QueueEntry {
                        time,
                        id: executor.id,
                        executor: executor.clone(),
                    });
                }
                let mut new_minimum = time;
                if let Some(first) = queue.executors.first() {
                    new_minimum = new_minimum.min(first.time);
                }
                queue.minimum_time = queue.minimum_time.max(new_minimum);
            }

            if task_stop >= deadline {
                break;
            }
        }

        lock(&shared.queue).budget -= nano_time().saturating_sub(start) as i64;
    }
}

impl MainThreadExecutor {
    /// Queue a task, returning whether there was space for it.
    pub fn enqueue(self: &Arc<Self>, task: MainThreadTask) -> bool {
        let need_queue = {
            let mut state = lock(&self.state);
            if state.tasks.len() >= MAX_TASKS {
                return false;
            }
            state.tasks.push_back(task);
            !state.on_queue && state.cool == CoolState::Cool
        };
        if need_queue {
            self.queue_on_scheduler();
        }
        true
    }

    fn queue_on_scheduler(self: &Arc<Self>) {
        let mut queue = lock(&self.shared.queue);
        let mut state = lock(&self.state);
        if state.on_queue {
            return;
        }
        state.on_queue = true;

        // Bring the virtual time up to the watermark; brand-new computers
        // start one budget behind.
        let mut new_time = queue.minimum_time;
        if state.virtual_time == 0 {
            new_time += self.shared.config.max_computer_time().as_nanos() as u64;
        }
        state.virtual_time = state.virtual_time.max(new_time);

        queue.executors.insert(QueueEntry {
            time: state.virtual_time,
            id: self.id,
            executor: self.clone(),
        });
    }

    fn execute(&self) {
        let task = {
            let mut state = lock(&self.state);
            if state.cool != CoolState::Cool {
                None
            } else {
                state.tasks.pop_front()
            }
        };
        if let Some(task) = task {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("A main-thread task panicked.");
            }
        }
    }

    /// Charge a finished task's wall time, returning whether this executor
    /// should stay on the queue.
    fn after_execute(self: &Arc<Self>, time: u64) -> bool {
        self.consume_time(time);

        let mut state = lock(&self.state);
        state.virtual_time += time;
        if state.cool != CoolState::Cool || state.tasks.is_empty() {
            state.on_queue = false;
            return false;
        }
        true
    }

    fn consume_time(self: &Arc<Self>, time: u64) {
        self.metrics.observe(Metric::MainThreadTasks, Duration::from_nanos(time));

        let mut state = lock(&self.state);
        let tick = self.shared.current_tick.load(Ordering::Relaxed);
        if state.current_tick != Some(tick) {
            // New tick and we weren't cooling, so the budget resets in full.
            state.current_tick = Some(tick);
            state.budget = self.shared.config.max_computer_time().as_nanos() as i64;
        }
        state.budget -= time as i64;

        if state.budget < 0 && state.cool == CoolState::Cool {
            state.cool = CoolState::Hot;
            lock(&self.shared.cooling).push(self.clone());
        }
    }

    /// Replenish one tick's worth of budget, returning whether this executor
    /// has fully cooled and may run again.
    fn tick_cooling(self: &Arc<Self>, tick: u32) -> bool {
        let need_queue = {
            let mut state = lock(&self.state);
            state.cool = CoolState::Cooling;
            state.current_tick = Some(tick);
            let max = self.shared.config.max_computer_time().as_nanos() as i64;
            state.budget = (state.budget + max).min(max);
            if state.budget < max {
                return false;
            }
            state.cool = CoolState::Cool;
            !state.tasks.is_empty() && !state.on_queue
        };
        if need_queue {
            self.queue_on_scheduler();
        }
        true
    }

    fn virtual_time(&self) -> u64 {
        lock(&self.state).virtual_time
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use polyvm_api::env::NoOpMetrics;

    fn counter_task(counter: &Arc<AtomicUsize>) -> MainThreadTask {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn tasks_run_on_tick() {
        let scheduler = MainThread::new(MainThreadConfig::default());
        let executor = scheduler.create_executor(Arc::new(NoOpMetrics));
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(executor.enqueue(counter_task(&counter)));
        assert!(executor.enqueue(counter_task(&counter)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn queue_is_bounded() {
        let scheduler = MainThread::new(MainThreadConfig::default());
        let executor = scheduler.create_executor(Arc::new(NoOpMetrics));
        for _ in 0..MAX_TASKS {
            assert!(executor.enqueue(Box::new(|| {})));
        }
        assert!(!executor.enqueue(Box::new(|| {})));
    }

    #[test]
    fn overrunning_computer_goes_hot_and_cools_down() {
        let config = MainThreadConfig { max_global_time_ms: 1_000, max_computer_time_ms: 10 };
        let scheduler = MainThread::new(config);
        let executor = scheduler.create_executor(Arc::new(NoOpMetrics));
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let counter = counter.clone();
            assert!(executor.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                // Blow well past the 10ms per-computer budget.
                std::thread::sleep(Duration::from_millis(30));
            })));
        }
        assert!(executor.enqueue(counter_task(&counter)));

        scheduler.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(lock(&executor.state).cool, CoolState::Hot);

        // 30ms spent against a 10ms budget: at least two ticks of cooling
        // before the budget is full again, then the queued task runs.
        scheduler.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let mut ticks = 0;
        while counter.load(Ordering::SeqCst) == 1 {
            assert!(ticks < 10, "executor never cooled down");
            scheduler.tick();
            ticks += 1;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(ticks >= 2);
    }

    #[test]
    fn executors_share_time_fairly() {
        let scheduler = MainThread::new(MainThreadConfig::default());
        let a = scheduler.create_executor(Arc::new(NoOpMetrics));
        let b = scheduler.create_executor(Arc::new(NoOpMetrics));
        let order = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            for (name, executor) in [("a", &a), ("b", &b)] {
                let order = order.clone();
                assert!(executor.enqueue(Box::new(move || {
                    lock(&order).push(name);
                })));
            }
        }

        scheduler.tick();
        let order = lock(&order).clone();
        assert_eq!(order.len(), 6);
        // Neither executor runs its whole queue before the other starts.
        assert_ne!(&order[..3], ["a", "a", "a"]);
        assert_ne!(&order[..3], ["b", "b", "b"]);
    }
}
