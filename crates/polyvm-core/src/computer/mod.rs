//! Computers and the machinery that runs them.

pub(crate) mod executor;
pub mod mainthread;
pub mod scheduler;
pub mod timeout;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use polyvm_api::env::ComputerEnvironment;
use polyvm_api::machine::{EventArgs, MachineApi};

use crate::computer::executor::ComputerExecutor;
use crate::computer::mainthread::{MainThreadExecutor, MainThreadTask};
use crate::context::ComputerContext;
use crate::fs::FileSystem;
use crate::terminal::Terminal;

/// Ticks a freshly started computer waits before a second start request is
/// honoured, so rapid toggling can't spam expensive boots.
const START_DELAY: u32 = 50;

bitflags! {
    /// What changed since the embedder last polled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeSet: u8 {
        const TERMINAL = 1 << 0;
        const STATE = 1 << 1;
        const LABEL = 1 << 2;
    }
}

/// A single virtual computer: the embedder-facing façade over an executor,
/// a terminal and a main-thread task queue.
pub struct Computer {
    id: i32,
    label: Mutex<Option<String>>,
    terminal: Arc<Terminal>,
    executor: Arc<ComputerExecutor>,
    main_thread: Arc<MainThreadExecutor>,
    changes: AtomicU8,
    tick_state: Mutex<TickState>,
}

struct TickState {
    start_requested: bool,
    /// `None` if the computer has never been started.
    ticks_since_start: Option<u32>,
    last_on: bool,
}

impl Computer {
    pub fn new(
        context: &ComputerContext,
        environment: Arc<dyn ComputerEnvironment>,
        terminal: Arc<Terminal>,
        id: i32,
    ) -> Arc<Computer> {
        let metrics = environment.metrics();
        let executor = ComputerExecutor::new(
            id,
            terminal.clone(),
            environment,
            context.global_environment(),
            context.machine_factory(),
            context.config().max_files_open,
        );
        executor.set_executor(
            context.computer_scheduler().create_executor(executor.clone(), metrics.clone()),
        );
        let main_thread = context.main_thread().create_executor(metrics);

        Arc::new(Computer {
            id,
            label: Mutex::new(None),
            terminal,
            executor,
            main_thread,
            changes: AtomicU8::new(0),
            tick_state: Mutex::new(TickState {
                start_requested: false,
                ticks_since_start: None,
                last_on: false,
            }),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn label(&self) -> Option<String> {
        lock(&self.label).clone()
    }

    pub fn set_label(&self, label: Option<String>) {
        let mut current = lock(&self.label);
        if *current != label {
            *current = label;
            self.mark_changed(ChangeSet::LABEL);
        }
    }

    pub fn terminal(&self) -> &Arc<Terminal> {
        &self.terminal
    }

    pub fn is_on(&self) -> bool {
        self.executor.is_on()
    }

    pub fn file_system(&self) -> Option<Arc<FileSystem>> {
        self.executor.file_system()
    }

    pub fn add_api(&self, api: Arc<dyn MachineApi>) {
        self.executor.add_api(api);
    }

    /// Request a start. Takes effect on a subsequent [`Self::tick`], and is
    /// rate-limited after a recent boot.
    pub fn turn_on(&self) {
        lock(&self.tick_state).start_requested = true;
    }

    pub fn shutdown(&self) {
        self.executor.queue_stop(false, false);
    }

    pub fn reboot(&self) {
        self.executor.queue_stop(true, false);
    }

    /// Shut down and permanently close this computer. It accepts no further
    /// commands or events afterwards.
    pub fn unload(&self) {
        self.executor.queue_stop(false, true);
    }

    pub fn queue_event(&self, event: &str, args: EventArgs) {
        self.executor.queue_event(event, args);
    }

    /// Queue a task for the host's main thread, returning whether there was
    /// space for it.
    pub fn queue_main_thread(&self, task: MainThreadTask) -> bool {
        self.main_thread.enqueue(task)
    }

    /// Advance the computer by one host tick: honour pending start requests,
    /// update APIs, and collect visible-state changes.
    pub fn tick(&self) {
        {
            let mut state = lock(&self.tick_state);
            if let Some(ticks) = &mut state.ticks_since_start {
                if *ticks <= START_DELAY {
                    *ticks += 1;
                }
            }

            if state.start_requested
                && state.ticks_since_start.is_none_or(|ticks| ticks > START_DELAY)
            {
                state.start_requested = false;
                if !self.executor.is_on() {
                    state.ticks_since_start = Some(0);
                    self.executor.queue_start();
                }
            }
        }

        self.executor.tick();

        if self.terminal.poll_changed() {
            self.mark_changed(ChangeSet::TERMINAL);
        }

        let on = self.executor.is_on();
        let mut state = lock(&self.tick_state);
        if on != state.last_on {
            state.last_on = on;
            self.mark_changed(ChangeSet::STATE);
        }
    }

    /// Collect and clear the set of changes since the last poll.
    pub fn poll_and_reset_changes(&self) -> ChangeSet {
        ChangeSet::from_bits_truncate(self.changes.swap(0, Ordering::AcqRel))
    }

    fn mark_changed(&self, change: ChangeSet) {
        self.changes.fetch_or(change.bits(), Ordering::AcqRel);
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

    #[test]
    fn change_bits_accumulate_until_polled() {
        let changes = AtomicU8::new(0);
        changes.fetch_or(ChangeSet::TERMINAL.bits(), Ordering::AcqRel);
        changes.fetch_or(ChangeSet::LABEL.bits(), Ordering::AcqRel);

        let polled = ChangeSet::from_bits_truncate(changes.swap(0, Ordering::AcqRel));
        assert_eq!(polled, ChangeSet::TERMINAL | ChangeSet::LABEL);
        assert_eq!(changes.load(Ordering::Acquire), 0);
    }
}
