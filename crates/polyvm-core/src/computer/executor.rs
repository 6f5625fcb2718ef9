//! The task queue and state machine for a single computer.
//!
//! Commands and events arrive from the embedder's thread and are executed on
//! a scheduler worker via [`Worker::work`]. The executor is two queues: a
//! single-element command slot deciding which state the computer should move
//! to, and a bounded FIFO of events delivered to the machine while it is on.
//! A pending command supersedes events, since the machine is about to be
//! torn down or rebuilt anyway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::OnceCell;
use serde_json::Value;

use polyvm_api::env::{ComputerEnvironment, GlobalEnvironment, MetricsObserver};
use polyvm_api::fs::WritableMount;
use polyvm_api::machine::{
    EventArgs, MachineApi, MachineEnvironment, MachineResult, ScriptMachine,
};
use polyvm_api::MachineFactory;

use crate::computer::scheduler::{Executor, Worker};
use crate::computer::timeout;
use crate::fs::FileSystem;
use crate::terminal::Terminal;

const QUEUE_LIMIT: usize = 256;

/// The resource domain bundled read-only assets live under.
const RESOURCE_DOMAIN: &str = "polyvm";
const BOOT_SCRIPT: &str = "boot";
const ROM_PATH: &str = "rom";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateCommand {
    TurnOn,
    Shutdown,
    Reboot,
    /// The watchdog gave up on this computer.
    Abort,
    /// Something internal broke (a panic, a scheduler invariant violation).
    Error,
}

struct Event {
    name: String,
    args: EventArgs,
}

#[derive(Default)]
struct Queues {
    command: Option<StateCommand>,
    events: VecDeque<Event>,
    /// Once closed, no further commands or events are accepted.
    closed: bool,
}

pub(crate) struct ComputerExecutor {
    computer_id: i32,
    terminal: Arc<Terminal>,
    env: Arc<dyn ComputerEnvironment>,
    global: Arc<dyn GlobalEnvironment>,
    machine_factory: Arc<dyn MachineFactory>,
    metrics: Arc<dyn MetricsObserver>,
    max_files_open: usize,

    apis: Mutex<Vec<Arc<dyn MachineApi>>>,
    file_system: Mutex<Option<Arc<FileSystem>>>,
    machine: Mutex<Option<Arc<dyn ScriptMachine>>>,
    /// Created once and reused across reboots, so computer storage persists.
    root_mount: Mutex<Option<Arc<dyn WritableMount>>>,

    is_on: AtomicBool,
    /// Held while running any state command, and tried when updating APIs,
    /// so a tick never races a startup or shutdown.
    is_on_lock: Mutex<()>,

    queue: Mutex<Queues>,

    /// The machine paused mid-event and must be resumed with no event before
    /// anything else runs.
    resume_paused: AtomicBool,

    /// Guards against two workers running us at once. The scheduler already
    /// enforces this; a violation here is a serious bug.
    executing: AtomicBool,

    /// Our handle into the scheduler, set just after construction.
    executor: OnceCell<Arc<Executor>>,
}

impl ComputerExecutor {
    pub(crate) fn new(
        computer_id: i32,
        terminal: Arc<Terminal>,
        env: Arc<dyn ComputerEnvironment>,
        global: Arc<dyn GlobalEnvironment>,
        machine_factory: Arc<dyn MachineFactory>,
        max_files_open: usize,
    ) -> Arc<ComputerExecutor> {
        let metrics = env.metrics();
        Arc::new(ComputerExecutor {
            computer_id,
            terminal,
            env,
            global,
            machine_factory,
            metrics,
            max_files_open,
            apis: Mutex::new(Vec::new()),
            file_system: Mutex::new(None),
            machine: Mutex::new(None),
            root_mount: Mutex::new(None),
            is_on: AtomicBool::new(false),
            is_on_lock: Mutex::new(()),
            queue: Mutex::new(Queues::default()),
            resume_paused: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            executor: OnceCell::new(),
        })
    }

    pub(crate) fn set_executor(&self, executor: Arc<Executor>) {
        if self.executor.set(executor).is_err() {
            log::error!("Scheduler executor for computer #{} set twice.", self.computer_id);
        }
    }

    pub(crate) fn is_on(&self) -> bool {
        self.is_on.load(Ordering::Acquire)
    }

    pub(crate) fn file_system(&self) -> Option<Arc<FileSystem>> {
        lock(&self.file_system).clone()
    }

    pub(crate) fn add_api(&self, api: Arc<dyn MachineApi>) {
        lock(&self.apis).push(api);
    }

    /// Schedule this computer to be started, if not already on.
    pub(crate) fn queue_start(&self) {
        let mut queue = lock(&self.queue);
        if queue.closed || self.is_on() || queue.command.is_some() {
            return;
        }
        queue.command = Some(StateCommand::TurnOn);
        drop(queue);
        self.enqueue();
    }

    /// Schedule this computer to be stopped, if currently on. `close` marks
    /// the executor as permanently done.
    pub(crate) fn queue_stop(&self, reboot: bool, close: bool) {
        let mut queue = lock(&self.queue);
        if queue.closed {
            return;
        }
        queue.closed = close;

        let command = if reboot { StateCommand::Reboot } else { StateCommand::Shutdown };
        if !self.is_on() || queue.command.is_some() {
            // Closing must always leave a stop pending, in case we are
            // mid-startup.
            if close {
                queue.command = Some(command);
            }
            return;
        }

        queue.command = Some(command);
        drop(queue);
        self.enqueue();
    }

    /// Queue an event for delivery, silently dropping it if the computer is
    /// off, a command is pending, or the queue is full.
    pub(crate) fn queue_event(&self, name: &str, args: EventArgs) {
        if !self.is_on() {
            return;
        }
        let mut queue = lock(&self.queue);
        if queue.closed || queue.command.is_some() || queue.events.len() >= QUEUE_LIMIT {
            return;
        }
        queue.events.push_back(Event { name: name.to_owned(), args });
        drop(queue);
        self.enqueue();
    }

    /// Destroy the machine immediately and schedule a teardown, bypassing
    /// whatever is mid-flight.
    fn immediate_fail(&self, command: StateCommand) {
        let machine = lock(&self.machine).clone();
        if let Some(machine) = machine {
            machine.close();
        }

        let mut queue = lock(&self.queue);
        if queue.closed {
            return;
        }
        queue.command = Some(command);
        if self.is_on() {
            drop(queue);
            self.enqueue();
        }
    }

    fn enqueue(&self) {
        if let Some(executor) = self.executor.get() {
            executor.submit();
        }
    }

    /// Advance the attached APIs. Called once per host tick; skipped rather
    /// than blocked if a state transition is in progress.
    pub(crate) fn tick(&self) {
        if !self.is_on() {
            return;
        }
        if let Ok(_guard) = self.is_on_lock.try_lock() {
            if self.is_on() {
                for api in lock(&self.apis).iter() {
                    api.update();
                }
            }
        }
    }

    fn create_file_system(&self) -> Option<Arc<FileSystem>> {
        let root = {
            let mut cached = lock(&self.root_mount);
            match &*cached {
                Some(mount) => mount.clone(),
                None => match self.env.create_root_mount() {
                    Ok(mount) => {
                        *cached = Some(mount.clone());
                        mount
                    }
                    Err(err) => {
                        log::error!(
                            "Cannot create root mount for computer #{}: {err:#}",
                            self.computer_id
                        );
                        self.display_failure("Cannot mount computer system", None);
                        return None;
                    }
                },
            }
        };

        let file_system = FileSystem::new("hdd", root, self.max_files_open);

        let Some(rom) = self.global.create_resource_mount(RESOURCE_DOMAIN, ROM_PATH) else {
            self.display_failure("Cannot mount rom", None);
            return None;
        };
        if let Err(err) = file_system.mount("rom", ROM_PATH, rom) {
            file_system.close();
            log::error!("Cannot mount rom for computer #{}: {err}", self.computer_id);
            self.display_failure("Cannot mount computer system", None);
            return None;
        }

        Some(file_system)
    }

    fn create_machine(&self) -> Option<Arc<dyn ScriptMachine>> {
        let Some(mut entry_script) =
            self.global.create_resource_file(RESOURCE_DOMAIN, BOOT_SCRIPT)
        else {
            self.display_failure("Error loading boot script", None);
            return None;
        };

        let Some(executor) = self.executor.get() else {
            log::error!("Computer #{} has no scheduler executor.", self.computer_id);
            self.display_failure("Error starting machine", None);
            return None;
        };

        let env = MachineEnvironment {
            computer_id: self.computer_id,
            host: self.global.host_string(),
            metrics: self.metrics.clone(),
            timeout: executor.timeout_state().clone(),
        };
        match self.machine_factory.create(env, &mut *entry_script) {
            Ok(machine) => Some(machine),
            Err(err) => {
                log::error!("Cannot create machine for computer #{}: {err}", self.computer_id);
                self.display_failure("Error starting machine", Some(&err.0));
                None
            }
        }
    }

    fn turn_on(&self) {
        let machine = {
            let _guard = lock(&self.is_on_lock);

            self.terminal.reset();
            {
                let mut queue = lock(&self.queue);
                queue.events.clear();
            }
            self.resume_paused.store(false, Ordering::Release);

            let Some(file_system) = self.create_file_system() else {
                self.shutdown_locked();
                return;
            };
            *lock(&self.file_system) = Some(file_system);

            for api in lock(&self.apis).iter() {
                api.startup();
            }

            let Some(machine) = self.create_machine() else {
                self.shutdown_locked();
                return;
            };
            *lock(&self.machine) = Some(machine.clone());

            self.is_on.store(true, Ordering::Release);
            machine
        };

        // Boot the machine now that everything is set up.
        self.resume_machine(&machine, None, &[]);
    }

    fn shutdown(&self) {
        let _guard = lock(&self.is_on_lock);
        self.shutdown_locked();
    }

    /// Tear everything down. Caller must hold `is_on_lock`.
    fn shutdown_locked(&self) {
        self.is_on.store(false, Ordering::Release);
        lock(&self.queue).events.clear();
        self.resume_paused.store(false, Ordering::Release);

        if let Some(machine) = lock(&self.machine).take() {
            machine.close();
        }
        for api in lock(&self.apis).iter() {
            api.shutdown();
        }
        if let Some(file_system) = lock(&self.file_system).take() {
            file_system.close();
        }
    }

    fn resume_machine(&self, machine: &Arc<dyn ScriptMachine>, event: Option<&str>, args: &[Value]) {
        match machine.handle_event(event, args) {
            MachineResult::Ok => {}
            MachineResult::Paused => self.resume_paused.store(true, Ordering::Release),
            MachineResult::Error(message) => {
                self.display_failure("Error running computer", Some(&message));
                self.shutdown();
            }
        }
    }

    fn display_failure(&self, message: &str, detail: Option<&str>) {
        self.terminal.reset();
        self.terminal.write(message);
        if let Some(detail) = detail {
            self.terminal.set_cursor_pos(0, 1);
            self.terminal.write(detail);
        }
    }

    fn work_impl(&self) {
        // Finish an event the machine previously yielded in the middle of.
        if self.resume_paused.swap(false, Ordering::AcqRel) {
            let machine = lock(&self.machine).clone();
            if let Some(machine) = machine {
                self.resume_machine(&machine, None, &[]);
                return;
            }
        }

        let (command, event) = {
            let mut queue = lock(&self.queue);
            match queue.command.take() {
                Some(command) => (Some(command), None),
                None => {
                    if !self.is_on() {
                        // Off with no command, yet work was queued. Should
                        // not happen; drop whatever is there.
                        queue.events.clear();
                        return;
                    }
                    (None, queue.events.pop_front())
                }
            }
        };

        if let Some(command) = command {
            match command {
                StateCommand::TurnOn => {
                    if !self.is_on() {
                        self.turn_on();
                    }
                }
                StateCommand::Shutdown => {
                    if self.is_on() {
                        self.terminal.reset();
                        self.shutdown();
                    }
                }
                StateCommand::Reboot => {
                    if self.is_on() {
                        self.terminal.reset();
                        self.shutdown();
                        self.queue_start();
                    }
                }
                StateCommand::Abort => {
                    if self.is_on() {
                        self.display_failure(timeout::ABORT_MESSAGE, None);
                        self.shutdown();
                    }
                }
                StateCommand::Error => {
                    if self.is_on() {
                        self.display_failure("Error running computer", None);
                        self.shutdown();
                    }
                }
            }
        } else if let Some(event) = event {
            let machine = lock(&self.machine).clone();
            if let Some(machine) = machine {
                self.resume_machine(&machine, Some(&event.name), &event.args);
            }
        }
    }
}

impl Worker for ComputerExecutor {
    fn work(&self) {
        if self.executing.swap(true, Ordering::AcqRel) {
            log::error!(
                "Computer #{} is executing on two threads at once. This is a serious bug.",
                self.computer_id
            );
            return;
        }

        // Reset the flag even if work_impl unwinds; the scheduler catches
        // the panic and this executor must stay runnable for its teardown.
        struct Reset<'a>(&'a AtomicBool);
        impl Drop for Reset<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _reset = Reset(&self.executing);

        self.work_impl();

        // Bank or reset the execution budget depending on whether the
        // machine finished what it was doing.
        let paused = self.resume_paused.load(Ordering::Acquire);
        if let Some(executor) = self.executor.get() {
            let timeout = executor.timeout_state();
            if paused {
                timeout.pause_timer();
            } else {
                timeout.stop_timer();
            }
        }

        let more = paused || {
            let queue = lock(&self.queue);
            queue.command.is_some() || !queue.events.is_empty()
        };
        if more {
            self.enqueue();
        }
    }

    fn computer_id(&self) -> i32 {
        self.computer_id
    }

    fn write_state(&self, out: &mut String) {
        let machine = lock(&self.machine).clone();
        if let Some(machine) = machine {
            machine.print_execution_state(out);
        }
    }

    fn abort_with_timeout(&self) {
        self.immediate_fail(StateCommand::Abort);
    }

    fn abort_with_error(&self) {
        self.immediate_fail(StateCommand::Error);
    }

    fn unload(&self) {
        self.queue_stop(false, true);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
