//! The shared context every computer in a session hangs off.

use std::sync::Arc;
use std::time::Duration;

use polyvm_api::env::GlobalEnvironment;
use polyvm_api::MachineFactory;

use crate::computer::mainthread::MainThread;
use crate::computer::scheduler::ComputerThread;
use crate::config::CoreConfig;

/// Owns the worker-pool scheduler, the main-thread scheduler and the global
/// environment. Constructed once by the embedder and passed to every
/// [`crate::computer::Computer`] it creates; there is no hidden global.
pub struct ComputerContext {
    config: CoreConfig,
    global_environment: Arc<dyn GlobalEnvironment>,
    machine_factory: Arc<dyn MachineFactory>,
    computer_scheduler: ComputerThread,
    main_thread: MainThread,
}

impl ComputerContext {
    pub fn new(
        config: CoreConfig,
        global_environment: Arc<dyn GlobalEnvironment>,
        machine_factory: Arc<dyn MachineFactory>,
    ) -> ComputerContext {
        let computer_scheduler = ComputerThread::new(config.computer_threads, config.timeout);
        let main_thread = MainThread::new(config.main_thread);
        ComputerContext {
            config,
            global_environment,
            machine_factory,
            computer_scheduler,
            main_thread,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn global_environment(&self) -> Arc<dyn GlobalEnvironment> {
        self.global_environment.clone()
    }

    pub fn machine_factory(&self) -> Arc<dyn MachineFactory> {
        self.machine_factory.clone()
    }

    pub(crate) fn computer_scheduler(&self) -> &ComputerThread {
        &self.computer_scheduler
    }

    pub fn main_thread(&self) -> &MainThread {
        &self.main_thread
    }

    /// Run one host tick's worth of main-thread tasks. Call from the host's
    /// own thread, alongside ticking each computer.
    pub fn tick(&self) {
        self.main_thread.tick();
    }

    /// Shut the worker pool down, waiting up to `timeout` for computers to
    /// finish. Returns false if some were still running when it expired.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.computer_scheduler.stop(timeout)
    }
}
