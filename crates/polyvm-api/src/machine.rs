//! The script machine contract.
//!
//! A [`ScriptMachine`] is an opaque resumable computation: the executor feeds
//! it events one at a time and it either finishes the event, pauses midway
//! (to be resumed with no event on the next slice), or fails. The core never
//! sees the scripting language behind it.

use std::io::Read;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::env::MetricsObserver;

/// Arguments attached to a queued event.
pub type EventArgs = Vec<Value>;

/// The outcome of resuming a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineResult {
    /// The event was handled to completion.
    Ok,
    /// The machine yielded midway through its slice and should be resumed
    /// with no event once it is rescheduled.
    Paused,
    /// The machine failed with the given user-visible message.
    Error(String),
}

impl MachineResult {
    pub fn is_error(&self) -> bool {
        matches!(self, MachineResult::Error(_))
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, MachineResult::Paused)
    }
}

/// A cooperative view of the executor's timeout accounting, handed to the
/// machine so it can poll for pause and abort requests at safe points.
pub trait TimeoutToken: Send + Sync {
    /// The scheduler wants this machine to yield so another can run. Advisory.
    fn is_paused(&self) -> bool;

    /// The machine has exhausted its cumulative budget and should wind down.
    fn is_soft_aborted(&self) -> bool;

    /// The grace period has passed; the machine must stop now.
    fn is_hard_aborted(&self) -> bool;
}

/// A running, resumable script machine. Implementations must tolerate
/// `handle_event` and `close` racing from different threads.
pub trait ScriptMachine: Send + Sync {
    /// Resume the machine with an event, or with `None` to continue a paused
    /// slice (or to boot a freshly created machine).
    fn handle_event(&self, event: Option<&str>, args: &[Value]) -> MachineResult;

    /// Append a human-readable description of what the machine is doing, for
    /// timeout reports.
    fn print_execution_state(&self, _out: &mut String) {}

    /// Tear the machine down, releasing any resources it holds. Must be safe
    /// to call while another thread is inside `handle_event`.
    fn close(&self);
}

/// What the core provides to a machine being constructed.
pub struct MachineEnvironment {
    pub computer_id: i32,
    pub host: String,
    pub metrics: Arc<dyn MetricsObserver>,
    pub timeout: Arc<dyn TimeoutToken>,
}

/// A machine could not be created.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MachineError(pub String);

/// Creates machines for computers as they boot.
pub trait MachineFactory: Send + Sync {
    /// Build a machine running the given entry script.
    fn create(
        &self,
        env: MachineEnvironment,
        entry_script: &mut dyn Read,
    ) -> Result<Arc<dyn ScriptMachine>, MachineError>;
}

/// An API surface exposed to computers, started and stopped with the machine
/// and ticked with the computer.
pub trait MachineApi: Send + Sync {
    /// The names this API is registered under.
    fn names(&self) -> &[&str];

    /// Called when the owning computer turns on.
    fn startup(&self) {}

    /// Called once per host tick while the computer is on.
    fn update(&self) {}

    /// Called when the owning computer shuts down.
    fn shutdown(&self) {}
}
