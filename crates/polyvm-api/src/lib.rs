//! Host-facing contracts for the polyvm computer core.
//!
//! This crate defines the seams between the core (`polyvm-core`) and an
//! embedder: mount backends and the typed filesystem error, the resumable
//! script-machine interface, and the environment/metrics hooks. It carries no
//! implementation logic of its own.

pub mod env;
pub mod fs;
pub mod machine;

pub use env::{ComputerEnvironment, GlobalEnvironment, Metric, MetricsObserver, NoOpMetrics};
pub use fs::{
    FileAttributes, FileOperationError, Mount, OpenFlags, SeekableChannel, WritableMount,
};
pub use machine::{
    EventArgs, MachineApi, MachineEnvironment, MachineError, MachineFactory, MachineResult,
    ScriptMachine, TimeoutToken,
};
