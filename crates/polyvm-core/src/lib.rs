//! The polyvm computer core: many sandboxed virtual computers multiplexed
//! fairly over a small pool of worker threads, each with a private virtual
//! filesystem assembled from heterogeneous mounts.
//!
//! The embedder constructs a [`ComputerContext`] (supplying the global
//! environment and a script-machine factory through the contracts in
//! `polyvm-api`), creates a [`computer::Computer`] per machine, and calls
//! `tick()` on each once per host frame. Fair scheduling, timeout escalation
//! and filesystem access all happen inside.

pub mod computer;
pub mod config;
pub mod context;
pub mod fs;
pub mod terminal;

pub use computer::mainthread::MainThread;
pub use computer::timeout::ABORT_MESSAGE;
pub use computer::{ChangeSet, Computer};
pub use config::{CoreConfig, MainThreadConfig, TimeoutConfig};
pub use context::ComputerContext;
pub use fs::FileSystem;
pub use terminal::Terminal;
