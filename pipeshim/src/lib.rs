//! pipeshim - process stdio wiring for container shims.
//!
//! Connects a container process's standard streams to the named pipes a
//! client attached, either through anonymous pipes or through a
//! pseudo-terminal received over a console socket, tracks the copy tasks,
//! and releases every handle once the output has drained.

#[cfg(not(target_os = "linux"))]
compile_error!("pipeshim only supports Linux");

pub mod io;
pub mod options;
pub mod process;
pub mod runtime;

pub use options::IoOptions;
pub use pipeshim_shared::errors::{ShimError, ShimResult};
pub use process::{IoState, Process, ProcessConfig, WaitReport};
pub use runtime::RuntimeCommand;
