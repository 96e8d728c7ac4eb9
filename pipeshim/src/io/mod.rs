//! Process stdio plumbing.
//!
//! # Architecture
//!
//! - [`fifo`]: named-pipe endpoints opened under a shared deadline
//! - [`pipes`]: anonymous pipes between the shim and a non-terminal container
//! - [`console`]: console socket handshake and pty bridging
//! - [`relay`]: directional byte copies, one task per stream
//! - [`tracker`]: counts relays that must finish before cleanup
//! - [`cleanup`]: release list closing every handle exactly once

pub mod cleanup;
pub mod console;
pub mod fifo;
pub mod pipes;
pub mod relay;
pub mod tracker;

pub use cleanup::{ReleaseList, ResourceKind};
pub use console::ConsoleSocket;
pub use fifo::{Deadline, Direction, Fifo};
pub use pipes::{ChildStdio, ContainerPipes};
pub use relay::{CopyDirection, Relay, RelayOutcome, RelayReport, RelaySet, StreamRole};
pub use tracker::{CompletionGuard, CompletionTracker};
