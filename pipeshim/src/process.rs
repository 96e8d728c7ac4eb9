//! Per-process I/O lifecycle.
//!
//! A [`Process`] moves through [`IoState::Uninitialized`] →
//! [`IoState::Ready`] → [`IoState::CleanedUp`]:
//!
//! - `open_io` opens every endpoint, stages each handle in a release list
//!   as soon as it is open, and only launches relays once all opens have
//!   succeeded. A failure closes everything staged so far.
//! - `wait` waits for the tracked relays, releases every handle once, then
//!   aborts the relays nobody waits on.
//!
//! `open_io` and `wait` both take `&mut self`, so they cannot race.

use crate::io::cleanup::{ReleaseList, ResourceKind};
use crate::io::console::{ConsoleBridge, ConsoleSocket};
use crate::io::fifo::{Deadline, Direction, Fifo};
use crate::io::pipes::{ChildStdio, ContainerPipes};
use crate::io::relay::{Relay, RelayReport, RelaySet, StreamRole};
use crate::io::tracker::CompletionTracker;
use crate::options::IoOptions;
use crate::runtime::RuntimeCommand;
use pipeshim_shared::errors::{ShimError, ShimResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Everything the shim knows about one managed process.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Container identifier passed to the runtime.
    pub id: String,

    /// True for a process exec'd into a running container.
    #[serde(default)]
    pub exec: bool,

    /// Wire the process through a pseudo-terminal.
    #[serde(default)]
    pub terminal: bool,

    /// Named pipe carrying the process's stdin.
    pub stdin: PathBuf,

    /// Named pipe receiving the process's stdout.
    pub stdout: PathBuf,

    /// Named pipe receiving the process's stderr.
    pub stderr: PathBuf,

    /// Owner of the container-side pipe ends.
    #[serde(default)]
    pub root_uid: u32,

    #[serde(default)]
    pub root_gid: u32,

    /// Low-level runtime binary.
    pub runtime: PathBuf,

    /// Arguments placed before every runtime subcommand.
    #[serde(default)]
    pub runtime_args: Vec<String>,
}

impl ProcessConfig {
    /// Fifo path serving `role`.
    pub fn stream_path(&self, role: StreamRole) -> &Path {
        match role {
            StreamRole::Stdin => &self.stdin,
            StreamRole::Stdout => &self.stdout,
            StreamRole::Stderr => &self.stderr,
        }
    }

    pub fn runtime_command(&self) -> RuntimeCommand {
        RuntimeCommand::new(&self.runtime, self.runtime_args.clone())
    }
}

/// I/O lifecycle state of a [`Process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Uninitialized,
    Ready,
    CleanedUp,
}

/// What `wait` did.
#[derive(Debug, Default)]
pub struct WaitReport {
    /// Handles closed by cleanup, in registration order.
    pub released: Vec<ResourceKind>,
    /// Relays that had ended by the time cleanup ran.
    pub relays: Vec<RelayReport>,
    /// Untracked relays stopped by cleanup (terminal-mode stdin).
    pub aborted: Vec<StreamRole>,
    /// Terminal mode: why console wiring failed, if it did.
    pub console_error: Option<ShimError>,
}

/// Work left to do once every endpoint is open.
enum Launch {
    Relays {
        relays: Vec<Relay>,
        child: ChildStdio,
    },
    Console {
        socket: ConsoleSocket,
        deadline: Deadline,
    },
}

/// One managed process and the I/O wired for it.
pub struct Process {
    config: ProcessConfig,
    work_dir: PathBuf,
    options: IoOptions,
    state: IoState,
    tracker: Arc<CompletionTracker>,
    resources: Arc<ReleaseList>,
    relays: Arc<RelaySet>,
    child_stdio: Option<ChildStdio>,
    console_task: Option<JoinHandle<ShimResult<()>>>,
}

impl Process {
    /// `work_dir` is the shim working directory; the console socket lives there.
    pub fn new(config: ProcessConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
            options: IoOptions::default(),
            state: IoState::Uninitialized,
            tracker: CompletionTracker::new(),
            resources: Arc::new(ReleaseList::new()),
            relays: Arc::new(RelaySet::new()),
            child_stdio: None,
            console_task: None,
        }
    }

    pub fn with_options(mut self, options: IoOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn state(&self) -> IoState {
        self.state
    }

    pub fn console_socket_path(&self) -> PathBuf {
        self.work_dir.join(&self.options.console_socket_name)
    }

    /// Tracked relays still running.
    pub fn outstanding_relays(&self) -> usize {
        self.tracker.outstanding()
    }

    /// Roles of every relay launched so far.
    pub fn launched_relays(&self) -> Vec<StreamRole> {
        self.relays.launched()
    }

    /// Hand the container-side pipe ends to the process-creation step.
    ///
    /// Only pipe mode has them, and only once.
    pub fn take_child_stdio(&mut self) -> Option<ChildStdio> {
        self.child_stdio.take()
    }

    /// Open every endpoint and launch the relays.
    ///
    /// # Errors
    ///
    /// The first [`ShimError::OpenTimeout`] / [`ShimError::OpenFailed`] hit
    /// while opening; everything opened before it has been closed and no
    /// relay was started.
    pub async fn open_io(&mut self) -> ShimResult<()> {
        if self.state != IoState::Uninitialized {
            return Err(ShimError::InvalidState(format!(
                "open_io called twice for {} (state {:?})",
                self.config.id, self.state
            )));
        }
        self.options.validate()?;

        let deadline = Deadline::after(self.options.open_timeout());
        let staged = ReleaseList::new();

        let result = self.open_endpoints(&staged, deadline).await;
        let launch = match result {
            Ok(launch) => launch,
            Err(e) => {
                let released = staged.release_all();
                tracing::warn!(
                    id = %self.config.id,
                    error = %e,
                    released = released.len(),
                    "stdio setup failed, rolled back"
                );
                return Err(e);
            }
        };

        self.resources.absorb(staged);
        self.launch(launch);
        self.state = IoState::Ready;

        tracing::debug!(
            id = %self.config.id,
            terminal = self.config.terminal,
            "stdio ready"
        );
        Ok(())
    }

    async fn open_endpoints(&self, staged: &ReleaseList, deadline: Deadline) -> ShimResult<Launch> {
        // Non-blocking so setup never waits on a client that has not attached yet.
        let keep_alive = Fifo::open(&self.config.stdin, Direction::Write, true, deadline).await?;
        staged.push(ResourceKind::StdinKeepAlive, keep_alive);

        if self.config.terminal {
            let socket = ConsoleSocket::bind(self.console_socket_path())?;
            return Ok(Launch::Console { socket, deadline });
        }

        let (ends, child) =
            ContainerPipes::new(self.config.root_uid, self.config.root_gid)?.into_parts();
        let mut relays = Vec::with_capacity(3);

        for role in StreamRole::OUTPUTS {
            let path = self.config.stream_path(role);
            let writer = Fifo::open(path, Direction::Write, false, deadline).await?;
            let destination = writer.try_clone_file()?;
            staged.push(ResourceKind::FifoWriter(role), writer);

            let reader = Fifo::open(path, Direction::Read, false, deadline).await?;
            staged.push(ResourceKind::FifoReader(role), reader);

            relays.push(self.relay(role, ends.end(role).try_clone()?, destination));
        }

        let stdin = Fifo::open(&self.config.stdin, Direction::Read, false, deadline).await?;
        let source = stdin.try_clone_file()?;
        staged.push(ResourceKind::FifoReader(StreamRole::Stdin), stdin);
        relays.push(self.relay(
            StreamRole::Stdin,
            source,
            ends.end(StreamRole::Stdin).try_clone()?,
        ));

        for (role, end) in ends.into_entries() {
            staged.push(ResourceKind::ContainerPipe(role), end);
        }

        Ok(Launch::Relays { relays, child })
    }

    fn relay(&self, role: StreamRole, source: File, destination: File) -> Relay {
        Relay::new(role, source, destination).with_buffer_size(self.options.relay_buffer_size)
    }

    fn launch(&mut self, launch: Launch) {
        match launch {
            Launch::Relays { relays, child } => {
                self.child_stdio = Some(child);
                for relay in relays {
                    let role = relay.role();
                    let guard = self.tracker.register();
                    self.relays.push(role, relay.spawn(Some(guard)));
                }
            }
            Launch::Console { socket, deadline } => {
                // Registered here, not in the task, so wait() covers the handshake too.
                let output_guard = self.tracker.register();
                let bridge = ConsoleBridge {
                    socket,
                    stdin: self.config.stdin.clone(),
                    stdout: self.config.stdout.clone(),
                    deadline,
                    buffer_size: self.options.relay_buffer_size,
                    resources: Arc::clone(&self.resources),
                    relays: Arc::clone(&self.relays),
                    output_guard,
                };
                self.console_task = Some(bridge.spawn());
            }
        }
    }

    /// Release the stdin keep-alive so the stdin relay sees end-of-stream
    /// once external writers close.
    pub fn close_stdin(&mut self) -> bool {
        self.resources.release_one(ResourceKind::StdinKeepAlive)
    }

    /// Wait for every tracked relay, then release all handles.
    ///
    /// Relays nobody waits on (terminal-mode stdin) are aborted after the
    /// release, which drops their handles too. Cleanup runs once; later
    /// calls return an empty report.
    pub async fn wait(&mut self) -> WaitReport {
        self.tracker.wait().await;

        if self.state != IoState::Ready {
            return WaitReport::default();
        }

        let console_error = match self.console_task.take() {
            Some(task) => match task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(ShimError::Console(format!("console task failed: {}", e))),
            },
            None => None,
        };

        let relays = self.relays.collect_finished().await;
        let released = self.resources.release_all();
        // Untracked relays hold duplicates of the master and the stdin reader.
        let aborted = self.relays.abort_running().await;
        self.state = IoState::CleanedUp;

        tracing::debug!(
            id = %self.config.id,
            released = released.len(),
            relays = relays.len(),
            aborted = aborted.len(),
            "stdio cleaned up"
        );

        WaitReport {
            released,
            relays,
            aborted,
            console_error,
        }
    }

    /// Kill every process of the container.
    ///
    /// A no-op for exec'd processes: only the init process owns the
    /// container.
    pub async fn kill_all(&self) -> ShimResult<()> {
        if self.config.exec {
            tracing::debug!(id = %self.config.id, "exec process, skipping kill-all");
            return Ok(());
        }
        self.config.runtime_command().kill_all(&self.config.id).await
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.config.id)
            .field("state", &self.state)
            .field("outstanding_relays", &self.tracker.outstanding())
            .field("resources", &self.resources)
            .finish()
    }
}
