//! Console socket and pty bridging for terminal-mode processes.
//!
//! The runtime connects to the console socket and passes the pty master as
//! an SCM_RIGHTS ancillary message. The socket is single-use: it is removed
//! from disk as soon as the master has been received (or the handshake has
//! failed).

use crate::io::cleanup::{ReleaseList, ResourceKind};
use crate::io::fifo::{Deadline, Direction, Fifo};
use crate::io::relay::{Relay, RelaySet, StreamRole};
use crate::io::tracker::CompletionGuard;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use pipeshim_shared::errors::{ShimError, ShimResult};
use std::fs::File;
use std::io::{self, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

/// Console socket for receiving the pty master from the runtime.
#[derive(Debug)]
pub struct ConsoleSocket {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl ConsoleSocket {
    /// Create the console socket at `socket_path`.
    ///
    /// A stale socket file left by an earlier shim is removed first.
    pub fn bind(socket_path: impl Into<PathBuf>) -> ShimResult<Self> {
        let socket_path = socket_path.into();

        let _ = std::fs::remove_file(&socket_path);

        let listener =
            UnixListener::bind(&socket_path).map_err(|e| ShimError::open_failed(&socket_path, e))?;

        tracing::debug!(socket_path = %socket_path.display(), "created console socket");

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Socket path handed to the runtime.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Receive the pty master, consuming the socket.
    ///
    /// # Errors
    ///
    /// - [`ShimError::OpenTimeout`] if no master arrives before `deadline`
    /// - [`ShimError::Console`] if the connection fails or carries no fd
    pub async fn receive_master(self, deadline: Deadline) -> ShimResult<OwnedFd> {
        match tokio::time::timeout_at(deadline.instant(), self.accept_master()).await {
            Ok(result) => result,
            Err(_) => Err(ShimError::open_timeout(&self.socket_path, deadline.timeout())),
        }
    }

    async fn accept_master(&self) -> ShimResult<OwnedFd> {
        tracing::debug!("waiting for console socket connection");

        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| ShimError::Console(format!("console socket accept failed: {}", e)))?;

        tracing::debug!("connection accepted, receiving pty master");

        loop {
            stream
                .readable()
                .await
                .map_err(|e| ShimError::Console(format!("console socket poll failed: {}", e)))?;

            match stream.try_io(Interest::READABLE, || recv_master_fd(stream.as_raw_fd())) {
                Ok(fd) => return Ok(fd),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    return Err(ShimError::Console(format!(
                        "failed to receive pty master: {}",
                        e
                    )))
                }
            }
        }
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(
                socket_path = %self.socket_path.display(),
                error = %e,
                "failed to remove console socket"
            );
        } else {
            tracing::debug!(socket_path = %self.socket_path.display(), "removed console socket");
        }
    }
}

fn recv_master_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let mut buf = [0u8; 4096];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<UnixAddr>(
        fd,
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    for cmsg in msg.cmsgs().into_iter().flatten() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                tracing::debug!(fd = fd, "received pty master");
                // SAFETY: the kernel just installed this fd for us; nothing else owns it.
                return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "no pty master fd received",
    ))
}

/// Terminal-mode wiring, run as its own task once the console socket exists.
///
/// Receives the master, relays stdin into it (untracked) and its output into
/// the stdout fifo (tracked by `output_guard`). Every handle it opens goes
/// into `resources` as soon as it is open.
pub(crate) struct ConsoleBridge {
    pub socket: ConsoleSocket,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub deadline: Deadline,
    pub buffer_size: usize,
    pub resources: Arc<ReleaseList>,
    pub relays: Arc<RelaySet>,
    pub output_guard: CompletionGuard,
}

impl ConsoleBridge {
    pub fn spawn(self) -> JoinHandle<ShimResult<()>> {
        tokio::spawn(async move {
            let socket_path = self.socket.path().to_path_buf();
            let result = self.run().await;
            if let Err(e) = &result {
                tracing::error!(
                    socket_path = %socket_path.display(),
                    error = %e,
                    "console wiring failed"
                );
            }
            result
        })
    }

    async fn run(self) -> ShimResult<()> {
        let Self {
            socket,
            stdin,
            stdout,
            deadline,
            buffer_size,
            resources,
            relays,
            output_guard,
        } = self;

        let master = File::from(socket.receive_master(deadline).await?);
        let input_master = master.try_clone()?;
        let output_master = master.try_clone()?;
        resources.push(ResourceKind::ConsoleMaster, master);

        let stdin_fifo = Fifo::open(&stdin, Direction::Read, false, deadline).await?;
        let stdin_source = stdin_fifo.try_clone_file()?;
        resources.push(ResourceKind::FifoReader(StreamRole::Stdin), stdin_fifo);
        relays.push(
            StreamRole::Stdin,
            Relay::new(StreamRole::Stdin, stdin_source, input_master)
                .with_buffer_size(buffer_size)
                .spawn(None),
        );

        // Writer first: the fifo must be live before anything reads it.
        let stdout_writer = Fifo::open(&stdout, Direction::Write, false, deadline).await?;
        let output_destination = stdout_writer.try_clone_file()?;
        resources.push(ResourceKind::FifoWriter(StreamRole::Stdout), stdout_writer);
        let stdout_reader = Fifo::open(&stdout, Direction::Read, false, deadline).await?;
        resources.push(ResourceKind::FifoReader(StreamRole::Stdout), stdout_reader);

        relays.push(
            StreamRole::Stdout,
            Relay::new(StreamRole::Stdout, output_master, output_destination)
                .with_buffer_size(buffer_size)
                .spawn(Some(output_guard)),
        );

        tracing::debug!(stdout = %stdout.display(), "console wired");
        Ok(())
    }
}
