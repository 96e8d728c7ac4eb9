//! Named-pipe endpoints.
//!
//! Opening a fifo blocks until the opposite end is opened too. Blocking
//! opens therefore run on tokio's blocking pool, bounded by a [`Deadline`]
//! shared by every open of one setup call. An open that can no longer be
//! awaited (deadline expired, pending endpoint dropped) is released by
//! briefly opening the opposite end non-blockingly, which lets the parked
//! thread return.

use pipeshim_shared::errors::{ShimError, ShimResult};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How many times a parked open is poked before giving up.
const RELEASE_ATTEMPTS: usize = 50;

/// Interval between release attempts.
const RELEASE_INTERVAL: Duration = Duration::from_millis(20);

/// Direction a fifo endpoint is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read-only end.
    Read,
    /// Write-only end.
    Write,
}

impl Direction {
    fn opposite(self) -> Self {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }

    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            Direction::Read => options.read(true),
            Direction::Write => options.write(true),
        };
        options
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Cancellation deadline shared by the opens of one setup call.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Deadline expiring `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    /// Point in time the deadline expires.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Total budget the deadline was created with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

enum FifoState {
    Open(File),
    Pending(Option<JoinHandle<io::Result<File>>>),
}

/// One opened (or, for non-blocking opens, opening) fifo endpoint.
pub struct Fifo {
    path: PathBuf,
    direction: Direction,
    state: FifoState,
}

impl Fifo {
    /// Open an existing fifo.
    ///
    /// With `nonblocking` set the call returns at once; the endpoint goes
    /// live in the background when the opposite end attaches. Otherwise the
    /// call waits for the opposite end until `deadline`.
    ///
    /// # Errors
    ///
    /// - [`ShimError::OpenFailed`] if the path is missing, not a fifo, or the
    ///   open itself fails
    /// - [`ShimError::OpenTimeout`] if the deadline expires first
    pub async fn open(
        path: &Path,
        direction: Direction,
        nonblocking: bool,
        deadline: Deadline,
    ) -> ShimResult<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| ShimError::open_failed(path, e))?;
        if !metadata.file_type().is_fifo() {
            return Err(ShimError::open_failed(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "not a named pipe"),
            ));
        }

        let owned = path.to_path_buf();
        let mut task = tokio::task::spawn_blocking(move || direction.options().open(&owned));

        if nonblocking {
            tracing::debug!(path = %path.display(), %direction, "fifo open pending");
            return Ok(Self {
                path: path.to_path_buf(),
                direction,
                state: FifoState::Pending(Some(task)),
            });
        }

        match tokio::time::timeout_at(deadline.instant(), &mut task).await {
            Ok(Ok(Ok(file))) => {
                tracing::debug!(path = %path.display(), %direction, "fifo opened");
                Ok(Self {
                    path: path.to_path_buf(),
                    direction,
                    state: FifoState::Open(file),
                })
            }
            Ok(Ok(Err(e))) => Err(ShimError::open_failed(path, e)),
            Ok(Err(e)) => Err(ShimError::open_failed(path, io::Error::other(e))),
            Err(_) => {
                tracing::debug!(path = %path.display(), %direction, "fifo open timed out");
                release_parked_open(path.to_path_buf(), direction, task);
                Err(ShimError::open_timeout(path, deadline.timeout()))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True when a blocking open returned the handle.
    ///
    /// Non-blocking endpoints always report false: their handle stays with
    /// the background open, even after the peer attached, and is closed when
    /// the endpoint is dropped.
    pub fn is_open(&self) -> bool {
        matches!(self.state, FifoState::Open(_))
    }

    /// Duplicate the live handle so a relay can own it.
    pub fn try_clone_file(&self) -> io::Result<File> {
        match &self.state {
            FifoState::Open(file) => file.try_clone(),
            FifoState::Pending(_) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is not open yet", self.path.display()),
            )),
        }
    }
}

impl fmt::Debug for Fifo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fifo")
            .field("path", &self.path)
            .field("direction", &self.direction)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        if let FifoState::Pending(task) = &mut self.state {
            if let Some(task) = task.take() {
                release_parked_open(self.path.clone(), self.direction, task);
            }
        }
    }
}

/// Let a thread parked in a fifo open return, then close what it opened.
///
/// The first poke happens inline. If the thread had not reached its open
/// yet, a background task keeps poking until it finishes.
fn release_parked_open(path: PathBuf, direction: Direction, task: JoinHandle<io::Result<File>>) {
    if task.is_finished() {
        return;
    }
    poke_opposite_end(&path, direction);

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        for _ in 0..RELEASE_ATTEMPTS {
            tokio::time::sleep(RELEASE_INTERVAL).await;
            if task.is_finished() {
                return;
            }
            poke_opposite_end(&path, direction);
        }
        tracing::warn!(path = %path.display(), %direction, "parked fifo open did not return");
    });
}

fn poke_opposite_end(path: &Path, direction: Direction) {
    let mut options = direction.opposite().options();
    options.custom_flags(libc::O_NONBLOCK);
    if let Err(e) = options.open(path) {
        tracing::trace!(path = %path.display(), error = %e, "poke of opposite fifo end failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeshim_test_utils::FifoDir;
    use std::io::{Read, Write};

    fn deadline(ms: u64) -> Deadline {
        Deadline::after(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_missing_path_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = Fifo::open(&missing, Direction::Read, false, deadline(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::OpenFailed { .. }));
    }

    #[tokio::test]
    async fn test_regular_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"x").unwrap();

        let err = Fifo::open(&plain, Direction::Write, false, deadline(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::OpenFailed { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_writer_meets_blocking_reader() {
        let fifos = FifoDir::new();
        let shared = deadline(5_000);

        let writer = Fifo::open(fifos.stdin(), Direction::Write, true, shared)
            .await
            .unwrap();
        let reader = Fifo::open(fifos.stdin(), Direction::Read, false, shared)
            .await
            .unwrap();
        assert!(reader.is_open());
        assert!(!writer.is_open());

        let mut r = reader.try_clone_file().unwrap();
        let mut w = {
            let mut options = OpenOptions::new();
            options.write(true);
            options.open(fifos.stdin()).unwrap()
        };
        w.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        drop(w);
        drop(writer);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_writer_without_reader_times_out() {
        let fifos = FifoDir::new();

        let started = std::time::Instant::now();
        let err = Fifo::open(fifos.stdout(), Direction::Write, false, deadline(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ShimError::OpenTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reader_without_writer_times_out() {
        let fifos = FifoDir::new();

        let err = Fifo::open(fifos.stderr(), Direction::Read, false, deadline(100))
            .await
            .unwrap_err();
        match err {
            ShimError::OpenTimeout { path, timeout } => {
                assert_eq!(path, fifos.stderr());
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_pending_writer_releases_thread() {
        let fifos = FifoDir::new();
        let pending = Fifo::open(fifos.stdin(), Direction::Write, true, deadline(5_000))
            .await
            .unwrap();
        assert!(!pending.is_open());
        assert!(pending.try_clone_file().is_err());
        drop(pending);
        // Runtime shutdown would hang here if the parked open were still blocked.
    }

    #[test]
    fn test_deadline_budget() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let d = Deadline::after(Duration::from_millis(10));
            assert_eq!(d.timeout(), Duration::from_millis(10));
            assert!(!d.is_expired());
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(d.is_expired());
        });
    }
}
