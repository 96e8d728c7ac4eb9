//! Byte relays between process streams and their external endpoints.
//!
//! A relay owns both of its handles and copies until the source reports
//! end-of-stream or either side fails. Failures end only that relay; they
//! are logged and returned as a [`RelayOutcome`], never propagated.
//!
//! Pipe and fifo handles are driven through the reactor, so aborting a relay
//! closes them at once. Other handles (a pty master) go through
//! `tokio::fs::File`.

use crate::io::tracker::CompletionGuard;
use parking_lot::Mutex;
use pipeshim_shared::constants::io as const_io;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileTypeExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

/// Which standard stream a relay serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    Stdin,
    Stdout,
    Stderr,
}

/// Which way bytes flow relative to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// External endpoint → process.
    Inbound,
    /// Process → external endpoint.
    Outbound,
}

impl StreamRole {
    /// Output streams, in the order their endpoints are opened.
    pub const OUTPUTS: [StreamRole; 2] = [StreamRole::Stdout, StreamRole::Stderr];

    pub fn direction(self) -> CopyDirection {
        match self {
            StreamRole::Stdin => CopyDirection::Inbound,
            StreamRole::Stdout | StreamRole::Stderr => CopyDirection::Outbound,
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRole::Stdin => f.write_str("stdin"),
            StreamRole::Stdout => f.write_str("stdout"),
            StreamRole::Stderr => f.write_str("stderr"),
        }
    }
}

/// How a relay ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Source reached end-of-stream and everything was written.
    Completed { bytes: u64 },
    /// Copy stopped on an I/O error after `bytes` were written.
    Failed { bytes: u64, error: io::Error },
}

impl RelayOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RelayOutcome::Completed { .. })
    }

    pub fn bytes(&self) -> u64 {
        match self {
            RelayOutcome::Completed { bytes } | RelayOutcome::Failed { bytes, .. } => *bytes,
        }
    }
}

/// One directional copy between two owned handles.
pub struct Relay {
    role: StreamRole,
    source: File,
    destination: File,
    buffer_size: usize,
}

impl Relay {
    pub fn new(role: StreamRole, source: File, destination: File) -> Self {
        Self {
            role,
            source,
            destination,
            buffer_size: const_io::RELAY_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn role(&self) -> StreamRole {
        self.role
    }

    /// Launch the relay as a task.
    ///
    /// `guard`, when given, is held until the copy ends and then dropped,
    /// which marks the relay done in its tracker.
    pub fn spawn(self, guard: Option<CompletionGuard>) -> JoinHandle<RelayOutcome> {
        tokio::spawn(async move {
            let outcome = self.run().await;
            drop(guard);
            outcome
        })
    }

    /// Copy until end-of-stream or error.
    pub async fn run(self) -> RelayOutcome {
        let role = self.role;
        let mut buf = vec![0u8; self.buffer_size];
        let mut bytes = 0u64;

        let result = match (async_source(self.source), async_destination(self.destination)) {
            (Ok(mut source), Ok(mut destination)) => {
                pump(&mut source, &mut destination, &mut buf, &mut bytes).await
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
        };
        let outcome = match result {
            Ok(()) => RelayOutcome::Completed { bytes },
            Err(error) => RelayOutcome::Failed { bytes, error },
        };

        match &outcome {
            RelayOutcome::Completed { bytes } => {
                tracing::debug!(%role, bytes, "relay finished");
            }
            RelayOutcome::Failed { bytes, error } => {
                tracing::warn!(%role, bytes, error = %error, "relay stopped on error");
            }
        }
        outcome
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("role", &self.role)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

type Source = Box<dyn AsyncRead + Send + Unpin>;
type Destination = Box<dyn AsyncWrite + Send + Unpin>;

fn is_pipe(file: &File) -> io::Result<bool> {
    Ok(file.metadata()?.file_type().is_fifo())
}

fn async_source(file: File) -> io::Result<Source> {
    if is_pipe(&file)? {
        Ok(Box::new(pipe::Receiver::from_file(file)?))
    } else {
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

fn async_destination(file: File) -> io::Result<Destination> {
    if is_pipe(&file)? {
        Ok(Box::new(pipe::Sender::from_file(file)?))
    } else {
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

async fn pump(
    source: &mut Source,
    destination: &mut Destination,
    buf: &mut [u8],
    bytes: &mut u64,
) -> io::Result<()> {
    loop {
        let n = match source.read(buf).await {
            Ok(n) => n,
            // pty master: every slave fd closed
            Err(e) if e.raw_os_error() == Some(libc::EIO) => 0,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(());
        }
        destination.write_all(&buf[..n]).await?;
        // tokio files write in the background; flush surfaces the real result.
        destination.flush().await?;
        *bytes += n as u64;
    }
}

/// Finished relay and how it ended.
#[derive(Debug)]
pub struct RelayReport {
    pub role: StreamRole,
    pub outcome: RelayOutcome,
}

/// Relays launched for one process.
#[derive(Default)]
pub struct RelaySet {
    inner: Mutex<RelaySetInner>,
}

#[derive(Default)]
struct RelaySetInner {
    launched: Vec<StreamRole>,
    running: Vec<(StreamRole, JoinHandle<RelayOutcome>)>,
}

impl RelaySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: StreamRole, handle: JoinHandle<RelayOutcome>) {
        let mut inner = self.inner.lock();
        inner.launched.push(role);
        inner.running.push((role, handle));
    }

    /// Roles of every relay launched so far, in launch order.
    pub fn launched(&self) -> Vec<StreamRole> {
        self.inner.lock().launched.clone()
    }

    /// Abort every relay still running and wait until its handles are dropped.
    ///
    /// Returns the roles of the aborted relays.
    pub async fn abort_running(&self) -> Vec<StreamRole> {
        let running = std::mem::take(&mut self.inner.lock().running);
        let mut aborted = Vec::with_capacity(running.len());
        for (role, handle) in running {
            handle.abort();
            match handle.await {
                Err(e) if e.is_cancelled() => {
                    tracing::debug!(%role, "relay aborted");
                    aborted.push(role);
                }
                // Ended on its own before the abort landed.
                _ => tracing::debug!(%role, "relay finished before abort"),
            }
        }
        aborted
    }

    /// Collect outcomes of relays that have already ended.
    ///
    /// Relays still running stay in the set and keep running.
    pub async fn collect_finished(&self) -> Vec<RelayReport> {
        let finished = {
            let mut inner = self.inner.lock();
            let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.running)
                .into_iter()
                .partition(|(_, handle)| handle.is_finished());
            inner.running = running;
            done
        };

        let mut reports = Vec::with_capacity(finished.len());
        for (role, handle) in finished {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => RelayOutcome::Failed {
                    bytes: 0,
                    error: io::Error::other(format!("relay task failed: {}", e)),
                },
            };
            reports.push(RelayReport { role, outcome });
        }
        reports
    }
}

impl fmt::Debug for RelaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySet")
            .field("launched", &self.launched())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::tracker::CompletionTracker;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn pipe_pair() -> (File, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (File::from(r), File::from(w))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_copies_until_eof() {
        let (source, mut feed) = pipe_pair();
        let (mut sink, destination) = pipe_pair();

        feed.write_all(b"hello relay").unwrap();
        drop(feed);

        let outcome = Relay::new(StreamRole::Stdout, source, destination)
            .with_buffer_size(4)
            .run()
            .await;
        assert!(outcome.is_completed());
        assert_eq!(outcome.bytes(), 11);

        let mut out = String::new();
        sink.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello relay");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broken_destination_ends_only_that_relay() {
        let tracker = CompletionTracker::new();

        // Broken: nobody reads the destination.
        let (broken_source, mut broken_feed) = pipe_pair();
        let (broken_sink, broken_destination) = pipe_pair();
        drop(broken_sink);

        // Healthy sibling.
        let (source, mut feed) = pipe_pair();
        let (mut sink, destination) = pipe_pair();

        let broken = Relay::new(StreamRole::Stderr, broken_source, broken_destination)
            .spawn(Some(tracker.register()));
        let healthy =
            Relay::new(StreamRole::Stdout, source, destination).spawn(Some(tracker.register()));
        assert_eq!(tracker.outstanding(), 2);

        broken_feed.write_all(b"lost").unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), broken)
            .await
            .expect("broken relay should stop")
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::Failed { .. }));
        assert_eq!(tracker.outstanding(), 1);

        feed.write_all(b"still flowing").unwrap();
        drop(feed);
        drop(broken_feed);
        let outcome = tokio::time::timeout(Duration::from_secs(5), healthy)
            .await
            .expect("healthy relay should finish")
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(tracker.outstanding(), 0);

        let mut out = String::new();
        sink.read_to_string(&mut out).unwrap();
        assert_eq!(out, "still flowing");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_relay_set_collects_only_finished() {
        let set = RelaySet::new();

        let (done_source, done_feed) = pipe_pair();
        let (_done_sink, done_destination) = pipe_pair();
        drop(done_feed);
        set.push(
            StreamRole::Stdout,
            Relay::new(StreamRole::Stdout, done_source, done_destination).spawn(None),
        );

        let (open_source, open_feed) = pipe_pair();
        let (_open_sink, open_destination) = pipe_pair();
        set.push(
            StreamRole::Stdin,
            Relay::new(StreamRole::Stdin, open_source, open_destination).spawn(None),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reports = set.collect_finished().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].role, StreamRole::Stdout);
        assert_eq!(set.launched(), vec![StreamRole::Stdout, StreamRole::Stdin]);

        drop(open_feed);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reports = set.collect_finished().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].role, StreamRole::Stdin);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_abort_running_closes_idle_relay_handles() {
        let set = RelaySet::new();

        // The feed stays open, so the relay would otherwise wait forever.
        let (source, _feed) = pipe_pair();
        let (mut sink, destination) = pipe_pair();
        set.push(
            StreamRole::Stdin,
            Relay::new(StreamRole::Stdin, source, destination).spawn(None),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(set.collect_finished().await.is_empty());

        assert_eq!(set.abort_running().await, vec![StreamRole::Stdin]);
        assert!(set.abort_running().await.is_empty());

        // The relay held the only write end; it is gone now.
        let mut rest = Vec::new();
        assert_eq!(sink.read_to_end(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_role_directions() {
        assert_eq!(StreamRole::Stdin.direction(), CopyDirection::Inbound);
        assert!(StreamRole::OUTPUTS
            .iter()
            .all(|r| r.direction() == CopyDirection::Outbound));
    }
}
