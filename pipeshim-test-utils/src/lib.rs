//! Shared fixtures for pipeshim tests.
//!
//! - [`FifoDir`]: a temp directory holding mkfifo'd stdin/stdout/stderr
//! - [`FakeRuntime`]: a shell script standing in for the low-level runtime
//! - [`send_fd`]: plays the runtime's side of the console socket handshake

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixAddr};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Install a fmt subscriber honouring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Temp directory with three named pipes, removed on drop.
pub struct FifoDir {
    dir: TempDir,
    stdin: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
}

impl FifoDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create fifo dir");
        let make = |name: &str| {
            let path = dir.path().join(name);
            mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).expect("mkfifo");
            path
        };
        let stdin = make("stdin");
        let stdout = make("stdout");
        let stderr = make("stderr");
        Self {
            dir,
            stdin,
            stdout,
            stderr,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stdin(&self) -> &Path {
        &self.stdin
    }

    pub fn stdout(&self) -> &Path {
        &self.stdout
    }

    pub fn stderr(&self) -> &Path {
        &self.stderr
    }
}

impl Default for FifoDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Attach a reader to a fifo without waiting for a writer.
pub fn open_nonblocking_reader(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .expect("open fifo reader")
}

/// Read a non-blocking handle until end-of-stream.
///
/// Panics if end-of-stream does not arrive within `timeout`.
pub fn read_to_eof(file: &mut File, timeout: Duration) -> Vec<u8> {
    let started = Instant::now();
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                assert!(
                    started.elapsed() < timeout,
                    "no end-of-stream after {:?}, read so far: {:?}",
                    timeout,
                    String::from_utf8_lossy(&out)
                );
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if check() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connect to a console socket and pass `fd` the way a runtime passes the
/// pty master.
pub fn send_fd(socket_path: &Path, fd: &OwnedFd) -> io::Result<()> {
    let stream = UnixStream::connect(socket_path)?;
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(b"pty")];
    sendmsg::<UnixAddr>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    Ok(())
}

/// Shell script impersonating the runtime binary.
///
/// It records its arguments, echoes them to stdout, prints `message` to
/// stderr and exits with `exit_code`. Run it as `/bin/sh <script> ...` so
/// no freshly written file is ever exec'd directly.
pub struct FakeRuntime {
    _dir: TempDir,
    script: PathBuf,
    log: PathBuf,
}

impl FakeRuntime {
    pub fn new(exit_code: i32, message: &str) -> Self {
        let dir = tempfile::tempdir().expect("create runtime dir");
        let script = dir.path().join("runtime.sh");
        let log = dir.path().join("args.log");
        let body = format!(
            "printf '%s' \"$*\" > '{log}'\necho \"$*\"\necho '{message}' >&2\nexit {exit_code}\n",
            log = log.display(),
        );
        std::fs::write(&script, body).expect("write runtime script");
        Self {
            _dir: dir,
            script,
            log,
        }
    }

    pub fn binary(&self) -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    /// Global runtime arguments: the script itself.
    pub fn args(&self) -> Vec<String> {
        vec![self.script.display().to_string()]
    }

    pub fn was_invoked(&self) -> bool {
        self.log.exists()
    }

    /// Arguments of the last invocation, space separated.
    pub fn recorded_args(&self) -> String {
        std::fs::read_to_string(&self.log).unwrap_or_default()
    }
}
