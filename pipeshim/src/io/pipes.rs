//! Anonymous pipes bridging the shim to a non-terminal container's stdio.

use crate::io::relay::StreamRole;
use nix::unistd::{fchown, pipe, Gid, Uid};
use pipeshim_shared::errors::{ShimError, ShimResult};
use std::fs::File;
use std::os::unix::io::{AsRawFd, OwnedFd};

/// Container-side pipe ends, handed to the process-creation step.
///
/// The shim must not keep these open once the process is created: the
/// output relays only see end-of-stream after every write end is closed.
#[derive(Debug)]
pub struct ChildStdio {
    pub stdin: OwnedFd,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Shim-side pipe ends.
#[derive(Debug)]
pub(crate) struct ShimEnds {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

impl ShimEnds {
    pub fn end(&self, role: StreamRole) -> &File {
        match role {
            StreamRole::Stdin => &self.stdin,
            StreamRole::Stdout => &self.stdout,
            StreamRole::Stderr => &self.stderr,
        }
    }

    pub fn into_entries(self) -> [(StreamRole, File); 3] {
        [
            (StreamRole::Stdin, self.stdin),
            (StreamRole::Stdout, self.stdout),
            (StreamRole::Stderr, self.stderr),
        ]
    }
}

/// The IOSet of a pipe-mode process.
#[derive(Debug)]
pub struct ContainerPipes {
    shim: ShimEnds,
    child: ChildStdio,
}

impl ContainerPipes {
    /// Create stdin/stdout/stderr pipes.
    ///
    /// The container-side ends are chowned to `uid:gid` so a process running
    /// as the container's root user can use them.
    pub fn new(uid: u32, gid: u32) -> ShimResult<Self> {
        let (stdin_read, stdin_write) = pipe().map_err(|e| pipe_error("stdin", e))?;
        let (stdout_read, stdout_write) = pipe().map_err(|e| pipe_error("stdout", e))?;
        let (stderr_read, stderr_write) = pipe().map_err(|e| pipe_error("stderr", e))?;

        let child = ChildStdio {
            stdin: stdin_read,
            stdout: stdout_write,
            stderr: stderr_write,
        };
        for fd in [&child.stdin, &child.stdout, &child.stderr] {
            chown_fd(fd, uid, gid)?;
        }

        tracing::debug!(uid, gid, "created container pipes");

        Ok(Self {
            shim: ShimEnds {
                stdin: File::from(stdin_write),
                stdout: File::from(stdout_read),
                stderr: File::from(stderr_read),
            },
            child,
        })
    }

    pub(crate) fn into_parts(self) -> (ShimEnds, ChildStdio) {
        (self.shim, self.child)
    }
}

fn chown_fd(fd: &OwnedFd, uid: u32, gid: u32) -> ShimResult<()> {
    // Skip the syscall when nothing would change, so unprivileged shims work.
    let current = (Uid::effective().as_raw(), Gid::effective().as_raw());
    if current == (uid, gid) {
        return Ok(());
    }
    fchown(
        fd.as_raw_fd(),
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
    )
    .map_err(|e| ShimError::Io(std::io::Error::from(e)))
}

fn pipe_error(name: &str, errno: nix::errno::Errno) -> ShimError {
    ShimError::Io(std::io::Error::new(
        std::io::Error::from(errno).kind(),
        format!("failed to create {} pipe: {}", name, errno),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn own_ids() -> (u32, u32) {
        (Uid::effective().as_raw(), Gid::effective().as_raw())
    }

    #[test]
    fn test_pipes_connect_shim_and_child() {
        let (uid, gid) = own_ids();
        let (mut shim, child) = ContainerPipes::new(uid, gid).unwrap().into_parts();

        let mut child_stdout = File::from(child.stdout);
        child_stdout.write_all(b"out").unwrap();
        drop(child_stdout);
        let mut out = String::new();
        shim.stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "out");

        shim.stdin.write_all(b"in").unwrap();
        drop(shim.stdin);
        let mut input = String::new();
        File::from(child.stdin).read_to_string(&mut input).unwrap();
        assert_eq!(input, "in");
    }

    #[test]
    fn test_child_ends_owned_by_requested_ids() {
        use std::os::unix::fs::MetadataExt;

        let (uid, gid) = own_ids();
        let (_shim, child) = ContainerPipes::new(uid, gid).unwrap().into_parts();
        let meta = File::from(child.stderr).metadata().unwrap();
        assert_eq!(meta.uid(), uid);
        assert_eq!(meta.gid(), gid);
    }
}
