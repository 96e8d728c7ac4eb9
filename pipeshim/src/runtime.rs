//! Invocation of the underlying low-level runtime.
//!
//! Only termination is driven from here:
//! `<runtime> <runtime args...> kill --all <id> SIGKILL`.

use pipeshim_shared::constants::runtime as const_runtime;
use pipeshim_shared::errors::{ShimError, ShimResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Runtime binary plus the global arguments passed before every subcommand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeCommand {
    binary: PathBuf,
    args: Vec<String>,
}

impl RuntimeCommand {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Full argument list of the kill-all invocation for container `id`.
    pub fn kill_all_args(&self, id: &str) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            const_runtime::KILL_SUBCOMMAND.to_string(),
            const_runtime::ALL_FLAG.to_string(),
            id.to_string(),
            const_runtime::KILL_SIGNAL.to_string(),
        ]);
        args
    }

    /// Ask the runtime to SIGKILL every process of container `id`.
    ///
    /// # Errors
    ///
    /// [`ShimError::TerminationFailed`] with the combined stdout/stderr of
    /// the invocation when it cannot be started or exits non-zero.
    pub async fn kill_all(&self, id: &str) -> ShimResult<()> {
        let args = self.kill_all_args(id);
        tracing::debug!(runtime = %self.binary.display(), ?args, "invoking runtime kill");

        let (output, status) = self
            .run_combined(&args)
            .await
            .map_err(|e| ShimError::TerminationFailed {
                output: String::new(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            let output = String::from_utf8_lossy(&output).trim_end().to_string();
            tracing::warn!(container = %id, %status, %output, "runtime kill failed");
            return Err(ShimError::TerminationFailed {
                output,
                reason: status.to_string(),
            });
        }

        tracing::info!(container = %id, "killed all container processes");
        Ok(())
    }

    /// Run the runtime with stdout and stderr sharing one pipe.
    async fn run_combined(
        &self,
        args: &[String],
    ) -> std::io::Result<(Vec<u8>, std::process::ExitStatus)> {
        let (read_end, write_end) = nix::unistd::pipe()?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end.try_clone()?))
            .stderr(Stdio::from(write_end));

        // SAFETY: the hook only calls prctl, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(clear_parent_death_signal);
        }

        let mut child = cmd.spawn()?;
        // The command still holds the write ends; drop it so the read sees EOF.
        drop(cmd);

        let mut output = Vec::new();
        tokio::fs::File::from_std(File::from(read_end))
            .read_to_end(&mut output)
            .await?;
        let status = child.wait().await?;
        Ok((output, status))
    }
}

/// Keep the kill request alive if the shim dies while it runs.
fn clear_parent_death_signal() -> std::io::Result<()> {
    // SAFETY: plain prctl with integer arguments.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
