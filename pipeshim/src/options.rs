//! Configuration for process I/O setup.

use pipeshim_shared::constants::io as const_io;
use pipeshim_shared::errors::{ShimError, ShimResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for `Process::open_io` and the relays it launches.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoOptions {
    /// Deadline for the whole endpoint-open phase of one setup call.
    ///
    /// Covers every fifo open and, in terminal mode, the console handshake.
    /// Default: 15000
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Console socket file name inside the shim working directory.
    ///
    /// Default: "pty.sock"
    #[serde(default = "default_console_socket_name")]
    pub console_socket_name: String,

    /// Buffer size for each relay copy loop, in bytes.
    ///
    /// Default: 32 KiB
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
}

fn default_open_timeout_ms() -> u64 {
    const_io::OPEN_TIMEOUT_MS
}

fn default_console_socket_name() -> String {
    const_io::CONSOLE_SOCKET_NAME.to_string()
}

fn default_relay_buffer_size() -> usize {
    const_io::RELAY_BUFFER_SIZE
}

impl Default for IoOptions {
    fn default() -> Self {
        Self {
            open_timeout_ms: default_open_timeout_ms(),
            console_socket_name: default_console_socket_name(),
            relay_buffer_size: default_relay_buffer_size(),
        }
    }
}

impl IoOptions {
    /// Setup deadline as a [`Duration`].
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Override the setup deadline.
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Reject values that would make setup meaningless.
    pub fn validate(&self) -> ShimResult<()> {
        if self.open_timeout_ms == 0 {
            return Err(ShimError::Config("open_timeout_ms must be positive".into()));
        }
        if self.relay_buffer_size == 0 {
            return Err(ShimError::Config(
                "relay_buffer_size must be positive".into(),
            ));
        }
        if self.console_socket_name.is_empty() || self.console_socket_name.contains('/') {
            return Err(ShimError::Config(format!(
                "console_socket_name must be a bare file name, got '{}'",
                self.console_socket_name
            )));
        }
        Ok(())
    }
}
