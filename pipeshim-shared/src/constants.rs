//! Constants shared between the shim core and its fixtures.

/// Endpoint setup constants
pub mod io {
    /// Deadline shared by every endpoint open of one setup call, in milliseconds.
    pub const OPEN_TIMEOUT_MS: u64 = 15_000;

    /// Console socket file name, created inside the shim working directory.
    pub const CONSOLE_SOCKET_NAME: &str = "pty.sock";

    /// Relay copy buffer size in bytes.
    pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;
}

/// Runtime invocation constants
///
/// Full command: `<runtime> <runtime args...> kill --all <id> SIGKILL`.
pub mod runtime {
    /// Runtime subcommand used for termination.
    pub const KILL_SUBCOMMAND: &str = "kill";

    /// Flag addressing every process in the container.
    pub const ALL_FLAG: &str = "--all";

    /// Signal name passed to the runtime.
    pub const KILL_SIGNAL: &str = "SIGKILL";
}
