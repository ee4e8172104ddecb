use std::io;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("another lifecycle command is in progress")]
    Busy,
    #[error("this command can only be used in a text channel")]
    InvalidChannelContext,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("wait for the server process was interrupted: {source}")]
    InterruptedWait {
        #[source]
        source: io::Error,
    },
    #[error("no matching line found in the server log")]
    NoDataFound,
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("server did not report ready within {timeout_secs}s")]
    StartTimeout { timeout_secs: u64 },
    #[error("server exited before it was ready (exit code {exit_code:?})")]
    ExitedBeforeReady { exit_code: Option<i32> },
    #[error("server stopped but failed to start again: {source}")]
    RestartPartialFailure {
        #[source]
        source: Box<LifecycleError>,
    },
}

impl LifecycleError {
    pub(crate) fn io(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| LifecycleError::Io { context, source }
    }

    /// Stable machine-readable code, used in structured replies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::AlreadyRunning => "already_running",
            LifecycleError::NotRunning => "not_running",
            LifecycleError::Busy => "busy",
            LifecycleError::InvalidChannelContext => "invalid_channel",
            LifecycleError::Io { .. } => "io_failure",
            LifecycleError::InterruptedWait { .. } => "interrupted_wait",
            LifecycleError::NoDataFound => "no_data",
            LifecycleError::Spawn { .. } => "spawn_failed",
            LifecycleError::StartTimeout { .. } => "start_timeout",
            LifecycleError::ExitedBeforeReady { .. } => "exited_before_ready",
            LifecycleError::RestartPartialFailure { .. } => "restart_partial_failure",
        }
    }
}
