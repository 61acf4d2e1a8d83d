use thiserror::Error;

/// Host-level failures inside the sandbox core.
///
/// These never reach callers of [`crate::Executor::execute`] directly; the
/// executors convert them into an `InternalError` result after discarding the
/// offending process or VM instance.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Interpreter heap does not fit in {0} MB")]
    HeapLimit(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<wasmtime::Error> for Error {
    fn from(err: wasmtime::Error) -> Self {
        Error::Engine(format!("{err:#}"))
    }
}

/// Admission-time rejection: the work was never started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("server too busy: {active} executions running and {pending} queued")]
pub struct OverloadError {
    pub active: usize,
    pub pending: usize,
}
