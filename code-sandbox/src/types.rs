use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Guest languages accepted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestLanguage {
    /// JavaScript, run in a fresh host process per call
    Script,
    /// A WebAssembly-hosted interpreter kept alive across calls
    Interpreted,
}

impl FromStr for GuestLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" | "javascript" | "js" => Ok(GuestLanguage::Script),
            "interpreted" | "wasm" => Ok(GuestLanguage::Interpreted),
            _ => Err(format!("Unsupported language: {}", s)),
        }
    }
}

impl fmt::Display for GuestLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestLanguage::Script => f.write_str("script"),
            GuestLanguage::Interpreted => f.write_str("interpreted"),
        }
    }
}

/// Quota for one execution.
///
/// All four ceilings are strictly positive; the fields are private so a value
/// that exists has already been validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLimits")]
pub struct ResourceLimits {
    timeout_ms: u64,
    memory_limit_mb: u64,
    max_output_bytes: usize,
    max_log_entries: usize,
}

#[derive(Deserialize)]
struct RawLimits {
    timeout_ms: u64,
    memory_limit_mb: u64,
    max_output_bytes: usize,
    max_log_entries: usize,
}

impl TryFrom<RawLimits> for ResourceLimits {
    type Error = Error;

    fn try_from(raw: RawLimits) -> Result<Self, Self::Error> {
        ResourceLimits::new(
            raw.timeout_ms,
            raw.memory_limit_mb,
            raw.max_output_bytes,
            raw.max_log_entries,
        )
    }
}

impl ResourceLimits {
    pub fn new(
        timeout_ms: u64,
        memory_limit_mb: u64,
        max_output_bytes: usize,
        max_log_entries: usize,
    ) -> Result<Self, Error> {
        let zero = [
            ("timeout_ms", timeout_ms == 0),
            ("memory_limit_mb", memory_limit_mb == 0),
            ("max_output_bytes", max_output_bytes == 0),
            ("max_log_entries", max_log_entries == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::InvalidLimits(format!("{} must be greater than zero", name)));
        }

        Ok(Self {
            timeout_ms,
            memory_limit_mb,
            max_output_bytes,
            max_log_entries,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    /// Memory ceiling in bytes, saturating on absurd inputs.
    pub fn memory_limit_bytes(&self) -> usize {
        usize::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    pub fn max_log_entries(&self) -> usize {
        self.max_log_entries
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            memory_limit_mb: 128,
            max_output_bytes: 1024 * 1024, // 1MB
            max_log_entries: 1_000,
        }
    }
}

/// Code execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Guest language, selects the sandbox variant
    pub language: GuestLanguage,
    /// Source code to execute
    pub code: String,
    /// Per-call quota
    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Category of a capped or failed execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TimeoutExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    LogLimitExceeded,
    RuntimeError,
    InternalError,
}

/// Structured execution outcome carried inside [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(limits: &ResourceLimits) -> Self {
        Self::new(
            ErrorCode::TimeoutExceeded,
            format!("Execution timed out after {} ms", limits.timeout_ms()),
        )
    }

    pub fn memory(limits: &ResourceLimits) -> Self {
        Self::new(
            ErrorCode::MemoryLimitExceeded,
            format!("Memory limit exceeded (max {} MB)", limits.memory_limit_mb()),
        )
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RuntimeError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Execution result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Bytes written to the guest's primary output channel
    pub output: Vec<u8>,
    /// Log entries, one per line
    pub logs: Vec<String>,
    /// Present when the run was capped or faulted
    pub error: Option<ExecutionError>,
    /// Wall time spent in the executor
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Result carrying only an error, for runs that never produced anything.
    pub fn failed(error: ExecutionError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn output_text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}
