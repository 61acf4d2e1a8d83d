//! # Code Sandbox
//!
//! Runs untrusted guest code under per-call quotas (wall-clock time, memory,
//! output bytes, log entries) while bounding how many executions the host
//! runs at once.
//!
//! Script-language guests run in a fresh host process per call
//! ([`ProcessSandbox`]); interpreted-language guests run in one long-lived
//! WebAssembly interpreter instance ([`VmSandbox`]). Both report every
//! expected failure as data inside [`ExecutionResult`]. The
//! [`AdmissionController`] in front of them queues or rejects excess work,
//! and [`ExecutionGateway`] ties the pieces together.

mod admission;
mod config;
mod context;
mod error;
mod executor;
mod gateway;
mod quota;
mod runtimes;
mod sandbox;
mod types;

#[cfg(test)]
mod tests;

pub use admission::{AdmissionController, AdmissionStats};
pub use config::SandboxConfig;
pub use context::ExecutionContext;
pub use error::{Error, OverloadError};
pub use executor::Executor;
pub use gateway::ExecutionGateway;
pub use quota::{QuotaMonitor, Supervised};
pub use runtimes::{ProcessSandbox, ScriptRuntime, VmSandbox};
pub use types::{
    ErrorCode, ExecutionError, ExecutionRequest, ExecutionResult, GuestLanguage, ResourceLimits,
};

/// Result type for sandbox setup operations
pub type Result<T> = std::result::Result<T, Error>;
