use async_trait::async_trait;

use crate::{
    context::ExecutionContext,
    types::{ExecutionResult, GuestLanguage, ResourceLimits},
};

/// Capability shared by both sandbox variants.
///
/// `execute` never fails: timeouts, quota breaches and guest faults are
/// reported through [`ExecutionResult::error`]. Host malfunctions surface as
/// `InternalError` after the offending process or VM has been discarded.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Guest language this executor runs
    fn language(&self) -> GuestLanguage;

    /// Run `code` under `limits`
    async fn execute(
        &self,
        code: &str,
        limits: &ResourceLimits,
        ctx: &ExecutionContext,
    ) -> ExecutionResult;

    /// Release long-lived resources. Executors without any keep the default.
    async fn shutdown(&self) {}
}
