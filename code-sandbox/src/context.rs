use tracing::Span;
use uuid::Uuid;

/// Per-request correlation id plus the span diagnostics are written under.
///
/// The context carries no business state; it is created by the caller, passed
/// by reference through every layer, and dropped when the request completes.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    correlation_id: String,
    span: Span,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_correlation_id(Uuid::new_v4().to_string())
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        let span = tracing::info_span!("execution", correlation_id = %correlation_id);
        Self {
            correlation_id,
            span,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Diagnostic sink for this request.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}
