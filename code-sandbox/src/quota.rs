//! Per-call quota enforcement shared by both sandbox variants.
//!
//! A [`QuotaMonitor`] is created for exactly one execution. Every unit of
//! guest output passes through it; the first emission that would push a
//! counter past its ceiling trips the monitor, which records the breach,
//! stops collecting and wakes whoever is supervising the run so the guest
//! can be torn down.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

use crate::types::{ErrorCode, ExecutionError, ExecutionResult, ResourceLimits};

/// Outcome of racing a guest run against its deadline and quota.
#[derive(Debug)]
pub enum Supervised<T> {
    Finished(T),
    Breached,
    TimedOut,
}

#[derive(Debug, Default)]
struct QuotaState {
    output: Vec<u8>,
    logs: Vec<String>,
    breach: Option<ExecutionError>,
}

#[derive(Debug)]
struct Inner {
    limits: ResourceLimits,
    state: Mutex<QuotaState>,
    abort: Notify,
}

/// Cheap-to-clone handle onto one call's counters.
#[derive(Debug, Clone)]
pub struct QuotaMonitor {
    inner: Arc<Inner>,
}

impl QuotaMonitor {
    pub fn new(limits: &ResourceLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits: *limits,
                state: Mutex::new(QuotaState::default()),
                abort: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.inner.limits
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one log entry.
    pub fn record_log(&self, line: impl Into<String>) -> Result<(), ExecutionError> {
        let mut state = self.lock();
        if let Some(breach) = &state.breach {
            return Err(breach.clone());
        }

        let max = self.inner.limits.max_log_entries();
        if state.logs.len() >= max {
            let error = ExecutionError::new(
                ErrorCode::LogLimitExceeded,
                format!("Log entry limit exceeded (max {})", max),
            );
            return Err(self.trip(&mut state, error));
        }

        state.logs.push(line.into());
        Ok(())
    }

    /// Record bytes written to the primary output channel.
    ///
    /// A chunk that does not fit keeps the prefix that does, then trips.
    pub fn record_output(&self, bytes: &[u8]) -> Result<(), ExecutionError> {
        let mut state = self.lock();
        if let Some(breach) = &state.breach {
            return Err(breach.clone());
        }

        let max = self.inner.limits.max_output_bytes();
        if state.output.len().saturating_add(bytes.len()) > max {
            let room = max.saturating_sub(state.output.len());
            state.output.extend_from_slice(&bytes[..room]);
            let error = ExecutionError::new(
                ErrorCode::OutputLimitExceeded,
                format!("Output limit exceeded (max {} bytes)", max),
            );
            return Err(self.trip(&mut state, error));
        }

        state.output.extend_from_slice(bytes);
        Ok(())
    }

    fn trip(&self, state: &mut QuotaState, error: ExecutionError) -> ExecutionError {
        warn!(code = ?error.code, "{}", error.message);
        state.breach = Some(error.clone());
        // notify_one keeps a permit if nobody is waiting yet
        self.inner.abort.notify_one();
        error
    }

    pub fn is_breached(&self) -> bool {
        self.lock().breach.is_some()
    }

    /// Resolves once a quota has been breached.
    pub async fn aborted(&self) {
        loop {
            if self.is_breached() {
                return;
            }
            self.inner.abort.notified().await;
        }
    }

    /// Race `run` against the deadline and the abort signal.
    pub async fn supervise<F: Future>(&self, timeout: Duration, run: F) -> Supervised<F::Output> {
        tokio::select! {
            biased;
            output = run => Supervised::Finished(output),
            _ = self.aborted() => Supervised::Breached,
            _ = tokio::time::sleep(timeout) => Supervised::TimedOut,
        }
    }

    /// Drain the collected output into a result. A recorded breach takes
    /// precedence over `error`.
    pub fn finish(&self, error: Option<ExecutionError>, started: Instant) -> ExecutionResult {
        let mut state = self.lock();
        let error = state.breach.clone().or(error);
        ExecutionResult {
            output: std::mem::take(&mut state.output),
            logs: std::mem::take(&mut state.logs),
            error,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}
