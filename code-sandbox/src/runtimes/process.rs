//! Ephemeral-process sandbox for the script language.
//!
//! Every call gets a brand new workspace and host process. The host is killed
//! (whole process group, `SIGKILL`) on timeout or quota breach, so nothing
//! outlives the call that started it.

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    context::ExecutionContext,
    error::Error,
    executor::Executor,
    quota::{QuotaMonitor, Supervised},
    sandbox::Workspace,
    types::{ExecutionError, ExecutionResult, GuestLanguage, ResourceLimits},
};

const ENTRY_FILE: &str = "main.js";
const MAX_LOG_LINE_BYTES: u64 = 64 * 1024;
const FAULT_SENTINEL: &str = "\u{1}guest-error\u{1} ";
/// Exit status the prelude uses after reporting an uncaught guest error.
const FAULT_STATUS: i32 = 70;
const HEAP_MARKERS: [&str; 2] = ["heap out of memory", "Reached heap limit"];

/// Routes `console.*` to stderr (one log entry per line) and turns uncaught
/// guest errors into a single sentinel line plus exit status 70.
const PRELUDE: &str = r#"const __sandboxFs = require('fs');
const __sandboxFormat = require('util').format;
const __sandboxLog = (...args) => {
  for (const line of __sandboxFormat(...args).split('\n')) {
    __sandboxFs.writeSync(2, line + '\n');
  }
};
for (const level of ['log', 'info', 'warn', 'error', 'debug', 'trace']) {
  console[level] = __sandboxLog;
}
const __sandboxFail = (err) => {
  const message = err instanceof Error ? `${err.name}: ${err.message}` : String(err);
  __sandboxFs.writeSync(2, '\u0001guest-error\u0001 ' + message.replace(/\n/g, ' ') + '\n');
  process.exit(70);
};
process.on('uncaughtException', __sandboxFail);
process.on('unhandledRejection', __sandboxFail);
"#;

/// Host binary used for script-language guests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptRuntime {
    /// Program name (looked up on `PATH`) or absolute path
    pub program: String,
    /// Extra flags placed before the entry file
    pub extra_args: Vec<String>,
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// What the host reported on stderr besides log lines.
#[derive(Debug, Default)]
struct HostDiagnostics {
    fault: Option<String>,
    heap_exhausted: bool,
}

pub struct ProcessSandbox {
    runtime: ScriptRuntime,
}

impl ProcessSandbox {
    pub fn new(runtime: ScriptRuntime) -> Self {
        Self { runtime }
    }

    fn entry_source(code: &str) -> String {
        format!(
            "{}\n(async () => {{\n{}\n}})().catch(__sandboxFail);\n",
            PRELUDE, code
        )
    }

    async fn run(&self, code: &str, monitor: &QuotaMonitor) -> Result<Option<ExecutionError>, Error> {
        let limits = *monitor.limits();
        let workspace = Workspace::create().await?;
        workspace
            .write_file(ENTRY_FILE, &Self::entry_source(code))
            .await?;

        let mut args = vec![format!("--max-old-space-size={}", limits.memory_limit_mb())];
        args.extend(self.runtime.extra_args.iter().cloned());
        args.push(ENTRY_FILE.to_string());

        let mut child = workspace
            .command(&self.runtime.program, &args, &limits)?
            .spawn()
            .map_err(|e| Error::Sandbox(format!("Failed to spawn script host: {}", e)))?;
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("Script host stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("Script host stderr not captured".to_string()))?;
        debug!(?pid, "Spawned script host");

        let outcome = monitor
            .supervise(limits.timeout(), async {
                tokio::join!(
                    pump_output(stdout, monitor),
                    pump_logs(stderr, monitor),
                    child.wait()
                )
            })
            .await;

        match outcome {
            Supervised::Finished((output, diagnostics, status)) => {
                output?;
                Ok(classify_exit(status?, diagnostics?, &limits))
            }
            Supervised::Breached => {
                terminate(&mut child, pid).await;
                Ok(None)
            }
            Supervised::TimedOut => {
                warn!(timeout_ms = limits.timeout_ms(), "Script host timed out, killing");
                terminate(&mut child, pid).await;
                Ok(Some(ExecutionError::timeout(&limits)))
            }
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(ScriptRuntime::default())
    }
}

#[async_trait]
impl Executor for ProcessSandbox {
    fn language(&self) -> GuestLanguage {
        GuestLanguage::Script
    }

    async fn execute(
        &self,
        code: &str,
        limits: &ResourceLimits,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let started = Instant::now();
        let monitor = QuotaMonitor::new(limits);

        let error = match self.run(code, &monitor).instrument(ctx.span().clone()).await {
            Ok(error) => error,
            Err(e) => {
                error!(parent: ctx.span(), "Script execution failed: {}", e);
                Some(ExecutionError::internal(e.to_string()))
            }
        };

        let result = monitor.finish(error, started);
        info!(
            parent: ctx.span(),
            duration_ms = result.duration_ms,
            error = ?result.error_code(),
            "Script execution finished"
        );
        result
    }
}

async fn pump_output(mut stdout: ChildStdout, monitor: &QuotaMonitor) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 || monitor.record_output(&buf[..n]).is_err() {
            return Ok(());
        }
    }
}

async fn pump_logs(stderr: ChildStderr, monitor: &QuotaMonitor) -> std::io::Result<HostDiagnostics> {
    let mut reader = BufReader::new(stderr);
    let mut diagnostics = HostDiagnostics::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        // Overlong lines are split rather than buffered without bound.
        let n = (&mut reader)
            .take(MAX_LOG_LINE_BYTES)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(diagnostics);
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(&['\n', '\r'][..]);

        if let Some(message) = text.strip_prefix(FAULT_SENTINEL) {
            diagnostics.fault = Some(message.to_string());
            continue;
        }
        if HEAP_MARKERS.iter().any(|marker| text.contains(marker)) {
            diagnostics.heap_exhausted = true;
        }
        if diagnostics.heap_exhausted {
            // everything after the OOM banner is host noise
            continue;
        }
        if monitor.record_log(text).is_err() {
            return Ok(diagnostics);
        }
    }
}

fn classify_exit(
    status: ExitStatus,
    diagnostics: HostDiagnostics,
    limits: &ResourceLimits,
) -> Option<ExecutionError> {
    if diagnostics.heap_exhausted {
        return Some(ExecutionError::memory(limits));
    }
    // a guest can print the sentinel itself; only the prelude's exit counts
    if let Some(message) = diagnostics.fault.filter(|_| status.code() == Some(FAULT_STATUS)) {
        return Some(ExecutionError::runtime(message));
    }
    if status.success() {
        return None;
    }

    match status.signal() {
        Some(signal) if signal == Signal::SIGXCPU as i32 => Some(ExecutionError::timeout(limits)),
        Some(signal) => Some(ExecutionError::runtime(format!(
            "Script host killed by signal {}",
            signal
        ))),
        None => Some(ExecutionError::runtime(format!(
            "Script host exited with status {}",
            status.code().unwrap_or(-1)
        ))),
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        // The host is its own group leader, this also reaches its children.
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!("killpg({}) failed: {}", pid, e);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Failed to reap script host: {}", e);
    }
}
