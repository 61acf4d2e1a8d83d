use std::time::{Duration, Instant};

use crate::{
    tests::{
        fixtures::script,
        utils::{
            defaults::{default_test_limits, limits},
            tools::skip_if_not_available,
        },
    },
    ErrorCode, ExecutionContext, Executor, ProcessSandbox, ScriptRuntime,
};

fn sandbox() -> Option<ProcessSandbox> {
    if skip_if_not_available(&["node"]) {
        return None;
    }
    Some(ProcessSandbox::default())
}

#[tokio::test]
async fn test_script_round_trip() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(script::HELLO, &default_test_limits(), &ExecutionContext::new())
        .await;

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.output_text(), "Hello from JavaScript!");
    assert_eq!(
        result.logs,
        vec!["first log".to_string(), "second log".to_string()]
    );
}

#[tokio::test]
async fn test_script_log_limit() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::HUNDRED_LOGS,
            &limits(5_000, 64, 1024, 10),
            &ExecutionContext::new(),
        )
        .await;

    let error = result.error.expect("log cap should trip");
    assert_eq!(error.code, ErrorCode::LogLimitExceeded);
    assert!(error.message.contains("Log entry limit exceeded"));
    assert_eq!(result.logs.len(), 10);
    assert_eq!(result.logs[0], "line 0");
}

#[tokio::test]
async fn test_script_output_limit() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::CHATTY_OUTPUT,
            &limits(5_000, 64, 100, 10),
            &ExecutionContext::new(),
        )
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::OutputLimitExceeded));
    assert_eq!(result.output_text(), "0123456789".repeat(10));
}

#[tokio::test]
async fn test_script_timeout_kills_host() {
    let Some(sandbox) = sandbox() else { return };
    let started = Instant::now();
    let result = sandbox
        .execute(
            script::BUSY_LOOP,
            &limits(300, 64, 1024, 10),
            &ExecutionContext::new(),
        )
        .await;

    let error = result.error.expect("busy loop must time out");
    assert_eq!(error.code, ErrorCode::TimeoutExceeded);
    assert_eq!(error.message, "Execution timed out after 300 ms");
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_script_uncaught_exception() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(script::THROWS, &default_test_limits(), &ExecutionContext::new())
        .await;

    let error = result.error.expect("throw should surface");
    assert_eq!(error.code, ErrorCode::RuntimeError);
    assert_eq!(error.message, "TypeError: guest exploded");
    assert_eq!(result.logs, vec!["before".to_string()]);
}

#[tokio::test]
async fn test_script_async_failure() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::REJECTS_LATER,
            &default_test_limits(),
            &ExecutionContext::new(),
        )
        .await;

    let error = result.error.expect("rejection should surface");
    assert_eq!(error.code, ErrorCode::RuntimeError);
    assert!(error.message.contains("late failure"));
}

#[tokio::test]
async fn test_script_memory_limit() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::ALLOCATES,
            &limits(20_000, 32, 1024, 1_000),
            &ExecutionContext::new(),
        )
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::MemoryLimitExceeded));
}

#[tokio::test]
async fn test_script_calls_do_not_share_state() {
    let Some(sandbox) = sandbox() else { return };
    let limits = default_test_limits();
    let ctx = ExecutionContext::new();

    let first = sandbox.execute(script::LEAVES_STATE, &limits, &ctx).await;
    assert_eq!(first.output_text(), "string");

    let second = sandbox.execute(script::READS_STATE, &limits, &ctx).await;
    assert!(second.is_success());
    assert_eq!(second.output_text(), "undefined");
}

#[tokio::test]
async fn test_missing_script_host_is_internal_error() {
    let sandbox = ProcessSandbox::new(ScriptRuntime {
        program: "definitely-not-a-script-host".to_string(),
        extra_args: Vec::new(),
    });
    let result = sandbox
        .execute("1", &default_test_limits(), &ExecutionContext::new())
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::InternalError));
    assert!(result.output.is_empty());
}

#[tokio::test]
async fn test_script_sloppy_mode_program() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::IMPLICIT_GLOBAL,
            &default_test_limits(),
            &ExecutionContext::new(),
        )
        .await;

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.output_text(), "1");
}

#[tokio::test]
async fn test_script_forged_fault_line_is_not_an_error() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::FORGES_FAULT_LINE,
            &default_test_limits(),
            &ExecutionContext::new(),
        )
        .await;

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.output_text(), "done");
}

#[tokio::test]
async fn test_script_scratch_file_larger_than_output_cap() {
    let Some(sandbox) = sandbox() else { return };
    let result = sandbox
        .execute(
            script::WRITES_SCRATCH_FILE,
            &limits(5_000, 64, 1024, 10),
            &ExecutionContext::new(),
        )
        .await;

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.output_text(), "written");
}
