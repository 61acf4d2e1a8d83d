use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    tests::{
        fixtures,
        utils::defaults::{default_test_limits, limits, toy_interpreter},
    },
    Error, ErrorCode, ExecutionContext, Executor, Result, VmSandbox,
};

#[tokio::test]
async fn test_vm_round_trip_within_quota() -> Result<()> {
    let vm = toy_interpreter()?;
    let result = vm
        .execute("llooo", &default_test_limits(), &ExecutionContext::new())
        .await;

    assert!(result.is_success(), "unexpected error: {:?}", result.error);
    assert_eq!(result.logs, vec!["log line".to_string(), "log line".to_string()]);
    assert_eq!(result.output_text(), "ooo");
    Ok(())
}

#[tokio::test]
async fn test_vm_log_limit() -> Result<()> {
    let vm = toy_interpreter()?;
    let code = "l".repeat(100);
    let result = vm
        .execute(&code, &limits(5_000, 64, 1024, 10), &ExecutionContext::new())
        .await;

    let error = result.error.expect("log cap should trip");
    assert_eq!(error.code, ErrorCode::LogLimitExceeded);
    assert!(error.message.contains("Log entry limit exceeded"));
    assert_eq!(result.logs.len(), 10);
    Ok(())
}

#[tokio::test]
async fn test_vm_output_limit() -> Result<()> {
    let vm = toy_interpreter()?;
    let code = "o".repeat(20);
    let result = vm
        .execute(&code, &limits(5_000, 64, 5, 10), &ExecutionContext::new())
        .await;

    assert_eq!(result.error_code(), Some(ErrorCode::OutputLimitExceeded));
    assert_eq!(result.output_text(), "ooooo");
    Ok(())
}

#[tokio::test]
async fn test_vm_counters_reset_between_calls() -> Result<()> {
    let vm = toy_interpreter()?;
    let limits = limits(5_000, 64, 1024, 10);
    for _ in 0..3 {
        let result = vm.execute("llllll", &limits, &ExecutionContext::new()).await;
        assert!(result.is_success());
        assert_eq!(result.logs.len(), 6);
    }
    Ok(())
}

#[tokio::test]
async fn test_vm_instance_persists_until_shutdown() -> Result<()> {
    let vm = toy_interpreter()?;
    let limits = default_test_limits();
    let ctx = ExecutionContext::new();
    assert!(!vm.is_warm().await);

    assert_eq!(vm.execute("cp", &limits, &ctx).await.output_text(), "1");
    assert_eq!(vm.execute("cp", &limits, &ctx).await.output_text(), "2");
    assert!(vm.is_warm().await);

    vm.shutdown().await;
    assert!(!vm.is_warm().await);
    assert_eq!(vm.execute("cp", &limits, &ctx).await.output_text(), "1");
    Ok(())
}

#[tokio::test]
async fn test_vm_timeout_quarantines_instance() -> Result<()> {
    let vm = toy_interpreter()?;
    let ctx = ExecutionContext::new();
    let fast = limits(200, 64, 1024, 10);

    assert_eq!(vm.execute("cp", &fast, &ctx).await.output_text(), "1");

    let started = Instant::now();
    let result = vm.execute("x", &fast, &ctx).await;
    assert_eq!(result.error_code(), Some(ErrorCode::TimeoutExceeded));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!vm.is_warm().await);

    // counter restarts: the next call runs on a new instance
    let result = vm.execute("cp", &fast, &ctx).await;
    assert!(result.is_success());
    assert_eq!(result.output_text(), "1");
    Ok(())
}

#[tokio::test]
async fn test_vm_memory_limit() -> Result<()> {
    let vm = toy_interpreter()?;
    let ctx = ExecutionContext::new();
    let small = limits(5_000, 16, 1024, 10);

    let result = vm.execute("lm", &small, &ctx).await;
    assert_eq!(result.error_code(), Some(ErrorCode::MemoryLimitExceeded));
    assert_eq!(result.logs.len(), 1);
    assert!(!vm.is_warm().await);

    assert!(vm.execute("l", &small, &ctx).await.is_success());
    Ok(())
}

#[tokio::test]
async fn test_vm_memory_ceiling_change_recreates_instance() -> Result<()> {
    let vm = toy_interpreter()?;
    let ctx = ExecutionContext::new();

    assert_eq!(
        vm.execute("cp", &limits(5_000, 16, 1024, 10), &ctx).await.output_text(),
        "1"
    );
    assert_eq!(
        vm.execute("cp", &limits(5_000, 32, 1024, 10), &ctx).await.output_text(),
        "1"
    );
    Ok(())
}

#[tokio::test]
async fn test_vm_guest_error_keeps_instance() -> Result<()> {
    let vm = toy_interpreter()?;
    let ctx = ExecutionContext::new();
    let limits = default_test_limits();

    assert_eq!(vm.execute("cp", &limits, &ctx).await.output_text(), "1");

    let result = vm.execute("le", &limits, &ctx).await;
    let error = result.error.expect("guest error expected");
    assert_eq!(error.code, ErrorCode::RuntimeError);
    assert_eq!(error.message, "guest fault: boom");
    assert_eq!(result.logs.len(), 1);

    assert_eq!(vm.execute("cp", &limits, &ctx).await.output_text(), "2");
    Ok(())
}

#[tokio::test]
async fn test_vm_trap_discards_instance() -> Result<()> {
    let vm = toy_interpreter()?;
    let ctx = ExecutionContext::new();
    let limits = default_test_limits();

    vm.execute("c", &limits, &ctx).await;
    let result = vm.execute("t", &limits, &ctx).await;
    let error = result.error.expect("trap expected");
    assert_eq!(error.code, ErrorCode::RuntimeError);
    assert!(error.message.contains("Guest trapped"));

    assert_eq!(vm.execute("p", &limits, &ctx).await.output_text(), "0");
    Ok(())
}

#[tokio::test]
async fn test_vm_initial_heap_over_ceiling() -> Result<()> {
    let vm = VmSandbox::new(fixtures::OVERSIZED_INTERPRETER_WAT)?;
    let result = vm
        .execute("", &limits(5_000, 16, 1024, 10), &ExecutionContext::new())
        .await;
    assert_eq!(result.error_code(), Some(ErrorCode::MemoryLimitExceeded));
    Ok(())
}

#[tokio::test]
async fn test_vm_missing_exports_is_internal_error() -> Result<()> {
    let vm = VmSandbox::new(r#"(module (memory (export "memory") 1))"#)?;
    let result = vm
        .execute("l", &default_test_limits(), &ExecutionContext::new())
        .await;
    assert_eq!(result.error_code(), Some(ErrorCode::InternalError));
    Ok(())
}

#[test]
fn test_vm_rejects_garbage_module() {
    assert!(matches!(
        VmSandbox::new(b"definitely not wasm"),
        Err(Error::Engine(_))
    ));
}

#[tokio::test]
async fn test_vm_calls_are_serialized() -> Result<()> {
    let vm = Arc::new(toy_interpreter()?);
    let limits = default_test_limits();

    let mut handles = vec![];
    for _ in 0..4 {
        let vm = vm.clone();
        handles.push(tokio::spawn(async move {
            vm.execute("cp", &limits, &ExecutionContext::new()).await
        }));
    }

    let mut seen = vec![];
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_success());
        seen.push(result.output_text());
    }
    seen.sort();
    assert_eq!(seen, vec!["1", "2", "3", "4"]);
    Ok(())
}

#[test]
fn test_vm_timeout_before_worker_starts() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let vm = toy_interpreter()?;
        let ctx = ExecutionContext::new();

        // keep the only blocking thread busy past the deadline
        let busy = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_millis(300)));

        let result = vm.execute("x", &limits(50, 64, 1024, 10), &ctx).await;
        assert_eq!(result.error_code(), Some(ErrorCode::TimeoutExceeded));

        busy.await.unwrap();
        let started = Instant::now();
        let result = vm.execute("l", &limits(2_000, 64, 1024, 10), &ctx).await;
        assert!(result.is_success(), "unexpected error: {:?}", result.error);
        assert_eq!(result.logs, vec!["log line".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok::<(), Error>(())
    })
}
