//! Persistent-VM sandbox for the interpreted language.
//!
//! [`VmSandbox`] owns the wasmtime [`Engine`] and the compiled interpreter
//! [`Module`]. The interpreter instance itself is created lazily, kept in a
//! single slot between calls and handed to exactly one call at a time.
//!
//! Guest ABI expected from the interpreter module:
//!
//! - exports `memory`, `alloc(len: i32) -> i32`, `eval(ptr: i32, len: i32) -> i32`
//!   (zero means success) and optionally `_initialize`;
//! - imports `env.host_log(ptr, len)`, `env.host_write(ptr, len)` and
//!   `env.host_error(ptr, len)`.
//!
//! Calls cannot be preempted. On timeout the caller is answered right away,
//! the engine epoch is bumped so the guest traps at its next loop or call
//! checkpoint, and the instance stays with the abandoned worker. The slot is
//! left empty, so the next call always starts on a fresh instance.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn, Instrument, Span};
use wasmtime::{
    Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, ResourceLimiter, Store,
    Trap, TypedFunc,
};

use crate::{
    context::ExecutionContext,
    error::Error,
    executor::Executor,
    quota::{QuotaMonitor, Supervised},
    types::{ExecutionError, ExecutionResult, GuestLanguage, ResourceLimits},
};

const MAX_TABLE_ELEMENTS: usize = 100_000;

/// Linear-memory ceiling fixed when the instance is created.
struct HeapLimiter {
    max_bytes: usize,
    exhausted: bool,
}

impl ResourceLimiter for HeapLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.max_bytes {
            self.exhausted = true;
            return Err(wasmtime::Error::msg(format!(
                "guest heap cannot grow from {} to {} bytes",
                current, desired
            )));
        }
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

struct HostState {
    heap: HeapLimiter,
    /// Present only while a call is running.
    monitor: Option<QuotaMonitor>,
    guest_error: Option<String>,
}

/// Result of one guest call, produced on the worker thread.
struct GuestRun {
    error: Option<ExecutionError>,
    /// The instance must not serve another call.
    poisoned: bool,
}

impl GuestRun {
    fn clean(error: Option<ExecutionError>) -> Self {
        Self {
            error,
            poisoned: false,
        }
    }

    fn poisoned(error: Option<ExecutionError>) -> Self {
        Self {
            error,
            poisoned: true,
        }
    }
}

/// One live interpreter instance.
struct GuestVm {
    store: Store<HostState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    eval: TypedFunc<(i32, i32), i32>,
    memory_limit_mb: u64,
}

impl GuestVm {
    fn create(engine: &Engine, module: &Module, limits: &ResourceLimits) -> Result<Self, Error> {
        debug!(memory_limit_mb = limits.memory_limit_mb(), "Creating interpreter instance");

        let state = HostState {
            heap: HeapLimiter {
                max_bytes: limits.memory_limit_bytes(),
                exhausted: false,
            },
            monitor: None,
            guest_error: None,
        };
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.heap);
        store.set_epoch_deadline(1);

        let mut linker: Linker<HostState> = Linker::new(engine);
        define_host_functions(&mut linker)?;

        let instance = match linker.instantiate(&mut store, module) {
            Ok(instance) => instance,
            Err(_) if store.data().heap.exhausted => {
                return Err(Error::HeapLimit(limits.memory_limit_mb()))
            }
            Err(e) => return Err(e.into()),
        };

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut store, "_initialize") {
            init.call(&mut store, ())?;
        }

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| Error::Engine("interpreter module exports no memory".to_string()))?;
        let alloc = typed_export(&instance, &mut store, "alloc")?;
        let eval = typed_export(&instance, &mut store, "eval")?;

        Ok(Self {
            store,
            memory,
            alloc,
            eval,
            memory_limit_mb: limits.memory_limit_mb(),
        })
    }

    fn run(
        &mut self,
        code: &str,
        monitor: QuotaMonitor,
        limits: &ResourceLimits,
        cancelled: &AtomicBool,
    ) -> GuestRun {
        self.store.set_epoch_deadline(1);
        // Checked after arming the deadline: a caller that gives up later
        // bumps the epoch past it, one that gave up earlier is seen here.
        if cancelled.load(Ordering::SeqCst) {
            return GuestRun::poisoned(Some(ExecutionError::timeout(limits)));
        }

        {
            let state = self.store.data_mut();
            state.monitor = Some(monitor.clone());
            state.guest_error = None;
        }

        let status = self.call_eval(code);

        let state = self.store.data_mut();
        state.monitor = None;
        let guest_error = state.guest_error.take();
        let heap_exhausted = std::mem::take(&mut state.heap.exhausted);

        match status {
            Ok(0) => GuestRun::clean(None),
            Ok(status) => GuestRun::clean(Some(ExecutionError::runtime(
                guest_error.unwrap_or_else(|| format!("Guest exited with status {}", status)),
            ))),
            // breach already recorded by the monitor
            Err(_) if monitor.is_breached() => GuestRun::poisoned(None),
            Err(_) if heap_exhausted => GuestRun::poisoned(Some(ExecutionError::memory(limits))),
            Err(e) => match e.downcast_ref::<Trap>() {
                Some(Trap::Interrupt) => GuestRun::poisoned(Some(ExecutionError::timeout(limits))),
                Some(trap) => GuestRun::poisoned(Some(ExecutionError::runtime(
                    guest_error.unwrap_or_else(|| format!("Guest trapped: {}", trap)),
                ))),
                None => GuestRun::poisoned(Some(ExecutionError::internal(format!(
                    "Interpreter call failed: {:#}",
                    e
                )))),
            },
        }
    }

    fn call_eval(&mut self, code: &str) -> wasmtime::Result<i32> {
        let len = i32::try_from(code.len())?;
        let ptr = self.alloc.call(&mut self.store, len)?;
        self.memory
            .write(&mut self.store, usize::try_from(ptr)?, code.as_bytes())?;
        self.eval.call(&mut self.store, (ptr, len))
    }
}

fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<TypedFunc<P, R>, Error>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, name)
        .map_err(|e| Error::Engine(format!("interpreter export `{}` unusable: {}", name, e)))
}

fn guest_bytes(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => return Err(wasmtime::Error::msg("guest has no exported memory")),
    };
    let start = usize::try_from(ptr)?;
    let len = usize::try_from(len)?;
    let data = memory.data(&*caller);
    let end = start
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| wasmtime::Error::msg("guest passed an out-of-bounds buffer"))?;
    Ok(data[start..end].to_vec())
}

fn define_host_functions(linker: &mut Linker<HostState>) -> Result<(), Error> {
    linker.func_wrap(
        "env",
        "host_log",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = guest_bytes(&mut caller, ptr, len)?;
            match &caller.data().monitor {
                Some(monitor) => monitor
                    .record_log(String::from_utf8_lossy(&bytes))
                    .map_err(|breach| wasmtime::Error::msg(breach.message)),
                None => Ok(()),
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "host_write",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = guest_bytes(&mut caller, ptr, len)?;
            match &caller.data().monitor {
                Some(monitor) => monitor
                    .record_output(&bytes)
                    .map_err(|breach| wasmtime::Error::msg(breach.message)),
                None => Ok(()),
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "host_error",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let bytes = guest_bytes(&mut caller, ptr, len)?;
            caller.data_mut().guest_error = Some(String::from_utf8_lossy(&bytes).into_owned());
            Ok(())
        },
    )?;

    Ok(())
}

/// Sandbox that keeps one interpreter instance alive across calls.
pub struct VmSandbox {
    engine: Engine,
    module: Module,
    /// Single-slot gate: holding the lock is the right to use the instance.
    slot: Mutex<Option<GuestVm>>,
}

impl VmSandbox {
    /// Compile an interpreter from WebAssembly binary or text.
    pub fn new(module: impl AsRef<[u8]>) -> Result<Self, Error> {
        let engine = Self::engine()?;
        let module = Module::new(&engine, module)?;
        Ok(Self::with_module(engine, module))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let engine = Self::engine()?;
        let module = Module::from_file(&engine, path).map_err(|e| {
            Error::Config(format!("cannot load interpreter {}: {:#}", path.display(), e))
        })?;
        Ok(Self::with_module(engine, module))
    }

    fn engine() -> Result<Engine, Error> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        Ok(Engine::new(&config)?)
    }

    fn with_module(engine: Engine, module: Module) -> Self {
        info!("Interpreter module compiled");
        Self {
            engine,
            module,
            slot: Mutex::new(None),
        }
    }

    /// Whether an instance is currently parked in the slot.
    pub async fn is_warm(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    fn settle(
        slot: &mut Option<GuestVm>,
        joined: Result<(Option<GuestVm>, GuestRun), JoinError>,
    ) -> Option<ExecutionError> {
        match joined {
            Ok((vm, run)) => {
                match vm {
                    Some(vm) if !run.poisoned => *slot = Some(vm),
                    Some(_) => warn!("Discarding interpreter instance after trap"),
                    None => {}
                }
                run.error
            }
            Err(e) => {
                error!("Interpreter worker failed: {}", e);
                Some(ExecutionError::internal(format!(
                    "Interpreter worker failed: {}",
                    e
                )))
            }
        }
    }
}

#[async_trait]
impl Executor for VmSandbox {
    fn language(&self) -> GuestLanguage {
        GuestLanguage::Interpreted
    }

    async fn execute(
        &self,
        code: &str,
        limits: &ResourceLimits,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        let monitor = QuotaMonitor::new(limits);

        async {
            let mut slot = self.slot.lock().await;
            let started = Instant::now();

            let reusable = match slot.take() {
                Some(vm) if vm.memory_limit_mb == limits.memory_limit_mb() => Some(vm),
                Some(_) => {
                    debug!("Memory ceiling changed, recreating interpreter instance");
                    None
                }
                None => None,
            };

            let engine = self.engine.clone();
            let module = self.module.clone();
            let code = code.to_owned();
            let limits_owned = *limits;
            let worker_monitor = monitor.clone();
            let cancelled = Arc::new(AtomicBool::new(false));
            let worker_cancelled = cancelled.clone();
            let span = Span::current();

            let mut worker = tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                if worker_cancelled.load(Ordering::SeqCst) {
                    debug!("Interpreter call abandoned before it started");
                    return (None, GuestRun::poisoned(None));
                }
                let mut vm = match reusable {
                    Some(vm) => vm,
                    None => match GuestVm::create(&engine, &module, &limits_owned) {
                        Ok(vm) => vm,
                        Err(Error::HeapLimit(_)) => {
                            let error = ExecutionError::memory(&limits_owned);
                            return (None, GuestRun::poisoned(Some(error)));
                        }
                        Err(e) => {
                            error!("Failed to create interpreter instance: {}", e);
                            let error = ExecutionError::internal(e.to_string());
                            return (None, GuestRun::poisoned(Some(error)));
                        }
                    },
                };
                let run = vm.run(&code, worker_monitor, &limits_owned, &worker_cancelled);
                (Some(vm), run)
            });

            let outcome = monitor.supervise(limits.timeout(), &mut worker).await;
            let error = match outcome {
                Supervised::Finished(joined) => Self::settle(&mut slot, joined),
                // The host function that tripped the quota also trapped the guest.
                Supervised::Breached => Self::settle(&mut slot, worker.await),
                Supervised::TimedOut => {
                    cancelled.store(true, Ordering::SeqCst);
                    self.engine.increment_epoch();
                    // only stops a worker that has not been scheduled yet
                    worker.abort();
                    warn!(
                        timeout_ms = limits.timeout_ms(),
                        "Interpreter call timed out, instance quarantined"
                    );
                    Some(ExecutionError::timeout(limits))
                }
            };

            let result = monitor.finish(error, started);
            info!(
                duration_ms = result.duration_ms,
                error = ?result.error_code(),
                "Interpreter execution finished"
            );
            result
        }
        .instrument(ctx.span().clone())
        .await
    }

    async fn shutdown(&self) {
        if self.slot.lock().await.take().is_some() {
            info!("Interpreter instance released");
        }
    }
}
