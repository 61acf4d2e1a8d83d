//! Sandbox variants behind the [`crate::Executor`] capability

mod process;
mod vm;

pub use process::{ProcessSandbox, ScriptRuntime};
pub use vm::VmSandbox;
