use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{error::Error, runtimes::ScriptRuntime, types::ResourceLimits};

/// Settings needed to assemble an [`crate::ExecutionGateway`].
///
/// The core never reads files or the environment itself; callers parse this
/// from whatever source they own (see [`SandboxConfig::from_toml_str`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Executions allowed to run at once, across both sandbox variants
    pub max_concurrent: usize,
    /// Submissions allowed to wait for a slot before overload rejection
    pub max_queue_size: usize,
    /// Limits applied when a request does not carry its own
    pub default_limits: ResourceLimits,
    /// Host process for script-language guests
    pub script: ScriptRuntime,
    /// WebAssembly interpreter for interpreted-language guests
    pub interpreter_module: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            default_limits: ResourceLimits::default(),
            script: ScriptRuntime::default(),
            interpreter_module: None,
        }
    }
}

impl SandboxConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent == 0 {
            return Err(Error::Config(
                "max_concurrent must be greater than zero".to_string(),
            ));
        }
        if self.script.program.trim().is_empty() {
            return Err(Error::Config("script.program must not be empty".to_string()));
        }
        Ok(())
    }
}
