pub mod defaults {
    use crate::{tests::fixtures, Error, ResourceLimits, VmSandbox};

    pub fn default_test_limits() -> ResourceLimits {
        ResourceLimits::new(5_000, 64, 64 * 1024, 1_000).expect("valid limits")
    }

    pub fn limits(
        timeout_ms: u64,
        memory_limit_mb: u64,
        max_output_bytes: usize,
        max_log_entries: usize,
    ) -> ResourceLimits {
        ResourceLimits::new(timeout_ms, memory_limit_mb, max_output_bytes, max_log_entries)
            .expect("valid limits")
    }

    pub fn toy_interpreter() -> Result<VmSandbox, Error> {
        VmSandbox::new(fixtures::TOY_INTERPRETER_WAT)
    }
}

pub mod tools {
    use which::which;

    /// The script host is an external binary; tests that need it skip
    /// themselves on machines without one.
    pub fn skip_if_not_available(tools: &[&str]) -> bool {
        let missing: Vec<_> = tools
            .iter()
            .filter(|tool| which(**tool).is_err())
            .map(|s| (*s).to_string())
            .collect();

        if !missing.is_empty() {
            eprintln!("Skipping test: {} not available", missing.join(", "));
            return true;
        }
        false
    }
}
