use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    admission::{AdmissionController, AdmissionStats},
    config::SandboxConfig,
    context::ExecutionContext,
    error::{Error, OverloadError},
    executor::Executor,
    runtimes::{ProcessSandbox, VmSandbox},
    types::{ExecutionError, ExecutionRequest, ExecutionResult, GuestLanguage},
};

/// Routes requests to the sandbox for their guest language, behind one
/// shared admission controller.
#[derive(Clone)]
pub struct ExecutionGateway {
    admission: Arc<AdmissionController>,
    script: Arc<dyn Executor>,
    interpreted: Option<Arc<dyn Executor>>,
}

impl ExecutionGateway {
    pub fn new(
        admission: Arc<AdmissionController>,
        script: Arc<dyn Executor>,
        interpreted: Option<Arc<dyn Executor>>,
    ) -> Self {
        check_language(&script, GuestLanguage::Script);
        if let Some(interpreted) = &interpreted {
            check_language(interpreted, GuestLanguage::Interpreted);
        }
        let (max_concurrent, max_queue_size) = admission.limits();
        debug!(max_concurrent, max_queue_size, "Admission limits");

        Self {
            admission,
            script,
            interpreted,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, Error> {
        config.validate()?;

        let admission = Arc::new(AdmissionController::new(
            config.max_concurrent,
            config.max_queue_size,
        ));
        let script: Arc<dyn Executor> = Arc::new(ProcessSandbox::new(config.script.clone()));
        let interpreted = match &config.interpreter_module {
            Some(path) => Some(Arc::new(VmSandbox::from_file(path)?) as Arc<dyn Executor>),
            None => None,
        };

        info!(interpreter = interpreted.is_some(), "Execution gateway ready");
        Ok(Self::new(admission, script, interpreted))
    }

    fn executor_for(&self, language: GuestLanguage) -> Option<&Arc<dyn Executor>> {
        match language {
            GuestLanguage::Script => Some(&self.script),
            GuestLanguage::Interpreted => self.interpreted.as_ref(),
        }
    }

    /// Admit and run one request.
    ///
    /// `Err` means the request was never started; capped or failed runs come
    /// back as `Ok` with [`ExecutionResult::error`] set.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, OverloadError> {
        let Some(executor) = self.executor_for(request.language) else {
            warn!(parent: ctx.span(), language = %request.language, "No executor configured");
            return Ok(ExecutionResult::failed(ExecutionError::internal(format!(
                "No executor configured for {} guests",
                request.language
            ))));
        };

        debug!(
            parent: ctx.span(),
            language = %request.language,
            code_len = request.code.len(),
            "Submitting execution"
        );

        let result = self
            .admission
            .run(executor.execute(&request.code, &request.limits, ctx))
            .await;

        if let Err(e) = &result {
            warn!(parent: ctx.span(), "Execution rejected: {}", e);
        }
        result
    }

    pub fn stats(&self) -> AdmissionStats {
        self.admission.stats()
    }

    pub async fn shutdown(&self) {
        self.script.shutdown().await;
        if let Some(interpreted) = &self.interpreted {
            interpreted.shutdown().await;
        }
        info!("Execution gateway shut down");
    }
}

fn check_language(executor: &Arc<dyn Executor>, slot: GuestLanguage) {
    if executor.language() != slot {
        warn!(
            executor = %executor.language(),
            slot = %slot,
            "Executor registered for a different guest language"
        );
    }
}
