use anyhow::Context;
use clap::Parser;
use code_sandbox::{
    ErrorCode, ExecutionContext, ExecutionError, ExecutionGateway, ExecutionRequest,
    GuestLanguage, ResourceLimits, SandboxConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with gateway settings; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Guest language of every input file
    #[arg(short, long, default_value = "script")]
    language: GuestLanguage,

    /// Wall-clock limit per run, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Memory limit per run, in MB
    #[arg(long)]
    memory_mb: Option<u64>,

    /// Output byte limit per run
    #[arg(long)]
    max_output_bytes: Option<usize>,

    /// Log entry limit per run
    #[arg(long)]
    max_log_entries: Option<usize>,

    /// Maximum number of concurrent executions
    #[arg(short, long)]
    max_concurrent: Option<usize>,

    /// Maximum number of queued executions
    #[arg(long)]
    max_queue: Option<usize>,

    /// Script host binary
    #[arg(long)]
    node: Option<String>,

    /// WebAssembly interpreter module for interpreted guests
    #[arg(long)]
    module: Option<PathBuf>,

    /// Guest source files
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn gateway_config(&self) -> anyhow::Result<SandboxConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                SandboxConfig::from_toml_str(&raw)?
            }
            None => SandboxConfig::default(),
        };

        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent = max_concurrent;
        }
        if let Some(max_queue) = self.max_queue {
            config.max_queue_size = max_queue;
        }
        if let Some(node) = &self.node {
            config.script.program = node.clone();
        }
        if let Some(module) = &self.module {
            config.interpreter_module = Some(module.clone());
        }

        let base = config.default_limits;
        config.default_limits = ResourceLimits::new(
            self.timeout_ms.unwrap_or(base.timeout_ms()),
            self.memory_mb.unwrap_or(base.memory_limit_mb()),
            self.max_output_bytes.unwrap_or(base.max_output_bytes()),
            self.max_log_entries.unwrap_or(base.max_log_entries()),
        )?;
        Ok(config)
    }
}

/// One JSON line per input file
#[derive(Debug, Serialize)]
struct Report {
    file: PathBuf,
    correlation_id: String,
    output: String,
    logs: Vec<String>,
    error: Option<ExecutionError>,
    duration_ms: u64,
}

impl Report {
    fn failed(file: PathBuf, correlation_id: String, error: ExecutionError) -> Self {
        Self {
            file,
            correlation_id,
            output: String::new(),
            logs: Vec::new(),
            error: Some(error),
            duration_ms: 0,
        }
    }
}

async fn run_file(
    gateway: ExecutionGateway,
    language: GuestLanguage,
    limits: ResourceLimits,
    file: PathBuf,
) -> Report {
    let ctx = ExecutionContext::new();
    let correlation_id = ctx.correlation_id().to_string();

    let code = match tokio::fs::read_to_string(&file).await {
        Ok(code) => code,
        Err(e) => {
            error!(file = %file.display(), "Failed to read guest source: {}", e);
            let error = ExecutionError::internal(format!("Failed to read source: {}", e));
            return Report::failed(file, correlation_id, error);
        }
    };

    let request = ExecutionRequest {
        language,
        code,
        limits,
    };
    match gateway.execute(request, &ctx).await {
        Ok(result) => Report {
            output: result.output_text(),
            file,
            correlation_id,
            logs: result.logs,
            error: result.error,
            duration_ms: result.duration_ms,
        },
        Err(overload) => Report::failed(
            file,
            correlation_id,
            ExecutionError::new(ErrorCode::InternalError, overload.to_string()),
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the JSON reports
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.gateway_config()?;
    let gateway = ExecutionGateway::from_config(&config)?;
    let limits = config.default_limits;

    let handles: Vec<_> = args
        .files
        .iter()
        .cloned()
        .map(|file| tokio::spawn(run_file(gateway.clone(), args.language, limits, file)))
        .collect();

    let mut failures = 0;
    for handle in handles {
        let report = handle.await?;
        if report.error.is_some() {
            failures += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    gateway.shutdown().await;
    info!(runs = args.files.len(), failures, "All runs finished");

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
