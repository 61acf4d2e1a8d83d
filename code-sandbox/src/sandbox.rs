use nix::sys::resource::{setrlimit, Resource};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tempfile::TempDir;
use tokio::{fs, process::Command};
use tracing::{debug, error};

use crate::{error::Error, types::ResourceLimits};

/// Largest file a guest may write into its workspace.
const MAX_SCRATCH_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// Scratch directory for one ephemeral host process.
///
/// Created fresh for every call and removed on drop, so nothing written by a
/// guest survives into the next execution.
pub struct Workspace {
    dir: Option<TempDir>,
    root: PathBuf,
}

impl Workspace {
    pub async fn create() -> Result<Self, Error> {
        let dir = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir()
            .map_err(|e| Error::Sandbox(format!("Failed to create sandbox directory: {}", e)))?;
        let root = dir.path().to_path_buf();

        for sub in &["home", "tmp"] {
            fs::create_dir_all(root.join(sub)).await.map_err(|e| {
                Error::Sandbox(format!("Failed to create {} directory: {}", sub, e))
            })?;
        }

        debug!("Created sandbox workspace at {}", root.display());
        Ok(Self {
            dir: Some(dir),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write_file(&self, name: &str, contents: &str) -> Result<PathBuf, Error> {
        let path = self.root.join(name);
        fs::write(&path, contents).await?;
        Ok(path)
    }

    /// Build a command for `program` that runs inside this workspace with a
    /// cleared environment, its own process group and kernel resource limits.
    pub fn command(
        &self,
        program: &str,
        args: &[String],
        limits: &ResourceLimits,
    ) -> Result<Command, Error> {
        let program_path = resolve_program(program)?;

        let mut command = Command::new(&program_path);
        command
            .args(args)
            .env_clear()
            .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
            .env("HOME", self.root.join("home"))
            .env("TMPDIR", self.root.join("tmp"))
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let cpu_seconds = cpu_limit_secs(limits);
        let file_size = MAX_SCRATCH_FILE_BYTES;

        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid()?;
                setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds)?;
                setrlimit(Resource::RLIMIT_FSIZE, file_size, file_size)?;
                Ok(())
            });
        }

        Ok(command)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                error!("Failed to clean up sandbox directory: {}", e);
            }
        }
    }
}

/// Kernel CPU backstop. CPU time is summed over every host thread (GC and
/// compiler threads included), so it gets twice the wall-clock budget plus a
/// second; the wall-clock deadline normally fires first.
fn cpu_limit_secs(limits: &ResourceLimits) -> u64 {
    limits.timeout_ms().div_ceil(1000).saturating_mul(2) + 1
}

fn resolve_program(program: &str) -> Result<PathBuf, Error> {
    let candidate = Path::new(program);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }
    which::which(program).map_err(|_| Error::Sandbox(format!("Command not found: {}", program)))
}
