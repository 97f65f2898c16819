//! Sandboxed execution of one candidate program.
//!
//! A [`Sandbox`] runs a single source artifact in a disposable working
//! directory with wall-clock, memory, CPU and output ceilings, and always
//! returns an [`ExecutionResult`]. Provisioning problems are reported as
//! [`ExecutionOutcome::SandboxUnavailable`] rather than as a failure of the
//! candidate, so the retry loop can keep "the code is wrong" apart from
//! "the platform is overloaded".

mod docker;
mod local;
pub mod output;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;
pub use output::CapturedOutput;

use crate::config::{SandboxBackend, SandboxConfig};
use crate::language::{Language, LanguageRuntime};

/// Candidate stdin is written here, next to the source file.
pub const STDIN_FILE: &str = "stdin.txt";

/// Hard ceilings applied to one execution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u32,
    pub output_limit_bytes: usize,
}

impl ResourceLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Applies per-task overrides on top of these (process-wide) limits.
    ///
    /// The process-wide values are ceilings: an override can only tighten a
    /// limit, never raise it.
    pub fn with_overrides(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(v) = overrides.timeout_ms {
            self.timeout_ms = self.timeout_ms.min(v);
        }
        if let Some(v) = overrides.memory_mb {
            self.memory_mb = self.memory_mb.min(v);
        }
        if let Some(v) = overrides.cpus {
            // `f64::min` ignores a NaN operand.
            self.cpus = self.cpus.min(v);
        }
        if let Some(v) = overrides.pids {
            self.pids = self.pids.min(v);
        }
        if let Some(v) = overrides.output_limit_bytes {
            self.output_limit_bytes = self.output_limit_bytes.min(v);
        }
        self
    }

    /// Memory ceiling in bytes, saturating at `i64::MAX`.
    pub fn memory_bytes(&self) -> i64 {
        i64::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    /// CPU quota in units of 10^-9 CPUs. The float cast saturates.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

/// Optional per-task limits; unset fields fall back to the sandbox defaults
/// and set fields are capped by them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_limit_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source: String,
    pub stdin: Option<String>,
    pub limits: LimitOverrides,
}

/// How the execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The process exited on its own (any exit code).
    Exited,
    /// The executor killed the process at the wall-clock deadline.
    TimedOut,
    /// The sandbox could not be provisioned or supervised.
    SandboxUnavailable,
}

/// Result of one execution. Produced once per attempt and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i64>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration_ms: u64,
    pub outcome: ExecutionOutcome,
    /// Infrastructure detail when the sandbox was unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExecutionResult {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration_ms: 0,
            outcome: ExecutionOutcome::SandboxUnavailable,
            detail: Some(detail.into()),
        }
    }

    pub fn is_clean_exit(&self) -> bool {
        self.outcome == ExecutionOutcome::Exited && self.exit_code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(Language),

    #[error("sandbox backend unavailable: {0}")]
    Backend(String),
}

/// Backend availability as reported by `codeloop doctor`.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHealth {
    pub backend: &'static str,
    pub available: bool,
    pub detail: Option<String>,
    /// Whether the runtime for each enabled language is present.
    pub runtimes: BTreeMap<Language, bool>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn supports(&self, language: Language) -> bool;

    /// Runs one candidate. Only caller errors are returned as `Err`; every
    /// provisioning or supervision failure becomes a `SandboxUnavailable` result.
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError>;

    async fn health(&self) -> SandboxHealth;
}

/// Builds the backend selected by `[sandbox] backend`.
pub fn from_config(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
    match config.backend {
        SandboxBackend::Docker => Ok(Arc::new(DockerSandbox::connect(config.clone())?)),
        SandboxBackend::Local => Ok(Arc::new(LocalSandbox::new(config.clone()))),
    }
}

/// Creates the per-invocation working directory holding the source and stdin.
/// Dropping the returned [`TempDir`] deletes it.
pub(crate) fn prepare_workspace(
    runtime: &dyn LanguageRuntime,
    source: &str,
    stdin: Option<&str>,
) -> std::io::Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("codeloop-").tempdir()?;
    std::fs::write(dir.path().join(runtime.source_file()), source)?;
    std::fs::write(dir.path().join(STDIN_FILE), stdin.unwrap_or(""))?;
    make_world_readable(dir.path(), runtime.source_file())?;
    Ok(dir)
}

// Containers run as an unprivileged uid that does not own the host temp dir.
#[cfg(unix)]
fn make_world_readable(dir: &Path, source_file: &str) -> std::io::Result<()> {
    use std::fs::{Permissions, set_permissions};
    use std::os::unix::fs::PermissionsExt;

    set_permissions(dir, Permissions::from_mode(0o755))?;
    set_permissions(dir.join(source_file), Permissions::from_mode(0o644))?;
    set_permissions(dir.join(STDIN_FILE), Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_world_readable(_dir: &Path, _source_file: &str) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ResourceLimits {
        ResourceLimits {
            timeout_ms: 30_000,
            memory_mb: 512,
            cpus: 1.0,
            pids: 64,
            output_limit_bytes: 65_536,
        }
    }

    #[test]
    fn overrides_only_replace_set_fields() {
        let limits = defaults().with_overrides(&LimitOverrides {
            timeout_ms: Some(2_000),
            output_limit_bytes: Some(128),
            ..Default::default()
        });
        assert_eq!(limits.timeout(), Duration::from_secs(2));
        assert_eq!(limits.output_limit_bytes, 128);
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.pids, 64);
    }

    #[test]
    fn overrides_cannot_raise_the_process_wide_ceilings() {
        let limits = defaults().with_overrides(&LimitOverrides {
            timeout_ms: Some(u64::MAX),
            memory_mb: Some(1 << 50),
            cpus: Some(64.0),
            pids: Some(u32::MAX),
            output_limit_bytes: Some(usize::MAX),
        });
        assert_eq!(limits, defaults());

        let nan = defaults().with_overrides(&LimitOverrides {
            cpus: Some(f64::NAN),
            ..Default::default()
        });
        assert_eq!(nan.cpus, 1.0);
    }

    #[test]
    fn byte_and_cpu_conversions_saturate() {
        let huge = ResourceLimits {
            memory_mb: 1 << 50,
            cpus: 1e30,
            ..defaults()
        };
        assert_eq!(huge.memory_bytes(), i64::MAX);
        assert_eq!(huge.nano_cpus(), i64::MAX);
        assert_eq!(defaults().memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(defaults().nano_cpus(), 1_000_000_000);
    }

    #[test]
    fn workspace_holds_source_and_stdin_and_is_removed_on_drop() {
        let runtime = Language::Python.runtime();
        let dir = prepare_workspace(runtime, "print(1)", Some("3 4\n")).unwrap();
        let path = dir.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(path.join("main.py")).unwrap(), "print(1)");
        assert_eq!(std::fs::read_to_string(path.join(STDIN_FILE)).unwrap(), "3 4\n");

        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn unavailable_result_is_not_a_clean_exit() {
        let result = ExecutionResult::unavailable("docker daemon unreachable");
        assert_eq!(result.outcome, ExecutionOutcome::SandboxUnavailable);
        assert!(!result.is_clean_exit());
        assert_eq!(result.detail.as_deref(), Some("docker daemon unreachable"));
    }

    #[test]
    fn backend_follows_config() {
        let config = SandboxConfig {
            backend: SandboxBackend::Local,
            languages: vec![Language::Python],
            ..SandboxConfig::default()
        };
        let sandbox = from_config(&config).unwrap();
        assert!(sandbox.supports(Language::Python));
        assert!(!sandbox.supports(Language::Java));
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionOutcome::SandboxUnavailable).unwrap();
        assert_eq!(json, r#""sandbox_unavailable""#);
    }
}
