//! Host-process backend for development machines without a container daemon.
//!
//! Candidates run under `/bin/sh` in a throwaway directory with a scrubbed
//! environment, in their own process group. Wall-clock timeout, output
//! ceilings and teardown match the Docker backend: the whole group is killed
//! at the deadline, on cancellation and after the shell exits. Memory and CPU
//! time are capped with rlimits. There is no network or filesystem isolation
//! beyond the working directory, and no per-tree process ceiling
//! (`RLIMIT_NPROC` counts every process of the host user).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::process::Command;
use tracing::{debug, warn};

use super::output;
use super::{
    ExecutionOutcome, ExecutionRequest, ExecutionResult, ResourceLimits, STDIN_FILE, Sandbox,
    SandboxError, SandboxHealth, prepare_workspace,
};
use crate::config::SandboxConfig;
use crate::language::{Language, LanguageRuntime};

/// How long output readers may keep draining after the process is gone.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct LocalSandbox {
    config: SandboxConfig,
}

impl LocalSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        warn!("local sandbox backend selected: candidates run on the host without network isolation");
        Self { config }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn supports(&self, language: Language) -> bool {
        self.config.languages.contains(&language)
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        if !self.supports(request.language) {
            return Err(SandboxError::UnsupportedLanguage(request.language));
        }
        let limits = self.config.default_limits().with_overrides(&request.limits);
        let runtime = request.language.runtime();

        let workspace = match prepare_workspace(runtime, &request.source, request.stdin.as_deref()) {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(ExecutionResult::unavailable(format!(
                    "failed to prepare workspace: {e}"
                )));
            }
        };
        let build_dir = workspace.path().join("build");
        if let Err(e) = std::fs::create_dir(&build_dir) {
            return Ok(ExecutionResult::unavailable(format!(
                "failed to prepare build dir: {e}"
            )));
        }

        let script = runtime.shell_script(&build_dir.to_string_lossy(), STDIN_FILE);
        debug!(language = %request.language, %script, "starting local sandbox process");

        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", host_path())
            .env("HOME", &build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        apply_rlimits(&mut command, &limits);

        let result = supervise(command, &limits).await;
        drop(workspace);
        Ok(result)
    }

    async fn health(&self) -> SandboxHealth {
        let runtimes: BTreeMap<Language, bool> = self
            .config
            .languages
            .iter()
            .map(|&language| (language, find_on_path(tool_for(language.runtime())).is_some()))
            .collect();
        SandboxHealth {
            backend: "local",
            available: PathBuf::from("/bin/sh").exists(),
            detail: Some("no network isolation".to_string()),
            runtimes,
        }
    }
}

/// Spawns `command` in a new process group, enforces the wall-clock deadline
/// and captures bounded output.
///
/// Every process in the group is killed at the deadline, when the returned
/// future is dropped, and once the direct child has exited.
pub(crate) async fn supervise(mut command: Command, limits: &ResourceLimits) -> ExecutionResult {
    let started = Instant::now();
    #[cfg(unix)]
    command.process_group(0);
    command.kill_on_drop(true);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionResult::unavailable(format!("failed to spawn sandbox process: {e}"));
        }
    };
    let group = ProcessGroup::new(child.id());

    let stdout = output::shared(limits.output_limit_bytes);
    let stderr = output::shared(limits.output_limit_bytes);
    let mut readers = Vec::with_capacity(2);
    if let Some(pipe) = child.stdout.take() {
        readers.push(tokio::spawn(output::drain_into(pipe, stdout.clone())));
    }
    if let Some(pipe) = child.stderr.take() {
        readers.push(tokio::spawn(output::drain_into(pipe, stderr.clone())));
    }

    let (exit_code, outcome) = match tokio::time::timeout(limits.timeout(), child.wait()).await {
        Ok(Ok(status)) => (exit_code_of(status), ExecutionOutcome::Exited),
        Ok(Err(e)) => {
            let _ = child.start_kill();
            return ExecutionResult::unavailable(format!("failed to wait for sandbox process: {e}"));
        }
        Err(_) => {
            group.kill();
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill timed-out sandbox process");
            }
            (None, ExecutionOutcome::TimedOut)
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    // Background processes left by the candidate go with the shell.
    group.kill();

    // Anything that escaped the group may still hold the pipes open.
    let _ = tokio::time::timeout(OUTPUT_GRACE, join_all(readers.iter_mut())).await;
    for reader in &readers {
        reader.abort();
    }

    let stdout = stdout.lock().snapshot();
    let stderr = stderr.lock().snapshot();
    ExecutionResult {
        exit_code,
        stdout,
        stderr,
        duration_ms,
        outcome,
        detail: None,
    }
}

/// Kills the whole process group of a spawned child, also on drop.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    #[cfg(unix)]
    fn kill(&self) {
        let Some(pgid) = self.pgid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return;
        };
        // ESRCH just means the group is already empty.
        // SAFETY: kill(2) with a negative pid only signals that process group.
        let _ = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    }

    #[cfg(not(unix))]
    fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Caps writable memory, CPU time and core dumps in the child before exec.
#[cfg(unix)]
fn apply_rlimits(command: &mut Command, limits: &ResourceLimits) {
    let memory = limits.memory_mb.saturating_mul(1024 * 1024);
    // CPU time can never usefully exceed the wall clock times the CPU share.
    let cpu_secs = ((limits.timeout_ms as f64 / 1000.0) * limits.cpus.max(1.0)).ceil() as u64;
    let cpu_secs = cpu_secs.max(1);

    // SAFETY: the closure only calls setrlimit(2), which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            // RLIMIT_DATA counts committed writable mappings, so runtimes that
            // reserve large address ranges up front still start.
            set_rlimit(libc::RLIMIT_DATA, memory, memory)?;
            set_rlimit(libc::RLIMIT_CPU, cpu_secs, cpu_secs.saturating_add(1))?;
            set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_rlimits(_command: &mut Command, _limits: &ResourceLimits) {}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;

#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, soft: u64, hard: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid out-pointer for the duration of the call.
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // An unprivileged process cannot raise its hard limit.
    let hard = (hard as libc::rlim_t).min(current.rlim_max);
    let limit = libc::rlimit {
        rlim_cur: (soft as libc::rlim_t).min(hard),
        rlim_max: hard,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> Option<i64> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .map(i64::from)
        .or_else(|| status.signal().map(|sig| 128 + i64::from(sig)))
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> Option<i64> {
    status.code().map(i64::from)
}

fn host_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| FALLBACK_PATH.to_string())
}

// First real command word of the build (or run) step, skipping env assignments.
fn tool_for(runtime: &dyn LanguageRuntime) -> String {
    let plan = runtime.commands("/tmp");
    let line = plan.compile.unwrap_or(plan.run);
    line.split_whitespace()
        .find(|word| !word.contains('='))
        .unwrap_or_default()
        .to_string()
}

fn find_on_path(tool: String) -> Option<PathBuf> {
    std::env::split_paths(&host_path())
        .map(|dir| dir.join(&tool))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LimitOverrides;

    fn limits(timeout_ms: u64, output_limit_bytes: usize) -> ResourceLimits {
        ResourceLimits {
            timeout_ms,
            memory_mb: 256,
            cpus: 1.0,
            pids: 32,
            output_limit_bytes,
        }
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    #[tokio::test]
    async fn sleeping_past_the_deadline_is_a_timeout() {
        let started = Instant::now();
        let result = supervise(sh("exec sleep 10"), &limits(200, 1024)).await;
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);
        assert_eq!(result.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_as_exited() {
        let result = supervise(sh("echo partial; echo boom >&2; exit 3"), &limits(5_000, 1024)).await;
        assert_eq!(result.outcome, ExecutionOutcome::Exited);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.text, "partial\n");
        assert_eq!(result.stderr.text, "boom\n");
        assert!(!result.is_clean_exit());
    }

    #[tokio::test]
    async fn output_past_the_ceiling_is_truncated_and_flagged() {
        let script = "i=0; while [ $i -lt 2000 ]; do printf 0123456789; i=$((i+1)); done";
        let result = supervise(sh(script), &limits(10_000, 1_000)).await;
        assert_eq!(result.outcome, ExecutionOutcome::Exited);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout.truncated);
        assert_eq!(result.stdout.total_bytes, 20_000);
        assert_eq!(result.stdout.text, "0123456789".repeat(100));
        assert!(!result.stderr.truncated);
    }

    #[tokio::test]
    async fn spawn_failure_is_sandbox_unavailable() {
        let mut command = Command::new("/definitely/not/a/real/binary");
        command.kill_on_drop(true);
        let result = supervise(command, &limits(1_000, 1024)).await;
        assert_eq!(result.outcome, ExecutionOutcome::SandboxUnavailable);
        assert!(result.detail.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn rejects_languages_that_are_not_enabled() {
        let config = SandboxConfig {
            languages: vec![Language::Python],
            ..SandboxConfig::default()
        };
        let sandbox = LocalSandbox::new(config);
        assert!(sandbox.supports(Language::Python));
        let err = sandbox
            .execute(ExecutionRequest {
                language: Language::Go,
                source: "package main".into(),
                stdin: None,
                limits: LimitOverrides::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(Language::Go)));
    }

    fn straggler(marker: &std::path::Path, then: &str) -> Command {
        sh(&format!(
            "(sleep 1; echo alive > {}) & {then}",
            marker.display()
        ))
    }

    #[tokio::test]
    async fn background_processes_die_at_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let result = supervise(straggler(&marker, "exec sleep 30"), &limits(300, 1024)).await;
        assert_eq!(result.outcome, ExecutionOutcome::TimedOut);

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn background_processes_die_when_execution_is_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let limits = limits(30_000, 1024);
        let run = supervise(straggler(&marker, "exec sleep 30"), &limits);
        assert!(tokio::time::timeout(Duration::from_millis(300), run).await.is_err());

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn background_processes_die_with_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let result = supervise(straggler(&marker, "exit 0"), &limits(5_000, 1024)).await;
        assert_eq!(result.exit_code, Some(0));

        tokio::time::sleep(Duration::from_millis(1_800)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn memory_and_cpu_rlimits_reach_the_candidate() {
        let mut command = sh("ulimit -d; ulimit -t; ulimit -c");
        let limits = ResourceLimits {
            memory_mb: 64,
            ..limits(5_000, 1024)
        };
        apply_rlimits(&mut command, &limits);
        let result = supervise(command, &limits).await;
        assert_eq!(result.exit_code, Some(0), "stderr: {}", result.stderr.text);
        assert_eq!(result.stdout.text, "65536\n5\n0\n");
    }

    #[test]
    fn tool_lookup_skips_environment_assignments() {
        assert_eq!(tool_for(Language::Go.runtime()), "go");
        assert_eq!(tool_for(Language::Python.runtime()), "python3");
        assert_eq!(tool_for(Language::Cpp.runtime()), "g++");
    }
}
