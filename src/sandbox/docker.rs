//! Docker backend: one throwaway container per candidate.
//!
//! The container has no network, a read-only root filesystem, all capabilities
//! dropped, and memory, CPU and pid ceilings. The work dir is bind-mounted
//! read-only and `/tmp` is a small tmpfs for compiler output. The wall-clock
//! deadline is enforced here, not by the language runtime: a container still
//! running at the deadline is killed and reported as `TimedOut`.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use futures_util::stream::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::output::BoundedOutput;
use super::{
    ExecutionOutcome, ExecutionRequest, ExecutionResult, ResourceLimits, STDIN_FILE, Sandbox,
    SandboxError, SandboxHealth, prepare_workspace,
};
use crate::config::SandboxConfig;
use crate::language::Language;

const WORK_DIR: &str = "/sandbox";
const BUILD_DIR: &str = "/tmp";
const NOBODY: &str = "65534:65534";

/// How long the log stream may keep delivering after the container stopped.
const LOG_GRACE: Duration = Duration::from_secs(2);

const LATE_CREATE_RETRY: Duration = Duration::from_secs(1);

pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
}

impl DockerSandbox {
    /// Connects to the local Docker daemon (socket or `DOCKER_HOST`).
    pub fn connect(config: SandboxConfig) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Backend(e.to_string()))?;
        Ok(Self::with_client(docker, config))
    }

    pub fn with_client(docker: Docker, config: SandboxConfig) -> Self {
        Self { docker, config }
    }

    fn container_body(
        &self,
        language: Language,
        host_dir: &str,
        limits: &ResourceLimits,
    ) -> ContainerCreateBody {
        let runtime = language.runtime();
        let script = runtime.shell_script(BUILD_DIR, &format!("{WORK_DIR}/{STDIN_FILE}"));
        let memory = limits.memory_bytes();

        ContainerCreateBody {
            image: Some(self.config.image_for(language)),
            cmd: Some(vec!["/bin/sh".into(), "-c".into(), script]),
            working_dir: Some(WORK_DIR.to_string()),
            user: Some(NOBODY.to_string()),
            env: Some(vec![format!("HOME={BUILD_DIR}")]),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{host_dir}:{WORK_DIR}:ro")]),
                network_mode: Some("none".to_string()),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(limits.nano_cpus()),
                pids_limit: Some(i64::from(limits.pids)),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(HashMap::from([(
                    BUILD_DIR.to_string(),
                    "rw,exec,nosuid,nodev,size=128m,mode=1777".to_string(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_container(
        &self,
        request: &ExecutionRequest,
        host_dir: &str,
        limits: &ResourceLimits,
    ) -> ExecutionResult {
        let name = format!("codeloop-{}", Uuid::new_v4());
        let body = self.container_body(request.language, host_dir, limits);
        let options = Some(CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        });

        // Armed before the request: the daemon may create the container even
        // if this future is dropped while the call is in flight.
        let guard = ContainerGuard::new(self.docker.clone(), name.clone());
        if let Err(e) = self.docker.create_container(options, body).await {
            guard.remove().await;
            return ExecutionResult::unavailable(format!("failed to create container: {e}"));
        }

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions>)
            .await
        {
            guard.remove().await;
            return ExecutionResult::unavailable(format!("failed to start container: {e}"));
        }
        let started = Instant::now();
        debug!(container = %name, language = %request.language, "container started");

        let mut stdout = BoundedOutput::new(limits.output_limit_bytes);
        let mut stderr = BoundedOutput::new(limits.output_limit_bytes);
        let waited = {
            let logs = drain_logs(self.follow_logs(&name), &mut stdout, &mut stderr);
            tokio::pin!(logs);
            let wait = self.wait_with_deadline(&name, limits);
            tokio::pin!(wait);

            let mut logs_done = false;
            let waited = loop {
                tokio::select! {
                    waited = &mut wait => break waited,
                    () = &mut logs, if !logs_done => logs_done = true,
                }
            };
            if !logs_done && tokio::time::timeout(LOG_GRACE, &mut logs).await.is_err() {
                warn!(container = %name, "log stream did not end after the container stopped");
            }
            waited
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        guard.remove().await;

        let (exit_code, outcome) = match waited {
            Ok(done) => done,
            Err(detail) => return ExecutionResult::unavailable(detail),
        };
        ExecutionResult {
            exit_code,
            stdout: stdout.finish(),
            stderr: stderr.finish(),
            duration_ms,
            outcome,
            detail: None,
        }
    }

    /// Waits for the container to exit, killing it at the deadline.
    async fn wait_with_deadline(
        &self,
        name: &str,
        limits: &ResourceLimits,
    ) -> Result<(Option<i64>, ExecutionOutcome), String> {
        let mut wait = self.docker.wait_container(name, None::<WaitContainerOptions>);
        match tokio::time::timeout(limits.timeout(), wait.next()).await {
            Ok(Some(Ok(response))) => Ok((Some(response.status_code), ExecutionOutcome::Exited)),
            // bollard reports a non-zero exit as a wait error carrying the code.
            Ok(Some(Err(BollardError::DockerContainerWaitError { code, .. }))) => {
                Ok((Some(code), ExecutionOutcome::Exited))
            }
            Ok(Some(Err(e))) => Err(format!("failed to wait for container: {e}")),
            Ok(None) => Err("container wait stream ended unexpectedly".to_string()),
            Err(_) => {
                info!(container = %name, timeout_ms = limits.timeout_ms, "container hit the deadline, killing");
                if let Err(e) = self
                    .docker
                    .kill_container(name, None::<KillContainerOptions>)
                    .await
                {
                    warn!(container = %name, error = %e, "failed to kill timed-out container");
                }
                Ok((None, ExecutionOutcome::TimedOut))
            }
        }
    }

    /// Live stdout/stderr of a running container, from its first byte.
    fn follow_logs(
        &self,
        name: &str,
    ) -> impl Stream<Item = Result<LogOutput, BollardError>> {
        let options = Some(LogsOptions {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });
        self.docker.logs(name, options)
    }
}

/// Feeds a container log stream into the bounded buffers until it ends.
/// The head of each stream is kept; the rest is only counted.
async fn drain_logs<S>(logs: S, stdout: &mut BoundedOutput, stderr: &mut BoundedOutput)
where
    S: Stream<Item = Result<LogOutput, BollardError>>,
{
    tokio::pin!(logs);
    while let Some(entry) = logs.next().await {
        match entry {
            Ok(LogOutput::StdOut { message }) => stdout.push(&message),
            Ok(LogOutput::StdErr { message }) => stderr.push(&message),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to read container logs");
                break;
            }
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
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
        let host_dir = workspace.path().to_string_lossy().into_owned();

        let result = self.run_container(&request, &host_dir, &limits).await;
        drop(workspace);
        Ok(result)
    }

    async fn health(&self) -> SandboxHealth {
        let (available, detail) = match self.docker.ping().await {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        let mut runtimes = BTreeMap::new();
        for &language in &self.config.languages {
            let present = available
                && self
                    .docker
                    .inspect_image(&self.config.image_for(language))
                    .await
                    .is_ok();
            runtimes.insert(language, present);
        }
        SandboxHealth {
            backend: "docker",
            available,
            detail,
            runtimes,
        }
    }
}

/// Force-removes its container exactly once.
///
/// Holds the container name, so it can be armed before the container exists.
/// Normal paths call [`ContainerGuard::remove`]. If the owning future is
/// dropped first (job cancelled), `Drop` hands the removal to the runtime.
struct ContainerGuard {
    docker: Docker,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id: Some(id),
        }
    }

    async fn remove(mut self) {
        if let Some(id) = self.id.take() {
            remove_container(&self.docker, &id).await;
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let docker = self.docker.clone();
                handle.spawn(async move {
                    if !remove_container(&docker, &id).await {
                        // A create call cut short can still land after the first attempt.
                        tokio::time::sleep(LATE_CREATE_RETRY).await;
                        remove_container(&docker, &id).await;
                    }
                });
            }
            Err(_) => warn!(container = %id, "no runtime available to remove abandoned container"),
        }
    }
}

/// Returns false when the daemon did not know the container.
async fn remove_container(docker: &Docker, id: &str) -> bool {
    let options = Some(RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    });
    match docker.remove_container(id, options).await {
        Ok(()) => {
            debug!(container = %id, "container removed");
            true
        }
        Err(BollardError::DockerResponseServerError {
            status_code: 404, ..
        }) => {
            debug!(container = %id, "container not found");
            false
        }
        Err(e) => {
            warn!(container = %id, error = %e, "failed to remove container");
            true
        }
    }
}
