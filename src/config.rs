//! Configuration loaded from `codeloop.toml`.
//!
//! Every field has a serde default, so a missing file or a partial file both
//! yield a usable [`CodeloopConfig`]. `CODELOOP_CONFIG` points at another file,
//! and `ANTHROPIC_API_KEY` takes precedence over the file for the API key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::agent::FeedbackLimits;
use crate::language::Language;
use crate::sandbox::ResourceLimits;
use crate::state_machine::RetryConfig;

const DEFAULT_PATH: &str = "codeloop.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeloopConfig {
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub feedback: FeedbackLimits,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry ceilings shared by all jobs unless a task overrides `max_attempts`.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Maximum attempts per job before it is marked exhausted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Transparent retries for infrastructure failures, counted separately.
    #[serde(default = "default_max_infra_retries")]
    pub max_infra_retries: u32,
    /// Base delay for the exponential backoff between infrastructure retries.
    #[serde(default = "default_infra_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_infra_retries() -> u32 {
    2
}

fn default_infra_delay_ms() -> u64 {
    500
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_infra_retries: default_max_infra_retries(),
            base_delay_ms: default_infra_delay_ms(),
        }
    }
}

impl RetrySection {
    pub fn infra_backoff(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_infra_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}

/// Concurrency ceilings for running jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_max_jobs_per_user")]
    pub max_jobs_per_user: usize,
    /// How long `acquire` may wait for process-wide capacity. Zero rejects at once.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_max_jobs_per_user() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    2000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_jobs_per_user: default_max_jobs_per_user(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Per-user submission quota; unset `max_jobs_per_window` means unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub max_jobs_per_window: Option<u32>,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    3600
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_window: None,
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Docker,
    Local,
}

/// Sandbox backend selection and process-wide default limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_backend")]
    pub backend: SandboxBackend,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    #[serde(default = "default_pids")]
    pub pids: u32,
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    /// Languages accepted at submission.
    #[serde(default = "default_languages")]
    pub languages: Vec<Language>,
    /// Image overrides keyed by language name, e.g. `python = "python:3.12-slim"`.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

fn default_backend() -> SandboxBackend {
    SandboxBackend::Docker
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_memory_mb() -> u64 {
    512
}

fn default_cpus() -> f64 {
    1.0
}

fn default_pids() -> u32 {
    64
}

fn default_output_limit_bytes() -> usize {
    64 * 1024
}

fn default_languages() -> Vec<Language> {
    Language::ALL.to_vec()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_ms: default_timeout_ms(),
            memory_mb: default_memory_mb(),
            cpus: default_cpus(),
            pids: default_pids(),
            output_limit_bytes: default_output_limit_bytes(),
            languages: default_languages(),
            images: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn default_limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout_ms: self.timeout_ms,
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            pids: self.pids,
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    pub fn image_for(&self, language: Language) -> String {
        self.images
            .get(language.as_str())
            .cloned()
            .unwrap_or_else(|| language.runtime().image().to_string())
    }
}

/// LLM settings for the generation agent.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Internal retries of the LLM call before reporting it unavailable.
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

// Low temperature keeps code generation consistent between attempts.
fn default_temperature() -> f32 {
    0.2
}

fn default_generation_retries() -> u32 {
    3
}

fn default_generation_delay_ms() -> u64 {
    1000
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_generation_retries(),
            base_delay_ms: default_generation_delay_ms(),
        }
    }
}

impl GenerationConfig {
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }
}

/// Review settings. The semantic judge is only consulted for tasks without
/// an expected output.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    #[serde(default)]
    pub semantic_judge: bool,
    #[serde(default = "default_judge_model")]
    pub model: String,
}

fn default_judge_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            semantic_judge: false,
            model: default_judge_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".codeloop/jobs")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl CodeloopConfig {
    /// Loads `$CODELOOP_CONFIG` or `codeloop.toml` from the current directory,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CODELOOP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<CodeloopConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Environment takes precedence over the file for the API key.
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.generation.api_key = key;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.admission.max_concurrent_jobs == 0 || self.admission.max_jobs_per_user == 0 {
            bail!("admission ceilings must be at least 1");
        }
        if self.sandbox.languages.is_empty() {
            bail!("sandbox.languages must enable at least one language");
        }
        if self.sandbox.timeout_ms == 0 || self.sandbox.output_limit_bytes == 0 {
            bail!("sandbox.timeout_ms and sandbox.output_limit_bytes must be positive");
        }
        if self.sandbox.memory_mb == 0 || self.sandbox.pids == 0 {
            bail!("sandbox.memory_mb and sandbox.pids must be positive");
        }
        if self.sandbox.cpus.is_nan() || self.sandbox.cpus <= 0.0 {
            bail!("sandbox.cpus must be positive");
        }
        for name in self.sandbox.images.keys() {
            name.parse::<Language>()
                .with_context(|| format!("sandbox.images.{name}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = CodeloopConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_infra_retries, 2);
        assert_eq!(config.admission.max_concurrent_jobs, 8);
        assert_eq!(config.admission.max_jobs_per_user, 2);
        assert_eq!(config.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(config.sandbox.languages.len(), 6);
        assert!(config.quota.max_jobs_per_window.is_none());
        assert!(!config.review.semantic_judge);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [retry]
            max_attempts = 5

            [sandbox]
            backend = "local"
            languages = ["python", "go"]
            timeout_ms = 2000

            [sandbox.images]
            python = "python:3.12-slim"
        "#;
        let config: CodeloopConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_infra_retries, 2);
        assert_eq!(config.sandbox.backend, SandboxBackend::Local);
        assert_eq!(config.sandbox.languages, vec![Language::Python, Language::Go]);
        assert_eq!(config.sandbox.default_limits().timeout_ms, 2000);
        assert_eq!(config.sandbox.image_for(Language::Python), "python:3.12-slim");
        assert_eq!(config.sandbox.image_for(Language::Go), "golang:1.21-alpine");
        assert_eq!(config.generation.max_tokens, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_zero_ceilings() {
        let mut config = CodeloopConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = CodeloopConfig::default();
        config.admission.max_jobs_per_user = 0;
        assert!(config.validate().is_err());

        let mut config = CodeloopConfig::default();
        config.sandbox.languages.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_sandbox_resources() {
        let mut config = CodeloopConfig::default();
        config.sandbox.memory_mb = 0;
        assert!(config.validate().is_err());

        let mut config = CodeloopConfig::default();
        config.sandbox.pids = 0;
        assert!(config.validate().is_err());

        let mut config = CodeloopConfig::default();
        config.sandbox.cpus = 0.0;
        assert!(config.validate().is_err());

        let mut config = CodeloopConfig::default();
        config.sandbox.cpus = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_unknown_image_keys() {
        let mut config = CodeloopConfig::default();
        config
            .sandbox
            .images
            .insert("cobol".to_string(), "cobol:latest".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CodeloopConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn load_from_file_reads_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codeloop.toml");
        std::fs::write(&path, "[admission]\nmax_concurrent_jobs = 1\n").unwrap();
        let config = CodeloopConfig::load_from(&path).unwrap();
        assert_eq!(config.admission.max_concurrent_jobs, 1);
    }
}
