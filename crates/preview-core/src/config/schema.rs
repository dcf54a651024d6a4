//! Configuration schema for preview.toml
//!
//! Only `store.remote`, `site.owner` and `site.site` are required; every other
//! field has a default suited to a GitHub Pages style host.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{Backoff, RetryPolicy};
use crate::urls::DeploymentUrls;
use crate::verify::VerifyPolicy;

use super::paths::default_work_dir;

/// Root configuration structure for preview.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    pub store: StoreConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    pub site: SiteConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub gate: GateConfig,

    #[serde(default)]
    pub operation: OperationConfig,
}

/// Location of the shared site branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Git URL or local path of the site repository
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Directory holding all preview slots, relative to the branch root
    #[serde(default = "default_container")]
    pub container: String,

    /// Scratch space for per-operation checkouts
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

fn default_branch() -> String {
    "gh-pages".to_string()
}

fn default_container() -> String {
    "pr-preview".to_string()
}

/// Author/committer identity stamped on every commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_name")]
    pub name: String,
    #[serde(default = "default_identity_email")]
    pub email: String,
}

fn default_identity_name() -> String {
    "preview-bot".to_string()
}

fn default_identity_email() -> String {
    "preview-bot@users.noreply.github.com".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            email: default_identity_email(),
        }
    }
}

/// Public hosting coordinates: `https://<owner>.<host>/<site>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub owner: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub site: String,
}

fn default_host() -> String {
    "github.io".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_verify_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_inter_delay")]
    pub inter_delay_secs: u64,
    #[serde(default = "default_initial_wait")]
    pub initial_wait_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_verify_attempts() -> u32 {
    10
}

fn default_inter_delay() -> u64 {
    10
}

fn default_initial_wait() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_verify_attempts(),
            inter_delay_secs: default_inter_delay(),
            initial_wait_secs: default_initial_wait(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_acquire_timeout() -> u64 {
    600
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default = "default_operation_timeout")]
    pub timeout_secs: u64,
}

fn default_operation_timeout() -> u64 {
    900
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_operation_timeout(),
        }
    }
}

impl PreviewConfig {
    /// Minimal configuration for a remote and site; everything else defaulted.
    pub fn new(remote: impl Into<String>, owner: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            store: StoreConfig {
                remote: remote.into(),
                branch: default_branch(),
                container: default_container(),
                work_dir: None,
            },
            identity: IdentityConfig::default(),
            site: SiteConfig {
                owner: owner.into(),
                host: default_host(),
                site: site.into(),
            },
            retry: RetryConfig::default(),
            verify: VerifyConfig::default(),
            gate: GateConfig::default(),
            operation: OperationConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.remote.trim().is_empty() {
            anyhow::bail!("store.remote must not be empty");
        }
        if self.store.branch.trim().is_empty() {
            anyhow::bail!("store.branch must not be empty");
        }
        validate_container(&self.store.container)?;
        if self.site.owner.trim().is_empty() || self.site.site.trim().is_empty() {
            anyhow::bail!("site.owner and site.site must not be empty");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.verify.max_attempts == 0 {
            anyhow::bail!("verify.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn work_dir(&self) -> PathBuf {
        self.store.work_dir.clone().unwrap_or_else(default_work_dir)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            delay: Duration::from_millis(self.retry.delay_ms),
            backoff: self.retry.backoff,
        }
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            max_attempts: self.verify.max_attempts,
            inter_delay: Duration::from_secs(self.verify.inter_delay_secs),
            initial_wait: Duration::from_secs(self.verify.initial_wait_secs),
            request_timeout: Duration::from_secs(self.verify.request_timeout_secs),
        }
    }

    pub fn urls(&self) -> anyhow::Result<DeploymentUrls> {
        DeploymentUrls::new(
            &self.site.owner,
            &self.site.host,
            &self.site.site,
            &self.store.container,
        )
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate.acquire_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation.timeout_secs)
    }
}

fn validate_container(container: &str) -> anyhow::Result<()> {
    let trimmed = container.trim_matches('/');
    if trimmed.is_empty() {
        anyhow::bail!("store.container must name a directory below the branch root");
    }
    let path = Path::new(container);
    if path.is_absolute() {
        anyhow::bail!("store.container must be relative: {}", container);
    }
    for component in path.components() {
        if !matches!(component, Component::Normal(_)) {
            anyhow::bail!("store.container must not contain '.' or '..': {}", container);
        }
    }
    Ok(())
}
