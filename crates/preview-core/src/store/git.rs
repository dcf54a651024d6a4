//! Store client backed by the git command line.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::StoreError;

use super::retry::RetryPolicy;
use super::workdir::Workdirs;
use super::{StoreClient, WorkingCopy};

const GIT_ENV_OVERRIDES: [&str; 4] = [
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_COMMON_DIR",
];

/// Output fragments git prints when a push lost a race for the branch head.
const REJECTED_MARKERS: [&str; 6] = [
    "non-fast-forward",
    "fetch first",
    "[rejected]",
    "cannot lock ref",
    "failed to update ref",
    "incorrect old value",
];

const TRANSIENT_MARKERS: [&str; 9] = [
    "could not resolve host",
    "connection timed out",
    "connection reset",
    "operation timed out",
    "early eof",
    "the remote end hung up unexpectedly",
    "rpc failed",
    "502",
    "503",
];

/// Commit author and committer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub remote: String,
    pub branch: String,
    pub container: String,
    pub work_dir: PathBuf,
    pub identity: Identity,
    /// Applied to transient checkout failures
    pub retry: RetryPolicy,
}

#[derive(Debug)]
pub struct GitStoreClient {
    settings: StoreSettings,
    workdirs: Workdirs,
    git_checked: OnceCell<()>,
}

impl GitStoreClient {
    pub fn new(settings: StoreSettings) -> Self {
        let workdirs = Workdirs::new(settings.work_dir.clone());
        Self {
            settings,
            workdirs,
            git_checked: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Ensure git version is 2.25+ (required for sparse checkout).
    pub async fn ensure_git_version() -> Result<(), StoreError> {
        let output = run_git(None, &["--version"], "version").await?;
        let version = output
            .stdout
            .split_whitespace()
            .nth(2)
            .ok_or_else(|| command_error("version", &output.stdout))?
            .to_string();
        let mut parts = version.split('.').map(|p| p.parse::<u32>());
        let (Some(Ok(major)), Some(Ok(minor))) = (parts.next(), parts.next()) else {
            return Err(command_error("version", &format!("unparsable version {}", version)));
        };
        if major > 2 || (major == 2 && minor >= 25) {
            return Ok(());
        }
        Err(command_error(
            "version",
            "git 2.25+ is required for sparse checkout; please upgrade git",
        ))
    }

    async fn clone_into(&self, dir: &Path) -> Result<(), StoreError> {
        let dir_str = path_arg(dir)?;
        run_git(
            None,
            &[
                "clone",
                "--quiet",
                "--depth",
                "1",
                "--sparse",
                "--single-branch",
                "--no-tags",
                "--branch",
                &self.settings.branch,
                &self.settings.remote,
                dir_str,
            ],
            "clone",
        )
        .await
        .map(|_| ())
        .map_err(|err| self.branch_missing_or(err))
    }

    fn branch_missing_or(&self, err: StoreError) -> StoreError {
        if let StoreError::Command { message, .. } = &err {
            let lower = message.to_lowercase();
            if (lower.contains("remote branch") && lower.contains("not found"))
                || lower.contains("couldn't find remote ref")
            {
                return StoreError::BranchMissing {
                    branch: self.settings.branch.clone(),
                };
            }
        }
        err
    }
}

#[async_trait]
impl StoreClient for GitStoreClient {
    async fn checkout(&self, label: &str) -> Result<Box<dyn WorkingCopy>, StoreError> {
        self.git_checked
            .get_or_try_init(Self::ensure_git_version)
            .await?;

        // The working copy owns the directory from allocation on, so a failed
        // or abandoned clone is removed on drop.
        let working_copy = GitWorkingCopy {
            dir: self.workdirs.allocate(label)?,
            branch: self.settings.branch.clone(),
            container: self.settings.container.clone(),
            identity: self.settings.identity.clone(),
        };
        let mut retry = self.settings.retry.start();
        loop {
            match self.clone_into(&working_copy.dir).await {
                Ok(()) => break,
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    retry.failed(err).await?;
                    reset_dir(&working_copy.dir);
                }
            }
        }

        run_git(
            Some(&working_copy.dir),
            &["sparse-checkout", "set", &working_copy.container],
            "sparse-checkout",
        )
        .await?;
        tracing::debug!(
            dir = %working_copy.dir.display(),
            branch = %working_copy.branch,
            "checked out store"
        );
        Ok(Box::new(working_copy))
    }

    fn container(&self) -> &str {
        &self.settings.container
    }
}

/// Sparse, shallow clone of the branch; deleted from disk on drop.
#[derive(Debug)]
pub struct GitWorkingCopy {
    dir: PathBuf,
    branch: String,
    container: String,
    identity: Identity,
}

impl GitWorkingCopy {
    fn identity_args(&self) -> [String; 6] {
        [
            "-c".to_string(),
            format!("user.name={}", self.identity.name),
            "-c".to_string(),
            format!("user.email={}", self.identity.email),
            "-c".to_string(),
            "commit.gpgsign=false".to_string(),
        ]
    }

    async fn git(&self, args: &[&str], op: &str) -> Result<GitOutput, StoreError> {
        run_git(Some(&self.dir), args, op).await
    }

    async fn git_as_identity(&self, args: &[&str], op: &str) -> Result<GitOutput, StoreError> {
        let identity = self.identity_args();
        let mut full: Vec<&str> = identity.iter().map(String::as_str).collect();
        full.extend_from_slice(args);
        run_git(Some(&self.dir), &full, op).await
    }

    /// `git diff --cached --quiet` exits 1 when something is staged.
    async fn has_staged_changes(&self, rel: &str) -> Result<bool, StoreError> {
        let output = git_command(Some(&self.dir))
            .args(["diff", "--cached", "--quiet", "--", rel])
            .output()
            .await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(command_error(
                "diff",
                String::from_utf8_lossy(&output.stderr).trim(),
            )),
        }
    }
}

#[async_trait]
impl WorkingCopy for GitWorkingCopy {
    fn root(&self) -> &Path {
        &self.dir
    }

    fn container(&self) -> &str {
        &self.container
    }

    async fn stage(&mut self, rel: &str) -> Result<bool, StoreError> {
        self.git(&["add", "--all", "--", rel], "add").await?;
        self.has_staged_changes(rel).await
    }

    async fn stage_removal(&mut self, rel: &str) -> Result<bool, StoreError> {
        self.git(
            &["rm", "-r", "-q", "--ignore-unmatch", "--", rel],
            "rm",
        )
        .await?;
        let leftover = self.dir.join(rel);
        if leftover.exists() {
            std::fs::remove_dir_all(&leftover)?;
        }
        self.has_staged_changes(rel).await
    }

    async fn stage_container_removal(&mut self) -> Result<(), StoreError> {
        let container = self.container.clone();
        let remaining = self.children(&container)?;
        if !remaining.is_empty() {
            return Err(StoreError::ContainerRepopulated {
                container,
                children: remaining.len(),
            });
        }
        self.git(
            &["rm", "-r", "-q", "--cached", "--ignore-unmatch", "--", &container],
            "rm",
        )
        .await?;
        let path = self.dir.join(&container);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    async fn commit(&mut self, message: &str) -> Result<String, StoreError> {
        self.git_as_identity(&["commit", "--quiet", "-m", message], "commit")
            .await?;
        self.head_revision()
    }

    async fn amend(&mut self, message: &str) -> Result<String, StoreError> {
        self.git_as_identity(
            &["commit", "--quiet", "--amend", "--allow-empty", "-m", message],
            "commit",
        )
        .await?;
        self.head_revision()
    }

    async fn push(&mut self) -> Result<(), StoreError> {
        let refspec = format!("HEAD:refs/heads/{}", self.branch);
        self.git(&["push", "--quiet", "origin", &refspec], "push")
            .await
            .map(|_| ())
    }

    async fn rebase(&mut self) -> Result<(), StoreError> {
        let fetch_spec = format!(
            "+refs/heads/{branch}:refs/remotes/origin/{branch}",
            branch = self.branch
        );
        self.git(&["fetch", "--quiet", "origin", &fetch_spec], "fetch")
            .await?;
        let upstream = format!("refs/remotes/origin/{}", self.branch);
        match self
            .git_as_identity(&["rebase", "--quiet", &upstream], "rebase")
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Err(abort) = self.git(&["rebase", "--abort"], "rebase").await {
                    tracing::warn!(error = %abort, "rebase --abort failed");
                }
                Err(err)
            }
        }
    }
}

impl Drop for GitWorkingCopy {
    fn drop(&mut self) {
        discard_dir(&self.dir);
    }
}

#[derive(Debug)]
struct GitOutput {
    stdout: String,
}

fn git_command(cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new("git");
    for key in GIT_ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd.env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}

/// Run a git command, classifying failures for the retry policy.
async fn run_git(cwd: Option<&Path>, args: &[&str], op: &str) -> Result<GitOutput, StoreError> {
    tracing::debug!(?args, "git");
    let output = git_command(cwd).args(args).output().await?;
    if output.status.success() {
        return Ok(GitOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        });
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let message = [stderr.trim(), stdout.trim()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");
    Err(classify_failure(op, &message))
}

fn classify_failure(op: &str, message: &str) -> StoreError {
    let lower = message.to_lowercase();
    if op == "push" && REJECTED_MARKERS.iter().any(|m| lower.contains(m)) {
        return StoreError::Rejected {
            message: message.to_string(),
        };
    }
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return StoreError::Transient {
            op: op.to_string(),
            message: message.to_string(),
        };
    }
    command_error(op, message)
}

fn command_error(op: &str, message: impl Into<String>) -> StoreError {
    StoreError::Command {
        op: op.to_string(),
        message: message.into(),
    }
}

fn path_arg(path: &Path) -> Result<&str, StoreError> {
    path.to_str()
        .ok_or_else(|| command_error("checkout", format!("non UTF-8 path: {}", path.display())))
}

/// Delete a checkout directory; an already missing one is fine.
fn discard_dir(dir: &Path) {
    if let Err(err) = std::fs::remove_dir_all(dir)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(dir = %dir.display(), error = %err, "failed to discard checkout");
    }
}

/// Empty a checkout directory after a failed clone so the next attempt starts clean.
fn reset_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => std::fs::remove_dir_all(&path),
            _ => std::fs::remove_file(&path),
        };
        if let Err(err) = removed {
            tracing::warn!(path = %path.display(), error = %err, "failed to reset checkout");
        }
    }
}
