//! Access to the shared site branch.
//!
//! Every mutation follows the same shape: fresh checkout of the latest branch
//! head, change the working copy, commit, then push with rebase-and-retry.
//! A working copy belongs to exactly one operation and is discarded when dropped.

mod git;
mod retry;
pub mod tree;
mod workdir;

use std::path::Path;

use async_trait::async_trait;

use crate::error::StoreError;

pub use git::{GitStoreClient, GitWorkingCopy, Identity, StoreSettings};
pub use retry::{Backoff, PushFailure, PushReport, RetryPolicy, RetryState, push_with_retry};
pub(crate) use retry::rebase_for_retry;
pub use workdir::Workdirs;

/// Hands out per-operation working copies of the container subtree.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Check out the latest branch head, restricted to the container.
    ///
    /// `label` names the checkout directory for diagnostics.
    async fn checkout(&self, label: &str) -> Result<Box<dyn WorkingCopy>, StoreError>;

    /// Container path relative to the branch root.
    fn container(&self) -> &str;
}

/// A private, mutable view of the branch owned by one operation.
#[async_trait]
pub trait WorkingCopy: Send {
    fn root(&self) -> &Path;

    fn container(&self) -> &str;

    /// Immediate children of `rel` in the working tree, sorted.
    fn children(&self, rel: &str) -> Result<Vec<String>, StoreError> {
        list_dir(&self.root().join(rel))
    }

    /// Immediate children of `rel` in the HEAD commit, sorted.
    fn committed_children(&self, rel: &str) -> Result<Vec<String>, StoreError> {
        Ok(tree::head_children(self.root(), rel)?)
    }

    fn head_revision(&self) -> Result<String, StoreError> {
        Ok(tree::head_revision(self.root())?)
    }

    /// Stage every change under `rel`. Returns whether anything is staged there.
    async fn stage(&mut self, rel: &str) -> Result<bool, StoreError>;

    /// Stage removal of the subtree at `rel`. Returns whether anything is staged there.
    async fn stage_removal(&mut self, rel: &str) -> Result<bool, StoreError>;

    /// Stage removal of the container itself.
    ///
    /// Re-checks emptiness first and fails with
    /// [`StoreError::ContainerRepopulated`] if any child exists.
    async fn stage_container_removal(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self, message: &str) -> Result<String, StoreError>;

    /// Fold the staged changes into the last, not yet pushed, commit.
    async fn amend(&mut self, message: &str) -> Result<String, StoreError>;

    /// Fast-forward push of HEAD. Never forced.
    async fn push(&mut self) -> Result<(), StoreError>;

    /// Fetch the branch head and replay local commits onto it.
    async fn rebase(&mut self) -> Result<(), StoreError>;
}

fn list_dir(path: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) if err.kind() == std::io::ErrorKind::NotADirectory => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name != ".git" {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
