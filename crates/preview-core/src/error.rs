//! Error types for store access and lifecycle operations.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::notify::Outcome;
use crate::types::RequestId;

/// Failures reported by the store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Push refused because the branch moved underneath us.
    #[error("push rejected as non-fast-forward: {message}")]
    Rejected { message: String },

    /// Network or lock contention failure that may succeed on retry.
    #[error("transient failure during git {op}: {message}")]
    Transient { op: String, message: String },

    #[error("branch '{branch}' does not exist on the remote")]
    BranchMissing { branch: String },

    /// The container gained children between the emptiness check and its removal.
    #[error("container '{container}' was repopulated ({children} entries)")]
    ContainerRepopulated { container: String, children: usize },

    #[error("git {op} failed: {message}")]
    Command { op: String, message: String },

    #[error("failed to inspect store revision: {0}")]
    Inspect(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether a push/checkout that failed this way may be retried after a rebase.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Rejected { .. } | StoreError::Transient { .. }
        )
    }
}

/// Step of a lifecycle operation at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Validate,
    Acquire,
    Checkout,
    CheckSlot,
    Stage,
    Commit,
    CheckContainer,
    RemoveContainer,
    Push,
    Verify,
    List,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Validate => "validate",
            Step::Acquire => "acquire",
            Step::Checkout => "checkout",
            Step::CheckSlot => "check-slot",
            Step::Stage => "stage",
            Step::Commit => "commit",
            Step::CheckContainer => "check-container",
            Step::RemoveContainer => "remove-container",
            Step::Push => "push",
            Step::Verify => "verify",
            Step::List => "list",
        };
        f.write_str(name)
    }
}

/// Fatal outcome of a lifecycle operation.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("artifact for request {request_id} is missing or empty: {detail}")]
    ArtifactMissing {
        request_id: RequestId,
        detail: String,
    },

    #[error(
        "push for request {request_id} failed after {attempts} attempt(s) at step {step}: {source}; \
         to recover, delete the slot manually and push"
    )]
    PushFailed {
        request_id: RequestId,
        step: Step,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("timed out after {waited:?} waiting for another operation on request {request_id}")]
    GateTimeout {
        request_id: RequestId,
        waited: Duration,
    },

    #[error("operation on request {request_id} aborted after {after:?}")]
    Timeout {
        request_id: RequestId,
        after: Duration,
    },

    #[error("store failure for request {request_id} at step {step}: {source}")]
    Store {
        request_id: RequestId,
        step: Step,
        #[source]
        source: StoreError,
    },
}

impl LifecycleError {
    pub(crate) fn store(request_id: RequestId, step: Step) -> impl FnOnce(StoreError) -> Self {
        move |source| LifecycleError::Store {
            request_id,
            step,
            source,
        }
    }

    /// Outcome code surfaced to the notifier.
    pub fn outcome(&self) -> Outcome {
        match self {
            LifecycleError::ArtifactMissing { .. } => Outcome::ArtifactMissing,
            LifecycleError::PushFailed { .. } => Outcome::PushFailed,
            LifecycleError::GateTimeout { .. } => Outcome::GateTimeout,
            LifecycleError::InvalidRequest { .. }
            | LifecycleError::Timeout { .. }
            | LifecycleError::Store { .. } => Outcome::Failed,
        }
    }

    /// Step at which the operation stopped, when known.
    pub fn step(&self) -> Option<Step> {
        match self {
            LifecycleError::InvalidRequest { .. } | LifecycleError::ArtifactMissing { .. } => {
                Some(Step::Validate)
            }
            LifecycleError::GateTimeout { .. } => Some(Step::Acquire),
            LifecycleError::PushFailed { step, .. } | LifecycleError::Store { step, .. } => {
                Some(*step)
            }
            LifecycleError::Timeout { .. } => None,
        }
    }
}
