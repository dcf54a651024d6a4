//! Request and event types supplied by the event source.

use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// Identifier of the request (pull request) a deployment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(NonZeroU64);

impl RequestId {
    pub fn new(id: u64) -> Result<Self, LifecycleError> {
        NonZeroU64::new(id)
            .map(Self)
            .ok_or_else(|| LifecycleError::InvalidRequest {
                reason: "request id must be a positive integer".to_string(),
            })
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Directory name of this request's slot inside the container.
    pub fn slot_dir(self) -> String {
        self.0.to_string()
    }

    /// Slot path relative to the branch root: `<container>/<id>`.
    pub fn slot_path(self, container: &str) -> String {
        format!("{}/{}", container.trim_matches('/'), self.slot_dir())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let raw = raw.strip_prefix('#').unwrap_or(raw);
        let id: u64 = raw.parse().map_err(|_| LifecycleError::InvalidRequest {
            reason: format!("malformed request id: '{}'", s),
        })?;
        Self::new(id)
    }
}

/// A request as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub title: String,
    pub head_revision: String,
}

impl Request {
    /// Build a request, rejecting missing metadata before anything touches the store.
    pub fn new(
        id: RequestId,
        title: impl Into<String>,
        head_revision: impl Into<String>,
    ) -> Result<Self, LifecycleError> {
        let request = Self {
            id,
            title: title.into(),
            head_revision: head_revision.into(),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.title.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest {
                reason: format!("request {} has an empty title", self.id),
            });
        }
        let head = self.head_revision.trim();
        if head.is_empty() {
            return Err(LifecycleError::InvalidRequest {
                reason: format!("request {} has no head revision", self.id),
            });
        }
        if !head.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LifecycleError::InvalidRequest {
                reason: format!(
                    "request {} head revision is not a commit hash: '{}'",
                    self.id, head
                ),
            });
        }
        Ok(())
    }

    /// Abbreviated head revision for commit messages.
    pub fn short_head(&self) -> &str {
        let head = self.head_revision.trim();
        &head[..head.len().min(7)]
    }
}

/// Why a slot is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupReason {
    #[default]
    Closed,
    Manual,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupReason::Closed => write!(f, "request closed"),
            CleanupReason::Manual => write!(f, "manual cleanup"),
        }
    }
}

/// Inbound lifecycle trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestOpenedOrUpdated {
        id: RequestId,
        title: String,
        head_revision: String,
    },
    RequestClosed {
        id: RequestId,
    },
}

impl LifecycleEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            LifecycleEvent::RequestOpenedOrUpdated { id, .. } => *id,
            LifecycleEvent::RequestClosed { id } => *id,
        }
    }
}

/// Kind of gated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Publish,
    Cleanup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Publish => write!(f, "publish"),
            Operation::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Unique identifier of one lifecycle operation, embedded in commits for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// First eight hex digits, enough to tell operations apart in a log.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
