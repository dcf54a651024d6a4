//! Preview Core Library
//!
//! Publishes per-request preview deployments into slots of a shared
//! git branch and retires them when the request closes, removing the
//! preview container once no slot remains.

pub mod artifact;
pub mod config;
pub mod controller;
pub mod error;
pub mod gate;
pub mod notify;
pub mod publish;
pub mod reconcile;
pub mod store;
pub mod types;
pub mod urls;
pub mod verify;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{PreviewConfig, load_config, parse_config_str};

    // Lifecycle
    pub use crate::controller::{Controller, ControllerSettings};
    pub use crate::error::{LifecycleError, Step, StoreError};
    pub use crate::gate::{ConcurrencyGate, GateTicket};
    pub use crate::publish::{PublishOutcome, Publisher};
    pub use crate::reconcile::{CleanupOutcome, Reconciler};
    pub use crate::types::{
        CleanupReason, LifecycleEvent, Operation, OperationId, Request, RequestId,
    };

    // Artifacts
    pub use crate::artifact::{Artifact, SizeMetrics};

    // Store
    pub use crate::store::{
        Backoff, GitStoreClient, RetryPolicy, StoreClient, StoreSettings, WorkingCopy,
    };

    // Verification and reporting
    pub use crate::notify::{JsonLinesNotifier, LifecycleReport, LogNotifier, Notifier, Outcome};
    pub use crate::urls::DeploymentUrls;
    pub use crate::verify::{HttpProbe, Probe, Verifier, VerifyPolicy};
}
