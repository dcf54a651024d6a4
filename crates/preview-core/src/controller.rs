//! Entry point for lifecycle events.
//!
//! Every operation runs behind the per-request gate and under an overall
//! timeout. Verification happens after the gate is released, so a slow
//! propagation check never holds up the request's next event.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::artifact::Artifact;
use crate::config::PreviewConfig;
use crate::error::{LifecycleError, StoreError, Step};
use crate::gate::ConcurrencyGate;
use crate::notify::{LifecycleReport, Notifier, Outcome};
use crate::publish::{PublishOutcome, Publisher};
use crate::reconcile::{CleanupOutcome, Reconciler};
use crate::store::{GitStoreClient, Identity, RetryPolicy, StoreClient, StoreSettings};
use crate::types::{CleanupReason, LifecycleEvent, Operation, OperationId, Request, RequestId};
use crate::urls::DeploymentUrls;
use crate::verify::{HttpProbe, Probe, Verifier, VerifyPolicy};

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub retry: RetryPolicy,
    /// `None` skips verification; publishes then report `published`
    pub verify: Option<VerifyPolicy>,
    pub gate_timeout: Duration,
    pub operation_timeout: Duration,
    pub urls: DeploymentUrls,
}

impl ControllerSettings {
    pub fn from_config(config: &PreviewConfig) -> anyhow::Result<Self> {
        Ok(Self {
            retry: config.retry_policy(),
            verify: config.verify.enabled.then(|| config.verify_policy()),
            gate_timeout: config.gate_timeout(),
            operation_timeout: config.operation_timeout(),
            urls: config.urls()?,
        })
    }
}

pub struct Controller {
    settings: ControllerSettings,
    store: Arc<dyn StoreClient>,
    gate: ConcurrencyGate,
    publisher: Publisher,
    reconciler: Reconciler,
    verifier: Verifier,
    notifier: Arc<dyn Notifier>,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        store: Arc<dyn StoreClient>,
        probe: Arc<dyn Probe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            publisher: Publisher::new(Arc::clone(&store), settings.retry.clone()),
            reconciler: Reconciler::new(Arc::clone(&store), settings.retry.clone()),
            verifier: Verifier::new(probe),
            gate: ConcurrencyGate::new(),
            settings,
            store,
            notifier,
        }
    }

    /// Git-backed store and HTTP verification, as described by `config`.
    pub fn from_config(config: &PreviewConfig, notifier: Arc<dyn Notifier>) -> anyhow::Result<Self> {
        let settings = ControllerSettings::from_config(config)?;
        let store = GitStoreClient::new(StoreSettings {
            remote: config.store.remote.clone(),
            branch: config.store.branch.clone(),
            container: config.store.container.trim_matches('/').to_string(),
            work_dir: config.work_dir(),
            identity: Identity {
                name: config.identity.name.clone(),
                email: config.identity.email.clone(),
            },
            retry: config.retry_policy(),
        });
        let probe = HttpProbe::new(config.verify_policy().request_timeout)?;
        Ok(Self::new(
            settings,
            Arc::new(store),
            Arc::new(probe),
            notifier,
        ))
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    /// Dispatch one inbound event. The artifact is required for open/update events.
    pub async fn handle(&self, event: LifecycleEvent, artifact: Option<Artifact>) -> LifecycleReport {
        match event {
            LifecycleEvent::RequestOpenedOrUpdated {
                id,
                title,
                head_revision,
            } => {
                let request = match Request::new(id, title, head_revision) {
                    Ok(request) => request,
                    Err(err) => return self.reject(id, Operation::Publish, &err).await,
                };
                match artifact {
                    Some(artifact) => self.publish(&request, &artifact).await,
                    None => {
                        let err = LifecycleError::ArtifactMissing {
                            request_id: id,
                            detail: "no artifact was supplied by the build".to_string(),
                        };
                        self.reject(id, Operation::Publish, &err).await
                    }
                }
            }
            LifecycleEvent::RequestClosed { id } => self.cleanup(id, CleanupReason::Closed).await,
        }
    }

    /// Report an operation refused before it reached the gate, such as invalid
    /// request metadata or an unreadable artifact.
    pub async fn reject(
        &self,
        request_id: RequestId,
        operation: Operation,
        err: &LifecycleError,
    ) -> LifecycleReport {
        let op_id = OperationId::new();
        tracing::warn!(
            request_id = %request_id,
            %operation,
            op_id = %op_id.short(),
            error = %err,
            "operation rejected"
        );
        self.finish(failure_report(request_id, operation, op_id, err)).await
    }

    /// Publish `artifact` as the preview of `request`, then verify it.
    pub async fn publish(&self, request: &Request, artifact: &Artifact) -> LifecycleReport {
        let id = request.id;
        let op_id = OperationId::new();
        let span = tracing::info_span!(
            "lifecycle",
            request_id = %id,
            operation = "publish",
            op_id = %op_id.short()
        );

        async {
            let url = self.settings.urls.preview(id);
            let result = self
                .gated(id, self.publisher.publish(request, artifact, op_id))
                .await;

            let receipt = match result {
                Ok(receipt) => receipt,
                Err(err) => {
                    let mut report = failure_report(id, Operation::Publish, op_id, &err);
                    report.url = Some(url.to_string());
                    return self.finish(report).await;
                }
            };

            let (outcome, revision) = match receipt.outcome {
                PublishOutcome::Unchanged { revision } => (Outcome::NoOp, revision),
                PublishOutcome::Published { revision, .. } => {
                    let outcome = match &self.settings.verify {
                        Some(policy) => {
                            let report = self.verifier.verify_with(&url, policy).await;
                            if report.verified {
                                Outcome::Verified
                            } else {
                                Outcome::VerificationPending
                            }
                        }
                        None => Outcome::Published,
                    };
                    (outcome, revision)
                }
            };

            let mut report = LifecycleReport::new(id, Operation::Publish, op_id, outcome);
            report.url = Some(url.to_string());
            report.size_metrics = Some(receipt.scan.metrics);
            report.fingerprint = Some(receipt.scan.fingerprint);
            report.revision = Some(revision);
            if outcome == Outcome::VerificationPending {
                report.step = Some(Step::Verify);
            }
            self.finish(report).await
        }
        .instrument(span)
        .await
    }

    /// Remove the request's slot, and the container if it ends up empty.
    pub async fn cleanup(&self, request_id: RequestId, reason: CleanupReason) -> LifecycleReport {
        let op_id = OperationId::new();
        let span = tracing::info_span!(
            "lifecycle",
            request_id = %request_id,
            operation = "cleanup",
            op_id = %op_id.short()
        );

        async {
            let result = self
                .gated(request_id, self.reconciler.cleanup(request_id, reason, op_id))
                .await;
            let report = match result {
                Ok(CleanupOutcome::NoOp) => {
                    LifecycleReport::new(request_id, Operation::Cleanup, op_id, Outcome::NoOp)
                }
                Ok(CleanupOutcome::PublishedRemoved { revision, .. }) => {
                    let mut report = LifecycleReport::new(
                        request_id,
                        Operation::Cleanup,
                        op_id,
                        Outcome::PublishedRemoved,
                    );
                    report.revision = Some(revision);
                    report
                }
                Ok(CleanupOutcome::FullyRemoved { revision, .. }) => {
                    let mut report = LifecycleReport::new(
                        request_id,
                        Operation::Cleanup,
                        op_id,
                        Outcome::FullyRemoved,
                    );
                    report.revision = Some(revision);
                    report
                }
                Err(err) => failure_report(request_id, Operation::Cleanup, op_id, &err),
            };
            self.finish(report).await
        }
        .instrument(span)
        .await
    }

    /// Request ids that currently hold a slot. Read-only and ungated.
    pub async fn list_slots(&self) -> Result<Vec<RequestId>, StoreError> {
        let wc = match self.store.checkout("list").await {
            Ok(wc) => wc,
            Err(StoreError::BranchMissing { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let container = wc.container().to_string();
        let mut ids: Vec<RequestId> = wc
            .committed_children(&container)?
            .iter()
            .filter_map(|name| name.parse::<u64>().ok())
            .filter_map(|n| RequestId::new(n).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Run `operation` holding the request's ticket, bounded by the operation timeout.
    ///
    /// On timeout the operation future is dropped, which discards its working copy.
    async fn gated<T>(
        &self,
        request_id: RequestId,
        operation: impl Future<Output = Result<T, LifecycleError>>,
    ) -> Result<T, LifecycleError> {
        let ticket = self
            .gate
            .acquire(request_id, self.settings.gate_timeout)
            .await?;
        let timeout = self.settings.operation_timeout;
        let result = match tokio::time::timeout(timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(LifecycleError::Timeout {
                request_id,
                after: timeout,
            }),
        };
        self.gate.release(ticket);
        result
    }

    async fn finish(&self, report: LifecycleReport) -> LifecycleReport {
        if let Err(err) = self.notifier.notify(&report).await {
            tracing::warn!(
                request_id = %report.request_id,
                error = %err,
                "notifier failed; outcome unchanged"
            );
        }
        report
    }
}

fn failure_report(
    request_id: RequestId,
    operation: Operation,
    op_id: OperationId,
    err: &LifecycleError,
) -> LifecycleReport {
    let mut report = LifecycleReport::new(request_id, operation, op_id, err.outcome());
    report.step = err.step();
    report.error_detail = Some(err.to_string());
    report
}
