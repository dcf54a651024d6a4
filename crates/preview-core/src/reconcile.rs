//! Retire a request's slot, and the container with it once it is empty.
//!
//! The container check runs after the slot removal is committed and again
//! inside [`WorkingCopy::stage_container_removal`], immediately before the
//! destructive step. After every rebase the container is re-read, and a
//! container removal is withdrawn from the pending commit if a concurrent
//! publish has repopulated it.

use std::sync::Arc;

use crate::error::{LifecycleError, StoreError, Step};
use crate::store::{PushReport, RetryPolicy, StoreClient, WorkingCopy, rebase_for_retry};
use crate::types::{CleanupReason, OperationId, RequestId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// No slot existed, or removing it changed nothing
    NoOp,
    /// Slot removed; the container still holds other slots
    PublishedRemoved { revision: String, push: PushReport },
    /// Slot removed and the container with it
    FullyRemoved { revision: String, push: PushReport },
}

pub struct Reconciler {
    store: Arc<dyn StoreClient>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StoreClient>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn cleanup(
        &self,
        request_id: RequestId,
        reason: CleanupReason,
        op_id: OperationId,
    ) -> Result<CleanupOutcome, LifecycleError> {
        let id = request_id;
        let label = format!("cleanup-{}-{}", id, op_id.short());
        let mut wc = match self.store.checkout(&label).await {
            Ok(wc) => wc,
            Err(StoreError::BranchMissing { branch }) => {
                tracing::info!(%id, %branch, "branch does not exist; nothing to clean");
                return Ok(CleanupOutcome::NoOp);
            }
            Err(err) => return Err(LifecycleError::store(id, Step::Checkout)(err)),
        };
        let container = wc.container().to_string();
        let slot_rel = id.slot_path(&container);

        // Check-Slot
        if !wc.root().join(&slot_rel).exists() {
            tracing::info!(%id, slot = %slot_rel, "no slot to clean");
            return Ok(CleanupOutcome::NoOp);
        }

        // Remove-Slot
        let changed = wc
            .stage_removal(&slot_rel)
            .await
            .map_err(LifecycleError::store(id, Step::Stage))?;
        if !changed {
            tracing::info!(%id, slot = %slot_rel, "slot held no tracked content");
            return Ok(CleanupOutcome::NoOp);
        }

        // Commit-Slot-Removal
        let slot_message = slot_removal_message(id, reason, op_id);
        wc.commit(&slot_message)
            .await
            .map_err(LifecycleError::store(id, Step::Commit))?;

        // Check-Container
        let remaining = wc
            .children(&container)
            .map_err(LifecycleError::store(id, Step::CheckContainer))?;
        let mut container_removed = false;
        let mut repopulated = false;
        if remaining.is_empty() {
            // Remove-Container
            match wc.stage_container_removal().await {
                Ok(()) => {
                    let message = container_removal_message(&slot_message, &container);
                    wc.amend(&message)
                        .await
                        .map_err(LifecycleError::store(id, Step::RemoveContainer))?;
                    container_removed = true;
                }
                Err(err @ StoreError::ContainerRepopulated { .. }) => {
                    tracing::warn!(%id, error = %err, "container repopulated; keeping it");
                    repopulated = true;
                }
                Err(err) => return Err(LifecycleError::store(id, Step::RemoveContainer)(err)),
            }
        } else {
            tracing::debug!(%id, remaining = remaining.len(), "container still holds slots");
        }

        // Push-With-Retry
        let removal_staged = container_removed;
        let push = self
            .push_revalidating(wc.as_mut(), id, &slot_message, &mut container_removed)
            .await?;
        repopulated |= removal_staged && !container_removed;

        let revision = wc
            .head_revision()
            .map_err(LifecycleError::store(id, Step::Push))?;
        let survivors = wc
            .committed_children(&container)
            .map_err(LifecycleError::store(id, Step::CheckContainer))?;

        if survivors.is_empty() && !repopulated {
            tracing::info!(%id, %revision, container = %container, "slot and container removed");
            Ok(CleanupOutcome::FullyRemoved { revision, push })
        } else {
            tracing::info!(
                %id,
                %revision,
                remaining = survivors.len(),
                "slot removed; container retained"
            );
            Ok(CleanupOutcome::PublishedRemoved { revision, push })
        }
    }

    /// Same retry policy as publishing, plus a container re-check after each rebase.
    async fn push_revalidating(
        &self,
        wc: &mut dyn WorkingCopy,
        id: RequestId,
        slot_message: &str,
        container_removed: &mut bool,
    ) -> Result<PushReport, LifecycleError> {
        let push_failed = |attempts: u32, source: StoreError| LifecycleError::PushFailed {
            request_id: id,
            step: Step::Push,
            attempts,
            source,
        };
        let container = wc.container().to_string();
        let mut retry = self.retry.start();
        let mut rebases = 0;
        loop {
            let err = match wc.push().await {
                Ok(()) => {
                    return Ok(PushReport {
                        attempts: retry.attempts(),
                        rebases,
                    });
                }
                Err(err) => err,
            };
            let attempts = retry.attempts();
            if !err.is_retryable() {
                return Err(push_failed(attempts, err));
            }
            retry
                .failed(err)
                .await
                .map_err(|source| push_failed(attempts, source))?;

            rebases += 1;
            rebase_for_retry(wc)
                .await
                .map_err(|source| push_failed(attempts, source))?;

            if *container_removed {
                let repopulated = wc
                    .children(&container)
                    .map_err(LifecycleError::store(id, Step::CheckContainer))?;
                if !repopulated.is_empty() {
                    tracing::warn!(
                        %id,
                        children = repopulated.len(),
                        "concurrent publish repopulated the container; keeping it"
                    );
                    wc.amend(slot_message)
                        .await
                        .map_err(LifecycleError::store(id, Step::RemoveContainer))?;
                    *container_removed = false;
                }
            }
        }
    }
}

fn slot_removal_message(id: RequestId, reason: CleanupReason, op_id: OperationId) -> String {
    format!(
        "Remove preview for #{id}\n\n\
         Request: #{id}\n\
         Reason: {reason}\n\
         Operation: cleanup {op_id}"
    )
}

fn container_removal_message(slot_message: &str, container: &str) -> String {
    let (subject, body) = slot_message
        .split_once("\n\n")
        .unwrap_or((slot_message, ""));
    format!(
        "{subject} and empty {container}\n\n{body}\nContainer: removed {container}",
        body = body.trim_end()
    )
}
