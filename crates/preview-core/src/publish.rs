//! Integrate a finished artifact into the request's slot.

use std::sync::Arc;

use crate::artifact::{Artifact, ArtifactScan};
use crate::error::{LifecycleError, StoreError, Step};
use crate::store::{PushReport, RetryPolicy, StoreClient, push_with_retry};
use crate::types::{OperationId, Request};

/// What a publish did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// A new slot revision was pushed
    Published { revision: String, push: PushReport },
    /// The slot already held identical content; nothing was committed
    Unchanged { revision: String },
}

#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub outcome: PublishOutcome,
    pub scan: ArtifactScan,
}

pub struct Publisher {
    store: Arc<dyn StoreClient>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(store: Arc<dyn StoreClient>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Copy `artifact` into `<container>/<id>`, commit and push.
    ///
    /// Any previous content of the slot is replaced. Pushes rejected because a
    /// sibling operation advanced the branch are rebased and retried.
    pub async fn publish(
        &self,
        request: &Request,
        artifact: &Artifact,
        op_id: OperationId,
    ) -> Result<PublishReceipt, LifecycleError> {
        let id = request.id;
        let scan = artifact.scan(id)?;

        let label = format!("publish-{}-{}", id, op_id.short());
        let mut wc = self
            .store
            .checkout(&label)
            .await
            .map_err(LifecycleError::store(id, Step::Checkout))?;

        let slot_rel = id.slot_path(wc.container());
        let slot_path = wc.root().join(&slot_rel);
        if slot_path.exists() {
            std::fs::remove_dir_all(&slot_path)
                .map_err(|err| LifecycleError::store(id, Step::Stage)(err.into()))?;
        }
        artifact
            .copy_into(&slot_path)
            .map_err(|err| LifecycleError::store(id, Step::Stage)(StoreError::Io(err)))?;

        let changed = wc
            .stage(&slot_rel)
            .await
            .map_err(LifecycleError::store(id, Step::Stage))?;
        if !changed {
            tracing::info!(%id, slot = %slot_rel, "slot already holds this artifact");
            let revision = wc
                .head_revision()
                .map_err(LifecycleError::store(id, Step::Stage))?;
            return Ok(PublishReceipt {
                outcome: PublishOutcome::Unchanged { revision },
                scan,
            });
        }

        let message = commit_message(request, op_id, &scan);
        wc.commit(&message)
            .await
            .map_err(LifecycleError::store(id, Step::Commit))?;

        let push = push_with_retry(wc.as_mut(), &self.retry)
            .await
            .map_err(|failure| LifecycleError::PushFailed {
                request_id: id,
                step: Step::Push,
                attempts: failure.attempts,
                source: failure.source,
            })?;
        let revision = wc
            .head_revision()
            .map_err(LifecycleError::store(id, Step::Push))?;

        tracing::info!(
            %id,
            slot = %slot_rel,
            %revision,
            attempts = push.attempts,
            rebases = push.rebases,
            files = scan.metrics.files,
            bytes = scan.metrics.bytes,
            "published preview"
        );
        Ok(PublishReceipt {
            outcome: PublishOutcome::Published { revision, push },
            scan,
        })
    }
}

fn commit_message(request: &Request, op_id: OperationId, scan: &ArtifactScan) -> String {
    let title = request.title.lines().next().unwrap_or_default().trim();
    format!(
        "Deploy preview for #{id}: {title}\n\n\
         Request: #{id}\n\
         Head: {head}\n\
         Operation: publish {op_id}\n\
         Fingerprint: {fingerprint}",
        id = request.id,
        title = title,
        head = request.short_head(),
        op_id = op_id,
        fingerprint = scan.fingerprint,
    )
}
