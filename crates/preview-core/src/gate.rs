//! Per-request mutual exclusion.
//!
//! Operations on the same request id queue behind each other; different
//! request ids never contend beyond a brief map lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::LifecycleError;
use crate::types::RequestId;

type Slots = Arc<Mutex<HashMap<RequestId, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGate {
    slots: Slots,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `request_id`.
    ///
    /// Waiters are served in arrival order. A timeout is reported as
    /// [`LifecycleError::GateTimeout`] so the caller can requeue.
    pub async fn acquire(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<GateTicket, LifecycleError> {
        let lock = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(request_id).or_default())
        };

        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => {
                tracing::debug!(%request_id, "gate acquired");
                Ok(GateTicket {
                    request_id,
                    guard: Some(guard),
                    slots: Arc::clone(&self.slots),
                })
            }
            Err(_) => {
                self.forget_if_idle(request_id);
                Err(LifecycleError::GateTimeout {
                    request_id,
                    waited: timeout,
                })
            }
        }
    }

    /// Give the ticket back. Dropping it has the same effect.
    pub fn release(&self, ticket: GateTicket) {
        drop(ticket);
    }

    /// Whether an operation currently holds or awaits the given id.
    pub fn is_busy(&self, request_id: RequestId) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&request_id)
            .is_some_and(|lock| lock.try_lock().is_err() || Arc::strong_count(lock) > 1)
    }

    /// Number of request ids with a live entry.
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn forget_if_idle(&self, request_id: RequestId) {
        forget_if_idle(&self.slots, request_id);
    }
}

fn forget_if_idle(slots: &Slots, request_id: RequestId) {
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    if slots
        .get(&request_id)
        .is_some_and(|lock| Arc::strong_count(lock) == 1)
    {
        slots.remove(&request_id);
    }
}

/// Exclusive right to run one lifecycle operation for a request.
#[derive(Debug)]
pub struct GateTicket {
    request_id: RequestId,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl GateTicket {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

impl Drop for GateTicket {
    fn drop(&mut self) {
        // The guard holds a reference to the lock; drop it before the idle check.
        self.guard.take();
        forget_if_idle(&self.slots, self.request_id);
        tracing::debug!(request_id = %self.request_id, "gate released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(n: u64) -> RequestId {
        RequestId::new(n).unwrap()
    }

    #[tokio::test]
    async fn same_request_is_serialized() {
        let gate = ConcurrencyGate::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let ticket = gate.acquire(id(42), Duration::from_secs(30)).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                gate.release(ticket);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn different_requests_run_in_parallel() {
        let gate = ConcurrencyGate::new();
        let first = gate.acquire(id(1), Duration::from_secs(1)).await.unwrap();
        let second = gate.acquire(id(2), Duration::from_millis(50)).await;
        assert!(second.is_ok());
        assert!(gate.is_busy(id(1)));
        drop(first);
        assert!(!gate.is_busy(id(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let gate = ConcurrencyGate::new();
        let held = gate.acquire(id(7), Duration::from_secs(1)).await.unwrap();

        let err = gate
            .acquire(id(7), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::GateTimeout { waited, .. } if waited == Duration::from_secs(5)));

        // the timed-out waiter must not strand the entry
        assert_eq!(gate.tracked(), 1);
        drop(held);
        assert_eq!(gate.tracked(), 0);
    }

    #[tokio::test]
    async fn ticket_reports_request() {
        let gate = ConcurrencyGate::new();
        let ticket = gate.acquire(id(9), Duration::from_secs(1)).await.unwrap();
        assert_eq!(ticket.request_id(), id(9));
    }
}
