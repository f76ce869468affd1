//! Tracking of asynchronous event producers that have not reached the intake
//! writer yet.
//!
//! A producer that does async work before sending its record registers an
//! [`InFlightId`] and resolves it once the record was sent or dropped. A flush
//! snapshots the live set and waits for that snapshot to drain, so work that
//! starts after the flush began is never waited on.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InFlightId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DrainError {
    #[error("timed out waiting for {remaining} in-flight event(s) to be sent")]
    Timeout { remaining: usize },
}

#[derive(Debug, Default)]
struct SetState {
    ids: HashSet<InFlightId>,
    next_waiter: u64,
    waiters: Vec<(u64, oneshot::Sender<()>)>,
}

/// A set of in-flight operations and the drain waiters armed on it.
#[derive(Debug, Default)]
pub struct InFlightSet {
    state: Mutex<SetState>,
}

impl InFlightSet {
    fn lock(&self) -> MutexGuard<'_, SetState> {
        // A panic while holding the lock cannot leave the set inconsistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn insert(&self, id: InFlightId) {
        self.lock().ids.insert(id);
    }

    fn remove(&self, id: InFlightId) -> bool {
        let mut state = self.lock();
        if !state.ids.remove(&id) {
            return false;
        }
        if state.ids.is_empty() {
            for (_, waiter) in state.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the first time the set is empty after this call.
    ///
    /// Every call arms its own waiter. With a `timeout`, the wait fails with
    /// the number of operations still outstanding and only this waiter is
    /// disarmed.
    pub async fn on_next_drain(&self, timeout: Option<Duration>) -> Result<(), DrainError> {
        let (token, rx) = {
            let mut state = self.lock();
            if state.ids.is_empty() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let token = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push((token, tx));
            (token, rx)
        };

        let drained = match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(()))),
            None => rx.await.is_ok(),
        };
        if drained {
            return Ok(());
        }

        let mut state = self.lock();
        state.waiters.retain(|(armed, _)| *armed != token);
        Err(DrainError::Timeout {
            remaining: state.ids.len(),
        })
    }

    /// Callback flavour of [`InFlightSet::on_next_drain`].
    pub fn on_next_drain_with<F>(self: &Arc<Self>, timeout: Option<Duration>, callback: F)
    where
        F: FnOnce(Result<(), DrainError>) + Send + 'static,
    {
        let set = Arc::clone(self);
        tokio::spawn(async move {
            callback(set.on_next_drain(timeout).await);
        });
    }
}

/// Owner of the live [`InFlightSet`] and of the snapshots taken by flushes.
#[derive(Debug)]
pub struct DrainCoordinator {
    next_id: AtomicU64,
    live: Mutex<Arc<InFlightSet>>,
    snapshots: Mutex<Vec<Weak<InFlightSet>>>,
}

impl Default for DrainCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainCoordinator {
    #[must_use]
    pub fn new() -> Self {
        DrainCoordinator {
            next_id: AtomicU64::new(1),
            live: Mutex::new(Arc::new(InFlightSet::default())),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    fn live(&self) -> Arc<InFlightSet> {
        Arc::clone(
            &self
                .live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    pub fn register_in_flight(&self) -> InFlightId {
        let id = InFlightId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live().insert(id);
        id
    }

    /// Marks an operation as done, whichever set it ended up in.
    pub fn resolve_in_flight(&self, id: InFlightId) {
        if self.live().remove(id) {
            return;
        }
        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        snapshots.retain(|set| set.strong_count() > 0);
        let resolved = snapshots
            .iter()
            .filter_map(Weak::upgrade)
            .any(|set| set.remove(id));
        if !resolved {
            debug!("DRAIN | Ignoring unknown in-flight id {:?}", id);
        }
    }

    /// Swaps the live set for an empty one and returns the previous set.
    pub fn take_snapshot(&self) -> Arc<InFlightSet> {
        let previous = {
            let mut live = self
                .live
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *live)
        };
        if !previous.is_empty() {
            self.snapshots
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(Arc::downgrade(&previous));
        }
        previous
    }

    /// Waits for the live set to drain without taking a snapshot.
    pub async fn on_next_drain(&self, timeout: Option<Duration>) -> Result<(), DrainError> {
        self.live().on_next_drain(timeout).await
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.live().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn test_drain_fires_once_after_all_resolved() {
        let coordinator = DrainCoordinator::new();
        let ids: Vec<_> = (0..5).map(|_| coordinator.register_in_flight()).collect();
        let snapshot = coordinator.take_snapshot();

        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = Arc::clone(&calls);
        snapshot.on_next_drain_with(Some(Duration::from_secs(5)), move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        tokio::task::yield_now().await;

        for id in ids {
            coordinator.resolve_in_flight(id);
        }
        assert_eq!(rx.await.unwrap(), Ok(()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_times_out_with_remaining_count() {
        let coordinator = DrainCoordinator::new();
        let first = coordinator.register_in_flight();
        coordinator.register_in_flight();
        coordinator.register_in_flight();
        let snapshot = coordinator.take_snapshot();
        coordinator.resolve_in_flight(first);

        let result = snapshot
            .on_next_drain(Some(Duration::from_millis(20)))
            .await;
        assert_eq!(result, Err(DrainError::Timeout { remaining: 2 }));
    }

    #[tokio::test]
    async fn test_empty_set_drains_immediately() {
        let coordinator = DrainCoordinator::new();
        let snapshot = coordinator.take_snapshot();
        assert_eq!(snapshot.on_next_drain(None).await, Ok(()));
        assert_eq!(coordinator.on_next_drain(Some(Duration::ZERO)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_snapshot_ignores_later_work() {
        let coordinator = DrainCoordinator::new();
        let before = coordinator.register_in_flight();
        let snapshot = coordinator.take_snapshot();
        let after = coordinator.register_in_flight();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(coordinator.in_flight(), 1);

        coordinator.resolve_in_flight(before);
        assert_eq!(
            snapshot.on_next_drain(Some(Duration::from_millis(50))).await,
            Ok(())
        );
        assert_eq!(coordinator.in_flight(), 1);

        coordinator.resolve_in_flight(after);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiters_armed_twice_both_wait_for_drain() {
        let coordinator = Arc::new(DrainCoordinator::new());
        let id = coordinator.register_in_flight();

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .on_next_drain(Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .on_next_drain(Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        coordinator.resolve_in_flight(id);
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_timeout_only_disarms_its_own_waiter() {
        let coordinator = Arc::new(DrainCoordinator::new());
        let id = coordinator.register_in_flight();

        let patient = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .on_next_drain(Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(
            coordinator
                .on_next_drain(Some(Duration::from_millis(20)))
                .await,
            Err(DrainError::Timeout { remaining: 1 })
        );
        assert!(!patient.is_finished());

        coordinator.resolve_in_flight(id);
        assert_eq!(patient.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_second_snapshot_does_not_wait_on_first() {
        let coordinator = DrainCoordinator::new();
        coordinator.register_in_flight();
        let first = coordinator.take_snapshot();
        let second = coordinator.take_snapshot();

        assert_eq!(second.on_next_drain(Some(Duration::from_millis(10))).await, Ok(()));
        assert_eq!(
            first.on_next_drain(Some(Duration::from_millis(10))).await,
            Err(DrainError::Timeout { remaining: 1 })
        );
    }
}
