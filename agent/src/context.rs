//! Wiring of the sync components.
//!
//! [`SyncContext`] builds every component once and shares it through
//! `Arc`s; applications hold one context per signed-in device.

use std::sync::{Arc, Mutex};

use stockroom_engine::Catalog;
use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::config::SyncSettings;
use crate::local::LocalStore;
use crate::mapper::IdMapper;
use crate::queue::OperationQueue;
use crate::reconciler::Reconciler;
use crate::remote::{RemoteAdapter, SharedRemoteStore};
use crate::storage::SharedStorage;
use crate::sync::{self, SchedulerHandle, SyncOrchestrator, Trigger};
use crate::writer::OptimisticWriter;

const TRIGGER_CAPACITY: usize = 16;

pub struct SyncContext {
    pub settings: SyncSettings,
    pub catalog: Arc<Catalog>,
    pub auth: Arc<dyn Authenticator>,
    pub local: Arc<LocalStore>,
    pub remote: Arc<RemoteAdapter>,
    pub queue: Arc<OperationQueue>,
    pub mapper: Arc<IdMapper>,
    pub reconciler: Arc<Reconciler>,
    pub writer: Arc<OptimisticWriter>,
    pub orchestrator: Arc<SyncOrchestrator>,
    triggers: mpsc::Sender<Trigger>,
    trigger_rx: Mutex<Option<mpsc::Receiver<Trigger>>>,
}

impl SyncContext {
    /// Context over the inventory catalog. `remote` is `None` when the
    /// remote integration is disabled.
    pub fn new(
        storage: SharedStorage,
        remote: Option<SharedRemoteStore>,
        auth: Arc<dyn Authenticator>,
        settings: SyncSettings,
    ) -> Self {
        Self::with_catalog(Catalog::inventory(), storage, remote, auth, settings)
    }

    pub fn with_catalog(
        catalog: Catalog,
        storage: SharedStorage,
        remote: Option<SharedRemoteStore>,
        auth: Arc<dyn Authenticator>,
        settings: SyncSettings,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let local = Arc::new(LocalStore::new(storage.clone(), settings.cache_ttl));
        let remote = Arc::new(match remote {
            Some(store) => RemoteAdapter::new(store, auth.clone(), settings.remote_timeout),
            None => RemoteAdapter::disabled(auth.clone()),
        });
        let queue = Arc::new(OperationQueue::new(storage));
        let mapper = Arc::new(IdMapper::new(local.clone(), catalog.clone()));
        let reconciler = Arc::new(Reconciler::new(
            local.clone(),
            queue.clone(),
            catalog.clone(),
        ));
        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CAPACITY);

        let writer = Arc::new(OptimisticWriter::new(
            local.clone(),
            remote.clone(),
            queue.clone(),
            mapper.clone(),
            auth.clone(),
            catalog.clone(),
            triggers.clone(),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            local.clone(),
            remote.clone(),
            queue.clone(),
            mapper.clone(),
            reconciler.clone(),
            auth.clone(),
            catalog.clone(),
            settings.retry,
        ));

        Self {
            settings,
            catalog,
            auth,
            local,
            remote,
            queue,
            mapper,
            reconciler,
            writer,
            orchestrator,
            triggers,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    /// Take the trigger receiver, leaving the scheduler without one.
    /// Returns `None` once taken.
    pub fn take_trigger_receiver(&self) -> Option<mpsc::Receiver<Trigger>> {
        match self.trigger_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Ask the scheduler for a cycle. Returns false when the request was
    /// dropped because the scheduler is busy or gone.
    pub fn request_sync(&self, trigger: Trigger) -> bool {
        match self.triggers.try_send(trigger) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(?trigger, "Sync trigger dropped: {}", e);
                false
            }
        }
    }

    /// Start the background scheduler. `None` if it was already started.
    pub fn spawn_scheduler(&self) -> Option<SchedulerHandle> {
        let triggers = self.take_trigger_receiver()?;
        Some(sync::spawn(
            self.orchestrator.clone(),
            self.local.clone(),
            triggers,
            self.settings.sync_interval,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SessionAuth, User};
    use crate::remote::MemoryRemoteStore;
    use crate::storage::MemoryStorage;
    use crate::sync::{SkipReason, SyncOutcome};

    fn context(remote: Option<SharedRemoteStore>) -> SyncContext {
        SyncContext::new(
            Arc::new(MemoryStorage::new()),
            remote,
            Arc::new(SessionAuth::signed_in(User::new("u1"))),
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn disabled_remote_skips_sync() {
        let ctx = context(None);
        assert!(!ctx.remote.is_enabled());
        assert!(matches!(
            ctx.orchestrator.start_sync().await,
            SyncOutcome::Skipped {
                reason: SkipReason::Offline
            }
        ));
    }

    #[tokio::test]
    async fn trigger_receiver_is_taken_once() {
        let ctx = context(Some(Arc::new(MemoryRemoteStore::new())));
        assert!(ctx.request_sync(Trigger::Manual));

        let mut rx = ctx.take_trigger_receiver().unwrap();
        assert_eq!(rx.recv().await, Some(Trigger::Manual));
        assert!(ctx.take_trigger_receiver().is_none());
        assert!(ctx.spawn_scheduler().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_runs_a_cycle_on_start_and_stops() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let ctx = context(Some(remote.clone()));
        let handle = ctx.spawn_scheduler().unwrap();

        // The first timer tick fires immediately.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(ctx.orchestrator.last_report().await.is_some());
        assert_eq!(remote.calls_of(crate::remote::CallKind::Query).len(), 7);

        handle.shutdown().await;
    }
}
