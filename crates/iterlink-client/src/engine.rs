//! Sync engine service object.
//!
//! Wires the local store, the write queue, the UI cache and the connection
//! manager together. Construct with [`SyncEngine::start`], tear down with
//! [`SyncEngine::stop`].

use std::sync::Arc;

use iterlink_core::{ChatEvent, InstanceId};
use iterlink_settings::SyncSettings;
use iterlink_store::{EventStore, StoreError, WriteQueue, WriteQueueConfig, WriteStats};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::cache::EventCache;
use crate::errors::ClientError;
use crate::manager::{ConnectionManager, ManagerConfig};
use crate::protocol::Outbound;
use crate::router::Router;
use crate::state::ConnectionState;
use crate::transport::Connector;

/// Events per instance loaded into the cache at startup.
pub const SEED_LIMIT: usize = 500;

/// Running sync engine.
pub struct SyncEngine {
    store: Arc<EventStore>,
    queue: Arc<WriteQueue>,
    manager: ConnectionManager,
}

impl SyncEngine {
    /// Seed the cache from the store, start the write worker and the
    /// connection actor. Does not connect.
    pub async fn start(
        settings: &SyncSettings,
        store: Arc<EventStore>,
        cache: Arc<dyn EventCache>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        seed_cache(&store, cache.as_ref()).await?;

        let queue = Arc::new(WriteQueue::start(
            store.clone(),
            WriteQueueConfig::from(&settings.write_queue),
        ));
        let hook_cache = cache.clone();
        queue.set_failure_hook(move |failure| {
            hook_cache.set_persistence_error(failure.message.clone(), failure.failed_count);
        });

        let router = Router::new(cache.clone(), queue.clone());
        let manager = ConnectionManager::start(connector, router, cache, ManagerConfig::from(settings));
        info!(url = %settings.server.url, "sync engine started");

        Ok(Self {
            store,
            queue,
            manager,
        })
    }

    /// Open the connection.
    pub fn connect(&self) {
        self.manager.connect();
    }

    /// Close the connection; no automatic reconnect.
    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    /// Reset backoff and reconnect now.
    pub fn reconnect(&self) {
        self.manager.reconnect();
    }

    /// Send an application message (dropped unless connected).
    pub fn send(&self, message: Value) {
        self.manager.send(Outbound::App(message));
    }

    /// Change the foreground instance.
    pub fn set_active_instance(&self, instance: InstanceId) {
        self.manager.set_active_instance(instance);
    }

    /// Drop in-memory sync state and backoff. The store is untouched.
    pub fn reset(&self) {
        self.manager.reset();
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.watch_state()
    }

    /// Chat and mutation messages.
    pub fn app_messages(&self) -> broadcast::Receiver<Value> {
        self.manager.app_messages()
    }

    /// Wait until every write enqueued so far has been attempted.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    /// Write queue counters.
    pub fn stats(&self) -> WriteStats {
        self.queue.stats()
    }

    /// The local store.
    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Stop the connection actor, then drain and stop the write worker.
    pub async fn stop(&self) {
        self.manager.stop().await;
        self.queue.close().await;
        let stats = self.queue.stats();
        info!(written = stats.written, failed = stats.failed, "sync engine stopped");
    }
}

async fn seed_cache(store: &Arc<EventStore>, cache: &dyn EventCache) -> Result<(), ClientError> {
    let store = store.clone();
    let seeded = tokio::task::spawn_blocking(move || -> Result<Vec<(InstanceId, Vec<ChatEvent>)>, StoreError> {
        store
            .list_instances()?
            .into_iter()
            .map(|instance| -> Result<_, StoreError> {
                let events: Vec<ChatEvent> = store
                    .recent_events(&instance, SEED_LIMIT)?
                    .into_iter()
                    .map(|p| p.event)
                    .collect();
                Ok((instance, events))
            })
            .collect()
    })
    .await
    .map_err(|e| ClientError::Internal(format!("seed task failed: {e}")))?;

    let seeded = match seeded {
        Ok(seeded) => seeded,
        Err(e) => {
            warn!(error = %e, "failed to seed cache from store");
            return Err(e.into());
        }
    };
    for (instance, events) in seeded {
        info!(instance_id = %instance, count = events.len(), "seeded cache from store");
        cache.replace_events(&instance, events);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use iterlink_core::{PersistedEvent, Session};

    use super::*;
    use crate::cache::MemoryCache;
    use crate::errors::TransportError;
    use crate::transport::TransportChannels;

    struct Refusing;

    #[async_trait::async_trait]
    impl Connector for Refusing {
        async fn open(&self) -> Result<TransportChannels, TransportError> {
            Err(TransportError::Connect("refused".into()))
        }
    }

    fn seeded_store() -> Arc<EventStore> {
        let store = Arc::new(EventStore::in_memory().unwrap());
        let a = InstanceId::from_raw("A");
        let session = Session::open(&a, 1, None);
        for i in 1..=3 {
            let event = ChatEvent::new("output", Some(i)).with_id(format!("e{i}"));
            let _ = store
                .put_event(&PersistedEvent::new(event, session.id.clone(), a.clone()))
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn start_seeds_cache_unsynced() {
        let store = seeded_store();
        let cache = Arc::new(MemoryCache::new(InstanceId::from_raw("A")));
        let engine = SyncEngine::start(&SyncSettings::default(), store, cache.clone(), Arc::new(Refusing))
            .await
            .unwrap();

        let view = cache.view(&InstanceId::from_raw("A"));
        assert_eq!(view.events.len(), 3);
        assert!(!view.synced);
        assert_eq!(engine.state(), ConnectionState::Disconnected);
        engine.stop().await;
    }
}
