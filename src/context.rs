//! Process-wide application context: the dependency-injected carrier for
//! the registry, clients, store, caches, and engines.

use std::sync::Arc;

use crate::config::Settings;
use crate::engine::capability::CapabilityCache;
use crate::engine::limiter::ProviderLimiter;
use crate::engine::sync::SyncEngine;
use crate::engine::turn::TurnRunner;
use crate::error::Result;
use crate::models::ModelRegistry;
use crate::provider::ClientSet;
use crate::store::Store;

pub struct AppContext {
    pub registry: Arc<ModelRegistry>,
    pub clients: Arc<ClientSet>,
    pub store: Arc<Store>,
    pub sync: SyncEngine,
    pub turns: TurnRunner,
}

impl AppContext {
    /// Build the context from settings: open the store, bind providers,
    /// and wire the engines.
    pub async fn initialize(settings: &Settings) -> Result<Self> {
        let store = Arc::new(Store::open(&settings.db_path).await?);
        let registry = Arc::new(ModelRegistry::new(settings.bindings.clone()));
        let clients = Arc::new(ClientSet::from_bindings(&settings.bindings));
        Ok(Self::assemble(registry, clients, store))
    }

    /// Wire engines around pre-built parts. Tests use this with mock
    /// clients and an in-memory store.
    pub fn assemble(
        registry: Arc<ModelRegistry>,
        clients: Arc<ClientSet>,
        store: Arc<Store>,
    ) -> Self {
        let limiter = Arc::new(ProviderLimiter::new());
        let capabilities = Arc::new(CapabilityCache::default());
        let sync = SyncEngine::new(
            Arc::clone(&registry),
            Arc::clone(&clients),
            Arc::clone(&limiter),
            capabilities,
        );
        let turns = TurnRunner::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&clients),
            limiter,
        );
        Self {
            registry,
            clients,
            store,
            sync,
            turns,
        }
    }

    /// Flush and close the store.
    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
