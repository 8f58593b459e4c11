use std::sync::Arc;

use tracing::info;

use changewatch_core::{ChangewatchResult, Namespace};
use changewatch_events::{ChangeSource, ChangeSubscription, DocumentStore, Pipeline, Store, WatchOptions};

use crate::config::StoreConfig;
use crate::scheduler::WriteScheduler;
use crate::store;

/// A connected store plus the collection the application works on.
///
/// Built once at startup and handed to whatever needs to watch or write.
#[derive(Clone)]
pub struct WatchContext {
    store: Arc<dyn Store>,
    namespace: Namespace,
}

impl std::fmt::Debug for WatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchContext")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl WatchContext {
    pub fn new(store: Arc<dyn Store>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    /// Connect the configured backend and bind the configured collection.
    pub async fn connect(config: &StoreConfig) -> ChangewatchResult<Self> {
        let namespace = config.namespace()?;
        let store = store::connect(config).await?;
        info!(%namespace, "watch context ready");
        Ok(Self::new(store, namespace))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Open a subscription on the context's collection.
    pub async fn open(&self, pipeline: Pipeline, options: WatchOptions) -> ChangewatchResult<ChangeSubscription> {
        self.store.watch(&self.namespace, pipeline, options).await
    }

    /// A scheduler writing to the context's collection.
    pub fn writer(&self) -> WriteScheduler<dyn Store> {
        WriteScheduler::new(Arc::clone(&self.store), self.namespace.clone())
    }

    pub async fn drop_collection(&self) -> ChangewatchResult<()> {
        self.store.drop_collection(&self.namespace).await
    }
}
