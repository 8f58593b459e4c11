//! Store backends.
//!
//! Both backends implement [`Store`] (watch + write). [`connect`] picks one
//! from the configured URI scheme.

mod in_memory;
#[cfg(feature = "mongo")]
mod mongo;

pub use in_memory::InMemoryStore;
#[cfg(feature = "mongo")]
pub use mongo::MongoStore;

use std::sync::Arc;

use tracing::info;

use changewatch_core::ChangewatchResult;
#[cfg(not(feature = "mongo"))]
use changewatch_core::ChangewatchError;
use changewatch_events::Store;

use crate::config::{Backend, StoreConfig};

/// Open the backend named by `config.uri`.
pub async fn connect(config: &StoreConfig) -> ChangewatchResult<Arc<dyn Store>> {
    config.validate()?;
    match config.backend()? {
        Backend::Memory => {
            info!("using the in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
        #[cfg(feature = "mongo")]
        Backend::MongoDb => Ok(Arc::new(MongoStore::connect(config).await?)),
        #[cfg(not(feature = "mongo"))]
        Backend::MongoDb => Err(ChangewatchError::config(
            "mongodb:// uris need changewatch-infra built with the `mongo` feature",
        )),
    }
}
