//! Store-facing abstractions (transport-agnostic).
//!
//! A backend implements [`ChangeSource`] to open subscriptions and
//! [`DocumentStore`] to accept writes. The in-memory and MongoDB backends in
//! `changewatch-infra` implement both; anything that does is a [`Store`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use changewatch_core::{ChangewatchResult, Namespace};

use crate::pipeline::Pipeline;
use crate::subscription::ChangeSubscription;
use crate::write::{UpdateSpec, WriteResult};

/// Whether update events carry the post-update document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocument {
    /// Only inserts and replaces carry `fullDocument`.
    #[default]
    Default,
    /// Updates carry the current version of the document as well.
    UpdateLookup,
}

/// Options for opening a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchOptions {
    pub full_document: FullDocument,
}

impl WatchOptions {
    pub fn with_full_document(mut self, full_document: FullDocument) -> Self {
        self.full_document = full_document;
        self
    }
}

/// Opens change subscriptions on a collection.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a subscription; events committed after this returns are delivered.
    ///
    /// Fails with `Connection` if the store is unreachable and with
    /// `InvalidPipeline` if the backend cannot evaluate the pipeline.
    async fn watch(
        &self,
        namespace: &Namespace,
        pipeline: Pipeline,
        options: WatchOptions,
    ) -> ChangewatchResult<ChangeSubscription>;
}

/// Accepts writes on a collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_one(&self, namespace: &Namespace, document: JsonValue) -> ChangewatchResult<WriteResult>;

    async fn update_one(&self, namespace: &Namespace, update: &UpdateSpec) -> ChangewatchResult<WriteResult>;

    /// Drop the collection; open subscriptions on it receive `drop` then `invalidate`.
    async fn drop_collection(&self, namespace: &Namespace) -> ChangewatchResult<()>;
}

/// A backend that can both be watched and written to.
pub trait Store: ChangeSource + DocumentStore {}

impl<T> Store for T where T: ChangeSource + DocumentStore + ?Sized {}

#[async_trait]
impl<S> ChangeSource for Arc<S>
where
    S: ChangeSource + ?Sized,
{
    async fn watch(
        &self,
        namespace: &Namespace,
        pipeline: Pipeline,
        options: WatchOptions,
    ) -> ChangewatchResult<ChangeSubscription> {
        (**self).watch(namespace, pipeline, options).await
    }
}

#[async_trait]
impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    async fn insert_one(&self, namespace: &Namespace, document: JsonValue) -> ChangewatchResult<WriteResult> {
        (**self).insert_one(namespace, document).await
    }

    async fn update_one(&self, namespace: &Namespace, update: &UpdateSpec) -> ChangewatchResult<WriteResult> {
        (**self).update_one(namespace, update).await
    }

    async fn drop_collection(&self, namespace: &Namespace) -> ChangewatchResult<()> {
        (**self).drop_collection(namespace).await
    }
}
