//! MongoDB-backed store.
//!
//! Pipelines are forwarded to the server as BSON; every stage the server
//! understands works here, including the ones the in-memory evaluator rejects.
//! Events come back as raw documents and are converted to relaxed extended
//! JSON, so a `$project` that removes fields never breaks decoding.

use async_trait::async_trait;
use futures::StreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FullDocumentType, WriteConcern};
use mongodb::{Client, Collection};
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use changewatch_core::{ChangewatchError, ChangewatchResult, Namespace};
use changewatch_events::{
    ChangeEvent, ChangeSource, ChangeSubscription, DocumentStore, FullDocument, Pipeline, UpdateSpec,
    WatchOptions, WriteResult,
};

use crate::config::StoreConfig;

/// A store backed by a MongoDB deployment (replica set or sharded cluster;
/// change streams are unavailable on standalone servers).
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
}

impl MongoStore {
    /// Connect and verify the deployment answers a `ping`.
    #[instrument(skip(config), fields(app_name = %config.app_name, pool_size = config.pool_size), err)]
    pub async fn connect(config: &StoreConfig) -> ChangewatchResult<Self> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .map_err(|err| ChangewatchError::config(format!("invalid mongodb uri: {err}")))?;
        options.app_name = Some(config.app_name.clone());
        options.max_pool_size = Some(config.pool_size);

        let mut write_concern = WriteConcern::default();
        write_concern.w_timeout = Some(config.write_timeout);
        options.write_concern = Some(write_concern);

        let client = Client::with_options(options).map_err(connection_error)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(connection_error)?;

        info!("connected to mongodb");
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn collection(&self, namespace: &Namespace) -> Collection<Document> {
        self.client
            .database(namespace.database())
            .collection::<Document>(namespace.collection())
    }
}

fn connection_error(err: mongodb::error::Error) -> ChangewatchError {
    ChangewatchError::connection(err.to_string())
}

/// Network-level failures are connection errors; everything else the server
/// rejected is a write error.
fn write_error(err: mongodb::error::Error) -> ChangewatchError {
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. } => connection_error(err),
        _ => ChangewatchError::write(err.to_string()),
    }
}

fn to_document(value: &JsonValue) -> ChangewatchResult<Document> {
    bson::to_document(value).map_err(|err| ChangewatchError::serialization(err.to_string()))
}

fn to_json(value: Bson) -> JsonValue {
    value.into_relaxed_extjson()
}

fn to_event(document: Document) -> ChangewatchResult<ChangeEvent> {
    ChangeEvent::from_document(to_json(Bson::Document(document)))
}

#[async_trait]
impl ChangeSource for MongoStore {
    #[instrument(skip(self, pipeline, options), fields(namespace = %namespace), err)]
    async fn watch(
        &self,
        namespace: &Namespace,
        pipeline: Pipeline,
        options: WatchOptions,
    ) -> ChangewatchResult<ChangeSubscription> {
        let stages = pipeline
            .stages()
            .iter()
            .map(|stage| to_document(&stage.to_json()))
            .collect::<ChangewatchResult<Vec<_>>>()?;

        let collection = self.collection(namespace);
        let mut watch = collection.watch().pipeline(stages);
        if options.full_document == FullDocument::UpdateLookup {
            watch = watch.full_document(FullDocumentType::UpdateLookup);
        }
        let stream = watch.await.map_err(|err| match err.kind.as_ref() {
            ErrorKind::Command(_) => ChangewatchError::invalid_pipeline(err.to_string()),
            _ => connection_error(err),
        })?;
        let mut stream = Box::pin(stream.with_type::<Document>());

        let (feed, subscription) = ChangeSubscription::channel(namespace.clone());
        let subscription_id = subscription.id();
        debug!(%subscription_id, "change stream opened");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = feed.closed() => break,
                    next = stream.next() => match next {
                        Some(Ok(document)) => match to_event(document) {
                            Ok(event) => {
                                if !feed.push(event) {
                                    break;
                                }
                            }
                            Err(err) => {
                                feed.fail(err);
                                break;
                            }
                        },
                        Some(Err(err)) => {
                            warn!(%subscription_id, error = %err, "change stream failed");
                            feed.fail(connection_error(err));
                            break;
                        }
                        // The server ended the stream (after `invalidate`).
                        None => break,
                    },
                }
            }
            // Dropping the stream kills the server-side cursor.
            debug!(%subscription_id, "change stream released");
        });

        Ok(subscription)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    #[instrument(skip(self, document), fields(namespace = %namespace), err)]
    async fn insert_one(&self, namespace: &Namespace, document: JsonValue) -> ChangewatchResult<WriteResult> {
        let document = to_document(&document)?;
        let result = self
            .collection(namespace)
            .insert_one(document)
            .await
            .map_err(write_error)?;
        Ok(WriteResult::Inserted {
            id: to_json(result.inserted_id),
        })
    }

    #[instrument(skip(self, update), fields(namespace = %namespace, upsert = update.upsert), err)]
    async fn update_one(&self, namespace: &Namespace, update: &UpdateSpec) -> ChangewatchResult<WriteResult> {
        let filter = to_document(&update.filter)?;
        let set = to_document(&update.set)?;
        let result = self
            .collection(namespace)
            .update_one(filter, doc! { "$set": set })
            .upsert(update.upsert)
            .await
            .map_err(write_error)?;
        Ok(WriteResult::Updated {
            matched: result.matched_count,
            modified: result.modified_count,
            upserted_id: result.upserted_id.map(to_json),
        })
    }

    #[instrument(skip(self), fields(namespace = %namespace), err)]
    async fn drop_collection(&self, namespace: &Namespace) -> ChangewatchResult<()> {
        self.collection(namespace).drop().await.map_err(write_error)?;
        info!("collection dropped");
        Ok(())
    }
}
