use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use changewatch_core::{ChangewatchError, ChangewatchResult, Namespace};
use changewatch_events::document::{get_path, set_path};
use changewatch_events::{
    ChangeEvent, ChangeEventBuilder, ChangeSource, ChangeSubscription, CompiledPipeline, DocumentStore, Filter,
    FullDocument, OperationKind, Pipeline, ResumeToken, SubscriptionFeed, UpdateDescription, UpdateSpec,
    WatchOptions, WriteResult,
};

struct Watcher {
    namespace: Namespace,
    pipeline: CompiledPipeline,
    full_document: FullDocument,
    feed: SubscriptionFeed,
}

impl Watcher {
    /// Shape the raw event for this watcher and push it. Returns `false` once
    /// the consumer is gone.
    fn deliver(&self, event: &ChangeEvent) -> bool {
        if self.feed.is_closed() {
            return false;
        }

        let kind = event.operation_kind();
        let mut raw = event.to_json();
        if kind == Some(OperationKind::Update) && self.full_document == FullDocument::Default {
            if let JsonValue::Object(map) = &mut raw {
                map.remove("fullDocument");
            }
        }

        // `invalidate` ends the stream and is never filtered out.
        let shaped = if kind == Some(OperationKind::Invalidate) {
            Some(raw)
        } else {
            self.pipeline.apply_document(raw)
        };

        match shaped.map(ChangeEvent::from_document) {
            Some(Ok(event)) => self.feed.push(event),
            Some(Err(err)) => {
                warn!(subscription_id = %self.feed.handle().id(), error = %err, "pipeline output is not an event");
                true
            }
            None => true,
        }
    }
}

#[derive(Default)]
struct State {
    disconnected: bool,
    sequence: u64,
    collections: HashMap<Namespace, Vec<JsonValue>>,
    watchers: Vec<Watcher>,
}

impl State {
    fn ensure_connected(&self) -> ChangewatchResult<()> {
        if self.disconnected {
            Err(ChangewatchError::connection("in-memory store is disconnected"))
        } else {
            Ok(())
        }
    }

    fn next_event(&mut self, kind: OperationKind, namespace: &Namespace) -> ChangeEventBuilder {
        self.sequence += 1;
        ChangeEvent::builder(kind, ResumeToken::from_sequence(self.sequence))
            .namespace(namespace)
            .wall_time(Utc::now())
    }

    /// Fan a committed event out to the watchers of its namespace, in commit
    /// order. Closed watchers on any namespace are released along the way.
    fn publish(&mut self, namespace: &Namespace, event: ChangeEvent) {
        self.watchers.retain(|watcher| {
            if watcher.namespace == *namespace {
                watcher.deliver(&event)
            } else {
                !watcher.feed.is_closed()
            }
        });
    }
}

/// In-process document store with change streams.
///
/// Intended for tests/dev and the `memory://` backend. Every write commits
/// under one lock and fans out to subscribers before returning, so events on a
/// collection are delivered in commit order. Pipelines are evaluated here,
/// playing the part a server plays for a real deployment.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryStore")
            .field("disconnected", &state.disconnected)
            .field("sequence", &state.sequence)
            .field("collections", &state.collections.len())
            .field("watchers", &state.watchers.len())
            .finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a collection's documents in insertion order.
    pub fn documents(&self, namespace: &Namespace) -> Vec<JsonValue> {
        self.state
            .lock()
            .collections
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of live subscriptions; closed ones are pruned first.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|w| !w.feed.is_closed());
        state.watchers.len()
    }

    /// Simulate losing the connection: every open subscription fails with a
    /// `Connection` error and later operations fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.disconnected = true;
        let watchers = std::mem::take(&mut state.watchers);
        warn!(subscriptions = watchers.len(), "in-memory store disconnected");
        for watcher in watchers {
            watcher
                .feed
                .fail(ChangewatchError::connection("connection to the store was lost"));
        }
    }

    pub fn reconnect(&self) {
        self.state.lock().disconnected = false;
        info!("in-memory store reconnected");
    }
}

fn document_id(document: &mut Map<String, JsonValue>) -> JsonValue {
    document
        .entry("_id")
        .or_insert_with(|| JsonValue::String(Uuid::now_v7().to_string()))
        .clone()
}

#[async_trait]
impl ChangeSource for InMemoryStore {
    #[instrument(skip(self, pipeline, options), fields(namespace = %namespace), err)]
    async fn watch(
        &self,
        namespace: &Namespace,
        pipeline: Pipeline,
        options: WatchOptions,
    ) -> ChangewatchResult<ChangeSubscription> {
        let compiled = pipeline.compile()?;

        let mut state = self.state.lock();
        state.ensure_connected()?;

        let (feed, subscription) = ChangeSubscription::channel(namespace.clone());
        debug!(
            subscription_id = %subscription.id(),
            stages = pipeline.stages().len(),
            full_document = ?options.full_document,
            "subscription opened"
        );
        state.watchers.push(Watcher {
            namespace: namespace.clone(),
            pipeline: compiled,
            full_document: options.full_document,
            feed,
        });
        Ok(subscription)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    #[instrument(skip(self, document), fields(namespace = %namespace), err)]
    async fn insert_one(&self, namespace: &Namespace, document: JsonValue) -> ChangewatchResult<WriteResult> {
        let JsonValue::Object(mut document) = document else {
            return Err(ChangewatchError::write("document must be an object"));
        };

        let mut state = self.state.lock();
        state.ensure_connected()?;

        let id = document_id(&mut document);
        let collection = state.collections.entry(namespace.clone()).or_default();
        if collection
            .iter()
            .any(|existing| existing.get("_id") == Some(&id))
        {
            return Err(ChangewatchError::write(format!(
                "duplicate key error: {namespace} already has _id {id}"
            )));
        }
        let document = JsonValue::Object(document);
        collection.push(document.clone());

        let event = state
            .next_event(OperationKind::Insert, namespace)
            .document_key(id.clone())
            .full_document(document)
            .build();
        state.publish(namespace, event);

        Ok(WriteResult::Inserted { id })
    }

    #[instrument(skip(self, update), fields(namespace = %namespace, upsert = update.upsert), err)]
    async fn update_one(&self, namespace: &Namespace, update: &UpdateSpec) -> ChangewatchResult<WriteResult> {
        let filter = Filter::compile(&update.filter)
            .map_err(|err| ChangewatchError::write(format!("invalid update filter: {err}")))?;
        let Some(set) = update.set.as_object() else {
            return Err(ChangewatchError::write("$set must be an object"));
        };
        if set.contains_key("_id") {
            return Err(ChangewatchError::write("_id is immutable"));
        }

        let mut state = self.state.lock();
        state.ensure_connected()?;

        let collection = state.collections.entry(namespace.clone()).or_default();
        let Some(position) = collection.iter().position(|doc| filter.matches(doc)) else {
            if !update.upsert {
                return Ok(WriteResult::Updated {
                    matched: 0,
                    modified: 0,
                    upserted_id: None,
                });
            }

            let mut seeded = JsonValue::Object(Map::new());
            let fields = filter
                .equality_fields()
                .into_iter()
                .chain(set.iter().map(|(path, value)| (path.as_str(), value)));
            for (path, value) in fields {
                if !set_path(&mut seeded, path, value.clone()) {
                    return Err(ChangewatchError::write(format!("cannot set {path}: a parent is not an object")));
                }
            }
            let JsonValue::Object(mut seeded) = seeded else {
                return Err(ChangewatchError::write("upserted document must be an object"));
            };
            let id = document_id(&mut seeded);
            let document = JsonValue::Object(seeded);
            collection.push(document.clone());

            let event = state
                .next_event(OperationKind::Insert, namespace)
                .document_key(id.clone())
                .full_document(document)
                .build();
            state.publish(namespace, event);

            return Ok(WriteResult::Updated {
                matched: 0,
                modified: 0,
                upserted_id: Some(id),
            });
        };

        // Staged on a copy so a rejected path leaves the stored document untouched.
        let mut next = collection[position].clone();
        let mut description = UpdateDescription::default();
        for (path, value) in set {
            let unchanged = get_path(&next, path).is_some_and(|current| current == value);
            if unchanged {
                continue;
            }
            if !set_path(&mut next, path, value.clone()) {
                return Err(ChangewatchError::write(format!("cannot set {path}: a parent is not an object")));
            }
            description.updated_fields.insert(path.clone(), value.clone());
        }

        if description.is_empty() {
            debug!("update matched but changed nothing");
            return Ok(WriteResult::Updated {
                matched: 1,
                modified: 0,
                upserted_id: None,
            });
        }

        let id = next.get("_id").cloned().unwrap_or(JsonValue::Null);
        let post_image = next.clone();
        collection[position] = next;
        let event = state
            .next_event(OperationKind::Update, namespace)
            .document_key(id)
            .update_description(description)
            .full_document(post_image)
            .build();
        state.publish(namespace, event);

        Ok(WriteResult::Updated {
            matched: 1,
            modified: 1,
            upserted_id: None,
        })
    }

    #[instrument(skip(self), fields(namespace = %namespace), err)]
    async fn drop_collection(&self, namespace: &Namespace) -> ChangewatchResult<()> {
        let mut state = self.state.lock();
        state.ensure_connected()?;

        if state.collections.remove(namespace).is_none() {
            debug!("drop of a missing collection is a no-op");
            return Ok(());
        }

        let dropped = state.next_event(OperationKind::Drop, namespace).build();
        state.publish(namespace, dropped);
        let invalidate = state.next_event(OperationKind::Invalidate, namespace).build();
        state.publish(namespace, invalidate);

        // Invalidated streams never see another event.
        state.watchers.retain(|w| w.namespace != *namespace);
        info!("collection dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("superheroesdb", "superheroes").unwrap()
    }

    async fn watch(store: &InMemoryStore, pipeline: Pipeline, options: WatchOptions) -> ChangeSubscription {
        store.watch(&ns(), pipeline, options).await.unwrap()
    }

    #[tokio::test]
    async fn insert_emits_an_event_with_the_stored_document() {
        let store = InMemoryStore::new();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;

        let result = store
            .insert_one(&ns(), json!({ "title": "Super Man 1", "amount": 20 }))
            .await
            .unwrap();
        let WriteResult::Inserted { id } = result else {
            panic!("expected an insert result");
        };

        let event = sub.next_event().await.unwrap();
        assert_eq!(event.operation_kind(), Some(OperationKind::Insert));
        assert_eq!(event.document_key(), Some(&json!({ "_id": id.clone() })));
        assert_eq!(event.get("fullDocument.title"), Some(&json!("Super Man 1")));
        assert_eq!(event.namespace(), Some(ns()));
        assert_eq!(store.documents(&ns())[0]["_id"], id);
    }

    #[tokio::test]
    async fn events_before_watch_are_not_replayed() {
        let store = InMemoryStore::new();
        store.insert_one(&ns(), json!({ "n": 1 })).await.unwrap();

        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        store.insert_one(&ns(), json!({ "n": 2 })).await.unwrap();

        let event = sub.next_event().await.unwrap();
        assert_eq!(event.get("fullDocument.n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn other_collections_are_not_delivered() {
        let store = InMemoryStore::new();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        let other = Namespace::new("superheroesdb", "villains").unwrap();

        store.insert_one(&other, json!({ "n": 1 })).await.unwrap();
        store.insert_one(&ns(), json!({ "n": 2 })).await.unwrap();

        let event = sub.next_event().await.unwrap();
        assert_eq!(event.get("fullDocument.n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = InMemoryStore::new();
        store.insert_one(&ns(), json!({ "_id": 1 })).await.unwrap();
        let err = store.insert_one(&ns(), json!({ "_id": 1 })).await.unwrap_err();
        assert!(matches!(err, ChangewatchError::Write(_)));
        assert_eq!(store.documents(&ns()).len(), 1);
    }

    #[tokio::test]
    async fn rejected_update_leaves_document_and_feed_untouched() {
        let store = InMemoryStore::new();
        store
            .insert_one(&ns(), json!({ "_id": "a", "title": "Super Man 4", "amount": 1 }))
            .await
            .unwrap();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;

        let update = UpdateSpec::new(json!({ "_id": "a" }), json!({ "amount": 99, "title.inner": 1 }));
        let err = store.update_one(&ns(), &update).await.unwrap_err();
        assert!(matches!(err, ChangewatchError::Write(_)));
        assert_eq!(
            store.documents(&ns()),
            vec![json!({ "_id": "a", "title": "Super Man 4", "amount": 1 })]
        );

        let upsert = UpdateSpec::new(json!({ "title": "Super Man 5" }), json!({ "title.inner": 1 })).with_upsert(true);
        let err = store.update_one(&ns(), &upsert).await.unwrap_err();
        assert!(matches!(err, ChangewatchError::Write(_)));
        assert_eq!(store.documents(&ns()).len(), 1);

        store.insert_one(&ns(), json!({ "_id": "b" })).await.unwrap();
        let next = sub.next_event().await.unwrap();
        assert_eq!(next.operation_kind(), Some(OperationKind::Insert));
        assert_eq!(next.get("fullDocument._id"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn closed_watchers_are_released_by_writes_elsewhere() {
        let store = InMemoryStore::new();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        assert!(sub.close());

        let other = Namespace::new("superheroesdb", "villains").unwrap();
        store.insert_one(&other, json!({ "n": 1 })).await.unwrap();
        assert!(store.state.lock().watchers.is_empty());
    }

    #[tokio::test]
    async fn upsert_seeds_from_the_filter_then_updates_in_place() {
        let store = InMemoryStore::new();
        let mut sub = watch(
            &store,
            Pipeline::new(),
            WatchOptions::default().with_full_document(FullDocument::UpdateLookup),
        )
        .await;
        let spec = |amount: &str| {
            UpdateSpec::new(json!({ "title": "Super Man 4" }), json!({ "amount": amount })).with_upsert(true)
        };

        let first = store.update_one(&ns(), &spec("0")).await.unwrap();
        assert!(matches!(first, WriteResult::Updated { upserted_id: Some(_), .. }));
        let second = store.update_one(&ns(), &spec("1")).await.unwrap();
        assert_eq!(
            second,
            WriteResult::Updated {
                matched: 1,
                modified: 1,
                upserted_id: None
            }
        );

        let inserted = sub.next_event().await.unwrap();
        assert_eq!(inserted.operation_kind(), Some(OperationKind::Insert));
        assert_eq!(inserted.get("fullDocument.title"), Some(&json!("Super Man 4")));
        assert_eq!(inserted.get("fullDocument.amount"), Some(&json!("0")));

        let updated = sub.next_event().await.unwrap();
        assert_eq!(updated.operation_kind(), Some(OperationKind::Update));
        assert_eq!(updated.get("fullDocument.amount"), Some(&json!("1")));
        assert_eq!(updated.get("updateDescription.updatedFields.amount"), Some(&json!("1")));
        assert_eq!(store.documents(&ns()).len(), 1);
    }

    #[tokio::test]
    async fn default_full_document_strips_the_post_image_from_updates() {
        let store = InMemoryStore::new();
        store.insert_one(&ns(), json!({ "_id": "a", "amount": 1 })).await.unwrap();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;

        store
            .update_one(&ns(), &UpdateSpec::new(json!({ "_id": "a" }), json!({ "amount": 2 })))
            .await
            .unwrap();

        let event = sub.next_event().await.unwrap();
        assert!(event.full_document().is_none());
        assert_eq!(event.get("updateDescription.updatedFields.amount"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn no_op_updates_emit_nothing() {
        let store = InMemoryStore::new();
        store.insert_one(&ns(), json!({ "_id": "a", "amount": 1 })).await.unwrap();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;

        let result = store
            .update_one(&ns(), &UpdateSpec::new(json!({ "_id": "a" }), json!({ "amount": 1 })))
            .await
            .unwrap();
        assert_eq!(
            result,
            WriteResult::Updated {
                matched: 1,
                modified: 0,
                upserted_id: None
            }
        );

        store.insert_one(&ns(), json!({ "_id": "b" })).await.unwrap();
        let event = sub.next_event().await.unwrap();
        assert_eq!(event.document_key(), Some(&json!({ "_id": "b" })));
    }

    #[tokio::test]
    async fn pipeline_filters_and_projects_per_subscription() {
        let store = InMemoryStore::new();
        let mut low = watch(
            &store,
            Pipeline::new()
                .matching(json!({ "fullDocument.amount": { "$lt": 20 } }))
                .project(json!({ "documentKey": false })),
            WatchOptions::default(),
        )
        .await;
        let mut all = watch(&store, Pipeline::new(), WatchOptions::default()).await;

        for amount in [50, 5, 30] {
            store.insert_one(&ns(), json!({ "amount": amount })).await.unwrap();
        }

        let event = low.next_event().await.unwrap();
        assert_eq!(event.get("fullDocument.amount"), Some(&json!(5)));
        assert!(!event.contains("documentKey"));

        for amount in [50, 5, 30] {
            let event = all.next_event().await.unwrap();
            assert_eq!(event.get("fullDocument.amount"), Some(&json!(amount)));
            assert!(event.contains("documentKey"));
        }
    }

    #[tokio::test]
    async fn unsupported_stages_fail_at_watch() {
        let store = InMemoryStore::new();
        let pipeline = Pipeline::from_json(&json!([{ "$addFields": { "x": 1 } }])).unwrap();
        let err = store.watch(&ns(), pipeline, WatchOptions::default()).await.unwrap_err();
        assert!(matches!(err, ChangewatchError::InvalidPipeline(_)));
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn resume_tokens_increase_in_commit_order() {
        let store = InMemoryStore::new();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        for n in 0..5 {
            store.insert_one(&ns(), json!({ "n": n })).await.unwrap();
        }

        let mut last = 0;
        for _ in 0..5 {
            let seq = sub
                .next_event()
                .await
                .unwrap()
                .resume_token()
                .and_then(|t| t.sequence())
                .unwrap();
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test]
    async fn drop_sends_drop_then_invalidate_then_ends() {
        let store = InMemoryStore::new();
        store.insert_one(&ns(), json!({ "n": 1 })).await.unwrap();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;

        store.drop_collection(&ns()).await.unwrap();

        assert_eq!(sub.next_event().await.unwrap().operation_kind(), Some(OperationKind::Drop));
        assert_eq!(
            sub.next_event().await.unwrap().operation_kind(),
            Some(OperationKind::Invalidate)
        );
        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));
        assert!(store.documents(&ns()).is_empty());
        assert_eq!(store.watcher_count(), 0);

        // Dropping again is a no-op.
        store.drop_collection(&ns()).await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_open_subscriptions_once() {
        let store = InMemoryStore::new();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        store.insert_one(&ns(), json!({ "n": 1 })).await.unwrap();

        store.disconnect();

        assert!(sub.next_event().await.is_ok());
        assert!(matches!(sub.next_event().await, Err(ChangewatchError::Connection(_))));
        assert_eq!(sub.next_event().await, Err(ChangewatchError::SubscriptionClosed));

        let err = store.insert_one(&ns(), json!({ "n": 2 })).await.unwrap_err();
        assert!(matches!(err, ChangewatchError::Connection(_)));
        assert!(store.watch(&ns(), Pipeline::new(), WatchOptions::default()).await.is_err());

        store.reconnect();
        assert!(store.insert_one(&ns(), json!({ "n": 3 })).await.is_ok());
    }

    #[tokio::test]
    async fn closed_subscriptions_are_pruned() {
        let store = InMemoryStore::new();
        let mut sub = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        let _open = watch(&store, Pipeline::new(), WatchOptions::default()).await;
        assert_eq!(store.watcher_count(), 2);

        sub.close();
        store.insert_one(&ns(), json!({ "n": 1 })).await.unwrap();
        assert_eq!(store.watcher_count(), 1);
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig {
            cases: 64,
            ..proptest::prelude::ProptestConfig::default()
        })]

        /// Property: a filtered subscription sees exactly the matching inserts,
        /// in commit order, while an unfiltered one sees all of them.
        #[test]
        fn subscribers_see_matching_commits_in_order(
            amounts in proptest::collection::vec(0i64..100i64, 1..30),
            limit in 0i64..100i64,
        ) {
            let (all, low) = block_on(async {
                let store = InMemoryStore::new();
                let mut all = watch(&store, Pipeline::new(), WatchOptions::default()).await;
                let mut low = watch(
                    &store,
                    Pipeline::new().matching(json!({ "fullDocument.amount": { "$lt": limit } })),
                    WatchOptions::default(),
                )
                .await;

                for amount in &amounts {
                    store.insert_one(&ns(), json!({ "amount": amount })).await.unwrap();
                }
                store.drop_collection(&ns()).await.unwrap();

                let mut seen_all = Vec::new();
                let mut seen_low = Vec::new();
                for (sub, seen) in [(&mut all, &mut seen_all), (&mut low, &mut seen_low)] {
                    while let Ok(event) = sub.next_event().await {
                        if let Some(amount) = event.get("fullDocument.amount").and_then(JsonValue::as_i64) {
                            seen.push(amount);
                        }
                    }
                }
                (seen_all, seen_low)
            });

            let expected_low: Vec<i64> = amounts.iter().copied().filter(|a| *a < limit).collect();
            proptest::prop_assert_eq!(all, amounts);
            proptest::prop_assert_eq!(low, expected_low);
        }
    }
}
