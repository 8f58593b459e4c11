//! The two stock-tracking scenarios run by the CLI.
//!
//! - insert feed: watch the collection with `documentKey` projected out while
//!   ten graded figures are inserted one per delay step
//! - low stock: additionally watch for `fullDocument.amount < 20` while one
//!   figure's amount is repeatedly updated; after `threshold` alerts close the
//!   alert subscription and drop the collection

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, instrument, warn};

use changewatch_core::{ChangewatchError, ChangewatchResult};
use changewatch_events::{
    ChangeEvent, FullDocument, ListenerExit, ListenerSummary, Pipeline, StopAfter, UpdateSpec, WatchOptions,
    WriteSpec,
};

use crate::context::WatchContext;
use crate::scheduler::BatchReport;

pub const INSERT_AMOUNTS: [i64; 10] = [20, 30, 40, 50, 65, 75, 80, 90, 95, 100];
pub const LOW_STOCK_LIMIT: i64 = 20;
pub const RESTOCKED_TITLE: &str = "Super Man 4";
pub const DEFAULT_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_THRESHOLD: u64 = 10;
/// How long alerts may trail the last restock before the run gives up.
pub const ALERT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioSettings {
    /// Gap between consecutive scheduled writes.
    pub delay: Duration,
    /// Low-stock alerts to observe before shutting down.
    pub threshold: u64,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            delay: DEFAULT_DELAY,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl ScenarioSettings {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }
}

/// Every change, without the `documentKey` field.
pub fn feed_pipeline() -> Pipeline {
    Pipeline::new().project(json!({ "documentKey": false }))
}

/// Changes whose document has less than `limit` in stock.
pub fn low_stock_pipeline(limit: i64) -> Pipeline {
    Pipeline::new().matching(json!({ "fullDocument.amount": { "$lt": limit } }))
}

/// `Super Man 1..=10`, one per entry of [`INSERT_AMOUNTS`].
pub fn insert_writes() -> Vec<WriteSpec> {
    INSERT_AMOUNTS
        .iter()
        .enumerate()
        .map(|(idx, amount)| {
            WriteSpec::insert(json!({
                "title": format!("Super Man {}", idx + 1),
                "amount": amount,
            }))
        })
        .collect()
}

/// Upserts of [`RESTOCKED_TITLE`] setting `amount` to `"0"`, `"1"`, ...
pub fn restock_writes(count: u64) -> Vec<WriteSpec> {
    (0..count)
        .map(|i| {
            WriteSpec::update(
                UpdateSpec::new(json!({ "title": RESTOCKED_TITLE }), json!({ "amount": i.to_string() }))
                    .with_upsert(true),
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct InsertFeedReport {
    pub events: Vec<ChangeEvent>,
    pub batch: BatchReport,
}

/// Watch the projected feed while the inserts run; returns once every
/// successful insert has been observed.
#[instrument(skip(ctx, on_event), fields(namespace = %ctx.namespace()), err)]
pub async fn run_insert_feed<F>(
    ctx: &WatchContext,
    settings: &ScenarioSettings,
    mut on_event: F,
) -> ChangewatchResult<InsertFeedReport>
where
    F: FnMut(&ChangeEvent),
{
    let mut subscription = ctx.open(feed_pipeline(), WatchOptions::default()).await?;
    let batch = ctx.writer().schedule(insert_writes(), settings.delay);
    let joined = batch.join();
    tokio::pin!(joined);

    let mut report: Option<BatchReport> = None;
    let mut events = Vec::new();
    loop {
        if let Some(report) = &report {
            if events.len() >= report.succeeded() {
                break;
            }
        }
        tokio::select! {
            done = &mut joined, if report.is_none() => {
                if done.failed() > 0 {
                    warn!(failed = done.failed(), "some inserts failed");
                }
                report = Some(done);
            }
            next = subscription.next_event() => {
                let event = next?;
                on_event(&event);
                events.push(event);
            }
        }
    }
    subscription.close();

    let batch = report.ok_or_else(|| ChangewatchError::write("insert batch did not finish"))?;
    info!(events = events.len(), "insert feed finished");
    Ok(InsertFeedReport { events, batch })
}

#[derive(Debug, Clone)]
pub struct LowStockReport {
    /// Events matched by the low-stock pipeline, in delivery order.
    pub alerts: Vec<ChangeEvent>,
    pub alert_listener: ListenerSummary,
    pub feed_listener: ListenerSummary,
    pub batch: BatchReport,
}

/// Run the low-stock scenario to completion, including dropping the collection.
///
/// `on_feed` sees every projected change; `on_alert` sees each low-stock
/// event with its zero-based position. A failed alert subscription aborts the
/// scenario with that error. If every restock has run and the threshold is
/// still unmet after [`ALERT_GRACE`], the listeners are closed, the collection
/// is dropped and `ThresholdNotReached` is returned.
#[instrument(skip(ctx, on_feed, on_alert), fields(namespace = %ctx.namespace(), threshold = settings.threshold), err)]
pub async fn run_low_stock<F, A>(
    ctx: &WatchContext,
    settings: &ScenarioSettings,
    mut on_feed: F,
    mut on_alert: A,
) -> ChangewatchResult<LowStockReport>
where
    F: FnMut(&ChangeEvent) + Send + 'static,
    A: FnMut(u64, &ChangeEvent) + Send + 'static,
{
    let feed = ctx.open(feed_pipeline(), WatchOptions::default()).await?;
    let low_stock = ctx
        .open(
            low_stock_pipeline(LOW_STOCK_LIMIT),
            WatchOptions::default().with_full_document(FullDocument::UpdateLookup),
        )
        .await?;

    let feed_listener = feed.on_event(
        move |event| {
            on_feed(event);
            ControlFlow::Continue(())
        },
        |_| {},
    );

    let alerts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&alerts);
    let mut stop = StopAfter::new(settings.threshold);
    let alert_listener = low_stock.on_event(
        move |event| {
            on_alert(stop.seen(), event);
            sink.lock().push(event.clone());
            stop.observe()
        },
        |_| {},
    );

    let batch = ctx
        .writer()
        .schedule(restock_writes(settings.threshold), settings.delay);

    let cancel = batch.cancellation_token();
    let alert_handle = alert_listener.subscription().clone();
    let alert_join = alert_listener.join();
    let batch_join = batch.join();
    tokio::pin!(alert_join, batch_join);

    let (alert_summary, batch) = tokio::select! {
        summary = &mut alert_join => {
            cancel.cancel();
            (summary, batch_join.await)
        }
        report = &mut batch_join => {
            let summary = match tokio::time::timeout(ALERT_GRACE, &mut alert_join).await {
                Ok(summary) => summary,
                Err(_) => {
                    alert_handle.close();
                    alert_join.await
                }
            };
            (summary, report)
        }
    };
    feed_listener.close();
    let feed_summary = feed_listener.join().await;

    if let ListenerExit::Failed(err) = &alert_summary.exit {
        return Err(err.clone());
    }

    ctx.drop_collection().await?;
    if alert_summary.exit != ListenerExit::Stopped {
        warn!(
            seen = alert_summary.delivered,
            threshold = settings.threshold,
            failed = batch.failed(),
            "restocks ran out before the low-stock threshold, collection dropped"
        );
        return Err(ChangewatchError::ThresholdNotReached {
            seen: alert_summary.delivered,
            threshold: settings.threshold,
        });
    }
    info!(alerts = alert_summary.delivered, "low-stock threshold reached, collection dropped");

    let alerts = std::mem::take(&mut *alerts.lock());
    Ok(LowStockReport {
        alerts,
        alert_listener: alert_summary,
        feed_listener: feed_summary,
        batch,
    })
}
