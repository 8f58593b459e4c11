mod args;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use changewatch_events::ChangeEvent;
use changewatch_infra::{StoreConfig, WatchContext, scenario};

use crate::args::{Args, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    changewatch_observability::init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        error!(error = %format!("{err:#}"), "changewatch failed");
        return Err(err);
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = StoreConfig::from(&args);
    let settings = args.scenario_settings();

    let ctx = WatchContext::connect(&config)
        .await
        .with_context(|| format!("failed to open store at {}", config.uri))?;

    match args.command {
        Command::Inserts => {
            let report = scenario::run_insert_feed(&ctx, &settings, log_change).await?;
            if report.batch.failed() > 0 {
                warn!(failed = report.batch.failed(), "some inserts were rejected");
            }
            info!(events = report.events.len(), "inserts scenario complete");
        }
        Command::LowStock { .. } => {
            let report = scenario::run_low_stock(&ctx, &settings, log_change, |position, event| {
                info!(
                    position,
                    amount = %event.get("fullDocument.amount").cloned().unwrap_or_default(),
                    change = %event.to_json(),
                    "low stock"
                );
            })
            .await?;
            info!(
                alerts = report.alerts.len(),
                changes = report.feed_listener.delivered,
                "low-stock scenario complete"
            );
        }
    }
    Ok(())
}

fn log_change(event: &ChangeEvent) {
    let operation = event
        .operation_kind()
        .map(|kind| kind.to_string())
        .unwrap_or_default();
    info!(%operation, change = %event.to_json(), "change");
}
