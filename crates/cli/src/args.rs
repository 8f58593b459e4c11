//! Command line arguments.

use std::time::Duration;

use clap::{Parser, Subcommand};

use changewatch_infra::config::{
    DEFAULT_APP_NAME, DEFAULT_COLLECTION, DEFAULT_DATABASE, DEFAULT_POOL_SIZE, DEFAULT_URI, ENV_COLLECTION,
    ENV_DATABASE, ENV_POOL_SIZE, ENV_URI, ENV_WRITE_TIMEOUT_MS,
};
use changewatch_infra::scenario::{DEFAULT_THRESHOLD, ScenarioSettings};
use changewatch_infra::StoreConfig;

/// Watch a collection's change stream while generating stock movements.
#[derive(Debug, Parser)]
#[command(name = "changewatch", version)]
pub struct Args {
    /// Store URI: `memory://` or `mongodb://host:port/?replicaSet=...`.
    #[arg(long, global = true, env = ENV_URI, default_value = DEFAULT_URI)]
    pub uri: String,

    #[arg(long, global = true, env = ENV_DATABASE, default_value = DEFAULT_DATABASE)]
    pub database: String,

    #[arg(long, global = true, env = ENV_COLLECTION, default_value = DEFAULT_COLLECTION)]
    pub collection: String,

    /// Maximum pooled connections.
    #[arg(long, global = true, env = ENV_POOL_SIZE, default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: u32,

    /// Write acknowledgement timeout (ms).
    #[arg(long, global = true, env = ENV_WRITE_TIMEOUT_MS, default_value_t = 2500)]
    pub write_timeout_ms: u64,

    /// Gap between scheduled writes (ms).
    #[arg(long, global = true, default_value_t = 1000)]
    pub delay_ms: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Insert ten graded figures and log every change.
    Inserts,
    /// Restock one figure, alert while it is below 20, then drop the collection.
    LowStock {
        /// Alerts to observe before shutting down.
        #[arg(long, default_value_t = DEFAULT_THRESHOLD, value_parser = clap::value_parser!(u64).range(1..=20))]
        threshold: u64,
    },
}

impl From<&Args> for StoreConfig {
    fn from(args: &Args) -> Self {
        StoreConfig::default()
            .with_uri(args.uri.clone())
            .with_database(args.database.clone())
            .with_collection(args.collection.clone())
            .with_pool_size(args.pool_size)
            .with_write_timeout(Duration::from_millis(args.write_timeout_ms))
            .with_app_name(DEFAULT_APP_NAME)
    }
}

impl Args {
    pub fn scenario_settings(&self) -> ScenarioSettings {
        let settings = ScenarioSettings::default().with_delay(Duration::from_millis(self.delay_ms));
        match self.command {
            Command::LowStock { threshold } => settings.with_threshold(threshold),
            Command::Inserts => settings,
        }
    }
}
