//! Store configuration: defaults, then environment, then caller overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use changewatch_core::{ChangewatchError, ChangewatchResult, Namespace};

pub const DEFAULT_URI: &str = "memory://";
pub const DEFAULT_DATABASE: &str = "superheroesdb";
pub const DEFAULT_COLLECTION: &str = "superheroes";
pub const DEFAULT_POOL_SIZE: u32 = 50;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(2500);
pub const DEFAULT_APP_NAME: &str = "changewatch";

pub const ENV_URI: &str = "CHANGEWATCH_DB_URI";
pub const ENV_DATABASE: &str = "CHANGEWATCH_DATABASE";
pub const ENV_COLLECTION: &str = "CHANGEWATCH_COLLECTION";
pub const ENV_POOL_SIZE: &str = "CHANGEWATCH_POOL_SIZE";
pub const ENV_WRITE_TIMEOUT_MS: &str = "CHANGEWATCH_WRITE_TIMEOUT_MS";

/// Which backend a URI selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    MongoDb,
}

impl Backend {
    pub fn from_uri(uri: &str) -> ChangewatchResult<Self> {
        if uri.starts_with("memory://") {
            Ok(Self::Memory)
        } else if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
            Ok(Self::MongoDb)
        } else {
            Err(ChangewatchError::config(format!(
                "unsupported store uri {uri:?} (expected memory:// or mongodb://)"
            )))
        }
    }
}

/// Connection settings for a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
    /// Upper bound on pooled connections.
    pub pool_size: u32,
    /// How long the server may take to acknowledge a write.
    pub write_timeout: Duration,
    pub app_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            app_name: DEFAULT_APP_NAME.to_string(),
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `CHANGEWATCH_*` environment variables.
    pub fn from_env() -> ChangewatchResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ChangewatchResult<Self> {
        let mut config = Self::default();
        if let Some(uri) = lookup(ENV_URI) {
            config.uri = uri;
        }
        if let Some(database) = lookup(ENV_DATABASE) {
            config.database = database;
        }
        if let Some(collection) = lookup(ENV_COLLECTION) {
            config.collection = collection;
        }
        if let Some(raw) = lookup(ENV_POOL_SIZE) {
            config.pool_size = parse_number(ENV_POOL_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WRITE_TIMEOUT_MS) {
            config.write_timeout = Duration::from_millis(parse_number(ENV_WRITE_TIMEOUT_MS, &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    pub fn backend(&self) -> ChangewatchResult<Backend> {
        Backend::from_uri(&self.uri)
    }

    pub fn namespace(&self) -> ChangewatchResult<Namespace> {
        Namespace::new(self.database.clone(), self.collection.clone())
    }

    /// Check everything that can be checked without connecting.
    pub fn validate(&self) -> ChangewatchResult<()> {
        self.backend()?;
        self.namespace()?;
        if self.pool_size == 0 {
            return Err(ChangewatchError::config("pool_size must be at least 1"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> ChangewatchResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| ChangewatchError::config(format!("{key}={raw:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_target_the_in_memory_superheroes_collection() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.backend().unwrap(), Backend::Memory);
        assert_eq!(config.namespace().unwrap().to_string(), "superheroesdb.superheroes");
        assert_eq!(config.pool_size, 50);
        assert_eq!(config.write_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_URI, "mongodb://localhost:27017"),
            (ENV_DATABASE, "marvel"),
            (ENV_COLLECTION, "heroes"),
            (ENV_POOL_SIZE, " 8 "),
            (ENV_WRITE_TIMEOUT_MS, "100"),
        ]))
        .unwrap();
        assert_eq!(config.backend().unwrap(), Backend::MongoDb);
        assert_eq!(config.database, "marvel");
        assert_eq!(config.collection, "heroes");
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.write_timeout, Duration::from_millis(100));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for vars in [
            vec![(ENV_POOL_SIZE, "lots")],
            vec![(ENV_POOL_SIZE, "0")],
            vec![(ENV_WRITE_TIMEOUT_MS, "-1")],
            vec![(ENV_URI, "postgres://localhost")],
        ] {
            let err = StoreConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, ChangewatchError::Config(_)), "{vars:?} gave {err:?}");
        }

        let err = StoreConfig::from_lookup(lookup(&[(ENV_DATABASE, "bad.name")])).unwrap_err();
        assert!(matches!(err, ChangewatchError::InvalidNamespace(_)));
    }

    #[test]
    fn builders_override_fields() {
        let config = StoreConfig::default()
            .with_uri("mongodb+srv://cluster.example.net")
            .with_database("db")
            .with_collection("coll")
            .with_pool_size(5)
            .with_write_timeout(Duration::from_secs(1))
            .with_app_name("test");
        assert_eq!(config.backend().unwrap(), Backend::MongoDb);
        assert_eq!(config.app_name, "test");
        assert!(config.validate().is_ok());
    }
}
