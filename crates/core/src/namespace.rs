//! Collection namespace (`database.collection`).

use serde::{Deserialize, Serialize};

use crate::error::{ChangewatchError, ChangewatchResult};

const FORBIDDEN_DB_CHARS: &[char] = &['/', '\\', '.', ' ', '"', '$'];

/// Identifies a monitored collection: database name + collection name.
///
/// Namespaces are value objects: two namespaces with the same names are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawNamespace")]
pub struct Namespace {
    #[serde(rename = "db")]
    database: String,
    #[serde(rename = "coll")]
    collection: String,
}

/// Wire form; deserialization goes through [`Namespace::new`].
#[derive(Deserialize)]
struct RawNamespace {
    db: String,
    coll: String,
}

impl TryFrom<RawNamespace> for Namespace {
    type Error = ChangewatchError;

    fn try_from(raw: RawNamespace) -> ChangewatchResult<Self> {
        Self::new(raw.db, raw.coll)
    }
}

impl Namespace {
    /// Build a validated namespace.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> ChangewatchResult<Self> {
        let database = database.into();
        let collection = collection.into();

        if database.is_empty() {
            return Err(ChangewatchError::invalid_namespace("database name is empty"));
        }
        if let Some(c) = database.chars().find(|c| FORBIDDEN_DB_CHARS.contains(c)) {
            return Err(ChangewatchError::invalid_namespace(format!(
                "database name {database:?} contains {c:?}"
            )));
        }
        if collection.is_empty() {
            return Err(ChangewatchError::invalid_namespace("collection name is empty"));
        }
        if collection.contains('$') {
            return Err(ChangewatchError::invalid_namespace(format!(
                "collection name {collection:?} contains '$'"
            )));
        }
        if collection.starts_with("system.") {
            return Err(ChangewatchError::invalid_namespace(format!(
                "collection name {collection:?} is reserved"
            )));
        }

        Ok(Self { database, collection })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl core::fmt::Display for Namespace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}
