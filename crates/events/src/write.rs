//! Write shapes accepted by a [`DocumentStore`](crate::source::DocumentStore).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// An update: match one document by `filter`, then `$set` the given fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub filter: JsonValue,
    pub set: JsonValue,
    /// Create the document from `filter` + `set` when nothing matches.
    #[serde(default)]
    pub upsert: bool,
}

impl UpdateSpec {
    pub fn new(filter: JsonValue, set: JsonValue) -> Self {
        Self {
            filter,
            set,
            upsert: false,
        }
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

/// One write in a scheduled batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteSpec {
    Insert { document: JsonValue },
    Update(UpdateSpec),
}

impl WriteSpec {
    pub fn insert(document: JsonValue) -> Self {
        Self::Insert { document }
    }

    pub fn update(spec: UpdateSpec) -> Self {
        Self::Update(spec)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update(_) => "update",
        }
    }
}

/// What the store reports for a successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteResult {
    Inserted {
        id: JsonValue,
    },
    Updated {
        matched: u64,
        modified: u64,
        upserted_id: Option<JsonValue>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn write_specs_are_tagged_by_op() {
        let insert = WriteSpec::insert(json!({ "title": "Super Man 1", "amount": 20 }));
        assert_eq!(
            serde_json::to_value(&insert).unwrap(),
            json!({ "op": "insert", "document": { "title": "Super Man 1", "amount": 20 } })
        );

        let update = WriteSpec::update(
            UpdateSpec::new(json!({ "title": "Super Man 4" }), json!({ "amount": "3" })).with_upsert(true),
        );
        let raw = serde_json::to_value(&update).unwrap();
        assert_eq!(raw["op"], "update");
        assert_eq!(raw["upsert"], true);
        assert_eq!(serde_json::from_value::<WriteSpec>(raw).unwrap(), update);
    }

    #[test]
    fn upsert_defaults_to_false() {
        let spec: UpdateSpec =
            serde_json::from_value(json!({ "filter": {}, "set": { "a": 1 } })).unwrap();
        assert!(!spec.upsert);
    }
}
