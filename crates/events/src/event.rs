//! Change event model.
//!
//! A change event is kept as the document the store delivered, after the
//! subscription's pipeline ran. A `$project` stage may remove any field, so
//! every typed accessor returns `Option`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use changewatch_core::{ChangewatchError, ChangewatchResult, Namespace};

use crate::document::get_path;

/// Kind of committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Invalidate,
    /// Any kind this crate does not model explicitly (e.g. `rename`).
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Drop => "drop",
            Self::Invalidate => "invalidate",
            Self::Other(s) => s,
        }
    }

    /// Kinds that carry a `fullDocument` without an explicit lookup.
    pub fn carries_full_document(&self) -> bool {
        matches!(self, Self::Insert | Self::Replace)
    }
}

impl From<&str> for OperationKind {
    fn from(value: &str) -> Self {
        match value {
            "insert" => Self::Insert,
            "update" => Self::Update,
            "replace" => Self::Replace,
            "delete" => Self::Delete,
            "drop" => Self::Drop,
            "invalidate" => Self::Invalidate,
            other => Self::Other(other.to_string()),
        }
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque ordering token (`_id` of a change event).
///
/// Tokens issued by one source are monotonic. The in-memory store encodes
/// its commit sequence as a fixed-width hex string under `_data`, the same
/// shape MongoDB uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(JsonValue);

impl ResumeToken {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn from_sequence(sequence: u64) -> Self {
        Self(json!({ "_data": format!("{sequence:016X}") }))
    }

    pub fn data(&self) -> Option<&str> {
        self.0.get("_data").and_then(JsonValue::as_str)
    }

    /// Commit sequence, when the token was issued by [`ResumeToken::from_sequence`].
    pub fn sequence(&self) -> Option<u64> {
        u64::from_str_radix(self.data()?, 16).ok()
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }
}

/// Fields changed by an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Map<String, JsonValue>,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

impl UpdateDescription {
    pub fn is_empty(&self) -> bool {
        self.updated_fields.is_empty() && self.removed_fields.is_empty()
    }
}

/// A single committed mutation as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub struct ChangeEvent {
    document: Map<String, JsonValue>,
}

impl ChangeEvent {
    pub fn builder(operation: OperationKind, token: ResumeToken) -> ChangeEventBuilder {
        ChangeEventBuilder::new(operation, token)
    }

    /// Wrap an event document; it must be a JSON object.
    pub fn from_document(document: JsonValue) -> ChangewatchResult<Self> {
        match document {
            JsonValue::Object(document) => Ok(Self { document }),
            other => Err(ChangewatchError::serialization(format!(
                "change event must be an object, got {other}"
            ))),
        }
    }

    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.document.get("_id").cloned().map(ResumeToken)
    }

    pub fn operation_kind(&self) -> Option<OperationKind> {
        self.document
            .get("operationType")
            .and_then(JsonValue::as_str)
            .map(OperationKind::from)
    }

    pub fn namespace(&self) -> Option<Namespace> {
        let ns = self.document.get("ns")?;
        let db = ns.get("db")?.as_str()?;
        let coll = ns.get("coll")?.as_str()?;
        Namespace::new(db, coll).ok()
    }

    pub fn document_key(&self) -> Option<&JsonValue> {
        self.document.get("documentKey")
    }

    pub fn full_document(&self) -> Option<&JsonValue> {
        self.document.get("fullDocument").filter(|d| !d.is_null())
    }

    pub fn update_description(&self) -> Option<UpdateDescription> {
        let raw = self.document.get("updateDescription")?;
        serde_json::from_value(raw.clone()).ok()
    }

    pub fn wall_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.document.get("wallTime")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Value at a dotted path (`fullDocument.amount`).
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let value = self.document.get(head)?;
        match rest {
            Some(rest) => get_path(value, rest),
            None => Some(value),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.document
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.document.clone())
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.document)
    }
}

impl TryFrom<JsonValue> for ChangeEvent {
    type Error = ChangewatchError;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        Self::from_document(value)
    }
}

impl From<ChangeEvent> for JsonValue {
    fn from(event: ChangeEvent) -> Self {
        event.into_json()
    }
}

/// Builds the raw event document a store emits at commit time.
#[derive(Debug, Clone)]
pub struct ChangeEventBuilder {
    document: Map<String, JsonValue>,
}

impl ChangeEventBuilder {
    pub fn new(operation: OperationKind, token: ResumeToken) -> Self {
        let mut document = Map::new();
        document.insert("_id".into(), token.0);
        document.insert("operationType".into(), JsonValue::String(operation.as_str().into()));
        Self { document }
    }

    pub fn namespace(mut self, namespace: &Namespace) -> Self {
        self.document.insert(
            "ns".into(),
            json!({ "db": namespace.database(), "coll": namespace.collection() }),
        );
        self
    }

    pub fn document_key(mut self, id: JsonValue) -> Self {
        self.document.insert("documentKey".into(), json!({ "_id": id }));
        self
    }

    pub fn full_document(mut self, document: JsonValue) -> Self {
        self.document.insert("fullDocument".into(), document);
        self
    }

    pub fn update_description(mut self, description: UpdateDescription) -> Self {
        if let Ok(value) = serde_json::to_value(description) {
            self.document.insert("updateDescription".into(), value);
        }
        self
    }

    pub fn wall_time(mut self, at: DateTime<Utc>) -> Self {
        self.document.insert("wallTime".into(), JsonValue::String(at.to_rfc3339()));
        self
    }

    pub fn build(self) -> ChangeEvent {
        ChangeEvent {
            document: self.document,
        }
    }
}
