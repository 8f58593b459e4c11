//! `$project` / `$unset` over event documents.

use serde_json::{Map, Value as JsonValue};

use changewatch_core::{ChangewatchError, ChangewatchResult};

use crate::document::{get_path, remove_path, set_path};

/// A compiled projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// Drop the listed paths, keep everything else.
    Exclude(Vec<String>),
    /// Keep only the listed paths (plus `_id` unless suppressed).
    Include { paths: Vec<String>, keep_id: bool },
}

impl Projection {
    /// Compile a `$project` specification such as `{ "documentKey": false }`.
    ///
    /// Values must be booleans or numbers (`0` excludes). Inclusion and
    /// exclusion cannot be mixed, except that `_id` may always be excluded.
    pub fn compile(body: &JsonValue) -> ChangewatchResult<Self> {
        let map = body.as_object().ok_or_else(|| {
            ChangewatchError::invalid_pipeline(format!("$project must be an object, got {body}"))
        })?;
        if map.is_empty() {
            return Err(ChangewatchError::invalid_pipeline(
                "$project requires at least one field",
            ));
        }

        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut keep_id = true;

        for (path, flag) in map {
            let include = match flag {
                JsonValue::Bool(b) => *b,
                JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                other => {
                    return Err(ChangewatchError::invalid_pipeline(format!(
                        "$project value for {path} must be a boolean or number, got {other}"
                    )));
                }
            };
            match (path.as_str(), include) {
                ("_id", false) => keep_id = false,
                ("_id", true) => {}
                (_, true) => included.push(path.clone()),
                (_, false) => excluded.push(path.clone()),
            }
        }

        match (included.is_empty(), excluded.is_empty()) {
            (true, _) => {
                if !keep_id {
                    excluded.insert(0, "_id".to_string());
                }
                Ok(Self::Exclude(excluded))
            }
            (false, true) => Ok(Self::Include {
                paths: included,
                keep_id,
            }),
            (false, false) => Err(ChangewatchError::invalid_pipeline(
                "$project cannot mix inclusion and exclusion",
            )),
        }
    }

    /// Compile an `$unset` specification (a path or an array of paths).
    pub fn compile_unset(body: &JsonValue) -> ChangewatchResult<Self> {
        let paths = match body {
            JsonValue::String(path) => vec![path.clone()],
            JsonValue::Array(items) if !items.is_empty() => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        ChangewatchError::invalid_pipeline(format!("$unset entries must be strings, got {item}"))
                    })
                })
                .collect::<ChangewatchResult<Vec<_>>>()?,
            other => {
                return Err(ChangewatchError::invalid_pipeline(format!(
                    "$unset needs a path or a non-empty array of paths, got {other}"
                )));
            }
        };
        Ok(Self::Exclude(paths))
    }

    /// Apply the projection to a document.
    pub fn apply(&self, mut document: JsonValue) -> JsonValue {
        match self {
            Self::Exclude(paths) => {
                for path in paths {
                    remove_path(&mut document, path);
                }
                document
            }
            Self::Include { paths, keep_id } => {
                let mut out = JsonValue::Object(Map::new());
                if *keep_id {
                    if let Some(id) = document.get("_id") {
                        set_path(&mut out, "_id", id.clone());
                    }
                }
                for path in paths {
                    if let Some(value) = get_path(&document, path) {
                        set_path(&mut out, path, value.clone());
                    }
                }
                out
            }
        }
    }
}
