//! Declarative pipelines applied to the raw change feed before delivery.
//!
//! A [`Pipeline`] is plain data (the JSON array a store accepts). Backends
//! that evaluate pipelines themselves compile it into a [`CompiledPipeline`];
//! backends that delegate to a server forward the stages untouched.
//!
//! Stages run in order:
//!
//! - `$match` drops events that do not satisfy the filter
//! - `$project` / `$unset` remove or keep fields
//!
//! An empty pipeline delivers every event unchanged.

mod filter;
mod projection;

pub use filter::{Condition, Filter};
pub use projection::Projection;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use changewatch_core::{ChangewatchError, ChangewatchResult};

use crate::event::ChangeEvent;

/// One pipeline stage, kept in its declarative form.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(JsonValue),
    Project(JsonValue),
    Unset(JsonValue),
    /// Any other stage (`$addFields`, `$replaceRoot`, ...), forwarded verbatim.
    Other { name: String, body: JsonValue },
}

impl Stage {
    pub fn name(&self) -> &str {
        match self {
            Self::Match(_) => "$match",
            Self::Project(_) => "$project",
            Self::Unset(_) => "$unset",
            Self::Other { name, .. } => name,
        }
    }

    pub fn body(&self) -> &JsonValue {
        match self {
            Self::Match(body) | Self::Project(body) | Self::Unset(body) => body,
            Self::Other { body, .. } => body,
        }
    }

    /// Parse a single-key stage document such as `{ "$match": { ... } }`.
    pub fn from_json(value: &JsonValue) -> ChangewatchResult<Self> {
        let map = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| ChangewatchError::invalid_pipeline(format!("stage must be a single-key object, got {value}")))?;

        let Some((name, body)) = map.iter().next() else {
            return Err(ChangewatchError::invalid_pipeline("empty stage"));
        };
        if !name.starts_with('$') {
            return Err(ChangewatchError::invalid_pipeline(format!(
                "stage name {name} must start with '$'"
            )));
        }

        Ok(match name.as_str() {
            "$match" => Self::Match(body.clone()),
            "$project" => Self::Project(body.clone()),
            "$unset" => Self::Unset(body.clone()),
            _ => Self::Other {
                name: name.clone(),
                body: body.clone(),
            },
        })
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        map.insert(self.name().to_string(), self.body().clone());
        JsonValue::Object(map)
    }
}

/// Ordered sequence of stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<JsonValue>", into = "Vec<JsonValue>")]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON array form: `[{ "$match": ... }, { "$project": ... }]`.
    pub fn from_json(value: &JsonValue) -> ChangewatchResult<Self> {
        let items = value.as_array().ok_or_else(|| {
            ChangewatchError::invalid_pipeline(format!("pipeline must be an array, got {value}"))
        })?;
        let stages = items.iter().map(Stage::from_json).collect::<ChangewatchResult<_>>()?;
        Ok(Self { stages })
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn matching(self, filter: JsonValue) -> Self {
        self.stage(Stage::Match(filter))
    }

    pub fn project(self, projection: JsonValue) -> Self {
        self.stage(Stage::Project(projection))
    }

    pub fn unset(self, paths: JsonValue) -> Self {
        self.stage(Stage::Unset(paths))
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Array(self.stages.iter().map(Stage::to_json).collect())
    }

    /// Compile for in-process evaluation.
    pub fn compile(&self) -> ChangewatchResult<CompiledPipeline> {
        CompiledPipeline::compile(self)
    }
}

impl TryFrom<Vec<JsonValue>> for Pipeline {
    type Error = ChangewatchError;

    fn try_from(items: Vec<JsonValue>) -> Result<Self, Self::Error> {
        Self::from_json(&JsonValue::Array(items))
    }
}

impl From<Pipeline> for Vec<JsonValue> {
    fn from(pipeline: Pipeline) -> Self {
        pipeline.stages.iter().map(Stage::to_json).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CompiledStage {
    Match(Filter),
    Reshape(Projection),
}

/// A pipeline ready to run against event documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledPipeline {
    stages: Vec<CompiledStage>,
}

impl CompiledPipeline {
    /// Compile every stage; stages this evaluator cannot run are rejected.
    pub fn compile(pipeline: &Pipeline) -> ChangewatchResult<Self> {
        let stages = pipeline
            .stages()
            .iter()
            .map(|stage| {
                Ok(match stage {
                    Stage::Match(body) => CompiledStage::Match(Filter::compile(body)?),
                    Stage::Project(body) => CompiledStage::Reshape(Projection::compile(body)?),
                    Stage::Unset(body) => CompiledStage::Reshape(Projection::compile_unset(body)?),
                    Stage::Other { name, .. } => {
                        return Err(ChangewatchError::invalid_pipeline(format!(
                            "stage {name} is not supported by the in-process evaluator"
                        )));
                    }
                })
            })
            .collect::<ChangewatchResult<_>>()?;
        Ok(Self { stages })
    }

    /// Run the stages in order over a raw event document.
    ///
    /// Returns `None` when a `$match` stage dropped the event.
    pub fn apply_document(&self, mut document: JsonValue) -> Option<JsonValue> {
        for stage in &self.stages {
            match stage {
                CompiledStage::Match(filter) => {
                    if !filter.matches(&document) {
                        return None;
                    }
                }
                CompiledStage::Reshape(projection) => document = projection.apply(document),
            }
        }
        Some(document)
    }

    /// Run the stages over an event.
    pub fn apply(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        let document = self.apply_document(event.into_json())?;
        ChangeEvent::from_document(document).ok()
    }
}
