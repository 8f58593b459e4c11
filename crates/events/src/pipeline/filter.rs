//! `$match` filter documents.

use serde_json::{Map, Value as JsonValue};

use changewatch_core::{ChangewatchError, ChangewatchResult};

use crate::document::{compare_values, get_path, values_equal};
use core::cmp::Ordering;

/// A compiled filter document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Field { path: String, conditions: Vec<Condition> },
}

/// A predicate on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(JsonValue),
    Ne(JsonValue),
    Gt(JsonValue),
    Gte(JsonValue),
    Lt(JsonValue),
    Lte(JsonValue),
    In(Vec<JsonValue>),
    Nin(Vec<JsonValue>),
    Exists(bool),
}

impl Filter {
    /// Compile a filter document such as `{ "fullDocument.amount": { "$lt": 20 } }`.
    pub fn compile(body: &JsonValue) -> ChangewatchResult<Self> {
        let map = body
            .as_object()
            .ok_or_else(|| ChangewatchError::invalid_pipeline(format!("filter must be an object, got {body}")))?;
        compile_document(map)
    }

    /// A filter that matches every document.
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    /// Fields pinned to a single value by top-level equality (`{a: 1}`,
    /// `{a: {$eq: 1}}`, or either inside `$and`). An upsert seeds the new
    /// document from these.
    pub fn equality_fields(&self) -> Vec<(&str, &JsonValue)> {
        match self {
            Self::And(clauses) => clauses.iter().flat_map(Filter::equality_fields).collect(),
            Self::Field { path, conditions } => conditions
                .iter()
                .filter_map(|c| match c {
                    Condition::Eq(value) => Some((path.as_str(), value)),
                    _ => None,
                })
                .collect(),
            Self::Or(_) | Self::Nor(_) => Vec::new(),
        }
    }

    pub fn matches(&self, document: &JsonValue) -> bool {
        match self {
            Self::And(clauses) => clauses.iter().all(|f| f.matches(document)),
            Self::Or(clauses) => clauses.iter().any(|f| f.matches(document)),
            Self::Nor(clauses) => !clauses.iter().any(|f| f.matches(document)),
            Self::Field { path, conditions } => {
                let value = get_path(document, path);
                conditions.iter().all(|c| c.holds(value))
            }
        }
    }
}

impl Condition {
    fn holds(&self, value: Option<&JsonValue>) -> bool {
        match self {
            Self::Eq(expected) => equals(value, expected),
            Self::Ne(expected) => !equals(value, expected),
            Self::Gt(bound) => ordered(value, bound, |o| o == Ordering::Greater),
            Self::Gte(bound) => ordered(value, bound, |o| o != Ordering::Less),
            Self::Lt(bound) => ordered(value, bound, |o| o == Ordering::Less),
            Self::Lte(bound) => ordered(value, bound, |o| o != Ordering::Greater),
            Self::In(options) => options.iter().any(|o| equals(value, o)),
            Self::Nin(options) => !options.iter().any(|o| equals(value, o)),
            Self::Exists(expected) => value.is_some() == *expected,
        }
    }
}

fn compile_document(map: &Map<String, JsonValue>) -> ChangewatchResult<Filter> {
    let mut clauses = Vec::with_capacity(map.len());

    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Filter::And(compile_list(key, value)?),
            "$or" => Filter::Or(compile_list(key, value)?),
            "$nor" => Filter::Nor(compile_list(key, value)?),
            op if op.starts_with('$') => {
                return Err(ChangewatchError::invalid_pipeline(format!(
                    "unsupported top-level operator {op}"
                )));
            }
            path => Filter::Field {
                path: path.to_string(),
                conditions: compile_conditions(path, value)?,
            },
        };
        clauses.push(clause);
    }

    if clauses.len() == 1 {
        if let Some(single) = clauses.pop() {
            return Ok(single);
        }
    }
    Ok(Filter::And(clauses))
}

fn compile_list(op: &str, value: &JsonValue) -> ChangewatchResult<Vec<Filter>> {
    let items = value
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| ChangewatchError::invalid_pipeline(format!("{op} needs a non-empty array")))?;
    items.iter().map(Filter::compile).collect()
}

fn compile_conditions(path: &str, value: &JsonValue) -> ChangewatchResult<Vec<Condition>> {
    let operators = match value {
        JsonValue::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        JsonValue::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            return Err(ChangewatchError::invalid_pipeline(format!(
                "field {path} mixes operators and literal keys"
            )));
        }
        literal => return Ok(vec![Condition::Eq(literal.clone())]),
    };

    operators
        .iter()
        .map(|(op, arg)| {
            Ok(match op.as_str() {
                "$eq" => Condition::Eq(arg.clone()),
                "$ne" => Condition::Ne(arg.clone()),
                "$gt" => Condition::Gt(arg.clone()),
                "$gte" => Condition::Gte(arg.clone()),
                "$lt" => Condition::Lt(arg.clone()),
                "$lte" => Condition::Lte(arg.clone()),
                "$in" => Condition::In(array_arg(path, op, arg)?),
                "$nin" => Condition::Nin(array_arg(path, op, arg)?),
                "$exists" => Condition::Exists(truthy(arg)),
                other => {
                    return Err(ChangewatchError::invalid_pipeline(format!(
                        "unsupported operator {other} on {path}"
                    )));
                }
            })
        })
        .collect()
}

fn array_arg(path: &str, op: &str, arg: &JsonValue) -> ChangewatchResult<Vec<JsonValue>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| ChangewatchError::invalid_pipeline(format!("{op} on {path} needs an array")))
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::Null => false,
        _ => true,
    }
}

/// Equality with MongoDB's array and null rules: an array field matches when
/// any element equals the operand, and `null` matches a missing field.
fn equals(value: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match value {
        None => expected.is_null(),
        Some(v) if values_equal(v, expected) => true,
        Some(JsonValue::Array(items)) => items.iter().any(|item| values_equal(item, expected)),
        Some(_) => false,
    }
}

fn ordered(value: Option<&JsonValue>, bound: &JsonValue, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        None => false,
        Some(JsonValue::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, bound).is_some_and(&accept)),
        Some(v) => compare_values(v, bound).is_some_and(accept),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matches(filter: JsonValue, doc: JsonValue) -> bool {
        Filter::compile(&filter).unwrap().matches(&doc)
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(matches(json!({}), json!({ "a": 1 })));
    }

    #[test]
    fn low_stock_threshold() {
        let filter = json!({ "fullDocument.amount": { "$lt": 20 } });
        assert!(matches(filter.clone(), json!({ "fullDocument": { "amount": 3 } })));
        assert!(matches(filter.clone(), json!({ "fullDocument": { "amount": "9" } })));
        assert!(!matches(filter.clone(), json!({ "fullDocument": { "amount": 20 } })));
        assert!(!matches(filter, json!({ "operationType": "update" })));
    }

    #[test]
    fn equality_keeps_strings_and_numbers_apart() {
        assert!(!matches(json!({ "title": 4 }), json!({ "title": "4" })));
        assert!(!matches(json!({ "amount": { "$in": [1, 2] } }), json!({ "amount": "1" })));
        assert!(matches(json!({ "amount": { "$ne": 1 } }), json!({ "amount": "1" })));
        assert!(matches(json!({ "amount": { "$lte": 1 } }), json!({ "amount": "1" })));
    }

    #[test]
    fn literal_equality_and_arrays() {
        assert!(matches(json!({ "title": "Super Man 4" }), json!({ "title": "Super Man 4" })));
        assert!(matches(json!({ "tags": "rare" }), json!({ "tags": ["mint", "rare"] })));
        assert!(!matches(json!({ "title": "Super Man 4" }), json!({ "title": "Super Man 5" })));
    }

    #[test]
    fn null_matches_missing() {
        assert!(matches(json!({ "gone": null }), json!({ "a": 1 })));
        assert!(matches(json!({ "gone": { "$exists": false } }), json!({ "a": 1 })));
        assert!(!matches(json!({ "a": { "$exists": 0 } }), json!({ "a": 1 })));
    }

    #[test]
    fn logical_combinators() {
        let filter = json!({
            "$or": [
                { "operationType": "insert" },
                { "fullDocument.amount": { "$gte": 90, "$lte": 95 } }
            ]
        });
        assert!(matches(filter.clone(), json!({ "operationType": "insert" })));
        assert!(matches(filter.clone(), json!({ "operationType": "update", "fullDocument": { "amount": 90 } })));
        assert!(!matches(filter, json!({ "operationType": "update", "fullDocument": { "amount": 100 } })));

        let nor = json!({ "$nor": [{ "operationType": "delete" }] });
        assert!(matches(nor.clone(), json!({ "operationType": "insert" })));
        assert!(!matches(nor, json!({ "operationType": "delete" })));
    }

    #[test]
    fn set_membership() {
        let filter = json!({ "operationType": { "$in": ["insert", "replace"] } });
        assert!(matches(filter.clone(), json!({ "operationType": "replace" })));
        assert!(!matches(filter, json!({ "operationType": "delete" })));
        assert!(matches(json!({ "a": { "$nin": [1, 2] } }), json!({ "a": 3 })));
        assert!(matches(json!({ "a": { "$ne": 1 } }), json!({})));
    }

    #[test]
    fn rejects_unknown_operators() {
        assert!(Filter::compile(&json!({ "a": { "$regex": "x" } })).is_err());
        assert!(Filter::compile(&json!({ "$where": "1" })).is_err());
        assert!(Filter::compile(&json!({ "$or": [] })).is_err());
        assert!(Filter::compile(&json!({ "a": { "$lt": 1, "b": 2 } })).is_err());
        assert!(Filter::compile(&json!({ "a": { "$in": 3 } })).is_err());
        assert!(Filter::compile(&json!([1])).is_err());
    }

    #[test]
    fn equality_fields_seed_upserts() {
        let filter = Filter::compile(&json!({
            "title": "Super Man 4",
            "$and": [{ "team": { "$eq": "justice" } }],
            "amount": { "$gt": 3 },
            "$or": [{ "x": 1 }, { "y": 2 }]
        }))
        .unwrap();
        let mut fields = filter.equality_fields();
        fields.sort_by_key(|(path, _)| *path);
        assert_eq!(fields, vec![("team", &json!("justice")), ("title", &json!("Super Man 4"))]);
    }
}
