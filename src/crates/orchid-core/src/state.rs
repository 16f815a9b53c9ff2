//! State schema and merge rules.
//!
//! Execution state is a free-form JSON object. The engine treats it
//! opaquely except for one thing: how concurrent writes to the same
//! property combine. Each property in the workflow's `state_schema`
//! declares a [`MergeRule`] via a `merge` keyword on the property schema:
//!
//! ```yaml
//! state_schema:
//!   type: object
//!   properties:
//!     items:
//!       type: array
//!       merge: append_list
//!     context:
//!       type: object
//!       merge: merge_object
//! ```
//!
//! Properties without a declared rule use `replace` (last writer wins).
//!
//! # Determinism
//!
//! Within a super-step, deltas from concurrently executed nodes are merged
//! in lexicographic node-id order ([`StateSchema::apply_many`]), so the
//! merged result is a pure function of the delta set, independent of task
//! completion order. This is the invariant the resume path relies on: a
//! replayed super-step merges to the same state.
//!
//! # Reserved properties
//!
//! `thread_id`, `plan_confirmed`, and `__step__` are reserved. `__step__`
//! is maintained by the runtime (monotonic super-step counter) and is
//! rejected in node deltas.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Reserved property: external resume token.
pub const THREAD_ID_KEY: &str = "thread_id";
/// Reserved property: plan confirmation flag used by wizard workflows.
pub const PLAN_CONFIRMED_KEY: &str = "plan_confirmed";
/// Reserved property: monotonic super-step counter, runtime maintained.
pub const STEP_KEY: &str = "__step__";

/// Errors from state merging.
#[derive(Debug, Error)]
pub enum StateError {
    /// State or delta was not a JSON object.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A merge rule was applied to a value of the wrong shape.
    #[error("merge rule '{rule}' cannot combine values at '{property}': {detail}")]
    RuleMismatch {
        rule: &'static str,
        property: String,
        detail: String,
    },

    /// A delta attempted to write a runtime-maintained property.
    #[error("property '{0}' is maintained by the runtime and cannot be written by nodes")]
    ReservedProperty(String),

    /// The state schema declared an unknown merge rule.
    #[error("unknown merge rule '{value}' on property '{property}'")]
    UnknownRule { property: String, value: String },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// How concurrent writes to one property combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Last writer wins, ordered by super-step and then node id.
    #[default]
    Replace,
    /// Shallow key-wise merge of two objects; the update's keys win.
    MergeObject,
    /// Concatenate the update list onto the current list.
    AppendList,
    /// Per-key replace across maps; tolerates an absent current map.
    MergeMap,
}

impl MergeRule {
    pub fn name(&self) -> &'static str {
        match self {
            MergeRule::Replace => "replace",
            MergeRule::MergeObject => "merge_object",
            MergeRule::AppendList => "append_list",
            MergeRule::MergeMap => "merge_map",
        }
    }

    /// Combine the current value (if any) with an update.
    pub fn combine(&self, property: &str, current: Option<&Value>, update: &Value) -> Result<Value> {
        match self {
            MergeRule::Replace => Ok(update.clone()),
            MergeRule::AppendList => {
                let added = update.as_array().ok_or_else(|| StateError::RuleMismatch {
                    rule: self.name(),
                    property: property.to_string(),
                    detail: format!("update is {}, expected array", kind_of(update)),
                })?;
                let mut list = match current {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(existing)) => existing.clone(),
                    Some(other) => {
                        return Err(StateError::RuleMismatch {
                            rule: self.name(),
                            property: property.to_string(),
                            detail: format!("current value is {}, expected array", kind_of(other)),
                        })
                    }
                };
                list.extend(added.iter().cloned());
                Ok(Value::Array(list))
            }
            MergeRule::MergeObject | MergeRule::MergeMap => {
                let added = update.as_object().ok_or_else(|| StateError::RuleMismatch {
                    rule: self.name(),
                    property: property.to_string(),
                    detail: format!("update is {}, expected object", kind_of(update)),
                })?;
                let mut map = match current {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(existing)) => existing.clone(),
                    Some(other) => {
                        return Err(StateError::RuleMismatch {
                            rule: self.name(),
                            property: property.to_string(),
                            detail: format!("current value is {}, expected object", kind_of(other)),
                        })
                    }
                };
                for (key, value) in added {
                    map.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(map))
            }
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Per-property merge rules for one workflow's state.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    rules: HashMap<String, MergeRule>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract merge rules from a JSON Schema: each entry under
    /// `properties` may carry a `merge` keyword naming a [`MergeRule`].
    pub fn from_json_schema(schema: &Value) -> Result<Self> {
        let mut rules = HashMap::new();
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (property, prop_schema) in properties {
                if let Some(merge) = prop_schema.get("merge") {
                    let name = merge.as_str().ok_or_else(|| StateError::UnknownRule {
                        property: property.clone(),
                        value: merge.to_string(),
                    })?;
                    let rule = serde_json::from_value(Value::String(name.to_string()))
                        .map_err(|_| StateError::UnknownRule {
                            property: property.clone(),
                            value: name.to_string(),
                        })?;
                    rules.insert(property.clone(), rule);
                }
            }
        }
        Ok(Self { rules })
    }

    /// Declare a rule programmatically.
    pub fn with_rule(mut self, property: impl Into<String>, rule: MergeRule) -> Self {
        self.rules.insert(property.into(), rule);
        self
    }

    pub fn rule_for(&self, property: &str) -> MergeRule {
        self.rules.get(property).copied().unwrap_or_default()
    }

    /// Merge one delta into `state` in place.
    pub fn apply(&self, state: &mut Value, delta: &Value) -> Result<()> {
        let delta = match delta {
            Value::Object(map) => map,
            Value::Null => return Ok(()),
            other => {
                return Err(StateError::InvalidState(format!(
                    "delta is {}, expected object",
                    kind_of(other)
                )))
            }
        };
        if !state.is_object() {
            return Err(StateError::InvalidState(format!(
                "state is {}, expected object",
                kind_of(state)
            )));
        }

        for (property, update) in delta {
            if property == STEP_KEY {
                return Err(StateError::ReservedProperty(property.clone()));
            }
            let merged = {
                let current = state.get(property.as_str());
                self.rule_for(property).combine(property, current, update)?
            };
            state[property.as_str()] = merged;
        }
        Ok(())
    }

    /// Merge a super-step's deltas deterministically: lexicographic by
    /// node id, independent of the order the nodes finished in.
    pub fn apply_many(&self, state: &mut Value, deltas: &[(String, Value)]) -> Result<()> {
        let mut ordered: Vec<&(String, Value)> = deltas.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, delta) in ordered {
            self.apply(state, delta)?;
        }
        Ok(())
    }
}
