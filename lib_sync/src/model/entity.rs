use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Opaque identifier of a cached entity, e.g. `post:42` or `AAPL`.
pub type EntityKey = String;

/// # Cache Entry
///
/// A snapshot of one entity as held by the `CacheStore`.
///
/// `version` is bumped on every applied mutation, local or remote, and is the
/// value the rollback guard compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    /// The entity identifier.
    pub key: EntityKey,
    /// The current value.
    pub value: T,
    /// Monotonic per-key version.
    pub version: u64,
    /// When this version was written.
    pub last_updated_at: DateTime<Utc>,
}

/// The shape of an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    /// Adds `delta` to the numeric field `field`, treating a missing field as 0.
    IncrementCounter {
        /// Name of the counter field, e.g. `viewCount`.
        field: String,
        /// Signed amount to add.
        delta: i64,
    },
    /// Merges a JSON merge patch into the entity.
    ApplyPatch(Value),
}

impl MutationKind {
    /// Shorthand for an increment.
    pub fn increment(field: impl Into<String>, delta: i64) -> Self {
        MutationKind::IncrementCounter { field: field.into(), delta }
    }

    /// Produces the post-mutation value from the current one.
    pub fn apply(&self, base: Option<&Value>) -> Value {
        match self {
            MutationKind::IncrementCounter { field, delta } => {
                let mut object = match base {
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                };
                let next = add_to_number(object.get(field), *delta);
                object.insert(field.clone(), next);
                Value::Object(object)
            }
            MutationKind::ApplyPatch(patch) => {
                let mut value = base.cloned().unwrap_or(Value::Null);
                merge_patch(&mut value, patch);
                value
            }
        }
    }
}

fn add_to_number(current: Option<&Value>, delta: i64) -> Value {
    match current {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => {
            let base = n.as_i64().unwrap_or(i64::MAX);
            Value::from(base.saturating_add(delta))
        }
        Some(Value::Number(n)) => {
            let base = n.as_f64().unwrap_or_default();
            Number::from_f64(base + delta as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        _ => Value::from(delta),
    }
}

/// Applies an RFC 7396 JSON merge patch to `target` in place.
///
/// Object patches merge key by key (`null` deletes); anything else replaces
/// the target wholesale.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
