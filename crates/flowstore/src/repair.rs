//! Load-time repair of self-nested collections
//!
//! A keyed collection can end up stored inside itself under its own name,
//! `{"workflows": {"workflows": {...}}}`, possibly several levels deep and
//! possibly with real entries beside the nested copy. `normalize_collection`
//! unwraps it; callers persist the result straight away.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use crate::audit::{AuditEntry, AuditEventType, AuditSeverity, AuditSink};
use crate::backend::{json_type_name, Entries};
use crate::error::StoreError;

pub const WORKFLOWS_COLLECTION: &str = "workflows";

/// Nesting levels unwrapped before giving up
pub const MAX_NESTING_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionShape {
    /// Null; reads as an empty collection
    Empty,
    /// Entries in an array instead of keyed by id
    List,
    /// Keyed mapping without a self-named key
    Clean,
    /// Self-named key holding a workflow whose id is the collection name
    LegitimateEntry,
    /// Self-named key is the only key
    PureWrapper,
    /// Self-named key next to real entries
    MixedCorruption,
    /// Scalar where a collection was expected
    Invalid,
}

/// Decide the shape of `value` stored as collection `name`
pub fn classify(name: &str, value: &Value) -> CollectionShape {
    let map = match value {
        Value::Null => return CollectionShape::Empty,
        Value::Array(_) => return CollectionShape::List,
        Value::Object(map) => map,
        _ => return CollectionShape::Invalid,
    };
    let Some(nested) = map.get(name) else {
        return CollectionShape::Clean;
    };
    match nested {
        Value::Object(inner) if inner.get("id").and_then(Value::as_str) == Some(name) => {
            CollectionShape::LegitimateEntry
        }
        Value::Object(_) | Value::Array(_) if map.len() == 1 => CollectionShape::PureWrapper,
        Value::Object(_) | Value::Array(_) => CollectionShape::MixedCorruption,
        // a scalar under the name is odd but not a nested collection
        _ => CollectionShape::Clean,
    }
}

/// Key a list of entries by their `id`; entries without one are dropped.
///
/// Returns the mapping and the number of dropped entries.
pub fn index_by_id(items: &[Value]) -> (Entries, usize) {
    let mut indexed = Entries::new();
    let mut dropped = 0;
    for item in items {
        let id = match item.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                dropped += 1;
                continue;
            }
        };
        indexed.insert(id, item.clone());
    }
    (indexed, dropped)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairOutcome {
    pub collection: Entries,
    /// Whether the result differs structurally from the input
    pub repaired: bool,
    /// Nesting levels unwrapped
    pub depth: usize,
    /// List entries dropped for lack of an id
    pub dropped_entries: usize,
}

/// Pure, idempotent normalization of collection `name`.
///
/// Fails with `CorruptionDetected` past `max_depth` nesting levels or when
/// the value is not a collection at all.
pub fn normalize_collection(
    name: &str,
    value: Value,
    max_depth: usize,
) -> Result<RepairOutcome, StoreError> {
    let mut outcome = RepairOutcome {
        collection: Entries::new(),
        repaired: false,
        depth: 0,
        dropped_entries: 0,
    };
    outcome.collection = normalize_at(name, value, max_depth, &mut outcome)?;
    Ok(outcome)
}

fn normalize_at(
    name: &str,
    mut current: Value,
    max_depth: usize,
    outcome: &mut RepairOutcome,
) -> Result<Entries, StoreError> {
    loop {
        match classify(name, &current) {
            CollectionShape::Empty => return Ok(Entries::new()),
            CollectionShape::List => {
                let Value::Array(items) = current else {
                    return Ok(Entries::new());
                };
                let (indexed, dropped) = index_by_id(&items);
                if dropped > 0 {
                    tracing::warn!(
                        collection = name,
                        dropped,
                        "Dropped list entries without an id"
                    );
                }
                outcome.dropped_entries += dropped;
                outcome.repaired = true;
                return Ok(indexed);
            }
            CollectionShape::Clean | CollectionShape::LegitimateEntry => {
                let Value::Object(map) = current else {
                    return Ok(Entries::new());
                };
                return Ok(map);
            }
            CollectionShape::PureWrapper => {
                descend(name, outcome, max_depth)?;
                current = match current {
                    Value::Object(mut map) => map.remove(name).unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            }
            CollectionShape::MixedCorruption => {
                // merging is terminal, so it may run at the last allowed level
                descend(name, outcome, max_depth.saturating_add(1))?;
                let Value::Object(mut siblings) = current else {
                    return Ok(Entries::new());
                };
                let nested = siblings.remove(name).unwrap_or(Value::Null);
                let mut merged = normalize_at(name, nested, max_depth, outcome)?;
                for (key, value) in siblings {
                    merged.insert(key, value);
                }
                return Ok(merged);
            }
            CollectionShape::Invalid => {
                return Err(StoreError::CorruptionDetected {
                    collection: name.to_string(),
                    reason: format!(
                        "expected an object or array, found {}",
                        json_type_name(&current)
                    ),
                });
            }
        }
    }
}

fn descend(name: &str, outcome: &mut RepairOutcome, max_depth: usize) -> Result<(), StoreError> {
    if outcome.depth >= max_depth {
        return Err(StoreError::CorruptionDetected {
            collection: name.to_string(),
            reason: format!("nested more than {max_depth} levels inside itself"),
        });
    }
    outcome.depth += 1;
    outcome.repaired = true;
    Ok(())
}

/// Runs normalization for the collections it guards and remembers which
/// ones it has repaired during this session.
pub struct CorruptionRepair {
    collections: Vec<String>,
    max_depth: usize,
    repaired: Mutex<HashSet<String>>,
    audit: Arc<dyn AuditSink>,
}

impl CorruptionRepair {
    pub fn new(max_depth: usize, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            collections: vec![WORKFLOWS_COLLECTION.to_string()],
            max_depth,
            repaired: Mutex::new(HashSet::new()),
            audit,
        }
    }

    pub fn applies_to(&self, key: &str) -> bool {
        self.collections.iter().any(|c| c == key)
    }

    pub fn repaired_this_session(&self, collection: &str) -> bool {
        self.repaired.lock().contains(collection)
    }

    /// Normalize `value` stored under `collection` and record a repair
    pub fn inspect(&self, collection: &str, value: Value) -> Result<RepairOutcome, StoreError> {
        let outcome = match normalize_collection(collection, value, self.max_depth) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(collection, "Collection could not be repaired: {}", e);
                return Err(e);
            }
        };
        if !outcome.repaired {
            return Ok(outcome);
        }

        let first_time = self.repaired.lock().insert(collection.to_string());
        if first_time {
            tracing::info!(
                collection,
                depth = outcome.depth,
                dropped = outcome.dropped_entries,
                entries = outcome.collection.len(),
                "Repaired corrupted collection"
            );
        } else {
            tracing::warn!(collection, "Corruption reappeared after an earlier repair this session");
        }

        self.audit.record(
            AuditEntry::new(
                AuditEventType::CorruptionRepaired,
                AuditSeverity::Warning,
                format!("Repaired collection '{collection}'"),
            )
            .with_context(json!({
                "collection": collection,
                "depth": outcome.depth,
                "droppedEntries": outcome.dropped_entries,
                "entries": outcome.collection.len(),
                "recurrence": !first_time,
            })),
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn normalize(value: Value) -> Result<RepairOutcome, StoreError> {
        normalize_collection(WORKFLOWS_COLLECTION, value, MAX_NESTING_DEPTH)
    }

    fn as_value(outcome: &RepairOutcome) -> Value {
        Value::Object(outcome.collection.clone())
    }

    #[test]
    fn test_pure_wrapper_is_unwrapped() -> Result<(), StoreError> {
        let outcome = normalize(json!({"workflows": {"a": {"id": "a"}, "b": {"id": "b"}}}))?;
        assert_eq!(as_value(&outcome), json!({"a": {"id": "a"}, "b": {"id": "b"}}));
        assert!(outcome.repaired);
        assert_eq!(outcome.depth, 1);
        Ok(())
    }

    #[test]
    fn test_mixed_corruption_merges_siblings() -> Result<(), StoreError> {
        let outcome = normalize(json!({"workflows": {"a": {"id": "a"}}, "c": {"id": "c"}}))?;
        assert_eq!(as_value(&outcome), json!({"a": {"id": "a"}, "c": {"id": "c"}}));
        assert!(outcome.repaired);
        Ok(())
    }

    #[test]
    fn test_siblings_win_on_collision() -> Result<(), StoreError> {
        let outcome = normalize(json!({
            "workflows": {"a": {"id": "a", "name": "stale"}},
            "a": {"id": "a", "name": "current"},
        }))?;
        assert_eq!(
            as_value(&outcome),
            json!({"a": {"id": "a", "name": "current"}})
        );
        Ok(())
    }

    #[test]
    fn test_legitimate_entry_is_unchanged() -> Result<(), StoreError> {
        let input = json!({"workflows": {"id": "workflows", "name": "My flow"}});
        let outcome = normalize(input.clone())?;
        assert_eq!(as_value(&outcome), input);
        assert!(!outcome.repaired);
        assert_eq!(
            classify(WORKFLOWS_COLLECTION, &input),
            CollectionShape::LegitimateEntry
        );
        Ok(())
    }

    #[test]
    fn test_deep_nesting_with_list_at_bottom() -> Result<(), StoreError> {
        let input = json!({"workflows": {"workflows": {"workflows": [
            {"id": "a"}, {"id": "b"}, {"name": "no id"}
        ]}}});
        let outcome = normalize(input)?;
        assert_eq!(as_value(&outcome), json!({"a": {"id": "a"}, "b": {"id": "b"}}));
        assert_eq!(outcome.depth, 3);
        assert_eq!(outcome.dropped_entries, 1);
        Ok(())
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({"a": {"id": "a"}});
        for _ in 0..=MAX_NESTING_DEPTH {
            value = json!({ WORKFLOWS_COLLECTION: value });
        }
        assert!(matches!(
            normalize(value),
            Err(StoreError::CorruptionDetected { .. })
        ));

        let mut value = json!({"a": {"id": "a"}});
        for _ in 0..MAX_NESTING_DEPTH {
            value = json!({ WORKFLOWS_COLLECTION: value });
        }
        assert!(normalize(value).is_ok());
    }

    #[test]
    fn test_mixed_merge_at_depth_limit() -> Result<(), StoreError> {
        let mut value = json!({WORKFLOWS_COLLECTION: {"a": {"id": "a"}}, "c": {"id": "c"}});
        for _ in 0..MAX_NESTING_DEPTH {
            value = json!({ WORKFLOWS_COLLECTION: value });
        }
        let outcome = normalize(value)?;
        assert_eq!(as_value(&outcome), json!({"a": {"id": "a"}, "c": {"id": "c"}}));
        assert_eq!(outcome.depth, MAX_NESTING_DEPTH + 1);

        // a wrapper below the merge still counts against the limit
        let mut value = json!({
            WORKFLOWS_COLLECTION: {WORKFLOWS_COLLECTION: {"a": {"id": "a"}}},
            "c": {"id": "c"},
        });
        for _ in 0..MAX_NESTING_DEPTH {
            value = json!({ WORKFLOWS_COLLECTION: value });
        }
        assert!(matches!(
            normalize(value),
            Err(StoreError::CorruptionDetected { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_normalize_is_idempotent() -> Result<(), StoreError> {
        let first = normalize(json!({"workflows": {"workflows": {"a": {"id": "a"}}}, "b": {"id": "b"}}))?;
        let second = normalize(as_value(&first))?;
        assert_eq!(first.collection, second.collection);
        assert!(!second.repaired);
        Ok(())
    }

    #[test]
    fn test_scalar_is_corruption() {
        assert!(matches!(
            normalize(json!("workflows")),
            Err(StoreError::CorruptionDetected { .. })
        ));
        assert_eq!(classify(WORKFLOWS_COLLECTION, &Value::Null), CollectionShape::Empty);
    }

    #[test]
    fn test_session_flag_and_audit() -> Result<(), StoreError> {
        let audit = Arc::new(MemoryAuditSink::default());
        let repair = CorruptionRepair::new(MAX_NESTING_DEPTH, audit.clone());
        assert!(repair.applies_to(WORKFLOWS_COLLECTION));
        assert!(!repair.applies_to("folders"));

        repair.inspect(WORKFLOWS_COLLECTION, json!({"a": {"id": "a"}}))?;
        assert!(!repair.repaired_this_session(WORKFLOWS_COLLECTION));
        assert_eq!(audit.count(&AuditEventType::CorruptionRepaired), 0);

        repair.inspect(WORKFLOWS_COLLECTION, json!({"workflows": {"a": {"id": "a"}}}))?;
        assert!(repair.repaired_this_session(WORKFLOWS_COLLECTION));
        assert_eq!(audit.count(&AuditEventType::CorruptionRepaired), 1);
        Ok(())
    }
}
