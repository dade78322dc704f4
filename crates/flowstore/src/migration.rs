//! Versioned data migrations
//!
//! Steps are applied strictly in registration order. The persisted version is
//! the label of the last applied step; a label the plan does not know is
//! treated as data from a newer build and refused.

use serde::Serialize;
use serde_json::Value;

use crate::backend::Entries;
use crate::error::StoreError;
use crate::repair::index_by_id;

/// Transform over the live (non-reserved) entries
pub type MigrationFn = Box<dyn Fn(&mut Entries) -> Result<(), String> + Send + Sync>;

pub struct Migration {
    version: String,
    description: String,
    apply: MigrationFn,
}

impl Migration {
    pub fn new<F>(version: impl Into<String>, description: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&mut Entries) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            version: version.into(),
            description: description.into(),
            apply: Box::new(apply),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn apply(&self, entries: &mut Entries) -> Result<(), StoreError> {
        (self.apply)(entries).map_err(|reason| StoreError::MigrationFailure {
            version: self.version.clone(),
            reason,
        })
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Ordered list of migration steps with unique labels
#[derive(Debug, Default)]
pub struct MigrationPlan {
    steps: Vec<Migration>,
}

impl MigrationPlan {
    pub fn new(steps: Vec<Migration>) -> Result<Self, StoreError> {
        for (i, step) in steps.iter().enumerate() {
            if step.version.is_empty() {
                return Err(StoreError::Config("migration version label is empty".into()));
            }
            if steps[..i].iter().any(|s| s.version == step.version) {
                return Err(StoreError::Config(format!(
                    "duplicate migration version '{}'",
                    step.version
                )));
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Migration] {
        &self.steps
    }

    pub fn latest(&self) -> Option<&str> {
        self.steps.last().map(Migration::version)
    }

    /// Steps after `current`, in order
    pub fn pending(&self, current: Option<&str>) -> Result<&[Migration], StoreError> {
        let Some(current) = current else {
            return Ok(&self.steps);
        };
        match self.steps.iter().position(|s| s.version == current) {
            Some(index) => Ok(&self.steps[index + 1..]),
            None => Err(StoreError::MigrationFailure {
                version: current.to_string(),
                reason: "persisted version is not a registered step; refusing to downgrade"
                    .to_string(),
            }),
        }
    }
}

/// Result of `initialize`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub from: Option<String>,
    pub to: Option<String>,
    pub applied: Vec<String>,
}

impl MigrationOutcome {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Entries to write and keys to remove to turn `before` into `after`
pub fn diff_entries(before: &Entries, after: &Entries) -> (Entries, Vec<String>) {
    let changed = after
        .iter()
        .filter(|(k, v)| before.get(k.as_str()) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let removed = before
        .keys()
        .filter(|k| !after.contains_key(k.as_str()))
        .cloned()
        .collect();
    (changed, removed)
}

/// Steps every store gets by default
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::new("1", "index workflow lists by id", |entries| {
            if let Some(Value::Array(items)) = entries.get("workflows") {
                let (indexed, dropped) = index_by_id(items);
                if dropped > 0 {
                    tracing::warn!(dropped, "Dropped workflows without an id during migration");
                }
                entries.insert("workflows".to_string(), Value::Object(indexed));
            }
            Ok(())
        }),
        Migration::new("2", "settings must be an object", |entries| {
            match entries.get("settings") {
                None | Some(Value::Object(_)) => {}
                Some(_) => {
                    entries.insert("settings".to_string(), Value::Object(Entries::new()));
                }
            }
            Ok(())
        }),
    ]
}

/// Default plan built from `builtin_migrations`
pub fn builtin_plan() -> Result<MigrationPlan, StoreError> {
    MigrationPlan::new(builtin_migrations())
}
