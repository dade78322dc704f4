//! Shape checks for known collections. Violations are reported, never fixed.

use serde::Serialize;
use serde_json::Value;

use crate::backend::json_type_name;

pub const WORKFLOWS: &str = "workflows";
pub const FOLDERS: &str = "folders";
pub const SETTINGS: &str = "settings";
pub const WORKFLOW_HOSTS: &str = "workflowHosts";

/// Field holding a workflow's graph
pub const GRAPH_FIELD: &str = "drawflow";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Check `data` against the rules for `key`; unknown keys are always valid
pub fn validate(key: &str, data: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    match key {
        WORKFLOWS => validate_workflows(data, &mut errors),
        FOLDERS => validate_folders(data, &mut errors),
        SETTINGS | WORKFLOW_HOSTS => {
            if !data.is_object() {
                errors.push(format!(
                    "{key}: expected object, found {}",
                    json_type_name(data)
                ));
            }
        }
        _ => {}
    }
    ValidationReport::from_errors(errors)
}

fn validate_workflows(data: &Value, errors: &mut Vec<String>) {
    let Value::Object(workflows) = data else {
        errors.push(format!(
            "{WORKFLOWS}: expected object keyed by workflow id, found {}",
            json_type_name(data)
        ));
        return;
    };

    for (id, workflow) in workflows {
        let Value::Object(fields) = workflow else {
            errors.push(format!("{WORKFLOWS}.{id}: expected object"));
            continue;
        };
        match fields.get("id").and_then(Value::as_str) {
            None => errors.push(format!("{WORKFLOWS}.{id}: missing id")),
            Some(inner) if inner != id => {
                errors.push(format!("{WORKFLOWS}.{id}: id '{inner}' does not match key"));
            }
            Some(_) => {}
        }
        if !fields.get("name").is_some_and(Value::is_string) {
            errors.push(format!("{WORKFLOWS}.{id}: missing name"));
        }
        match fields.get(GRAPH_FIELD) {
            Some(Value::Object(_) | Value::String(_)) => {}
            Some(other) => errors.push(format!(
                "{WORKFLOWS}.{id}: {GRAPH_FIELD} must be an object or string, found {}",
                json_type_name(other)
            )),
            None => errors.push(format!("{WORKFLOWS}.{id}: missing {GRAPH_FIELD}")),
        }
    }
}

fn validate_folders(data: &Value, errors: &mut Vec<String>) {
    let Value::Array(folders) = data else {
        errors.push(format!(
            "{FOLDERS}: expected array, found {}",
            json_type_name(data)
        ));
        return;
    };

    for (index, folder) in folders.iter().enumerate() {
        let Value::Object(fields) = folder else {
            errors.push(format!("{FOLDERS}[{index}]: expected object"));
            continue;
        };
        for field in ["id", "name"] {
            if !fields.get(field).is_some_and(Value::is_string) {
                errors.push(format!("{FOLDERS}[{index}]: missing {field}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_workflows() {
        let data = json!({
            "a": {"id": "a", "name": "Daily report", "drawflow": {"nodes": [], "edges": []}},
            "b": {"id": "b", "name": "Backup", "drawflow": "{\"nodes\":[]}"},
        });
        let report = validate(WORKFLOWS, &data);
        assert!(report.valid, "{:?}", report.errors);
    }

    #[test]
    fn test_workflow_violations_are_listed() {
        let data = json!({
            "a": {"id": "x", "drawflow": 3},
            "b": "not an object",
        });
        let report = validate(WORKFLOWS, &data);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 4);
        assert!(report.errors.iter().any(|e| e.contains("does not match key")));
        assert!(report.errors.iter().any(|e| e.contains("missing name")));
        assert!(report.errors.iter().any(|e| e.contains("must be an object or string")));
    }

    #[test]
    fn test_workflow_list_is_invalid() {
        let report = validate(WORKFLOWS, &json!([{"id": "a"}]));
        assert!(!report.valid);
        assert!(report.errors[0].contains("found array"));
    }

    #[test]
    fn test_folders_and_settings() {
        assert!(validate(FOLDERS, &json!([{"id": "f", "name": "Inbox"}])).valid);
        assert_eq!(validate(FOLDERS, &json!([{"id": "f"}])).errors.len(), 1);
        assert!(validate(SETTINGS, &json!({"theme": "dark"})).valid);
        assert!(!validate(SETTINGS, &json!("dark")).valid);
    }

    #[test]
    fn test_unknown_keys_pass() {
        assert!(validate("lastOpened", &json!(12)).valid);
    }
}
