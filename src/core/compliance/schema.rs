//! Structural validation of compliance items

use crate::config::ItemSchemaConfig;
use crate::domain::{ComplianceItemInput, JsonType};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-kind required-field schemas
///
/// Only the structure is checked: every required field present, non-null and
/// of the declared JSON type. Report content is not interpreted.
#[derive(Debug, Clone, Default)]
pub struct ItemValidator {
    schemas: BTreeMap<String, BTreeMap<String, JsonType>>,
}

impl ItemValidator {
    pub fn new(schemas: &[ItemSchemaConfig]) -> Self {
        Self {
            schemas: schemas
                .iter()
                .map(|s| (s.kind.clone(), s.required.clone()))
                .collect(),
        }
    }

    /// `Err` carries every problem found, joined with `; `
    pub fn validate(&self, item: &ComplianceItemInput) -> Result<(), String> {
        if item.item_id.trim().is_empty() {
            return Err("item_id cannot be empty".to_string());
        }
        let Some(required) = self.schemas.get(&item.kind) else {
            return Err(format!("no schema for item kind '{}'", item.kind));
        };
        let Value::Object(payload) = &item.payload else {
            return Err("payload must be a JSON object".to_string());
        };

        let problems: Vec<String> = required
            .iter()
            .filter_map(|(field, expected)| match payload.get(field) {
                None | Some(Value::Null) => Some(format!("missing required field '{field}'")),
                Some(value) if !expected.matches(value) => {
                    Some(format!("field '{field}' must be {expected}"))
                }
                Some(_) => None,
            })
            .collect();

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn validator() -> ItemValidator {
        ItemValidator::new(&[ItemSchemaConfig {
            kind: "falls".into(),
            required: [
                ("resident_count".to_string(), JsonType::Integer),
                ("falls".to_string(), JsonType::Array),
            ]
            .into_iter()
            .collect(),
        }])
    }

    fn input(kind: &str, payload: Value) -> ComplianceItemInput {
        ComplianceItemInput {
            item_id: "falls-1".into(),
            kind: kind.into(),
            payload,
        }
    }

    #[test]
    fn test_valid_item() {
        let item = input("falls", json!({"resident_count": 40, "falls": [], "extra": "ok"}));
        assert!(validator().validate(&item).is_ok());
    }

    #[test_case(json!({"falls": []}), "missing required field 'resident_count'" ; "missing")]
    #[test_case(json!({"resident_count": null, "falls": []}), "missing required field 'resident_count'" ; "null")]
    #[test_case(json!({"resident_count": "40", "falls": []}), "field 'resident_count' must be integer" ; "wrong type")]
    #[test_case(json!([1, 2]), "payload must be a JSON object" ; "not an object")]
    fn test_invalid_payloads(payload: Value, expected: &str) {
        let reason = validator().validate(&input("falls", payload)).unwrap_err();
        assert!(reason.contains(expected), "{reason}");
    }

    #[test]
    fn test_unknown_kind_is_invalid() {
        let reason = validator()
            .validate(&input("pressure_ulcers", json!({})))
            .unwrap_err();
        assert!(reason.contains("pressure_ulcers"));
    }

    #[test]
    fn test_reports_every_problem() {
        let reason = validator().validate(&input("falls", json!({}))).unwrap_err();
        assert_eq!(reason.split("; ").count(), 2);
    }
}
