//! Field-ownership merge policy

use crate::adapters::fhir::mapping::{
    ADDRESS, ALLERGIES, BIRTH_DATE, CONDITIONS, DECEASED, FAMILY_NAME, GENDER, GIVEN_NAMES,
    GP_PRACTICE, MEDICATIONS, OBSERVATIONS, TELECOM,
};
use crate::adapters::storage::FieldPatch;
use crate::domain::{CanonicalRecord, FieldOwner};
use std::collections::BTreeMap;

/// Static per-field ownership table
///
/// A field missing from the table has ambiguous ownership. It is treated as
/// local (never overwritten) and reported back so the caller can flag it.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOwnershipTable {
    owners: BTreeMap<String, FieldOwner>,
}

/// Outcome of applying the table to a remote record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// External-owned fields to write
    pub patch: FieldPatch,
    /// Remote fields left untouched because they are local-owned
    pub preserved: Vec<String>,
    /// Remote fields with no ownership entry
    pub ambiguous: Vec<String>,
}

impl FieldOwnershipTable {
    pub fn new(owners: BTreeMap<String, FieldOwner>) -> Self {
        Self { owners }
    }

    /// The configured table, or the built-in one when nothing is configured
    pub fn from_config(configured: &BTreeMap<String, FieldOwner>) -> Self {
        if configured.is_empty() {
            Self::default()
        } else {
            Self::new(configured.clone())
        }
    }

    pub fn owner(&self, field: &str) -> Option<FieldOwner> {
        self.owners.get(field).copied()
    }

    /// Split a remote record into the fields to overwrite and the ones to leave
    ///
    /// No timestamps are consulted: external-owned fields always take the
    /// remote value, local-owned fields never do.
    pub fn plan(&self, remote: &CanonicalRecord) -> MergePlan {
        let mut plan = MergePlan::default();
        for (field, value) in remote {
            match self.owner(field) {
                Some(FieldOwner::External) => {
                    plan.patch.fields.insert(field.clone(), value.clone());
                }
                Some(FieldOwner::Local) => plan.preserved.push(field.clone()),
                None => plan.ambiguous.push(field.clone()),
            }
        }
        plan
    }

    /// Drop patch entries whose local value already equals the remote one
    pub fn changed_only(patch: FieldPatch, local: &CanonicalRecord) -> FieldPatch {
        FieldPatch {
            fields: patch
                .fields
                .into_iter()
                .filter(|(field, value)| local.get(field) != Some(value))
                .collect(),
        }
    }
}

impl Default for FieldOwnershipTable {
    /// Demographics, contact details, registration and the coded clinical
    /// summary follow the national record. Medications and observations are
    /// maintained by the local clinical system.
    fn default() -> Self {
        let external = [
            FAMILY_NAME,
            GIVEN_NAMES,
            BIRTH_DATE,
            GENDER,
            DECEASED,
            TELECOM,
            ADDRESS,
            GP_PRACTICE,
            ALLERGIES,
            CONDITIONS,
        ];
        let local = [MEDICATIONS, OBSERVATIONS];

        let owners = external
            .iter()
            .map(|f| (f.to_string(), FieldOwner::External))
            .chain(local.iter().map(|f| (f.to_string(), FieldOwner::Local)))
            .collect();
        Self { owners }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fhir::CANONICAL_FIELDS;
    use serde_json::json;

    #[test]
    fn test_default_table_covers_every_canonical_field() {
        let table = FieldOwnershipTable::default();
        for field in CANONICAL_FIELDS {
            assert!(table.owner(field).is_some(), "{field} has no owner");
        }
    }

    #[test]
    fn test_plan_splits_by_owner() {
        let table = FieldOwnershipTable::default();
        let remote: CanonicalRecord = [
            (FAMILY_NAME.to_string(), json!("Smith")),
            (MEDICATIONS.to_string(), json!([])),
            ("custom.flag".to_string(), json!(true)),
        ]
        .into_iter()
        .collect();

        let plan = table.plan(&remote);
        assert_eq!(plan.patch.fields.get(FAMILY_NAME), Some(&json!("Smith")));
        assert!(!plan.patch.fields.contains_key(MEDICATIONS));
        assert_eq!(plan.preserved, vec![MEDICATIONS.to_string()]);
        assert_eq!(plan.ambiguous, vec!["custom.flag".to_string()]);
    }

    #[test]
    fn test_configured_table_replaces_builtin() {
        let configured: BTreeMap<String, FieldOwner> =
            [(FAMILY_NAME.to_string(), FieldOwner::Local)].into_iter().collect();
        let table = FieldOwnershipTable::from_config(&configured);
        assert_eq!(table.owner(FAMILY_NAME), Some(FieldOwner::Local));
        assert_eq!(table.owner(GENDER), None);

        let builtin = FieldOwnershipTable::from_config(&BTreeMap::new());
        assert_eq!(builtin.owner(GENDER), Some(FieldOwner::External));
    }

    #[test]
    fn test_changed_only_skips_equal_values() {
        let mut patch = FieldPatch::default();
        patch.fields.insert(GENDER.into(), json!("female"));
        patch.fields.insert(BIRTH_DATE.into(), json!("1941-03-02"));
        let local: CanonicalRecord = [(GENDER.to_string(), json!("female"))].into_iter().collect();

        let changed = FieldOwnershipTable::changed_only(patch, &local);
        assert_eq!(changed.len(), 1);
        assert!(changed.fields.contains_key(BIRTH_DATE));
    }
}
