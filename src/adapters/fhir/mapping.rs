//! Canonical mapping of validated FHIR resources
//!
//! Every canonical field is always present (as `null` when the remote record
//! has no value), so a value removed upstream also clears the external-owned
//! field locally. Lists are sorted by resource id so page order never changes
//! the content hash.

use crate::core::checksum::calculate_checksum;
use crate::domain::resource::{
    AllergyResource, CodeableConcept, ConditionResource, HumanName, MedicationResource,
    ObservationResource, PatientResource,
};
use crate::domain::{
    CanonicalRecord, CarelinkError, ClinicalResource, FhirResourceBundle, NhsNumber, ResourceType,
    Result,
};
use serde_json::{json, Value};

pub const FAMILY_NAME: &str = "demographics.family_name";
pub const GIVEN_NAMES: &str = "demographics.given_names";
pub const BIRTH_DATE: &str = "demographics.birth_date";
pub const GENDER: &str = "demographics.gender";
pub const DECEASED: &str = "demographics.deceased";
pub const TELECOM: &str = "contact.telecom";
pub const ADDRESS: &str = "contact.address";
pub const GP_PRACTICE: &str = "registration.gp_practice";
pub const ALLERGIES: &str = "clinical.allergies";
pub const MEDICATIONS: &str = "clinical.medications";
pub const CONDITIONS: &str = "clinical.conditions";
pub const OBSERVATIONS: &str = "clinical.observations";

/// Every field the mapper produces
pub const CANONICAL_FIELDS: [&str; 12] = [
    FAMILY_NAME,
    GIVEN_NAMES,
    BIRTH_DATE,
    GENDER,
    DECEASED,
    TELECOM,
    ADDRESS,
    GP_PRACTICE,
    ALLERGIES,
    MEDICATIONS,
    CONDITIONS,
    OBSERVATIONS,
];

/// Parse raw resources and build the bundle for one patient
///
/// # Errors
///
/// - [`CarelinkError::Mapping`] if any resource fails validation or more than
///   one Patient matched
/// - [`CarelinkError::NotFound`] if no Patient resource is present
pub fn build_bundle(raw: Vec<Value>, nhs_number: &NhsNumber) -> Result<FhirResourceBundle> {
    let resources = raw
        .iter()
        .map(ClinicalResource::from_value)
        .collect::<Result<Vec<_>>>()?;

    let patients: Vec<&PatientResource> = resources
        .iter()
        .filter_map(|r| match r {
            ClinicalResource::Patient(p) => Some(p),
            _ => None,
        })
        .collect();

    let patient = match patients.as_slice() {
        [] => {
            return Err(CarelinkError::NotFound(format!(
                "patient with NHS number {}",
                nhs_number.redacted()
            )))
        }
        [patient] => *patient,
        many => {
            return Err(CarelinkError::mapping(
                "Bundle",
                format!("{} Patient resources matched one identifier", many.len()),
            ))
        }
    };

    let canonical = to_canonical(patient, &resources);
    let content_hash = calculate_checksum(&Value::Object(
        canonical.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    ))?;

    Ok(FhirResourceBundle {
        raw,
        resources,
        canonical,
        resource_type: ResourceType::Patient,
        content_hash,
    })
}

/// Canonical form of a patient and its included resources
pub fn to_canonical(patient: &PatientResource, resources: &[ClinicalResource]) -> CanonicalRecord {
    let mut record = CanonicalRecord::new();

    let name = preferred_name(&patient.name);
    record.insert(
        FAMILY_NAME.to_string(),
        name.and_then(|n| n.family.clone()).map_or(Value::Null, Value::String),
    );
    record.insert(
        GIVEN_NAMES.to_string(),
        name.map_or(Value::Null, |n| json!(n.given)),
    );
    record.insert(BIRTH_DATE.to_string(), opt(&patient.birth_date));
    record.insert(GENDER.to_string(), opt(&patient.gender));
    record.insert(
        DECEASED.to_string(),
        match (&patient.deceased_date_time, patient.deceased_boolean) {
            (Some(at), _) => json!(at),
            (None, Some(flag)) => json!(flag),
            (None, None) => Value::Null,
        },
    );
    record.insert(
        TELECOM.to_string(),
        Value::Array(
            patient
                .telecom
                .iter()
                .map(|t| json!({"system": t.system, "value": t.value, "use": t.r#use}))
                .collect(),
        ),
    );
    record.insert(
        ADDRESS.to_string(),
        Value::Array(
            patient
                .address
                .iter()
                .map(|a| json!({"line": a.line, "city": a.city, "postal_code": a.postal_code}))
                .collect(),
        ),
    );
    record.insert(
        GP_PRACTICE.to_string(),
        patient
            .general_practitioner
            .first()
            .and_then(|r| {
                r.identifier
                    .as_ref()
                    .map(|i| i.value.clone())
                    .or_else(|| r.reference.clone())
            })
            .map_or(Value::Null, Value::String),
    );

    let mut allergies = Vec::new();
    let mut medications = Vec::new();
    let mut conditions = Vec::new();
    let mut observations = Vec::new();
    for resource in resources {
        match resource {
            ClinicalResource::Patient(_) => {}
            ClinicalResource::AllergyIntolerance(a) => allergies.push(allergy(a)),
            ClinicalResource::MedicationStatement(m) => medications.push(medication(m)),
            ClinicalResource::Condition(c) => conditions.push(condition(c)),
            ClinicalResource::Observation(o) => observations.push(observation(o)),
        }
    }
    record.insert(ALLERGIES.to_string(), sorted(allergies));
    record.insert(MEDICATIONS.to_string(), sorted(medications));
    record.insert(CONDITIONS.to_string(), sorted(conditions));
    record.insert(OBSERVATIONS.to_string(), sorted(observations));

    record
}

fn preferred_name(names: &[HumanName]) -> Option<&HumanName> {
    names
        .iter()
        .find(|n| n.r#use.as_deref() == Some("official"))
        .or_else(|| names.first())
}

fn opt(value: &Option<String>) -> Value {
    value.clone().map_or(Value::Null, Value::String)
}

fn status(concept: &Option<CodeableConcept>) -> Value {
    concept
        .as_ref()
        .and_then(|c| c.coding.iter().find_map(|coding| coding.code.clone()))
        .map_or(Value::Null, Value::String)
}

fn allergy(a: &AllergyResource) -> Value {
    json!({
        "id": a.id,
        "code": a.code.key(),
        "label": a.code.label(),
        "clinical_status": status(&a.clinical_status),
        "criticality": a.criticality,
    })
}

fn medication(m: &MedicationResource) -> Value {
    json!({
        "id": m.id,
        "code": m.medication_codeable_concept.key(),
        "label": m.medication_codeable_concept.label(),
        "status": m.status,
        "dosage": m.dosage.iter().filter_map(|d| d.text.clone()).collect::<Vec<_>>(),
        "effective": m.effective_date_time,
    })
}

fn condition(c: &ConditionResource) -> Value {
    json!({
        "id": c.id,
        "code": c.code.key(),
        "label": c.code.label(),
        "clinical_status": status(&c.clinical_status),
        "onset": c.onset_date_time,
    })
}

fn observation(o: &ObservationResource) -> Value {
    json!({
        "id": o.id,
        "code": o.code.key(),
        "label": o.code.label(),
        "status": o.status,
        "value": o.value_quantity.as_ref().map(|q| json!({"value": q.value, "unit": q.unit})),
        "effective": o.effective_date_time,
    })
}

fn sorted(mut items: Vec<Value>) -> Value {
    items.sort_by(|a, b| {
        let id = |v: &Value| v.get("id").and_then(Value::as_str).unwrap_or("").to_string();
        id(a).cmp(&id(b))
    });
    Value::Array(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nhs() -> NhsNumber {
        NhsNumber::parse("9434765919").unwrap()
    }

    fn patient() -> Value {
        json!({
            "resourceType": "Patient",
            "id": "pat-1",
            "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": "9434765919"}],
            "name": [
                {"use": "usual", "family": "Smithy", "given": ["Janie"]},
                {"use": "official", "family": "Smith", "given": ["Jane", "Ann"]}
            ],
            "gender": "female",
            "birthDate": "1941-03-02",
            "generalPractitioner": [{"identifier": {"value": "A81001"}}]
        })
    }

    fn medication_json(id: &str, code: &str) -> Value {
        json!({
            "resourceType": "MedicationStatement",
            "id": id,
            "status": "active",
            "medicationCodeableConcept": {
                "coding": [{"system": "http://snomed.info/sct", "code": code, "display": "Drug"}]
            },
            "subject": {"reference": "Patient/pat-1"},
            "dosage": [{"text": "1 tablet daily"}]
        })
    }

    #[test]
    fn test_canonical_fields_always_present() {
        let bundle = build_bundle(vec![patient()], &nhs()).unwrap();
        for field in CANONICAL_FIELDS {
            assert!(bundle.canonical.contains_key(field), "missing {field}");
        }
        assert_eq!(bundle.canonical[FAMILY_NAME], json!("Smith"));
        assert_eq!(bundle.canonical[GIVEN_NAMES], json!(["Jane", "Ann"]));
        assert_eq!(bundle.canonical[GP_PRACTICE], json!("A81001"));
        assert_eq!(bundle.canonical[DECEASED], Value::Null);
        assert_eq!(bundle.canonical[MEDICATIONS], json!([]));
    }

    #[test]
    fn test_hash_independent_of_resource_order() {
        let a = build_bundle(
            vec![patient(), medication_json("m-1", "111"), medication_json("m-2", "222")],
            &nhs(),
        )
        .unwrap();
        let b = build_bundle(
            vec![medication_json("m-2", "222"), patient(), medication_json("m-1", "111")],
            &nhs(),
        )
        .unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(
            a.canonical[MEDICATIONS][0]["code"],
            json!("http://snomed.info/sct|111")
        );
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = build_bundle(vec![patient()], &nhs()).unwrap();
        let mut changed = patient();
        changed["birthDate"] = json!("1941-03-03");
        let b = build_bundle(vec![changed], &nhs()).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
    }

    #[test]
    fn test_no_patient_is_not_found() {
        let err = build_bundle(vec![medication_json("m-1", "111")], &nhs()).unwrap_err();
        assert!(matches!(err, CarelinkError::NotFound(ref m) if m.contains("*******919")));
    }

    #[test]
    fn test_two_patients_rejected() {
        let mut other = patient();
        other["id"] = json!("pat-2");
        let err = build_bundle(vec![patient(), other], &nhs()).unwrap_err();
        assert!(matches!(err, CarelinkError::Mapping { .. }));
    }
}
