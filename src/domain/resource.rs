//! Clinical resources received from the clinical-record protocol
//!
//! Remote payloads are loosely typed JSON. They are parsed into the closed set
//! of [`ClinicalResource`] variants at the boundary; a resource whose
//! `resourceType` is not one of these variants, or which lacks a required
//! field, is rejected instead of being passed through.

use super::errors::CarelinkError;
use super::result::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// FHIR `Coding`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
}

/// FHIR `CodeableConcept`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default)]
    pub coding: Vec<Coding>,
    #[serde(default)]
    pub text: Option<String>,
}

impl CodeableConcept {
    /// First code (system|code) or the free text
    pub fn key(&self) -> Option<String> {
        self.coding
            .iter()
            .find_map(|c| {
                c.code.as_ref().map(|code| match &c.system {
                    Some(system) => format!("{system}|{code}"),
                    None => code.clone(),
                })
            })
            .or_else(|| self.text.clone())
    }

    /// Human-readable label
    pub fn label(&self) -> Option<String> {
        self.text
            .clone()
            .or_else(|| self.coding.iter().find_map(|c| c.display.clone()))
    }
}

/// FHIR `Identifier`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(default)]
    pub system: Option<String>,
    pub value: String,
}

/// FHIR `HumanName`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanName {
    #[serde(default)]
    pub r#use: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub given: Vec<String>,
}

/// FHIR `ContactPoint`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactPoint {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub r#use: Option<String>,
}

/// FHIR `Address`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub line: Vec<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default, rename = "postalCode")]
    pub postal_code: Option<String>,
}

/// FHIR `Reference`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub identifier: Option<Identifier>,
    #[serde(default)]
    pub display: Option<String>,
}

/// FHIR `Quantity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// FHIR `Dosage` (text only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dosage {
    #[serde(default)]
    pub text: Option<String>,
}

/// Patient demographics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientResource {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub name: Vec<HumanName>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub deceased_boolean: Option<bool>,
    #[serde(default)]
    pub deceased_date_time: Option<String>,
    #[serde(default)]
    pub telecom: Vec<ContactPoint>,
    #[serde(default)]
    pub address: Vec<Address>,
    #[serde(default)]
    pub general_practitioner: Vec<Reference>,
}

/// Recorded allergy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllergyResource {
    pub id: String,
    pub code: CodeableConcept,
    pub patient: Reference,
    #[serde(default)]
    pub clinical_status: Option<CodeableConcept>,
    #[serde(default)]
    pub criticality: Option<String>,
}

/// Medication the patient is taking or has taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationResource {
    pub id: String,
    pub status: String,
    pub medication_codeable_concept: CodeableConcept,
    pub subject: Reference,
    #[serde(default)]
    pub dosage: Vec<Dosage>,
    #[serde(default)]
    pub effective_date_time: Option<String>,
}

/// Problem or diagnosis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionResource {
    pub id: String,
    pub code: CodeableConcept,
    pub subject: Reference,
    #[serde(default)]
    pub clinical_status: Option<CodeableConcept>,
    #[serde(default)]
    pub onset_date_time: Option<String>,
}

/// Measurement or finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResource {
    pub id: String,
    pub status: String,
    pub code: CodeableConcept,
    pub subject: Reference,
    #[serde(default)]
    pub value_quantity: Option<Quantity>,
    #[serde(default)]
    pub effective_date_time: Option<String>,
}

/// Closed set of resource variants accepted from the remote API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum ClinicalResource {
    Patient(PatientResource),
    AllergyIntolerance(AllergyResource),
    MedicationStatement(MedicationResource),
    Condition(ConditionResource),
    Observation(ObservationResource),
}

/// Resource type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    AllergyIntolerance,
    MedicationStatement,
    Condition,
    Observation,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Patient => "Patient",
            ResourceType::AllergyIntolerance => "AllergyIntolerance",
            ResourceType::MedicationStatement => "MedicationStatement",
            ResourceType::Condition => "Condition",
            ResourceType::Observation => "Observation",
        };
        f.write_str(s)
    }
}

impl ClinicalResource {
    /// Parse and validate a raw resource
    ///
    /// # Errors
    ///
    /// Returns [`CarelinkError::Mapping`] when the declared type is not in the
    /// closed set, a required field is missing, or a field has the wrong shape.
    pub fn from_value(raw: &Value) -> Result<Self> {
        let declared = raw
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| CarelinkError::mapping("resource", "missing resourceType"))?;
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>")
            .to_string();

        let resource: ClinicalResource = serde_json::from_value(raw.clone()).map_err(|e| {
            CarelinkError::mapping(format!("{declared}/{id}"), e.to_string())
        })?;
        resource.validate()?;
        Ok(resource)
    }

    /// Resource type tag
    pub fn resource_type(&self) -> ResourceType {
        match self {
            ClinicalResource::Patient(_) => ResourceType::Patient,
            ClinicalResource::AllergyIntolerance(_) => ResourceType::AllergyIntolerance,
            ClinicalResource::MedicationStatement(_) => ResourceType::MedicationStatement,
            ClinicalResource::Condition(_) => ResourceType::Condition,
            ClinicalResource::Observation(_) => ResourceType::Observation,
        }
    }

    /// Logical id of the resource
    pub fn id(&self) -> &str {
        match self {
            ClinicalResource::Patient(r) => &r.id,
            ClinicalResource::AllergyIntolerance(r) => &r.id,
            ClinicalResource::MedicationStatement(r) => &r.id,
            ClinicalResource::Condition(r) => &r.id,
            ClinicalResource::Observation(r) => &r.id,
        }
    }

    /// Semantic checks serde cannot express
    fn validate(&self) -> Result<()> {
        let label = format!("{}/{}", self.resource_type(), self.id());
        let fail = |message: &str| Err(CarelinkError::mapping(label.clone(), message));

        if self.id().trim().is_empty() {
            return fail("empty id");
        }

        match self {
            ClinicalResource::Patient(p) => {
                if p.identifier.is_empty() {
                    return fail("patient has no identifier");
                }
                if !p.name.iter().any(|n| n.family.is_some() || !n.given.is_empty()) {
                    return fail("patient has no usable name");
                }
            }
            ClinicalResource::AllergyIntolerance(a) => {
                if a.code.key().is_none() {
                    return fail("allergy code has neither coding nor text");
                }
            }
            ClinicalResource::MedicationStatement(m) => {
                if m.medication_codeable_concept.key().is_none() {
                    return fail("medication has neither coding nor text");
                }
            }
            ClinicalResource::Condition(c) => {
                if c.code.key().is_none() {
                    return fail("condition code has neither coding nor text");
                }
            }
            ClinicalResource::Observation(o) => {
                if o.code.key().is_none() {
                    return fail("observation code has neither coding nor text");
                }
            }
        }
        Ok(())
    }
}

/// Canonical, store-agnostic form of a patient record: field name → value
pub type CanonicalRecord = BTreeMap<String, Value>;

/// A fetched and validated remote record
#[derive(Debug, Clone, PartialEq)]
pub struct FhirResourceBundle {
    /// Raw resources exactly as received, in page order
    pub raw: Vec<Value>,

    /// Parsed resources
    pub resources: Vec<ClinicalResource>,

    /// Canonical mapped form used for merging
    pub canonical: CanonicalRecord,

    /// Primary resource type of the bundle
    pub resource_type: ResourceType,

    /// Hash of the canonical form, used for idempotent-merge comparison
    pub content_hash: String,
}

impl FhirResourceBundle {
    /// The single Patient resource of the bundle
    pub fn patient(&self) -> Option<&PatientResource> {
        self.resources.iter().find_map(|r| match r {
            ClinicalResource::Patient(p) => Some(p),
            _ => None,
        })
    }
}
