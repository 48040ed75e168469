//! Periodic compliance submission batches

use super::errors::CarelinkError;
use super::result::Result;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How often a reporting period rolls over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportingCadence {
    #[default]
    Monthly,
    Quarterly,
}

/// Reporting period identifier, e.g. `2026-10` or `2026-Q4`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportingPeriod(String);

impl ReportingPeriod {
    /// The period containing `at`
    pub fn containing(at: DateTime<Utc>, cadence: ReportingCadence) -> Self {
        match cadence {
            ReportingCadence::Monthly => Self(format!("{}-{:02}", at.year(), at.month())),
            ReportingCadence::Quarterly => {
                Self(format!("{}-Q{}", at.year(), (at.month() - 1) / 3 + 1))
            }
        }
    }

    /// Returns the period as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ReportingPeriod {
    type Err = CarelinkError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CarelinkError::Validation(format!("Invalid reporting period: {s}"));
        let (year, rest) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || year.parse::<u32>().is_err() {
            return Err(invalid());
        }
        let ok = match rest.strip_prefix('Q') {
            Some(q) => matches!(q, "1" | "2" | "3" | "4"),
            None => rest.len() == 2 && matches!(rest.parse::<u32>(), Ok(1..=12)),
        };
        if !ok {
            return Err(invalid());
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for ReportingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a single compliance item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Passed local schema validation, awaiting submission
    Valid,
    /// Failed local schema validation; excluded with a reason
    Invalid,
    /// Accepted by the remote endpoint (terminal success)
    Submitted,
    /// Rejected by the remote endpoint; not retried unless its content changes
    Rejected,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Valid => "valid",
            ItemStatus::Invalid => "invalid",
            ItemStatus::Submitted => "submitted",
            ItemStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// JSON type a required compliance field must have
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl JsonType {
    /// Whether `value` has this type (`null` never matches)
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Object => value.is_object(),
            JsonType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for JsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
        };
        f.write_str(s)
    }
}

/// Item produced by the reporting collaborator, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceItemInput {
    pub item_id: String,
    pub kind: String,
    pub payload: Value,
}

/// A compliance item tracked inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceItem {
    pub item_id: String,
    pub kind: String,
    pub payload: Value,
    /// Checksum of `payload`, used to detect corrected content
    pub payload_hash: String,
    pub status: ItemStatus,
    pub reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ComplianceItem {
    /// Whether a run may (re)submit this item
    pub fn needs_submission(&self) -> bool {
        self.status == ItemStatus::Valid
    }
}

/// Batch of compliance items for one reporting period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSubmissionBatch {
    pub period: ReportingPeriod,
    /// Items in insertion order
    pub items: Vec<ComplianceItem>,
    /// Timestamp of the most recent submission run that sent items
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ComplianceSubmissionBatch {
    /// Empty batch for a period
    pub fn new(period: ReportingPeriod) -> Self {
        Self {
            period,
            items: Vec::new(),
            submitted_at: None,
            created_at: Utc::now(),
        }
    }

    /// Look up an item by id
    pub fn item(&self, item_id: &str) -> Option<&ComplianceItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    /// Mutable lookup by id
    pub fn item_mut(&mut self, item_id: &str) -> Option<&mut ComplianceItem> {
        self.items.iter_mut().find(|i| i.item_id == item_id)
    }

    /// Count items with the given status
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use test_case::test_case;

    #[test]
    fn test_period_containing() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        assert_eq!(
            ReportingPeriod::containing(at, ReportingCadence::Monthly).as_str(),
            "2026-10"
        );
        assert_eq!(
            ReportingPeriod::containing(at, ReportingCadence::Quarterly).as_str(),
            "2026-Q4"
        );
    }

    #[test_case("2026-01", true)]
    #[test_case("2026-12", true)]
    #[test_case("2026-Q3", true)]
    #[test_case("2026-13", false)]
    #[test_case("2026-Q5", false)]
    #[test_case("26-01", false)]
    #[test_case("2026", false)]
    fn test_period_parse(input: &str, ok: bool) {
        assert_eq!(input.parse::<ReportingPeriod>().is_ok(), ok);
    }

    #[test]
    fn test_json_type_matches() {
        use serde_json::json;
        assert!(JsonType::Integer.matches(&json!(3)));
        assert!(!JsonType::Integer.matches(&json!(3.5)));
        assert!(JsonType::Number.matches(&json!(3.5)));
        assert!(!JsonType::String.matches(&Value::Null));
    }

    #[test]
    fn test_batch_counts() {
        let mut batch = ComplianceSubmissionBatch::new("2026-10".parse().unwrap());
        for (id, status) in [("a", ItemStatus::Valid), ("b", ItemStatus::Submitted)] {
            batch.items.push(ComplianceItem {
                item_id: id.into(),
                kind: "falls".into(),
                payload: Value::Null,
                payload_hash: String::new(),
                status,
                reason: None,
                submitted_at: None,
            });
        }
        assert_eq!(batch.count(ItemStatus::Valid), 1);
        assert!(batch.item("a").unwrap().needs_submission());
        assert!(!batch.item("b").unwrap().needs_submission());
    }
}
