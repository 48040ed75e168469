//! Domain identifier types with validation
//!
//! Newtype wrappers for the identifiers that flow through Carelink. The most
//! important one is [`NhsNumber`]: it can only be constructed through
//! [`validate`], so holding an `NhsNumber` proves the identifier passed the
//! Modulus 11 checksum and may be sent over the network.

use super::errors::CarelinkError;
use super::result::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of digits in a national patient identifier
pub const NHS_NUMBER_LENGTH: usize = 10;

/// Checksum weights applied to the first nine digits
const CHECKSUM_WEIGHTS: [u32; 9] = [10, 9, 8, 7, 6, 5, 4, 3, 2];

/// Compute the expected check digit for the first nine digits
///
/// Returns `None` when the weighted sum yields a check value of 10, which
/// means no valid identifier exists with this prefix.
///
/// # Examples
///
/// ```
/// use carelink::domain::ids::check_digit;
///
/// assert_eq!(check_digit(&[9, 4, 3, 4, 7, 6, 5, 9, 1]), Some(9));
/// ```
pub fn check_digit(first_nine: &[u8; 9]) -> Option<u8> {
    let sum: u32 = first_nine
        .iter()
        .zip(CHECKSUM_WEIGHTS.iter())
        .map(|(digit, weight)| u32::from(*digit) * weight)
        .sum();

    match 11 - (sum % 11) {
        11 => Some(0),
        10 => None,
        check => Some(check as u8),
    }
}

/// Validate a national patient identifier
///
/// The identifier must be exactly ten ASCII digits whose last digit matches the
/// weighted Modulus 11 check digit of the first nine. Surrounding whitespace is
/// ignored; anything else (separators, letters) is rejected.
///
/// # Errors
///
/// Returns [`CarelinkError::InvalidIdentifier`] on a format or checksum failure.
///
/// # Examples
///
/// ```
/// use carelink::domain::ids::validate;
///
/// assert!(validate("9434765919").is_ok());
/// assert!(validate("9434765918").is_err());
/// ```
pub fn validate(identifier: &str) -> Result<NhsNumber> {
    let trimmed = identifier.trim();

    if trimmed.len() != NHS_NUMBER_LENGTH || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CarelinkError::InvalidIdentifier(format!(
            "expected {NHS_NUMBER_LENGTH} digits, got {} characters",
            trimmed.chars().count()
        )));
    }

    let digits: Vec<u8> = trimmed.bytes().map(|b| b - b'0').collect();
    let mut first_nine = [0u8; 9];
    first_nine.copy_from_slice(&digits[..9]);

    match check_digit(&first_nine) {
        None => Err(CarelinkError::InvalidIdentifier(
            "checksum remainder has no valid check digit".to_string(),
        )),
        Some(expected) if expected != digits[9] => Err(CarelinkError::InvalidIdentifier(
            "check digit does not match".to_string(),
        )),
        Some(_) => Ok(NhsNumber(trimmed.to_string())),
    }
}

/// A national patient identifier that has passed checksum validation
///
/// Deserialization re-validates, so a persisted or received value can never
/// bypass the checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct NhsNumber(String);

impl NhsNumber {
    /// Parse and validate an identifier (alias for [`validate`])
    pub fn parse(identifier: &str) -> Result<Self> {
        validate(identifier)
    }

    /// Returns the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Masked form for log output (`*******919`)
    pub fn redacted(&self) -> String {
        format!("*******{}", &self.0[7..])
    }
}

impl fmt::Display for NhsNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NhsNumber {
    type Err = CarelinkError;

    fn from_str(s: &str) -> Result<Self> {
        validate(s)
    }
}

impl<'de> Deserialize<'de> for NhsNumber {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        validate(&raw).map_err(serde::de::Error::custom)
    }
}

/// Local patient identifier newtype wrapper
///
/// Identifies a resident in the local canonical clinical-record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatientId(String);

impl PatientId {
    /// Creates a new PatientId from a string
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CarelinkError::Validation(
                "Patient ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the patient ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PatientId {
    type Err = CarelinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Connected-organization identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a new ConnectionId from a string
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CarelinkError::Validation(
                "Connection ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the connection ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = CarelinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Correlation identifier tying audit entries of one logical operation together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a fresh correlation id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = CarelinkError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CarelinkError::Validation(format!("Invalid correlation id: {e}")))
    }
}
