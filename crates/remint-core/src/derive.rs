//! Canonical identifier derivation.
//!
//! An identifier is a pure function of `(entity type, contributing fields)`.
//! The same content always produces the same identifier, which is what makes
//! re-running a migration safe: every re-run rewrites the same values.
//!
//! [`StandardIdDeriver`] produces `"<type>--<uuid v5>"`, where the UUID is
//! computed over the canonical JSON form of the fields the type's
//! [`IdContract`] lists.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::DerivationError;

/// Namespace used for all v5 identifiers (the STIX 2.1 namespace).
pub const IDENTIFIER_NAMESPACE: Uuid = Uuid::from_u128(0x00ab_edb4_aa42_466c_9c01_fed2_3315_a9b7);

/// A canonical, content-derived identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives a canonical identifier for a record retyped to `target_type`.
///
/// Implementations must be deterministic and side-effect free.
pub trait IdDeriver: Send + Sync {
    fn derive(
        &self,
        target_type: &str,
        content: &Map<String, Value>,
    ) -> Result<Identifier, DerivationError>;
}

/// Which fields an entity type's identifier is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdContract {
    pub fields: &'static [&'static str],
}

impl IdContract {
    /// Contract for `entity_type`; types without a dedicated rule use `name`.
    #[must_use]
    pub fn for_type(entity_type: &str) -> Self {
        let fields: &'static [&'static str] = match entity_type.to_ascii_lowercase().as_str() {
            "report" => &["name", "published"],
            "note" => &["content"],
            "opinion" => &["opinion"],
            "observed-data" => &["first_observed", "last_observed"],
            "indicator" => &["pattern"],
            "location" | "city" | "country" | "region" | "position" => &["name", "x_opencti_location_type"],
            "identity" | "individual" | "organization" | "sector" | "system" => {
                &["name", "identity_class"]
            }
            _ => &["name"],
        };
        Self { fields }
    }
}

/// Default deriver: `<type lowercased>--<uuid v5 of canonical contributing data>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardIdDeriver;

impl StandardIdDeriver {
    /// Canonical JSON over the contract fields: keys sorted, strings trimmed,
    /// `name` additionally lowercased.
    fn canonical_payload(
        target_type: &str,
        content: &Map<String, Value>,
    ) -> Result<String, DerivationError> {
        let contract = IdContract::for_type(target_type);
        let mut data = BTreeMap::new();
        for field in contract.fields {
            let value = content
                .get(*field)
                .and_then(normalize_scalar(field))
                .ok_or_else(|| DerivationError::MissingField {
                    entity_type: target_type.to_string(),
                    field: (*field).to_string(),
                })?;
            data.insert(*field, value);
        }
        // BTreeMap keys serialize in sorted order.
        Ok(serde_json::to_string(&data).unwrap_or_default())
    }
}

fn normalize_scalar(field: &str) -> impl Fn(&Value) -> Option<Value> + '_ {
    move |value| match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else if field == "name" {
                Some(Value::String(trimmed.to_lowercase()))
            } else {
                Some(Value::String(trimmed.to_string()))
            }
        }
        Value::Number(_) | Value::Bool(_) => Some(value.clone()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl IdDeriver for StandardIdDeriver {
    fn derive(
        &self,
        target_type: &str,
        content: &Map<String, Value>,
    ) -> Result<Identifier, DerivationError> {
        let target_type = target_type.trim();
        if target_type.is_empty() {
            return Err(DerivationError::EmptyType);
        }
        let payload = Self::canonical_payload(target_type, content)?;
        let uuid = Uuid::new_v5(&IDENTIFIER_NAMESPACE, payload.as_bytes());
        Ok(Identifier(format!(
            "{}--{uuid}",
            target_type.to_ascii_lowercase()
        )))
    }
}
