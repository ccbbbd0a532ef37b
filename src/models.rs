//! Typed values and their provenance

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::checksum::value_hash;
use crate::error::{QueryError, Result};
use crate::schema::{collection_type_name, Schema};

// ============================================================================
// Provenance
// ============================================================================

/// Details of a single remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCall {
    pub service: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    pub is_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A named input passed to a remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationParam {
    pub parameter_name: String,
    pub value: TypedInstance,
}

/// How a value was obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// Supplied by the caller
    Provided,
    /// A constant declared in the schema
    DefinedInSchema,
    /// Composite built from children with differing provenance
    MixedSources,
    OperationResult {
        call: RemoteCall,
        inputs: Vec<OperationParam>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_attempts: Vec<DataSource>,
    },
    FailedSearch {
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_attempts: Vec<DataSource>,
    },
    FailedEvaluation {
        message: String,
    },
}

impl DataSource {
    pub fn failed_search(message: impl Into<String>) -> Self {
        DataSource::FailedSearch {
            message: message.into(),
            failed_attempts: Vec::new(),
        }
    }

    pub fn failed_attempts(&self) -> &[DataSource] {
        match self {
            DataSource::OperationResult { failed_attempts, .. }
            | DataSource::FailedSearch { failed_attempts, .. } => failed_attempts,
            _ => &[],
        }
    }

    /// Attach attempts that failed before this value was found.
    ///
    /// Static sources have nowhere to record them and are returned unchanged.
    pub fn append_failed_attempts(self, attempts: Vec<DataSource>) -> DataSource {
        if attempts.is_empty() {
            return self;
        }
        match self {
            DataSource::OperationResult {
                call,
                inputs,
                mut failed_attempts,
            } => {
                failed_attempts.extend(attempts);
                DataSource::OperationResult {
                    call,
                    inputs,
                    failed_attempts,
                }
            }
            DataSource::FailedSearch {
                message,
                mut failed_attempts,
            } => {
                failed_attempts.extend(attempts);
                DataSource::FailedSearch {
                    message,
                    failed_attempts,
                }
            }
            other => {
                warn!(
                    "Dropping {} failed attempts on static source {}",
                    attempts.len(),
                    other.name()
                );
                other
            }
        }
    }

    /// The shared source of `instances`, or `MixedSources` when they differ
    pub fn single_source_or_mixed<'a>(
        instances: impl IntoIterator<Item = &'a TypedInstance>,
    ) -> DataSource {
        let mut sources = instances.into_iter().map(|i| &i.source);
        let Some(first) = sources.next() else {
            return DataSource::MixedSources;
        };
        if sources.all(|s| s == first) {
            first.clone()
        } else {
            DataSource::MixedSources
        }
    }

    pub fn is_failure(&self) -> bool {
        match self {
            DataSource::FailedSearch { .. } | DataSource::FailedEvaluation { .. } => true,
            DataSource::OperationResult { call, .. } => call.is_failed,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataSource::Provided => "Provided",
            DataSource::DefinedInSchema => "DefinedInSchema",
            DataSource::MixedSources => "MixedSources",
            DataSource::OperationResult { .. } => "OperationResult",
            DataSource::FailedSearch { .. } => "FailedSearch",
            DataSource::FailedEvaluation { .. } => "FailedEvaluation",
        }
    }
}

// ============================================================================
// Typed values
// ============================================================================

/// The payload of a typed instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TypedValue {
    Null,
    Scalar(serde_json::Value),
    Object(BTreeMap<String, TypedInstance>),
    Collection(Vec<TypedInstance>),
    Enum {
        name: String,
        value: serde_json::Value,
    },
}

/// A concrete value tagged with its type and provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedInstance {
    pub type_name: String,
    pub value: TypedValue,
    pub source: DataSource,
}

impl TypedInstance {
    pub fn scalar(type_name: impl Into<String>, value: serde_json::Value, source: DataSource) -> Self {
        Self {
            type_name: type_name.into(),
            value: TypedValue::Scalar(value),
            source,
        }
    }

    /// A typed null, carrying why no value exists
    pub fn null(type_name: impl Into<String>, source: DataSource) -> Self {
        Self {
            type_name: type_name.into(),
            value: TypedValue::Null,
            source,
        }
    }

    pub fn object(
        type_name: impl Into<String>,
        attributes: BTreeMap<String, TypedInstance>,
        source: DataSource,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            value: TypedValue::Object(attributes),
            source,
        }
    }

    /// A collection of `member_type`, typed `member_type[]`
    pub fn collection(member_type: &str, members: Vec<TypedInstance>, source: DataSource) -> Self {
        Self {
            type_name: collection_type_name(member_type),
            value: TypedValue::Collection(members),
            source,
        }
    }

    /// A collection whose source is derived from its members
    pub fn collection_of(member_type: &str, members: Vec<TypedInstance>) -> Self {
        let source = DataSource::single_source_or_mixed(&members);
        Self::collection(member_type, members, source)
    }

    /// Parse raw JSON against a declared type.
    ///
    /// Unknown object keys are ignored, missing ones fall back to the field
    /// default (sourced `DefinedInSchema`) or are left out.
    pub fn from_json(
        type_name: &str,
        raw: &serde_json::Value,
        schema: &Schema,
        source: DataSource,
    ) -> Result<Self> {
        let t = schema.type_named(type_name)?;
        if raw.is_null() {
            return Ok(Self::null(type_name, source));
        }
        if let Some(member) = t.collection_member_type() {
            let items = match raw {
                serde_json::Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            let members = items
                .iter()
                .map(|item| Self::from_json(member, item, schema, source.clone()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Self::collection(member, members, source));
        }
        if t.is_enum() {
            let value = t.enum_value(raw).ok_or_else(|| {
                QueryError::InvalidValue(format!("{} is not a value of enum {}", raw, type_name))
            })?;
            return Ok(Self {
                type_name: type_name.to_string(),
                value: TypedValue::Enum {
                    name: value.name.clone(),
                    value: value.raw_value(),
                },
                source,
            });
        }
        if t.is_scalar() {
            if raw.is_object() || raw.is_array() {
                return Err(QueryError::InvalidValue(format!(
                    "Expected a scalar for {}, got {}",
                    type_name, raw
                )));
            }
            return Ok(Self::scalar(type_name, raw.clone(), source));
        }
        let serde_json::Value::Object(map) = raw else {
            return Err(QueryError::InvalidValue(format!(
                "Expected an object for {}, got {}",
                type_name, raw
            )));
        };
        let mut attributes = BTreeMap::new();
        for (name, field) in &t.attributes {
            let value = match (map.get(name), &field.default_value) {
                (Some(v), _) => Self::from_json(&field.type_name, v, schema, source.clone())?,
                (None, Some(default)) => {
                    Self::from_json(&field.type_name, default, schema, DataSource::DefinedInSchema)?
                }
                (None, None) => continue,
            };
            attributes.insert(name.clone(), value);
        }
        Ok(Self::object(type_name, attributes, source))
    }

    /// Plain JSON form, without type or provenance
    pub fn to_raw(&self) -> serde_json::Value {
        match &self.value {
            TypedValue::Null => serde_json::Value::Null,
            TypedValue::Scalar(v) => v.clone(),
            TypedValue::Enum { name, .. } => serde_json::Value::String(name.clone()),
            TypedValue::Object(attributes) => serde_json::Value::Object(
                attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_raw()))
                    .collect(),
            ),
            TypedValue::Collection(members) => {
                serde_json::Value::Array(members.iter().map(|m| m.to_raw()).collect())
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, TypedValue::Null)
    }

    /// Not null, and not an empty string
    pub fn has_value(&self) -> bool {
        match &self.value {
            TypedValue::Null => false,
            TypedValue::Scalar(serde_json::Value::String(s)) => !s.is_empty(),
            TypedValue::Scalar(serde_json::Value::Null) => false,
            _ => true,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.value, TypedValue::Collection(_))
    }

    /// Hash of type and value; provenance is ignored
    pub fn value_hash(&self) -> u64 {
        value_hash(&serde_json::json!([self.type_name, self.to_raw()]))
    }

    /// Same type and value, regardless of provenance
    pub fn same_value(&self, other: &TypedInstance) -> bool {
        self.type_name == other.type_name && self.to_raw() == other.to_raw()
    }

    pub fn attribute(&self, name: &str) -> Option<&TypedInstance> {
        match &self.value {
            TypedValue::Object(attributes) => attributes.get(name),
            _ => None,
        }
    }

    pub fn attributes(&self) -> Option<&BTreeMap<String, TypedInstance>> {
        match &self.value {
            TypedValue::Object(attributes) => Some(attributes),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&[TypedInstance]> {
        match &self.value {
            TypedValue::Collection(members) => Some(members),
            _ => None,
        }
    }

    /// Nested collections are flattened into their leaf members
    pub fn flatten(self) -> Vec<TypedInstance> {
        match self.value {
            TypedValue::Collection(members) => {
                members.into_iter().flat_map(TypedInstance::flatten).collect()
            }
            _ => vec![self],
        }
    }

    pub fn with_source(mut self, source: DataSource) -> Self {
        self.source = source;
        self
    }

    /// Restamp this value and everything nested in it
    pub fn with_source_deep(self, source: DataSource) -> Self {
        let value = match self.value {
            TypedValue::Object(attributes) => TypedValue::Object(
                attributes
                    .into_iter()
                    .map(|(k, v)| (k, v.with_source_deep(source.clone())))
                    .collect(),
            ),
            TypedValue::Collection(members) => TypedValue::Collection(
                members
                    .into_iter()
                    .map(|m| m.with_source_deep(source.clone()))
                    .collect(),
            ),
            other => other,
        };
        Self {
            type_name: self.type_name,
            value,
            source,
        }
    }

    pub fn append_failed_attempts(mut self, attempts: Vec<DataSource>) -> Self {
        self.source = self.source.append_failed_attempts(attempts);
        self
    }
}

impl fmt::Display for TypedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name, self.to_raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EnumValue, Field, Type};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::new("ClientId").inheriting("String"),
                Type::new("Currency").with_enum_value(EnumValue {
                    name: "GBP".to_string(),
                    value: Some(json!("gbp")),
                    synonyms: Vec::new(),
                }),
                Type::new("Client")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("currency", Field::of("Currency"))
                    .with_attribute(
                        "region",
                        Field {
                            default_value: Some(json!("EMEA")),
                            ..Field::of("String")
                        },
                    ),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn test_from_json_object() {
        let schema = schema();
        let client = TypedInstance::from_json(
            "Client",
            &json!({"id": "C1", "currency": "gbp", "ignored": true}),
            &schema,
            DataSource::Provided,
        )
        .unwrap();

        assert_eq!(client.attribute("id").unwrap().to_raw(), json!("C1"));
        assert_eq!(client.attribute("currency").unwrap().to_raw(), json!("GBP"));
        let region = client.attribute("region").unwrap();
        assert_eq!(region.source, DataSource::DefinedInSchema);
        assert_eq!(
            client.to_raw(),
            json!({"id": "C1", "currency": "GBP", "region": "EMEA"})
        );
    }

    #[test]
    fn test_from_json_rejects_shape_mismatch() {
        let schema = schema();
        assert!(TypedInstance::from_json("ClientId", &json!({"a": 1}), &schema, DataSource::Provided).is_err());
        assert!(TypedInstance::from_json("Client", &json!("C1"), &schema, DataSource::Provided).is_err());
        assert!(TypedInstance::from_json("Currency", &json!("USD"), &schema, DataSource::Provided).is_err());
    }

    #[test]
    fn test_collection_flatten() {
        let schema = schema();
        let ids = TypedInstance::from_json("ClientId[]", &json!(["C1", "C2"]), &schema, DataSource::Provided).unwrap();
        assert_eq!(ids.type_name, "ClientId[]");
        let nested = TypedInstance::collection_of("ClientId[]", vec![ids]);
        let flat = nested.flatten();
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[1].to_raw(), json!("C2"));
    }

    #[test]
    fn test_has_value() {
        assert!(!TypedInstance::scalar("String", json!(""), DataSource::Provided).has_value());
        assert!(!TypedInstance::null("String", DataSource::failed_search("none")).has_value());
        assert!(TypedInstance::scalar("String", json!("x"), DataSource::Provided).has_value());
    }

    #[test]
    fn test_value_hash_ignores_source() {
        let a = TypedInstance::scalar("ClientId", json!("C1"), DataSource::Provided);
        let b = TypedInstance::scalar("ClientId", json!("C1"), DataSource::DefinedInSchema);
        let c = TypedInstance::scalar("String", json!("C1"), DataSource::Provided);
        assert_eq!(a.value_hash(), b.value_hash());
        assert_ne!(a.value_hash(), c.value_hash());
        assert!(a.same_value(&b));
    }

    #[test]
    fn test_single_source_or_mixed() {
        let a = TypedInstance::scalar("ClientId", json!("C1"), DataSource::Provided);
        let b = TypedInstance::scalar("ClientId", json!("C2"), DataSource::Provided);
        let c = TypedInstance::scalar("ClientId", json!("C3"), DataSource::DefinedInSchema);
        assert_eq!(DataSource::single_source_or_mixed([&a, &b]), DataSource::Provided);
        assert_eq!(DataSource::single_source_or_mixed([&a, &c]), DataSource::MixedSources);
    }

    #[test]
    fn test_append_failed_attempts() {
        let failure = DataSource::failed_search("first");
        let source = DataSource::failed_search("second").append_failed_attempts(vec![failure.clone()]);
        assert_eq!(source.failed_attempts(), &[failure.clone()]);
        assert_eq!(
            DataSource::Provided.append_failed_attempts(vec![failure]),
            DataSource::Provided
        );
    }
}
