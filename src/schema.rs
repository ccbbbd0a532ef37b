//! Schema model
//!
//! Read-only view of the declared types and services a query resolves
//! against. A `Schema` is built once per schema version, wrapped in an `Arc`
//! and shared by every query context that uses it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::checksum::Checksum;
use crate::error::{QueryError, Result};

/// Suffix used for synthesised collection type names (`Client[]`)
pub const COLLECTION_SUFFIX: &str = "[]";

/// Primitive types every schema carries
pub const PRIMITIVES: &[&str] = &[
    "String", "Int", "Long", "Decimal", "Boolean", "Date", "DateTime",
];

/// Type modifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    /// Built-in scalar
    Primitive,
    /// Closed set of named values
    Enum,
    /// May only be populated from an exact, directly provided instance
    Closed,
    /// May be constructed by the engine to satisfy an operation parameter
    Parameter,
}

/// A named value of an enum type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumValue {
    pub name: String,
    /// Underlying value, defaults to the name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Equivalent values on other enums, written `Enum.VALUE`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synonyms: Vec<String>,
}

impl EnumValue {
    pub fn raw_value(&self) -> serde_json::Value {
        self.value
            .clone()
            .unwrap_or_else(|| serde_json::Value::String(self.name.clone()))
    }
}

/// A named attribute of a Type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub nullable: bool,
    /// Computed fields are left for downstream evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

impl Field {
    pub fn of(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            nullable: false,
            expression: None,
            default_value: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// A named kind of data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<Modifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_for: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,
    /// Member type, for collection types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_of: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<EnumValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Type {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
            modifiers: Vec::new(),
            alias_for: None,
            inherits: Vec::new(),
            collection_of: None,
            enum_values: Vec::new(),
            format: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, field: Field) -> Self {
        self.attributes.insert(name.into(), field);
        self
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        if !self.modifiers.contains(&modifier) {
            self.modifiers.push(modifier);
        }
        self
    }

    pub fn inheriting(mut self, supertype: impl Into<String>) -> Self {
        self.inherits.push(supertype.into());
        self
    }

    pub fn aliasing(mut self, target: impl Into<String>) -> Self {
        self.alias_for = Some(target.into());
        self
    }

    pub fn with_enum_value(mut self, value: EnumValue) -> Self {
        self.enum_values.push(value);
        self.with_modifier(Modifier::Enum)
    }

    pub fn is_closed(&self) -> bool {
        self.modifiers.contains(&Modifier::Closed)
    }

    pub fn is_enum(&self) -> bool {
        self.modifiers.contains(&Modifier::Enum)
    }

    pub fn is_primitive(&self) -> bool {
        self.modifiers.contains(&Modifier::Primitive)
    }

    pub fn is_parameter_type(&self) -> bool {
        self.modifiers.contains(&Modifier::Parameter)
    }

    pub fn is_collection(&self) -> bool {
        self.collection_of.is_some()
    }

    /// Primitives, enums, and attribute-less non-collection types
    pub fn is_scalar(&self) -> bool {
        self.is_primitive()
            || self.is_enum()
            || (self.attributes.is_empty() && !self.is_collection())
    }

    pub fn collection_member_type(&self) -> Option<&str> {
        self.collection_of.as_deref()
    }

    /// Looks up an enum value by name, then by underlying value
    pub fn enum_value(&self, key: &serde_json::Value) -> Option<&EnumValue> {
        self.enum_values
            .iter()
            .find(|v| key.as_str() == Some(v.name.as_str()))
            .or_else(|| self.enum_values.iter().find(|v| &v.raw_value() == key))
    }
}

/// Constraint on an operation parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterConstraint {
    /// The parameter is always populated with this constant
    Equals { value: serde_json::Value },
}

/// An input of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<ParameterConstraint>,
}

impl Parameter {
    pub fn of(type_name: impl Into<String>) -> Self {
        Self {
            name: None,
            type_name: type_name.into(),
            nullable: false,
            constraints: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn constant(mut self, value: serde_json::Value) -> Self {
        self.constraints.push(ParameterConstraint::Equals { value });
        self
    }

    /// The constant this parameter is pinned to, if any
    pub fn constant_value(&self) -> Option<&serde_json::Value> {
        self.constraints.iter().find_map(|c| match c {
            ParameterConstraint::Equals { value } => Some(value),
        })
    }

    /// Display name, falling back to the type name
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }
}

/// A remote capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub return_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>, return_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
            return_type: return_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }
}

/// A group of operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|o| o.name == name)
    }
}

/// Qualified operation name, `Service.operation`
pub fn operation_name(service: &str, operation: &str) -> String {
    format!("{}.{}", service, operation)
}

/// Serialized form of a schema, one or more per file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<semver::Version>,
    #[serde(default)]
    pub types: Vec<Type>,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// Immutable schema with fast lookup indexes
#[derive(Debug)]
pub struct Schema {
    version: Option<semver::Version>,
    types: HashMap<String, Arc<Type>>,
    services: Vec<Service>,
    fingerprint: Checksum,
}

impl Schema {
    /// Build a schema, adding the built-in primitives when absent
    pub fn new(types: Vec<Type>, services: Vec<Service>) -> Self {
        Self::from_document(SchemaDocument {
            version: None,
            types,
            services,
        })
    }

    pub fn from_document(document: SchemaDocument) -> Self {
        let fingerprint = Checksum::of(&document);
        let mut types: HashMap<String, Arc<Type>> = document
            .types
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        for primitive in PRIMITIVES {
            types
                .entry(primitive.to_string())
                .or_insert_with(|| Arc::new(Type::new(*primitive).with_modifier(Modifier::Primitive)));
        }
        Self {
            version: document.version,
            types,
            services: document.services,
            fingerprint,
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let document: SchemaDocument = serde_json::from_str(content)?;
        Ok(Self::from_document(document))
    }

    /// Load a schema from a single JSON file or a directory of them
    pub fn load(path: &Path) -> Result<Self> {
        if path.is_dir() {
            Self::from_directory(path)
        } else {
            Self::from_json_str(&std::fs::read_to_string(path)?)
        }
    }

    /// Merge every `*.json` document under a directory
    pub fn from_directory(dir: &Path) -> Result<Self> {
        let mut merged = SchemaDocument::default();
        let mut files = 0;
        for entry in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        {
            let content = std::fs::read_to_string(entry.path())?;
            let document: SchemaDocument = serde_json::from_str(&content)?;
            debug!(
                "Loaded {} types, {} services from {:?}",
                document.types.len(),
                document.services.len(),
                entry.path()
            );
            if merged.version.is_none() {
                merged.version = document.version;
            }
            merged.types.extend(document.types);
            merged.services.extend(document.services);
            files += 1;
        }
        info!(
            "Loaded schema from {} files: {} types, {} services",
            files,
            merged.types.len(),
            merged.services.len()
        );
        Ok(Self::from_document(merged))
    }

    pub fn version(&self) -> Option<&semver::Version> {
        self.version.as_ref()
    }

    /// Fingerprint of the declared content
    pub fn fingerprint(&self) -> &Checksum {
        &self.fingerprint
    }

    /// Look up a type. Collection names (`Foo[]`) are synthesised on demand.
    pub fn type_named(&self, name: &str) -> Result<Arc<Type>> {
        if let Some(t) = self.types.get(name) {
            return Ok(t.clone());
        }
        if let Some(member) = name.strip_suffix(COLLECTION_SUFFIX) {
            self.type_named(member)?;
            return Ok(self.collection_type(member));
        }
        Err(QueryError::TypeNotFound {
            name: name.to_string(),
            suggestion: self.suggest_type(name),
        })
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.type_named(name).is_ok()
    }

    /// Synthesise the collection type of a member type
    pub fn collection_type(&self, member: &str) -> Arc<Type> {
        let name = collection_type_name(member);
        if let Some(t) = self.types.get(&name) {
            return t.clone();
        }
        let mut t = Type::new(name);
        t.collection_of = Some(member.to_string());
        Arc::new(t)
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<Type>> {
        self.types.values()
    }

    /// Types sorted by name, for deterministic traversal
    pub fn sorted_types(&self) -> Vec<&Arc<Type>> {
        let mut types: Vec<_> = self.types.values().collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| QueryError::ServiceNotFound(name.to_string()))
    }

    /// Look up an operation by its qualified name (`Service.operation`)
    pub fn operation(&self, qualified_name: &str) -> Result<(&Service, &Operation)> {
        let Some((service_name, operation_name)) = qualified_name.rsplit_once('.') else {
            return Err(QueryError::OperationNotFound {
                service: String::new(),
                operation: qualified_name.to_string(),
            });
        };
        let service = self.service(service_name)?;
        let operation = service
            .operation(operation_name)
            .ok_or_else(|| QueryError::OperationNotFound {
                service: service_name.to_string(),
                operation: operation_name.to_string(),
            })?;
        Ok((service, operation))
    }

    /// Operations whose return type is assignable to `type_name`
    pub fn operations_with_return_type(&self, type_name: &str) -> Vec<(&Service, &Operation)> {
        self.services
            .iter()
            .flat_map(|s| s.operations.iter().map(move |o| (s, o)))
            .filter(|(_, o)| self.is_assignable(&o.return_type, type_name))
            .collect()
    }

    /// Follow alias chains to the underlying type name
    pub fn resolve_alias(&self, name: &str) -> String {
        let mut current = name.to_string();
        let mut visited = HashSet::new();
        while visited.insert(current.clone()) {
            match self.types.get(&current).and_then(|t| t.alias_for.clone()) {
                Some(target) => current = target,
                None => break,
            }
        }
        current
    }

    /// All transitive supertypes of a type, nearest first, excluding itself
    pub fn inheritance_graph(&self, name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::from([name.to_string()]);
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            let Some(t) = self.types.get(&current) else {
                continue;
            };
            let parents = t.inherits.iter().chain(t.alias_for.iter());
            for parent in parents {
                if visited.insert(parent.clone()) {
                    result.push(parent.clone());
                    queue.push_back(parent.clone());
                }
            }
        }
        result
    }

    /// Can a value of `from` be used where `to` is expected?
    pub fn is_assignable(&self, from: &str, to: &str) -> bool {
        let from = self.resolve_alias(from);
        let to = self.resolve_alias(to);
        if from == to {
            return true;
        }
        if let (Some(from_member), Some(to_member)) = (
            from.strip_suffix(COLLECTION_SUFFIX),
            to.strip_suffix(COLLECTION_SUFFIX),
        ) {
            return self.is_assignable(from_member, to_member);
        }
        self.inheritance_graph(&from)
            .iter()
            .any(|parent| self.resolve_alias(parent) == to)
    }

    /// Enum values on other enums that a value is a synonym of
    pub fn enum_synonyms(&self, type_name: &str, value_name: &str) -> Vec<(String, String)> {
        let Ok(t) = self.type_named(type_name) else {
            return Vec::new();
        };
        t.enum_values
            .iter()
            .filter(|v| v.name == value_name)
            .flat_map(|v| v.synonyms.iter())
            .filter_map(|s| s.rsplit_once('.'))
            .map(|(t, v)| (t.to_string(), v.to_string()))
            .collect()
    }

    /// Closest known type name
    fn suggest_type(&self, name: &str) -> Option<String> {
        let matcher = SkimMatcherV2::default();
        self.types
            .keys()
            .filter_map(|candidate| {
                matcher
                    .fuzzy_match(candidate, name)
                    .map(|score| (score, candidate))
            })
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)))
            .map(|(_, candidate)| candidate.clone())
    }
}

/// Name of the collection type of `member`
pub fn collection_type_name(member: &str) -> String {
    format!("{}{}", member, COLLECTION_SUFFIX)
}

/// Narrow read-only access to the current schema.
///
/// The engine snapshots `schema()` when a query context is created, so a
/// provider may swap versions between queries but never during one.
pub trait SchemaProvider: Send + Sync {
    fn schema(&self) -> Arc<Schema>;

    fn type_named(&self, name: &str) -> Result<Arc<Type>> {
        Schema::type_named(&self.schema(), name)
    }

    fn has_type(&self, name: &str) -> bool {
        Schema::has_type(&self.schema(), name)
    }

    fn service(&self, name: &str) -> Result<Service> {
        Schema::service(&self.schema(), name).cloned()
    }

    /// `(service name, operation)` pairs whose return type fits `type_name`
    fn operations_with_return_type(&self, type_name: &str) -> Vec<(String, Operation)> {
        let schema = self.schema();
        Schema::operations_with_return_type(&schema, type_name)
            .into_iter()
            .map(|(s, o)| (s.name.clone(), o.clone()))
            .collect()
    }
}

impl SchemaProvider for Arc<Schema> {
    fn schema(&self) -> Arc<Schema> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(
            vec![
                Type::new("ClientId").inheriting("String"),
                Type::new("CustomerId").aliasing("ClientId"),
                Type::new("Client")
                    .with_attribute("id", Field::of("ClientId"))
                    .with_attribute("name", Field::of("String").nullable()),
                Type::new("Currency").with_enum_value(EnumValue {
                    name: "GBP".to_string(),
                    value: None,
                    synonyms: vec!["IsoCurrency.GB_POUND".to_string()],
                }),
            ],
            vec![Service::new("ClientService")
                .with_operation(Operation::new("getClient", "Client").with_parameter(Parameter::of("ClientId")))],
        )
    }

    #[test]
    fn test_primitives_are_added() {
        let schema = schema();
        assert!(schema.has_type("String"));
        assert!(schema.type_named("Int").unwrap().is_primitive());
    }

    #[test]
    fn test_scalar_and_collection() {
        let schema = schema();
        assert!(schema.type_named("ClientId").unwrap().is_scalar());
        assert!(!schema.type_named("Client").unwrap().is_scalar());

        let clients = schema.type_named("Client[]").unwrap();
        assert!(clients.is_collection());
        assert_eq!(clients.collection_member_type(), Some("Client"));
        assert!(schema.type_named("Unknown[]").is_err());
    }

    #[test]
    fn test_assignability() {
        let schema = schema();
        assert!(schema.is_assignable("ClientId", "String"));
        assert!(schema.is_assignable("CustomerId", "ClientId"));
        assert!(schema.is_assignable("ClientId[]", "String[]"));
        assert!(!schema.is_assignable("String", "ClientId"));
        assert_eq!(schema.inheritance_graph("CustomerId"), vec!["ClientId", "String"]);
    }

    #[test]
    fn test_operation_lookup() {
        let schema = schema();
        let (service, operation) = schema.operation("ClientService.getClient").unwrap();
        assert_eq!(service.name, "ClientService");
        assert_eq!(operation.return_type, "Client");
        assert_eq!(schema.operations_with_return_type("Client").len(), 1);
        assert!(schema.operation("ClientService.nope").is_err());
    }

    #[test]
    fn test_type_not_found_suggests() {
        let err = schema().type_named("Clent").unwrap_err();
        match err {
            QueryError::TypeNotFound { suggestion, .. } => {
                assert_eq!(suggestion.as_deref(), Some("Client"));
            }
            other => panic!("Expected TypeNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_enum_synonyms() {
        let schema = schema();
        assert_eq!(
            schema.enum_synonyms("Currency", "GBP"),
            vec![("IsoCurrency".to_string(), "GB_POUND".to_string())]
        );
    }

    #[test]
    fn test_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"version": "1.2.0", "types": [{"name": "ClientId", "inherits": ["String"]}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"services": [{"name": "S", "operations": [{"name": "op", "return_type": "ClientId"}]}]}"#,
        )
        .unwrap();

        let schema = Schema::load(dir.path()).unwrap();
        assert!(schema.has_type("ClientId"));
        assert_eq!(schema.services().len(), 1);
        assert_eq!(schema.version().map(|v| v.to_string()), Some("1.2.0".to_string()));
    }

    #[test]
    fn test_provider_lookups() {
        let provider = Arc::new(schema());
        assert!(SchemaProvider::has_type(&provider, "CustomerId"));
        assert!(SchemaProvider::service(&provider, "Missing").is_err());

        let operations = SchemaProvider::operations_with_return_type(&provider, "Client");
        assert_eq!(operations.len(), 1);
        assert_eq!(operations[0].0, "ClientService");
        assert_eq!(operations[0].1.name, "getClient");
    }
}
