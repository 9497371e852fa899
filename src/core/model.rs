use super::{DataType, DbError, Key, Result, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Participates in the version fingerprint of the entity.
    pub version: bool,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            version: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn versioned(mut self) -> Self {
        self.version = true;
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if value.is_null() {
            if !self.nullable {
                return Err(DbError::Validation(format!(
                    "Field '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(DbError::TypeMismatch(format!(
                "Field '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

/// Field layout of one entity type (key fields excluded; they live in `Key`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeInfo {
    name: String,
    fields: Vec<FieldInfo>,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>, fields: Vec<FieldInfo>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn field(&self, offset: usize) -> Option<&FieldInfo> {
        self.fields.get(offset)
    }

    pub fn version_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, field)| field.version)
            .map(|(index, _)| index)
    }

    /// Version extractor: projects the version-tracked fields of `tuple`.
    /// Void when the type tracks no version fields.
    pub fn extract_version(&self, tuple: &Tuple) -> VersionInfo {
        VersionInfo::new(
            self.version_fields()
                .map(|offset| tuple.get(offset).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

/// Registry of entity types known to a disconnected state and its sources.
#[derive(Debug, Clone, Default)]
pub struct EntityModel {
    types: HashMap<String, Arc<TypeInfo>>,
}

impl EntityModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, type_info: TypeInfo) -> Self {
        self.register(type_info);
        self
    }

    pub fn register(&mut self, type_info: TypeInfo) {
        self.types
            .insert(type_info.name().to_string(), Arc::new(type_info));
    }

    pub fn get(&self, entity_type: &str) -> Result<&Arc<TypeInfo>> {
        self.types
            .get(entity_type)
            .ok_or_else(|| DbError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn type_of(&self, key: &Key) -> Result<&Arc<TypeInfo>> {
        self.get(key.entity_type())
    }

    pub fn extract_version(&self, key: &Key, tuple: &Tuple) -> Result<VersionInfo> {
        Ok(self.type_of(key)?.extract_version(tuple))
    }
}

/// Version fingerprint of an entity. Empty means void: the type carries no
/// version-tracked fields and never conflicts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionInfo {
    values: Vec<Value>,
}

impl VersionInfo {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub const fn void() -> Self {
        Self { values: Vec::new() }
    }

    pub fn is_void(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            return write!(f, "(void)");
        }
        let values = self
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "({})", values)
    }
}

/// Pluggable hook validating an entity before a local change is recorded.
pub trait EntityValidator: Send + Sync {
    fn validate(&self, type_info: &TypeInfo, key: &Key, tuple: &Tuple) -> Result<()>;
}

/// Default validator: arity, field types and nullability.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl EntityValidator for SchemaValidator {
    fn validate(&self, type_info: &TypeInfo, key: &Key, tuple: &Tuple) -> Result<()> {
        if tuple.len() > type_info.fields().len() {
            return Err(DbError::Validation(format!(
                "Entity {} has {} values, type '{}' declares {} fields",
                key,
                tuple.len(),
                type_info.name(),
                type_info.fields().len()
            )));
        }
        for (field, value) in type_info.fields().iter().zip(tuple) {
            field.validate(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer_type() -> TypeInfo {
        TypeInfo::new(
            "Customer",
            vec![
                FieldInfo::new("name", DataType::Text).not_null(),
                FieldInfo::new("row_version", DataType::Integer).versioned(),
            ],
        )
    }

    #[test]
    fn test_extract_version_projects_versioned_fields() {
        let info = customer_type();
        let version = info.extract_version(&vec![Value::from("Ann"), Value::Integer(4)]);
        assert_eq!(version, VersionInfo::new(vec![Value::Integer(4)]));
    }

    #[test]
    fn test_type_without_version_fields_has_void_version() {
        let info = TypeInfo::new("Tag", vec![FieldInfo::new("label", DataType::Text)]);
        assert!(info.extract_version(&vec![Value::from("x")]).is_void());
    }

    #[test]
    fn test_schema_validator() {
        let info = customer_type();
        let key = Key::new("Customer", vec![Value::Integer(1)]);
        let validator = SchemaValidator;

        assert!(validator
            .validate(&info, &key, &vec![Value::from("Ann"), Value::Integer(1)])
            .is_ok());
        assert!(matches!(
            validator.validate(&info, &key, &vec![Value::Null]),
            Err(DbError::Validation(_))
        ));
        assert!(matches!(
            validator.validate(&info, &key, &vec![Value::Integer(5)]),
            Err(DbError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        let model = EntityModel::new().with_type(customer_type());
        assert!(model.get("Customer").is_ok());
        assert!(matches!(model.get("Order"), Err(DbError::UnknownEntityType(_))));
    }
}
