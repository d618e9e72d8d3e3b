//! Field schema definition and validation.
//!
//! A schema describes the fields of the synced collection and lets the
//! context reject bad input before anything is written or queued.

use crate::{error::Result, CollectionName, Error, Fields};
use serde::{Deserialize, Serialize};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            // Epoch millis or an RFC 3339 string, as browsers send either
            FieldType::Timestamp => {
                value.is_u64()
                    || value.is_i64()
                    || value
                        .as_str()
                        .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            }
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for the synced collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    /// Collection name
    pub name: CollectionName,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    /// Create a new collection schema.
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// The branch form: a required name, an address and a default flag.
    pub fn branches(name: impl Into<CollectionName>) -> Self {
        Self::new(
            name,
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("address", FieldType::String),
                FieldDef::optional("isDefault", FieldType::Bool),
                FieldDef::optional("lastUpdated", FieldType::Timestamp),
            ],
        )
    }

    /// A schema that accepts any fields.
    pub fn permissive(name: impl Into<CollectionName>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Validate the full field set of a new record.
    pub fn validate_fields(&self, fields: &Fields) -> Result<()> {
        for field in &self.fields {
            field.validate(fields.get(&field.name))?;
        }

        Ok(())
    }

    /// Validate a partial update: only the supplied fields are checked.
    pub fn validate_partial(&self, fields: &Fields) -> Result<()> {
        for field in &self.fields {
            if let Some(value) = fields.get(&field.name) {
                field.validate(Some(value))?;
            }
        }

        Ok(())
    }

    /// Validate an arbitrary JSON payload, which must be an object.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        self.validate_fields(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn validate_valid_branch() {
        let schema = CollectionSchema::branches("branches");

        assert!(schema
            .validate_fields(&fields(json!({"name": "Branch A"})))
            .is_ok());
        assert!(schema
            .validate_fields(&fields(json!({
                "name": "Branch B",
                "address": "Mall Road",
                "isDefault": true,
                "lastUpdated": "2024-01-31T10:00:00.000Z"
            })))
            .is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = CollectionSchema::branches("branches");

        let result = schema.validate_fields(&fields(json!({"address": "Main St"})));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "name"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = CollectionSchema::branches("branches");

        let result = schema.validate_fields(&fields(json!({"name": "A", "isDefault": "yes"})));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "isDefault"));
    }

    #[test]
    fn validate_timestamp_forms() {
        let schema = CollectionSchema::branches("branches");

        assert!(schema
            .validate_partial(&fields(json!({"lastUpdated": 1706745600000u64})))
            .is_ok());
        assert!(schema
            .validate_partial(&fields(json!({"lastUpdated": "yesterday"})))
            .is_err());
    }

    #[test]
    fn partial_validation_skips_absent_fields() {
        let schema = CollectionSchema::branches("branches");

        assert!(schema
            .validate_partial(&fields(json!({"address": "New address"})))
            .is_ok());

        let result = schema.validate_partial(&fields(json!({"name": null})));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "name"));
    }

    #[test]
    fn payload_must_be_object() {
        let schema = CollectionSchema::permissive("anything");
        let result = schema.validate_payload(&json!([1, 2, 3]));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
        assert!(schema.validate_payload(&json!({"x": 1})).is_ok());
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Bool.to_string(), "Bool");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn json_field_accepts_any() {
        let collection =
            CollectionSchema::new("events", vec![FieldDef::required("data", FieldType::Json)]);

        assert!(collection
            .validate_payload(&json!({"data": "string"}))
            .is_ok());
        assert!(collection.validate_payload(&json!({"data": 123})).is_ok());
        assert!(collection
            .validate_payload(&json!({"data": {"nested": "object"}}))
            .is_ok());
    }
}
