//! Declared input/output schemas for thoughts.
//!
//! A schema is a flat map of field name to [`FieldSpec`]. Bindings between
//! nodes are type-checked against these declarations when a workflow graph is
//! built, and node outputs are checked against them when a node succeeds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Maximum length of a schema field name.
const MAX_FIELD_NAME_LEN: usize = 64;

/// The JSON value type a field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// JSON string.
    String,
    /// Any JSON number.
    Number,
    /// A JSON number with no fractional part.
    Integer,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
    /// Unconstrained.
    Any,
}

impl ValueType {
    /// Returns `true` if a consumer declared as `self` can accept a value a
    /// producer declared as `produced`.
    pub fn accepts(self, produced: ValueType) -> bool {
        match (self, produced) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Number, Self::Integer) => true,
            (a, b) => a == b,
        }
    }

    /// Returns `true` if `value` is an instance of this type.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    /// Infer the narrowest type describing `value`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
            Value::Null => Self::Any,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

fn default_required() -> bool {
    true
}

/// Declaration of one input or output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Value type of the field.
    #[serde(rename = "type")]
    pub ty: ValueType,
    /// Whether the field must be bound (inputs) or produced (outputs).
    #[serde(default = "default_required")]
    pub required: bool,
    /// Free-form description surfaced to planners.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl FieldSpec {
    /// A required field of the given type.
    pub fn required(ty: ValueType) -> Self {
        Self {
            ty,
            required: true,
            description: String::new(),
        }
    }

    /// An optional field of the given type.
    pub fn optional(ty: ValueType) -> Self {
        Self {
            ty,
            required: false,
            description: String::new(),
        }
    }
}

/// A flat, ordered map of field name to declaration.
///
/// # Example
///
/// ```rust
/// use thought_orchestrator::thought::schema::{Schema, ValueType};
/// let schema = Schema::new()
///     .with_field("path", ValueType::String)
///     .with_optional("append", ValueType::Boolean);
/// assert_eq!(schema.len(), 2);
/// assert!(schema.well_formed().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// An empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field.
    pub fn with_field(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.fields.insert(name.into(), FieldSpec::required(ty));
        self
    }

    /// Add an optional field.
    pub fn with_optional(mut self, name: impl Into<String>, ty: ValueType) -> Self {
        self.fields.insert(name.into(), FieldSpec::optional(ty));
        self
    }

    /// Look up a field declaration.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of every required field.
    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(k, _)| k.as_str())
    }

    /// Number of declared fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if no fields are declared.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check that every field name is a plain identifier.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if every name is non-empty, at most 64 bytes, and made of
    ///   ASCII alphanumerics and `_`
    /// - `Err(issues)` with one message per offending field
    pub fn well_formed(&self) -> Result<(), Vec<String>> {
        let issues: Vec<String> = self
            .fields
            .keys()
            .filter(|name| !is_identifier(name))
            .map(|name| format!("invalid field name '{name}'"))
            .collect();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Check a produced value against this schema.
    ///
    /// The value must be a JSON object when the schema declares any field.
    /// Undeclared extra fields are permitted.
    pub fn check_value(&self, value: &Value) -> Result<(), Vec<String>> {
        if self.is_empty() {
            return Ok(());
        }
        let Some(obj) = value.as_object() else {
            return Err(vec![format!(
                "expected an object, got {}",
                ValueType::of(value)
            )]);
        };
        let mut issues = Vec::new();
        for (name, spec) in &self.fields {
            match obj.get(name) {
                None | Some(Value::Null) if spec.required => {
                    issues.push(format!("missing required field '{name}'"));
                }
                Some(v) if !v.is_null() && !spec.ty.matches(v) => issues.push(format!(
                    "field '{name}' expected {}, got {}",
                    spec.ty,
                    ValueType::of(v)
                )),
                _ => {}
            }
        }
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FIELD_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
