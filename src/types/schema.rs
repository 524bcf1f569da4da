use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;

use super::value::{is_integral, Value};

/// Structural type of a flag value, as reported by the resolver.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Schema {
    /// Unknown shape. Accepts any value.
    #[default]
    Undefined,
    Boolean,
    Integer,
    Double,
    String,
    Struct(BTreeMap<String, Schema>),
    List(Box<Schema>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mismatch {
    Kind {
        expected: &'static str,
        found: &'static str,
    },
    MissingField,
}

/// A structural mismatch found at `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMismatch {
    pub path: Vec<String>,
    pub kind: Mismatch,
}

impl TypeMismatch {
    pub fn new(kind: Mismatch) -> Self {
        Self {
            path: Vec::new(),
            kind,
        }
    }

    pub fn at(path: &[impl AsRef<str>], kind: Mismatch) -> Self {
        Self {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            kind,
        }
    }

    /// Prepends path segments, e.g. `defaultValue`.
    pub fn prefixed(mut self, prefix: &[impl AsRef<str>]) -> Self {
        let mut path: Vec<String> = prefix.iter().map(|s| s.as_ref().to_string()).collect();
        path.append(&mut self.path);
        self.path = path;
        self
    }

    pub fn path_string(&self) -> String {
        self.path.join(".")
    }
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = if self.path.is_empty() {
            String::from("value")
        } else {
            self.path_string()
        };
        match &self.kind {
            Mismatch::Kind { expected, found } => {
                write!(f, "Expected {} at {}, found {}", expected, at, found)
            }
            Mismatch::MissingField => write!(f, "No field at {}", at),
        }
    }
}

impl std::error::Error for TypeMismatch {}

impl Schema {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Schema::Undefined => "undefined",
            Schema::Boolean => "boolean",
            Schema::Integer => "integer",
            Schema::Double => "double",
            Schema::String => "string",
            Schema::Struct(_) => "struct",
            Schema::List(_) => "list",
        }
    }

    /// Parses the resolver's `flagSchema` object, `{"schema": {field: <fieldSchema>}}`.
    ///
    /// A missing schema parses as `Undefined`.
    pub fn from_wire(wire: &serde_json::Value) -> Result<Schema, TypeMismatch> {
        match wire.get("schema") {
            Some(serde_json::Value::Object(fields)) => {
                let mut parsed = BTreeMap::new();
                for (name, field) in fields {
                    let schema = Self::field_from_wire(field).map_err(|e| e.prefixed(&[name]))?;
                    parsed.insert(name.clone(), schema);
                }
                Ok(Schema::Struct(parsed))
            }
            Some(other) if !other.is_null() => Err(TypeMismatch::at(
                &["schema"],
                Mismatch::Kind {
                    expected: "struct",
                    found: Value::from(other.clone()).kind_name(),
                },
            )),
            _ if wire.is_null() => Ok(Schema::Undefined),
            _ => Self::field_from_wire(wire),
        }
    }

    fn field_from_wire(field: &serde_json::Value) -> Result<Schema, TypeMismatch> {
        let object = field.as_object().ok_or_else(|| {
            TypeMismatch::new(Mismatch::Kind {
                expected: "struct",
                found: Value::from(field.clone()).kind_name(),
            })
        })?;
        if object.contains_key("boolSchema") {
            Ok(Schema::Boolean)
        } else if object.contains_key("intSchema") {
            Ok(Schema::Integer)
        } else if object.contains_key("doubleSchema") {
            Ok(Schema::Double)
        } else if object.contains_key("stringSchema") {
            Ok(Schema::String)
        } else if let Some(inner) = object.get("structSchema") {
            Self::from_wire(inner)
        } else if let Some(inner) = object.get("listSchema") {
            let element = match inner.get("elementSchema") {
                Some(element) => Self::field_from_wire(element)?,
                None => Schema::Undefined,
            };
            Ok(Schema::List(Box::new(element)))
        } else {
            Ok(Schema::Undefined)
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Schema::Struct(fields) => json!({
                "schema": fields
                    .iter()
                    .map(|(name, schema)| (name.clone(), schema.field_to_wire()))
                    .collect::<serde_json::Map<_, _>>()
            }),
            Schema::Undefined => serde_json::Value::Null,
            other => other.field_to_wire(),
        }
    }

    fn field_to_wire(&self) -> serde_json::Value {
        match self {
            Schema::Undefined => json!({}),
            Schema::Boolean => json!({ "boolSchema": {} }),
            Schema::Integer => json!({ "intSchema": {} }),
            Schema::Double => json!({ "doubleSchema": {} }),
            Schema::String => json!({ "stringSchema": {} }),
            Schema::Struct(_) => json!({ "structSchema": self.to_wire() }),
            Schema::List(element) => json!({ "listSchema": { "elementSchema": element.field_to_wire() } }),
        }
    }

    /// Navigates struct fields along `path`. An `Undefined` schema navigates to itself.
    pub fn get<S: AsRef<str>>(&self, path: &[S]) -> Result<&Schema, TypeMismatch> {
        let mut current = self;
        for (depth, step) in path.iter().enumerate() {
            current = match current {
                Schema::Undefined => return Ok(current),
                Schema::Struct(fields) => fields
                    .get(step.as_ref())
                    .ok_or_else(|| TypeMismatch::at(&path[..=depth], Mismatch::MissingField))?,
                other => {
                    return Err(TypeMismatch::at(
                        &path[..depth],
                        Mismatch::Kind {
                            expected: "struct",
                            found: other.kind_name(),
                        },
                    ))
                }
            };
        }
        Ok(current)
    }

    /// Checks that `value` could stand in for a value of this schema.
    ///
    /// Struct values may omit fields but may not add any.
    pub fn assert_assignable(&self, value: &Value) -> Result<(), TypeMismatch> {
        let kind_error = || {
            TypeMismatch::new(Mismatch::Kind {
                expected: self.kind_name(),
                found: value.kind_name(),
            })
        };
        match (self, value) {
            (_, Value::Undefined) | (Schema::Undefined, _) => Ok(()),
            (Schema::Boolean, Value::Bool(_)) => Ok(()),
            (Schema::String, Value::String(_)) => Ok(()),
            (Schema::Double, Value::Number(_)) => Ok(()),
            (Schema::Integer, Value::Number(n)) if is_integral(*n) => Ok(()),
            (Schema::Struct(fields), Value::Struct(values)) => {
                for (key, field_value) in values {
                    let field = fields
                        .get(key)
                        .ok_or_else(|| TypeMismatch::at(&[key], Mismatch::MissingField))?;
                    field
                        .assert_assignable(field_value)
                        .map_err(|e| e.prefixed(&[key]))?;
                }
                Ok(())
            }
            (Schema::List(element), Value::List(items)) => {
                for (index, item) in items.iter().enumerate() {
                    element
                        .assert_assignable(item)
                        .map_err(|e| e.prefixed(&[index.to_string()]))?;
                }
                Ok(())
            }
            _ => Err(kind_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button_schema() -> Schema {
        Schema::from_wire(&json!({
            "schema": {
                "enabled": { "boolSchema": {} },
                "size": { "intSchema": {} },
                "style": { "structSchema": { "schema": { "color": { "stringSchema": {} } } } },
                "weights": { "listSchema": { "elementSchema": { "doubleSchema": {} } } }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_from_wire() {
        let schema = button_schema();
        assert_eq!(schema.get(&["enabled"]).unwrap(), &Schema::Boolean);
        assert_eq!(schema.get(&["style", "color"]).unwrap(), &Schema::String);
        assert_eq!(
            schema.get(&["weights"]).unwrap(),
            &Schema::List(Box::new(Schema::Double))
        );
    }

    #[test]
    fn test_get_reports_missing_path() {
        let err = button_schema().get(&["style", "border"]).unwrap_err();
        assert_eq!(err.path_string(), "style.border");
        assert_eq!(err.kind, Mismatch::MissingField);

        let err = button_schema().get(&["enabled", "x"]).unwrap_err();
        assert_eq!(err.path_string(), "enabled");
    }

    #[test]
    fn test_partial_struct_default_is_assignable() {
        let default = Value::from(json!({ "enabled": true, "style": {} }));
        assert!(button_schema().assert_assignable(&default).is_ok());
    }

    #[test]
    fn test_unknown_field_is_not_assignable() {
        let default = Value::from(json!({ "style": { "font": "mono" } }));
        let err = button_schema().assert_assignable(&default).unwrap_err();
        assert_eq!(err.path_string(), "style.font");
    }

    #[test]
    fn test_integer_requires_integral_number() {
        assert!(Schema::Integer.assert_assignable(&Value::Number(2.0)).is_ok());
        assert!(Schema::Integer.assert_assignable(&Value::Number(2.5)).is_err());
        assert!(Schema::Double.assert_assignable(&Value::Number(2.5)).is_ok());
    }

    #[test]
    fn test_list_elements_checked() {
        let default = Value::from(json!({ "weights": [1.0, "heavy"] }));
        let err = button_schema().assert_assignable(&default).unwrap_err();
        assert_eq!(err.path_string(), "weights.1");
    }

    #[test]
    fn test_wire_round_trip() {
        let schema = button_schema();
        assert_eq!(Schema::from_wire(&schema.to_wire()).unwrap(), schema);
    }
}
