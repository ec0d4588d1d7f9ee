//! Field-level merge of incoming mirror documents
//!
//! A field is overwritten only when the document carries a non-null value
//! that differs from the local one. Fields the document omits, or sends as
//! null, are left alone.

use serde_json::Value;
use thiserror::Error;

use super::remote::Fields;

/// Why a document could not be merged
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` should be {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
    #[error("unknown reference in `{field}`: {value}")]
    UnknownReference { field: &'static str, value: String },
}

/// How to read and write one mergeable field of `R`
pub enum FieldAccess<R> {
    Text {
        get: fn(&R) -> Option<&str>,
        set: fn(&mut R, String),
    },
    Flag {
        get: fn(&R) -> bool,
        set: fn(&mut R, bool),
    },
    Count {
        get: fn(&R) -> u32,
        set: fn(&mut R, u32),
    },
    Timestamp {
        get: fn(&R) -> Option<i64>,
        set: fn(&mut R, i64),
    },
}

/// A document key paired with its accessors
pub struct MergeField<R> {
    pub key: &'static str,
    pub access: FieldAccess<R>,
}

impl<R> MergeField<R> {
    pub const fn text(
        key: &'static str,
        get: fn(&R) -> Option<&str>,
        set: fn(&mut R, String),
    ) -> Self {
        Self {
            key,
            access: FieldAccess::Text { get, set },
        }
    }

    pub const fn flag(key: &'static str, get: fn(&R) -> bool, set: fn(&mut R, bool)) -> Self {
        Self {
            key,
            access: FieldAccess::Flag { get, set },
        }
    }

    pub const fn count(key: &'static str, get: fn(&R) -> u32, set: fn(&mut R, u32)) -> Self {
        Self {
            key,
            access: FieldAccess::Count { get, set },
        }
    }

    pub const fn timestamp(
        key: &'static str,
        get: fn(&R) -> Option<i64>,
        set: fn(&mut R, i64),
    ) -> Self {
        Self {
            key,
            access: FieldAccess::Timestamp { get, set },
        }
    }
}

/// Merge `fields` into `record`; returns the keys that changed.
///
/// Every present field is type-checked before anything is written, so a
/// malformed document leaves `record` untouched.
pub fn merge_fields<R>(
    record: &mut R,
    fields: &Fields,
    accessors: &[MergeField<R>],
) -> Result<Vec<&'static str>, MergeError> {
    let mut updates = Vec::new();
    for field in accessors {
        let Some(value) = fields.get(field.key).filter(|value| !value.is_null()) else {
            continue;
        };
        updates.push((field, parse(field.key, &field.access, value)?));
    }

    let mut changed = Vec::new();
    for (field, incoming) in updates {
        if apply(record, &field.access, incoming) {
            changed.push(field.key);
        }
    }
    Ok(changed)
}

enum Incoming {
    Text(String),
    Flag(bool),
    Count(u32),
    Timestamp(i64),
}

fn parse<R>(
    key: &'static str,
    access: &FieldAccess<R>,
    value: &Value,
) -> Result<Incoming, MergeError> {
    let mismatch = |expected| MergeError::TypeMismatch {
        field: key,
        expected,
    };
    match access {
        FieldAccess::Text { .. } => value
            .as_str()
            .map(|text| Incoming::Text(text.to_string()))
            .ok_or_else(|| mismatch("a string")),
        FieldAccess::Flag { .. } => value
            .as_bool()
            .map(Incoming::Flag)
            .ok_or_else(|| mismatch("a boolean")),
        FieldAccess::Count { .. } => value
            .as_u64()
            .and_then(|count| u32::try_from(count).ok())
            .map(Incoming::Count)
            .ok_or_else(|| mismatch("a non-negative integer")),
        FieldAccess::Timestamp { .. } => value
            .as_i64()
            .map(Incoming::Timestamp)
            .ok_or_else(|| mismatch("an integer timestamp")),
    }
}

fn apply<R>(record: &mut R, access: &FieldAccess<R>, incoming: Incoming) -> bool {
    match (access, incoming) {
        (FieldAccess::Text { get, set }, Incoming::Text(value)) => {
            if get(record) == Some(value.as_str()) {
                return false;
            }
            set(record, value);
        }
        (FieldAccess::Flag { get, set }, Incoming::Flag(value)) => {
            if get(record) == value {
                return false;
            }
            set(record, value);
        }
        (FieldAccess::Count { get, set }, Incoming::Count(value)) => {
            if get(record) == value {
                return false;
            }
            set(record, value);
        }
        (FieldAccess::Timestamp { get, set }, Incoming::Timestamp(value)) => {
            if get(record) == Some(value) {
                return false;
            }
            set(record, value);
        }
        _ => return false,
    }
    true
}

/// Required string field
pub fn required_str(fields: &Fields, key: &'static str) -> Result<String, MergeError> {
    match fields.get(key) {
        None | Some(Value::Null) => Err(MergeError::MissingField(key)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(MergeError::TypeMismatch {
            field: key,
            expected: "a string",
        }),
    }
}

/// Optional string field; present non-strings are an error
pub fn optional_str(fields: &Fields, key: &'static str) -> Result<Option<String>, MergeError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(MergeError::TypeMismatch {
            field: key,
            expected: "a string",
        }),
    }
}

/// Optional boolean field
pub fn optional_bool(fields: &Fields, key: &'static str) -> Result<Option<bool>, MergeError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(MergeError::TypeMismatch {
            field: key,
            expected: "a boolean",
        }),
    }
}

/// Optional integer field
pub fn optional_i64(fields: &Fields, key: &'static str) -> Result<Option<i64>, MergeError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or(MergeError::TypeMismatch {
            field: key,
            expected: "an integer",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Profile {
        name: Option<String>,
        phone: Option<String>,
        active: bool,
        failures: u32,
        seen_at: Option<i64>,
    }

    fn profile_fields() -> Vec<MergeField<Profile>> {
        vec![
            MergeField::<Profile>::text("name", |p| p.name.as_deref(), |p, v| p.name = Some(v)),
            MergeField::<Profile>::text("phone", |p| p.phone.as_deref(), |p, v| p.phone = Some(v)),
            MergeField::<Profile>::flag("active", |p| p.active, |p, v| p.active = v),
            MergeField::<Profile>::count("failures", |p| p.failures, |p, v| p.failures = v),
            MergeField::<Profile>::timestamp("seenAt", |p| p.seen_at, |p, v| p.seen_at = Some(v)),
        ]
    }

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn only_differing_fields_change() {
        let mut profile = Profile {
            name: Some("Alice".to_string()),
            active: true,
            ..Profile::default()
        };

        let changed = merge_fields(
            &mut profile,
            &fields(json!({"name": "Alice", "active": true, "failures": 2})),
            &profile_fields(),
        )
        .unwrap();

        assert_eq!(changed, vec!["failures"]);
        assert_eq!(profile.failures, 2);
    }

    #[test]
    fn missing_and_null_fields_never_clear_local_values() {
        let mut profile = Profile {
            phone: Some("+15550100".to_string()),
            seen_at: Some(5),
            ..Profile::default()
        };

        let changed = merge_fields(
            &mut profile,
            &fields(json!({"name": "Alice", "seenAt": null})),
            &profile_fields(),
        )
        .unwrap();

        assert_eq!(changed, vec!["name"]);
        assert_eq!(profile.phone.as_deref(), Some("+15550100"));
        assert_eq!(profile.seen_at, Some(5));
    }

    #[test]
    fn type_mismatch_leaves_record_untouched() {
        let mut profile = Profile::default();
        let before = profile.clone();

        let error = merge_fields(
            &mut profile,
            &fields(json!({"name": "Alice", "failures": "three"})),
            &profile_fields(),
        )
        .unwrap_err();

        assert_eq!(
            error,
            MergeError::TypeMismatch {
                field: "failures",
                expected: "a non-negative integer"
            }
        );
        assert_eq!(profile, before);
    }

    #[test]
    fn required_str_reports_missing_key() {
        let document = fields(json!({"email": null}));
        assert_eq!(
            required_str(&document, "email"),
            Err(MergeError::MissingField("email"))
        );
    }
}
