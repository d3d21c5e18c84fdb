//! Debezium envelope decoding.
//!
//! Decoding never touches the store. Every failure here is permanent: the same
//! bytes will never decode differently, so the worker dead-letters them.

use serde_json::{Map, Value};
use thiserror::Error;

use super::models::{CdcOperation, CdcPayload, ChangeOperation, ChangeRecord};
use super::schema::TargetSchema;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    EmptyPayload,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("{operation} change is missing its '{image}' image")]
    MissingImage {
        operation: &'static str,
        image: &'static str,
    },

    #[error("'{0}' image is not a JSON object")]
    ImageNotObject(&'static str),

    #[error("missing entity id field '{0}'")]
    MissingEntityId(String),

    #[error("entity id field '{field}' has unsupported value {value}")]
    InvalidEntityId { field: String, value: String },

    #[error("unexpected source table '{found}' (expected '{expected}')")]
    UnexpectedTable { expected: String, found: String },
}

/// Turns raw message values into [`ChangeRecord`]s.
#[derive(Debug, Clone)]
pub struct ChangeDecoder {
    key_field: String,
    expected_table: Option<String>,
}

impl ChangeDecoder {
    pub fn new(key_field: impl Into<String>, expected_table: Option<String>) -> Self {
        Self {
            key_field: key_field.into(),
            expected_table,
        }
    }

    pub fn from_schema(schema: &TargetSchema) -> Self {
        Self::new(
            schema.key_field.clone(),
            schema.expected_source_table.clone(),
        )
    }

    pub fn decode(&self, payload: &[u8], position: i64) -> Result<ChangeRecord, DecodeError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::EmptyPayload);
        }

        let envelope: Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        // Schemas-enabled converters wrap the change in {"schema", "payload"}
        let body = match envelope {
            Value::Object(mut map) if map.get("payload").is_some_and(Value::is_object) => {
                map.remove("payload").unwrap_or(Value::Null)
            }
            other => other,
        };

        let payload: CdcPayload =
            serde_json::from_value(body).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if let Some(expected) = &self.expected_table {
            let found = payload.source.table.as_deref().unwrap_or_default();
            if found != expected {
                return Err(DecodeError::UnexpectedTable {
                    expected: expected.clone(),
                    found: found.to_string(),
                });
            }
        }

        let operation = ChangeOperation::from(payload.op);
        let before_image = into_object(payload.before, "before")?;
        let after_image = into_object(payload.after, "after")?;

        let keyed_image = match operation {
            ChangeOperation::Create | ChangeOperation::Update => {
                after_image.as_ref().ok_or(DecodeError::MissingImage {
                    operation: operation.as_str(),
                    image: "after",
                })?
            }
            ChangeOperation::Delete => before_image.as_ref().ok_or(DecodeError::MissingImage {
                operation: operation.as_str(),
                image: "before",
            })?,
        };

        let entity_id = self.extract_entity_id(keyed_image)?;

        Ok(ChangeRecord {
            entity_id,
            operation,
            before_image,
            after_image,
            position,
            source: payload.source,
            ts_ms: payload.ts_ms,
            snapshot: payload.op == CdcOperation::Read,
        })
    }

    fn extract_entity_id(&self, image: &Map<String, Value>) -> Result<String, DecodeError> {
        let invalid = |value: &Value| DecodeError::InvalidEntityId {
            field: self.key_field.clone(),
            value: value.to_string(),
        };

        match image.get(&self.key_field) {
            None | Some(Value::Null) => Err(DecodeError::MissingEntityId(self.key_field.clone())),
            // control characters are rejected by the store's text columns
            Some(Value::String(s)) if !s.trim().is_empty() && !s.chars().any(char::is_control) => {
                Ok(s.clone())
            }
            Some(value @ Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    Ok(i.to_string())
                } else if let Some(u) = n.as_u64() {
                    Ok(u.to_string())
                } else {
                    Err(invalid(value))
                }
            }
            Some(value) => Err(invalid(value)),
        }
    }
}

fn into_object(
    image: Option<Value>,
    name: &'static str,
) -> Result<Option<Map<String, Value>>, DecodeError> {
    match image {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(DecodeError::ImageNotObject(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> ChangeDecoder {
        ChangeDecoder::new("id", None)
    }

    fn bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_decode_bare_update() {
        let record = decoder()
            .decode(
                &bytes(json!({
                    "before": {"id": "P-1", "ownerName": "Old"},
                    "after": {"id": "P-1", "ownerName": "New"},
                    "source": {"connector": "postgresql", "table": "property", "ts_ms": 1700000000000_i64, "lsn": 42},
                    "op": "u",
                    "ts_ms": 1700000000100_i64,
                    "transaction": null
                })),
                7,
            )
            .unwrap();

        assert_eq!(record.entity_id, "P-1");
        assert_eq!(record.operation, ChangeOperation::Update);
        assert_eq!(record.position, 7);
        assert_eq!(record.source.lsn, Some(42));
        assert_eq!(record.ts_ms, Some(1700000000100));
        assert_eq!(record.image().unwrap()["ownerName"], json!("New"));
        assert!(!record.snapshot);
    }

    #[test]
    fn test_decode_schema_wrapped_snapshot_read() {
        let record = decoder()
            .decode(
                &bytes(json!({
                    "schema": {"type": "struct"},
                    "payload": {
                        "before": null,
                        "after": {"id": 1001, "geoId": "G-9"},
                        "source": {"table": "property"},
                        "op": "r"
                    }
                })),
                0,
            )
            .unwrap();

        assert_eq!(record.entity_id, "1001");
        assert_eq!(record.operation, ChangeOperation::Create);
        assert!(record.snapshot);
    }

    #[test]
    fn test_decode_delete_uses_before_image() {
        let record = decoder()
            .decode(
                &bytes(json!({"before": {"id": "P-2"}, "after": null, "op": "d"})),
                3,
            )
            .unwrap();
        assert_eq!(record.operation, ChangeOperation::Delete);
        assert_eq!(record.entity_id, "P-2");
    }

    #[test]
    fn test_decode_failures() {
        let d = decoder();

        assert_eq!(d.decode(b"", 0), Err(DecodeError::EmptyPayload));
        assert!(matches!(d.decode(b"{not json", 0), Err(DecodeError::Malformed(_))));
        assert!(matches!(
            d.decode(&bytes(json!({"after": {"id": "x"}, "op": "t"})), 0),
            Err(DecodeError::Malformed(_))
        ));
        assert_eq!(
            d.decode(&bytes(json!({"before": {"id": "x"}, "op": "u"})), 0),
            Err(DecodeError::MissingImage {
                operation: "update",
                image: "after"
            })
        );
        assert_eq!(
            d.decode(&bytes(json!({"after": {"name": "x"}, "op": "c"})), 0),
            Err(DecodeError::MissingEntityId("id".into()))
        );
        assert!(matches!(
            d.decode(&bytes(json!({"after": {"id": "  "}, "op": "c"})), 0),
            Err(DecodeError::InvalidEntityId { .. })
        ));
        assert!(matches!(
            d.decode(&bytes(json!({"after": {"id": "P-1\u{0}x"}, "op": "c"})), 0),
            Err(DecodeError::InvalidEntityId { .. })
        ));
        assert!(matches!(
            d.decode(&bytes(json!({"after": {"id": {"nested": 1}}, "op": "c"})), 0),
            Err(DecodeError::InvalidEntityId { .. })
        ));
        assert_eq!(
            d.decode(&bytes(json!({"after": [1, 2], "op": "c"})), 0),
            Err(DecodeError::ImageNotObject("after"))
        );
    }

    #[test]
    fn test_expected_source_table() {
        let d = ChangeDecoder::new("id", Some("property".into()));
        let ok = bytes(json!({"after": {"id": "a"}, "source": {"table": "property"}, "op": "c"}));
        let wrong = bytes(json!({"after": {"id": "a"}, "source": {"table": "owner"}, "op": "c"}));

        assert!(d.decode(&ok, 0).is_ok());
        assert_eq!(
            d.decode(&wrong, 1),
            Err(DecodeError::UnexpectedTable {
                expected: "property".into(),
                found: "owner".into()
            })
        );
    }
}
