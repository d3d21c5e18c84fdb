//! Source field to target column mapping.
//!
//! The target table layout is fixed at startup: a key column, a set of mapped
//! attribute columns, and the bookkeeping columns every target row carries
//! (`last_applied_position`, `deleted_at`, `synced_at`). Table and column names
//! are validated here once so the store can splice them into SQL.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::str::FromStr;
use thiserror::Error;

/// Bookkeeping columns owned by the pipeline; never mappable from source data.
pub const RESERVED_COLUMNS: [&str; 3] = ["last_applied_position", "deleted_at", "synced_at"];

const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("column '{0}' is reserved")]
    ReservedColumn(String),

    #[error("column '{0}' is mapped more than once")]
    DuplicateColumn(String),

    #[error("unknown column kind '{0}'")]
    UnknownKind(String),

    #[error("invalid column mapping entry '{0}' (expected sourceField:column:kind)")]
    InvalidMapping(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("field '{field}' cannot be stored as {kind}: {reason}")]
pub struct CoercionError {
    pub field: String,
    pub kind: ColumnKind,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Json => "json",
        }
    }
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Ok(ColumnKind::Text),
            "integer" | "int" | "bigint" => Ok(ColumnKind::Integer),
            "float" | "double" | "numeric" => Ok(ColumnKind::Float),
            "boolean" | "bool" => Ok(ColumnKind::Boolean),
            "timestamp" | "timestamptz" => Ok(ColumnKind::Timestamp),
            "json" | "jsonb" => Ok(ColumnKind::Json),
            other => Err(SchemaError::UnknownKind(other.to_string())),
        }
    }
}

/// A typed value ready to be bound to a target column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// SQL NULL, typed so the store can bind it to the right column type
    Null(ColumnKind),
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source_field: String,
    pub column: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSchema {
    pub table: String,
    pub key_column: String,
    /// Field of the before/after image holding the entity identifier
    pub key_field: String,
    /// When set, records whose `source.table` differs are dead-lettered
    pub expected_source_table: Option<String>,
    pub columns: Vec<ColumnMapping>,
}

impl TargetSchema {
    pub fn new(table: &str, key_column: &str, key_field: &str) -> Result<Self, SchemaError> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;
        if RESERVED_COLUMNS.contains(&key_column) {
            return Err(SchemaError::ReservedColumn(key_column.to_string()));
        }

        Ok(Self {
            table: table.to_string(),
            key_column: key_column.to_string(),
            key_field: key_field.to_string(),
            expected_source_table: None,
            columns: Vec::new(),
        })
    }

    pub fn with_column(
        mut self,
        source_field: &str,
        column: &str,
        kind: ColumnKind,
    ) -> Result<Self, SchemaError> {
        validate_identifier(column)?;
        if RESERVED_COLUMNS.contains(&column) || column == self.key_column {
            return Err(SchemaError::ReservedColumn(column.to_string()));
        }
        if self.columns.iter().any(|c| c.column == column) {
            return Err(SchemaError::DuplicateColumn(column.to_string()));
        }

        self.columns.push(ColumnMapping {
            source_field: source_field.to_string(),
            column: column.to_string(),
            kind,
        });
        Ok(self)
    }

    pub fn with_expected_source_table(mut self, table: Option<String>) -> Self {
        self.expected_source_table = table.filter(|t| !t.trim().is_empty());
        self
    }

    /// Replace the column set with a mapping parsed from
    /// `sourceField:column:kind,sourceField:column:kind,...`.
    pub fn with_mapping_spec(mut self, spec: &str) -> Result<Self, SchemaError> {
        self.columns.clear();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [source, column, kind] = parts.as_slice() else {
                return Err(SchemaError::InvalidMapping(entry.to_string()));
            };
            if source.is_empty() {
                return Err(SchemaError::InvalidMapping(entry.to_string()));
            }
            self = self.with_column(source, column, kind.parse()?)?;
        }
        Ok(self)
    }

    /// The shipped `properties` mapping (Debezium camelCase fields from the
    /// appraisal source system).
    pub fn properties_default() -> Result<Self, SchemaError> {
        Self::new("properties", "property_id", "id")?
            .with_column("geoId", "geo_id", ColumnKind::Text)?
            .with_column("situsAddr", "situs_address", ColumnKind::Text)?
            .with_column("ownerName", "owner_name", ColumnKind::Text)?
            .with_column("propType", "property_type", ColumnKind::Text)?
            .with_column("landValue", "land_value", ColumnKind::Float)?
            .with_column("improvementValue", "improvement_value", ColumnKind::Float)?
            .with_column("marketValue", "market_value", ColumnKind::Float)?
            .with_column("assessedValue", "assessed_value", ColumnKind::Float)?
            .with_column("yearBuilt", "year_built", ColumnKind::Integer)?
            .with_column("acreage", "acreage", ColumnKind::Float)?
            .with_column("isExempt", "is_exempt", ColumnKind::Boolean)?
            .with_column("lastSaleDate", "last_sale_date", ColumnKind::Timestamp)?
            .with_column("attributes", "attributes", ColumnKind::Json)
    }

    /// Map an after-image onto target columns.
    ///
    /// Only mapped fields present in the image are returned; unmapped fields are
    /// ignored and absent ones leave the stored column untouched.
    pub fn map_image(
        &self,
        image: &Map<String, Value>,
    ) -> Result<Vec<(String, ColumnValue)>, CoercionError> {
        self.columns
            .iter()
            .filter_map(|mapping| {
                image
                    .get(&mapping.source_field)
                    .map(|value| coerce(&mapping.source_field, value, mapping.kind))
                    .map(|coerced| coerced.map(|v| (mapping.column.clone(), v)))
            })
            .collect()
    }
}

/// Coerce a JSON value to the column kind.
pub fn coerce(field: &str, value: &Value, kind: ColumnKind) -> Result<ColumnValue, CoercionError> {
    let fail = |reason: &str| CoercionError {
        field: field.to_string(),
        kind,
        reason: reason.to_string(),
    };

    if value.is_null() {
        return Ok(ColumnValue::Null(kind));
    }

    match kind {
        ColumnKind::Text => match value {
            Value::String(s) => Ok(ColumnValue::Text(s.clone())),
            Value::Number(n) => Ok(ColumnValue::Text(n.to_string())),
            Value::Bool(b) => Ok(ColumnValue::Text(b.to_string())),
            _ => Err(fail("nested value")),
        },
        ColumnKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(ColumnValue::Integer)
                .ok_or_else(|| fail("not an integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(ColumnValue::Integer)
                .map_err(|e| fail(&e.to_string())),
            _ => Err(fail("not a number")),
        },
        ColumnKind::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(ColumnValue::Float)
                .ok_or_else(|| fail("not a number")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(ColumnValue::Float)
                .ok_or_else(|| fail("not a finite number")),
            _ => Err(fail("not a number")),
        },
        ColumnKind::Boolean => match value {
            Value::Bool(b) => Ok(ColumnValue::Boolean(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(ColumnValue::Boolean(false)),
                Some(1) => Ok(ColumnValue::Boolean(true)),
                _ => Err(fail("expected 0 or 1")),
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" => Ok(ColumnValue::Boolean(true)),
                "false" | "f" | "0" | "no" | "n" => Ok(ColumnValue::Boolean(false)),
                _ => Err(fail("unrecognized boolean")),
            },
            _ => Err(fail("not a boolean")),
        },
        ColumnKind::Timestamp => match value {
            Value::String(s) => parse_datetime_best_effort(s)
                .map(ColumnValue::Timestamp)
                .ok_or_else(|| fail("unrecognized timestamp format")),
            Value::Number(n) => n
                .as_i64()
                .and_then(epoch_to_datetime)
                .map(ColumnValue::Timestamp)
                .ok_or_else(|| fail("epoch value out of range")),
            _ => Err(fail("not a timestamp")),
        },
        ColumnKind::Json => Ok(ColumnValue::Json(value.clone())),
    }
}

/// Debezium encodes timestamps as epoch millis (`Timestamp`) or epoch micros
/// (`MicroTimestamp`); micros are told apart by magnitude.
fn epoch_to_datetime(value: i64) -> Option<DateTime<Utc>> {
    const MICROS_THRESHOLD: i64 = 100_000_000_000_000;
    if value.abs() >= MICROS_THRESHOLD {
        Utc.timestamp_opt(
            value.div_euclid(1_000_000),
            (value.rem_euclid(1_000_000) * 1_000) as u32,
        )
        .single()
    } else {
        Utc.timestamp_millis_opt(value).single()
    }
}

fn parse_datetime_best_effort(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Lowercase SQL identifier: `[a-z_][a-z0-9_]*`, at most 63 bytes.
pub fn validate_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use serde_json::json;

    fn image(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_properties_default_is_valid() {
        let schema = TargetSchema::properties_default().unwrap();
        assert_eq!(schema.table, "properties");
        assert_eq!(schema.key_column, "property_id");
        assert_eq!(schema.key_field, "id");
        assert!(schema.columns.iter().any(|c| c.column == "situs_address"));
    }

    #[test]
    fn test_map_image_ignores_unmapped_and_absent_fields() {
        let schema = TargetSchema::properties_default().unwrap();
        let mapped = schema
            .map_image(&image(json!({
                "id": "P-1",
                "ownerName": "Ada Lovelace",
                "yearBuilt": "1912",
                "internalFlag": true
            })))
            .unwrap();

        assert_eq!(
            mapped,
            vec![
                ("owner_name".to_string(), ColumnValue::Text("Ada Lovelace".into())),
                ("year_built".to_string(), ColumnValue::Integer(1912)),
            ]
        );
    }

    #[test]
    fn test_map_image_coercion_failure() {
        let schema = TargetSchema::properties_default().unwrap();
        let err = schema
            .map_image(&image(json!({ "yearBuilt": "nineteen-twelve" })))
            .unwrap_err();
        assert_eq!(err.field, "yearBuilt");
        assert_eq!(err.kind, ColumnKind::Integer);
    }

    #[test]
    fn test_null_keeps_column_kind() {
        assert_eq!(
            coerce("landValue", &Value::Null, ColumnKind::Float).unwrap(),
            ColumnValue::Null(ColumnKind::Float)
        );
    }

    #[test]
    fn test_coerce_timestamps() {
        let rfc = coerce("d", &json!("2024-03-01T12:00:00Z"), ColumnKind::Timestamp).unwrap();
        let millis = coerce("d", &json!(1_709_294_400_000_i64), ColumnKind::Timestamp).unwrap();
        let micros = coerce("d", &json!(1_709_294_400_000_000_i64), ColumnKind::Timestamp).unwrap();
        assert_eq!(rfc, millis);
        assert_eq!(millis, micros);

        match coerce("d", &json!("2024-03-01"), ColumnKind::Timestamp).unwrap() {
            ColumnValue::Timestamp(dt) => assert_eq!(dt.day(), 1),
            other => panic!("unexpected value {:?}", other),
        }
        assert!(coerce("d", &json!("yesterday"), ColumnKind::Timestamp).is_err());
    }

    #[test]
    fn test_coerce_booleans_and_numbers() {
        assert_eq!(
            coerce("b", &json!("t"), ColumnKind::Boolean).unwrap(),
            ColumnValue::Boolean(true)
        );
        assert_eq!(
            coerce("b", &json!(0), ColumnKind::Boolean).unwrap(),
            ColumnValue::Boolean(false)
        );
        assert!(coerce("b", &json!(2), ColumnKind::Boolean).is_err());
        assert_eq!(
            coerce("i", &json!(42.0), ColumnKind::Integer).unwrap(),
            ColumnValue::Integer(42)
        );
        assert!(coerce("i", &json!(4.5), ColumnKind::Integer).is_err());
        assert!(coerce("f", &json!("NaN"), ColumnKind::Float).is_err());
        assert!(coerce("t", &json!({"a": 1}), ColumnKind::Text).is_err());
    }

    #[test]
    fn test_mapping_spec() {
        let schema = TargetSchema::new("parcels", "parcel_id", "parcelId")
            .unwrap()
            .with_mapping_spec("ownerName:owner_name:text, acres:acreage:float")
            .unwrap();
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[1].kind, ColumnKind::Float);

        assert!(matches!(
            schema.clone().with_mapping_spec("ownerName:owner_name"),
            Err(SchemaError::InvalidMapping(_))
        ));
        assert!(matches!(
            schema.clone().with_mapping_spec("x:deleted_at:timestamp"),
            Err(SchemaError::ReservedColumn(_))
        ));
        assert!(matches!(
            schema.with_mapping_spec("a:col:text,b:col:text"),
            Err(SchemaError::DuplicateColumn(_))
        ));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("properties").is_ok());
        assert!(validate_identifier("_p2").is_ok());
        assert!(validate_identifier("Properties").is_err());
        assert!(validate_identifier("props; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
        assert!(TargetSchema::new("properties", "deleted_at", "id").is_err());
    }
}
