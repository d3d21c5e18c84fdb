use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// CDC operation types from Debezium
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CdcOperation {
    /// Insert operation (c = create)
    #[serde(rename = "c")]
    Insert,
    /// Update operation (u = update)
    #[serde(rename = "u")]
    Update,
    /// Delete operation (d = delete)
    #[serde(rename = "d")]
    Delete,
    /// Read operation (r = read, initial snapshot)
    #[serde(rename = "r")]
    Read,
}

/// Debezium change payload.
///
/// With `value.converter.schemas.enable = true` this arrives wrapped as
/// `{"schema": ..., "payload": {...}}`; otherwise it is the message body itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdcPayload {
    /// State before the change (null for Insert, populated for Update/Delete)
    #[serde(default)]
    pub before: Option<Value>,

    /// State after the change (populated for Insert/Update, null for Delete)
    #[serde(default)]
    pub after: Option<Value>,

    /// Source metadata (database, table, timestamp, etc.)
    #[serde(default)]
    pub source: CdcSource,

    /// Operation type (c/u/d/r)
    pub op: CdcOperation,

    /// Time the connector processed the event, milliseconds since epoch
    #[serde(default)]
    pub ts_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CdcSource {
    /// Connector type (e.g., "postgresql")
    #[serde(default)]
    pub connector: Option<String>,

    /// Logical name of the database server
    #[serde(default)]
    pub name: Option<String>,

    /// Commit timestamp in the source database, milliseconds
    #[serde(default)]
    pub ts_ms: Option<i64>,

    #[serde(default)]
    pub db: Option<String>,

    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub table: Option<String>,

    /// PostgreSQL log sequence number of the change
    #[serde(default)]
    pub lsn: Option<i64>,
}

/// Operation applied to the target row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Create => "create",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl From<CdcOperation> for ChangeOperation {
    fn from(op: CdcOperation) -> Self {
        match op {
            CdcOperation::Insert | CdcOperation::Read => ChangeOperation::Create,
            CdcOperation::Update => ChangeOperation::Update,
            CdcOperation::Delete => ChangeOperation::Delete,
        }
    }
}

/// A decoded change event, positioned within its partition.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub before_image: Option<Map<String, Value>>,
    pub after_image: Option<Map<String, Value>>,
    /// Broker offset within the partition; orders changes to the same entity
    pub position: i64,
    pub source: CdcSource,
    pub ts_ms: Option<i64>,
    /// True for initial-snapshot reads (`op = r`)
    pub snapshot: bool,
}

impl ChangeRecord {
    /// The image the applier writes from: `after` for Create/Update.
    pub fn image(&self) -> Option<&Map<String, Value>> {
        match self.operation {
            ChangeOperation::Create | ChangeOperation::Update => self.after_image.as_ref(),
            ChangeOperation::Delete => self.before_image.as_ref(),
        }
    }
}
