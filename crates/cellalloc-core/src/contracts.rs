use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type SampleId = i64;

#[derive(Debug, Error)]
pub enum CoreContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("unknown {field} value: {value}")]
    UnknownVariant { field: &'static str, value: String },
}

/// Where a sample sits: the legacy primary reference or an allocation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub sample_id: SampleId,
    pub box_id: String,
    pub cell_id: String,
    pub is_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Sample,
    StorageBox,
    StorageCell,
    Allocation,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Sample => "sample",
            ContentType::StorageBox => "storage_box",
            ContentType::StorageCell => "storage_cell",
            ContentType::Allocation => "allocation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    BulkUpdate,
    BulkDelete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::BulkUpdate => "BULK_UPDATE",
            AuditAction::BulkDelete => "BULK_DELETE",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry, emitted once per successful mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub content_type: ContentType,
    pub object_id: String,
    pub action: AuditAction,
    pub old_values: Value,
    pub new_values: Value,
    pub comment: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(content_type: ContentType, object_id: impl ToString, action: AuditAction) -> Self {
        Self {
            content_type,
            object_id: object_id.to_string(),
            action,
            old_values: Value::Null,
            new_values: Value::Null,
            comment: String::new(),
            batch_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn old_values(mut self, values: Value) -> Self {
        self.old_values = values;
        self
    }

    pub fn new_values(mut self, values: Value) -> Self {
        self.new_values = values;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn batch(mut self, batch_id: Option<&str>) -> Self {
        self.batch_id = batch_id.map(str::to_string);
        self
    }
}

pub fn new_batch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Winner ordering used by the duplicate resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prefer {
    #[default]
    WithStrain,
    CreatedAt,
    UpdatedAt,
}

impl Prefer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prefer::WithStrain => "with_strain",
            Prefer::CreatedAt => "created_at",
            Prefer::UpdatedAt => "updated_at",
        }
    }
}

impl FromStr for Prefer {
    type Err = CoreContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "with_strain" => Ok(Prefer::WithStrain),
            "created_at" => Ok(Prefer::CreatedAt),
            "updated_at" => Ok(Prefer::UpdatedAt),
            other => Err(CoreContractError::UnknownVariant {
                field: "prefer",
                value: other.to_string(),
            }),
        }
    }
}

/// Where the resolver may look for a free cell once the loser's own box is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    #[default]
    None,
    AnyBox,
}

impl Fallback {
    pub fn as_str(&self) -> &'static str {
        match self {
            Fallback::None => "none",
            Fallback::AnyBox => "any_box",
        }
    }
}

impl FromStr for Fallback {
    type Err = CoreContractError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(Fallback::None),
            "any_box" => Ok(Fallback::AnyBox),
            other => Err(CoreContractError::UnknownVariant {
                field: "fallback",
                value: other.to_string(),
            }),
        }
    }
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// JSON with object keys sorted recursively, so equal values render identically.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CoreContractError> {
    let json = serde_json::to_value(value)
        .map_err(|err| CoreContractError::Serialization(err.to_string()))?;
    serde_json::to_string(&sort_keys(json))
        .map_err(|err| CoreContractError::Serialization(err.to_string()))
}

/// Digest of a resolver plan or any other payload operators compare across runs.
///
/// Two payloads hash equal exactly when they hold the same values: object key
/// order is ignored, array order is not. A dry run and the execute run built
/// from the same snapshot therefore share a `plan_digest`, while any change in
/// a winner, a loser or the order groups are processed in changes it.
pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<String, CoreContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let sorted = object
                .into_iter()
                .map(|(key, value)| (key, sort_keys(value)))
                .collect::<BTreeMap<_, _>>();
            Value::Object(sorted.into_iter().collect::<Map<_, _>>())
        }
        Value::Array(values) => Value::Array(values.into_iter().map(sort_keys).collect()),
        scalar => scalar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audit_action_serializes_in_upper_snake_case() {
        let rendered = serde_json::to_string(&AuditAction::BulkDelete).expect("serialize");
        assert_eq!(rendered, "\"BULK_DELETE\"");
        assert_eq!(AuditAction::Update.to_string(), "UPDATE");
    }

    #[test]
    fn change_record_builder_sets_batch_and_snapshots() {
        let record = ChangeRecord::new(ContentType::Sample, 20, AuditAction::Update)
            .old_values(json!({"primary": "B2"}))
            .new_values(json!({"primary": null}))
            .comment("duplicate resolved")
            .batch(Some("batch-1"));

        assert_eq!(record.object_id, "20");
        assert_eq!(record.content_type.as_str(), "sample");
        assert_eq!(record.batch_id.as_deref(), Some("batch-1"));
        assert_eq!(record.old_values["primary"], "B2");
        assert!(record.new_values["primary"].is_null());
    }

    #[test]
    fn prefer_and_fallback_parse_cli_spellings() {
        assert_eq!("with_strain".parse::<Prefer>().expect("parse"), Prefer::WithStrain);
        assert_eq!("updated_at".parse::<Prefer>().expect("parse"), Prefer::UpdatedAt);
        assert_eq!("any_box".parse::<Fallback>().expect("parse"), Fallback::AnyBox);
        assert!("sometimes".parse::<Fallback>().is_err());
    }

    #[test]
    fn canonical_hash_ignores_key_order() {
        let left = json!({"z": 1, "a": {"b": 2, "a": 1}});
        let right = json!({"a": {"a": 1, "b": 2}, "z": 1});
        assert_eq!(
            canonical_payload_hash(&left).expect("hash"),
            canonical_payload_hash(&right).expect("hash")
        );
        let rendered = canonical_json(&left).expect("canonical");
        assert_eq!(rendered, r#"{"a":{"a":1,"b":2},"z":1}"#);
        assert_eq!(
            canonical_payload_hash(&left).expect("hash"),
            sha256_hex(rendered.as_bytes())
        );
    }

    #[test]
    fn canonical_hash_keeps_array_order() {
        let plan = json!([{"cell_id": "A1", "winner": 1}, {"cell_id": "B1", "winner": 2}]);
        let reordered = json!([{"cell_id": "B1", "winner": 2}, {"cell_id": "A1", "winner": 1}]);
        assert_ne!(
            canonical_payload_hash(&plan).expect("hash"),
            canonical_payload_hash(&reordered).expect("hash")
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn batch_ids_are_unique() {
        assert_ne!(new_batch_id(), new_batch_id());
    }
}
