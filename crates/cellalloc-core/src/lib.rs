pub mod contracts;
pub mod label;

pub use contracts::{
    canonical_json, canonical_payload_hash, new_batch_id, sha256_hex, AuditAction, ChangeRecord,
    ContentType, CoreContractError, Fallback, Placement, Prefer, SampleId,
};
pub use label::{canonical_label, grid_labels, label_to_row, row_label, CellLabel, LabelError};
