use cellalloc_core::SampleId;
use cellalloc_storage::StorageError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Cell,
    Box,
    Sample,
    Allocation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Entity::Cell => "cell",
            Entity::Box => "box",
            Entity::Sample => "sample",
            Entity::Allocation => "allocation",
        })
    }
}

/// Stable, machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    CellOccupied,
    AllocationOccupied,
    LegacyCellOccupied,
    SampleAlreadyPlaced,
    SampleHasAllocations,
    CellAlreadyFree,
    AllocationNotFound,
    SaveConflict,
    LockTimeout,
    EmptyRequest,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::CellOccupied => "cell_occupied",
            ErrorKind::AllocationOccupied => "allocation_occupied",
            ErrorKind::LegacyCellOccupied => "legacy_cell_occupied",
            ErrorKind::SampleAlreadyPlaced => "sample_already_placed",
            ErrorKind::SampleHasAllocations => "sample_has_allocations",
            ErrorKind::CellAlreadyFree => "cell_already_free",
            ErrorKind::AllocationNotFound => "allocation_not_found",
            ErrorKind::SaveConflict => "save_conflict",
            ErrorKind::LockTimeout => "lock_timeout",
            ErrorKind::EmptyRequest => "empty_request",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: Entity, key: String },
    #[error("cell {box_id}/{cell_id} is occupied by sample {occupant}; run `{remediation}` first")]
    CellOccupied {
        box_id: String,
        cell_id: String,
        occupant: SampleId,
        remediation: String,
    },
    #[error(
        "cell {box_id}/{cell_id} is allocated to sample {occupant}; run `{remediation}` first"
    )]
    AllocationOccupied {
        box_id: String,
        cell_id: String,
        occupant: SampleId,
        remediation: String,
    },
    #[error(
        "cell {box_id}/{cell_id} is the primary location of sample {occupant}; run `{remediation}` first"
    )]
    LegacyCellOccupied {
        box_id: String,
        cell_id: String,
        occupant: SampleId,
        remediation: String,
    },
    #[error("sample {sample_id} is already placed at {box_id}/{cell_id}; run `{remediation}` first")]
    SampleAlreadyPlaced {
        sample_id: SampleId,
        box_id: String,
        cell_id: String,
        remediation: String,
    },
    #[error(
        "sample {sample_id} uses {count} allocation(s); remove them (e.g. `{remediation}`) before assigning a primary location"
    )]
    SampleHasAllocations {
        sample_id: SampleId,
        count: usize,
        remediation: String,
    },
    #[error("cell {box_id}/{cell_id} is already free")]
    CellAlreadyFree { box_id: String, cell_id: String },
    #[error("sample {sample_id} has no allocation at {box_id}/{cell_id}")]
    AllocationNotFound {
        sample_id: SampleId,
        box_id: String,
        cell_id: String,
    },
    #[error("save conflict: {message}")]
    SaveConflict { message: String },
    #[error("lock wait failed: {message}")]
    LockTimeout { message: String },
    #[error("request contains no items")]
    EmptyRequest,
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for AllocationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Constraint(message) => AllocationError::SaveConflict { message },
            StorageError::LockTimeout(message) => AllocationError::LockTimeout { message },
            other => AllocationError::Storage(other),
        }
    }
}

impl AllocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocationError::NotFound { .. } => ErrorKind::NotFound,
            AllocationError::CellOccupied { .. } => ErrorKind::CellOccupied,
            AllocationError::AllocationOccupied { .. } => ErrorKind::AllocationOccupied,
            AllocationError::LegacyCellOccupied { .. } => ErrorKind::LegacyCellOccupied,
            AllocationError::SampleAlreadyPlaced { .. } => ErrorKind::SampleAlreadyPlaced,
            AllocationError::SampleHasAllocations { .. } => ErrorKind::SampleHasAllocations,
            AllocationError::CellAlreadyFree { .. } => ErrorKind::CellAlreadyFree,
            AllocationError::AllocationNotFound { .. } => ErrorKind::AllocationNotFound,
            AllocationError::SaveConflict { .. } => ErrorKind::SaveConflict,
            AllocationError::LockTimeout { .. } => ErrorKind::LockTimeout,
            AllocationError::EmptyRequest => ErrorKind::EmptyRequest,
            AllocationError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// The call that clears the blocking relationship, when one exists.
    pub fn remediation(&self) -> Option<&str> {
        match self {
            AllocationError::CellOccupied { remediation, .. }
            | AllocationError::AllocationOccupied { remediation, .. }
            | AllocationError::LegacyCellOccupied { remediation, .. }
            | AllocationError::SampleAlreadyPlaced { remediation, .. }
            | AllocationError::SampleHasAllocations { remediation, .. } => Some(remediation),
            _ => None,
        }
    }

    pub fn occupant(&self) -> Option<SampleId> {
        match self {
            AllocationError::CellOccupied { occupant, .. }
            | AllocationError::AllocationOccupied { occupant, .. }
            | AllocationError::LegacyCellOccupied { occupant, .. } => Some(*occupant),
            _ => None,
        }
    }

    /// Whether the same request can succeed later, possibly after remediation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CellOccupied
                | ErrorKind::AllocationOccupied
                | ErrorKind::LegacyCellOccupied
                | ErrorKind::SampleAlreadyPlaced
                | ErrorKind::SampleHasAllocations
                | ErrorKind::SaveConflict
                | ErrorKind::LockTimeout
        )
    }

    pub(crate) fn not_found(entity: Entity, key: impl ToString) -> Self {
        AllocationError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

pub(crate) fn clear_call(box_id: &str, cell_id: &str) -> String {
    format!("cellalloc clear --box {box_id} --cell {cell_id}")
}

pub(crate) fn unallocate_call(sample_id: SampleId, box_id: &str, cell_id: &str) -> String {
    format!("cellalloc unallocate --sample {sample_id} --box {box_id} --cell {cell_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_distinct_kinds() {
        let conflict = AllocationError::from(StorageError::Constraint("UNIQUE failed".to_string()));
        assert_eq!(conflict.kind(), ErrorKind::SaveConflict);
        assert!(conflict.to_string().contains("UNIQUE failed"));

        let busy = AllocationError::from(StorageError::LockTimeout("database is locked".into()));
        assert_eq!(busy.kind(), ErrorKind::LockTimeout);
        assert!(busy.is_retryable());
    }

    #[test]
    fn occupied_errors_carry_occupant_and_remediation() {
        let err = AllocationError::CellOccupied {
            box_id: "BOX1".to_string(),
            cell_id: "A1".to_string(),
            occupant: 10,
            remediation: clear_call("BOX1", "A1"),
        };
        assert_eq!(err.occupant(), Some(10));
        assert_eq!(err.remediation(), Some("cellalloc clear --box BOX1 --cell A1"));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("sample 10"));

        let free = AllocationError::CellAlreadyFree {
            box_id: "BOX1".to_string(),
            cell_id: "A1".to_string(),
        };
        assert!(!free.is_retryable());
        assert_eq!(free.remediation(), None);
    }

    #[test]
    fn kinds_serialize_in_snake_case() {
        let rendered = serde_json::to_string(&ErrorKind::SampleHasAllocations).expect("json");
        assert_eq!(rendered, "\"sample_has_allocations\"");
        assert_eq!(ErrorKind::SampleHasAllocations.as_str(), "sample_has_allocations");
    }
}
