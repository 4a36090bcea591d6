pub mod allocation;
pub mod audit;
pub mod auditor;
pub mod error;
pub mod resolver;

pub use allocation::{AllocationService, BulkItem, BulkItemError, BulkOutcome};
pub use audit::{AuditError, AuditSink, JsonlAuditSink, NullAuditSink, RecordingAuditSink};
pub use auditor::{
    AuditReport, AuditorConfig, AuditorError, BoxAudit, BoxRepair, ConsistencyAuditor,
    DuplicateLabel, Geometry, LabelSpelling, RepairReport, RepairStep, DEFAULT_MAX_FILL_CELLS,
    DEFAULT_MISSING_CELLS_CAP,
};
pub use error::{AllocationError, Entity, ErrorKind};
pub use resolver::{
    Candidate, DuplicateResolver, GroupDecision, Reallocation, ResolveFailure, ResolverConfig,
    ResolverError, ResolverReport,
};
