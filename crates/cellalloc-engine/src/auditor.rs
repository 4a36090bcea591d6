//! Consistency Auditor: box geometry inference, gap/duplicate reports and repair.

use crate::audit::{emit_change, AuditSink};
use cellalloc_core::{
    canonical_label, grid_labels, new_batch_id, AuditAction, CellLabel, ChangeRecord, ContentType,
};
use cellalloc_storage::{BoxRow, LockedTxn, OccupancyStore, StorageError};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_MISSING_CELLS_CAP: usize = 1000;
pub const DEFAULT_MAX_FILL_CELLS: u64 = 100_000;

const NO_GEOMETRY: &str = "no inferable geometry";

#[derive(Debug, Error)]
pub enum AuditorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditorConfig {
    pub missing_cells_cap: usize,
    /// Largest gap a repair fills in one box; a bigger one fails that box.
    pub max_fill_cells: u64,
    /// Restricts the run to these boxes; empty means every known box.
    pub boxes: Vec<String>,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            missing_cells_cap: DEFAULT_MISSING_CELLS_CAP,
            max_fill_cells: DEFAULT_MAX_FILL_CELLS,
            boxes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub rows: u32,
    pub cols: u32,
}

impl Geometry {
    fn covers(&self, other: &Geometry) -> bool {
        self.rows >= other.rows && self.cols >= other.cols
    }

    fn union(&self, other: &Geometry) -> Geometry {
        Geometry {
            rows: self.rows.max(other.rows),
            cols: self.cols.max(other.cols),
        }
    }

    fn cell_count(&self) -> u64 {
        u64::from(self.rows) * u64::from(self.cols)
    }
}

impl From<&BoxRow> for Geometry {
    fn from(row: &BoxRow) -> Self {
        Self {
            rows: row.rows,
            cols: row.cols,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateLabel {
    pub cell_id: String,
    pub rows: usize,
    /// Physical row ids, oldest first.
    pub row_ids: Vec<i64>,
}

/// A row whose label parses but is not spelled canonically (`a1`, `A01`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelSpelling {
    pub row_id: i64,
    pub cell_id: String,
    pub canonical: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoxAudit {
    pub box_id: String,
    pub cell_rows: usize,
    pub distinct_cells: usize,
    pub duplicates: Vec<DuplicateLabel>,
    pub invalid_labels: Vec<String>,
    pub noncanonical_labels: Vec<LabelSpelling>,
    pub inferred: Option<Geometry>,
    pub stored: Option<Geometry>,
    pub geometry_mismatch: bool,
    pub expected_cells: u64,
    pub missing_count: u64,
    pub missing_cells: Vec<String>,
    pub missing_truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    description: String,
}

impl BoxAudit {
    /// Stored geometry grown to cover every observed label.
    pub fn effective(&self) -> Option<Geometry> {
        match (self.stored, self.inferred) {
            (Some(stored), Some(inferred)) => Some(stored.union(&inferred)),
            (stored, inferred) => stored.or(inferred),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.error.is_none()
            && self.stored.is_some()
            && !self.geometry_mismatch
            && self.duplicates.is_empty()
            && self.noncanonical_labels.is_empty()
            && self.missing_count == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub boxes: Vec<BoxAudit>,
    pub total_cell_rows: usize,
    pub total_duplicate_rows: usize,
    pub total_missing: u64,
    pub boxes_without_metadata: usize,
    pub geometry_mismatches: usize,
    pub failed_boxes: Vec<String>,
}

impl AuditReport {
    pub fn has_failures(&self) -> bool {
        !self.failed_boxes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairStep {
    CreateBox {
        to: Geometry,
    },
    GrowBox {
        from: Geometry,
        to: Geometry,
    },
    RemoveDuplicates {
        label: String,
        kept_id: i64,
        removed_ids: Vec<i64>,
    },
    RenameLabel {
        row_id: i64,
        from: String,
        to: String,
    },
    FillMissing {
        count: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoxRepair {
    pub box_id: String,
    pub steps: Vec<RepairStep>,
    pub applied: bool,
    pub cells_created: u64,
    pub rows_removed: usize,
    pub labels_renamed: usize,
    pub references_moved: usize,
    pub allocations_dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub dry_run: bool,
    pub batch_id: String,
    pub boxes: Vec<BoxRepair>,
    pub failed_boxes: Vec<String>,
}

impl RepairReport {
    pub fn has_failures(&self) -> bool {
        !self.failed_boxes.is_empty()
    }
}

struct DuplicateMerge<'a> {
    box_id: &'a str,
    label: &'a str,
    kept_id: i64,
    removed_ids: &'a [i64],
}

impl DuplicateMerge<'_> {
    /// Folds the removed rows into the kept one, moving references first.
    fn apply(
        &self,
        txn: &mut LockedTxn<'_>,
        repair: &mut BoxRepair,
        records: &mut Vec<ChangeRecord>,
    ) -> Result<(), StorageError> {
        if txn.lock_cell_by_id(self.kept_id)?.is_none() {
            return Ok(());
        }
        let mut removed = Vec::new();
        for id in self.removed_ids {
            if txn.lock_cell_by_id(*id)?.is_none() {
                continue;
            }
            repair.references_moved += txn.repoint_primary_refs(*id, self.kept_id)?;
            if let Some(stranded) = txn.repoint_allocation(*id, self.kept_id)? {
                txn.delete_allocation(stranded.id)?;
                repair.allocations_dropped += 1;
                records.push(
                    ChangeRecord::new(ContentType::Allocation, stranded.id, AuditAction::Delete)
                        .old_values(json!({
                            "sample_id": stranded.sample_id,
                            "box_id": stranded.box_id,
                            "cell_id": stranded.cell_id,
                            "is_primary": stranded.is_primary,
                        }))
                        .comment("allocation on duplicate cell row collided with kept row"),
                );
            }
            txn.delete_cell_row(*id)?;
            removed.push(*id);
        }
        if removed.is_empty() {
            return Ok(());
        }
        repair.rows_removed += removed.len();
        records.push(
            ChangeRecord::new(
                ContentType::StorageCell,
                format!("{}/{}", self.box_id, self.label),
                AuditAction::BulkDelete,
            )
            .old_values(json!({ "removed_ids": removed }))
            .new_values(json!({ "kept_id": self.kept_id }))
            .comment("duplicate cell rows removed"),
        );
        Ok(())
    }
}

pub struct ConsistencyAuditor<A> {
    config: AuditorConfig,
    audit: A,
}

impl<A: AuditSink> ConsistencyAuditor<A> {
    pub fn new(config: AuditorConfig, audit: A) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &AuditorConfig {
        &self.config
    }

    /// Read-only report; takes no locks.
    pub fn report(&self, store: &OccupancyStore) -> Result<AuditReport, AuditorError> {
        let box_ids = if self.config.boxes.is_empty() {
            store.box_ids()?
        } else {
            self.config.boxes.clone()
        };

        let mut report = AuditReport::default();
        for box_id in box_ids {
            let audit = self.audit_box(store, &box_id)?;
            report.total_cell_rows += audit.cell_rows;
            report.total_duplicate_rows += audit
                .duplicates
                .iter()
                .map(|duplicate| duplicate.rows - 1)
                .sum::<usize>();
            report.total_missing += audit.missing_count;
            if audit.stored.is_none() {
                report.boxes_without_metadata += 1;
            }
            if audit.geometry_mismatch {
                report.geometry_mismatches += 1;
            }
            if audit.error.is_some() {
                report.failed_boxes.push(audit.box_id.clone());
            }
            report.boxes.push(audit);
        }
        Ok(report)
    }

    fn audit_box(&self, store: &OccupancyStore, box_id: &str) -> Result<BoxAudit, AuditorError> {
        let cells = store.cells_in_box(box_id)?;
        let stored_row = store.storage_box(box_id)?;
        let stored = stored_row.as_ref().map(Geometry::from);

        let mut present = BTreeSet::new();
        let mut invalid_labels = Vec::new();
        let mut noncanonical_labels = Vec::new();
        for cell in &cells {
            let Ok(label) = CellLabel::parse(&cell.cell_id) else {
                invalid_labels.push(cell.cell_id.clone());
                continue;
            };
            present.insert(label);
            let canonical = label.to_string();
            if canonical != cell.cell_id {
                noncanonical_labels.push(LabelSpelling {
                    row_id: cell.id,
                    cell_id: cell.cell_id.clone(),
                    canonical,
                });
            }
        }
        invalid_labels.sort();
        invalid_labels.dedup();

        let inferred = present.iter().fold(None, |acc: Option<Geometry>, label| {
            let here = Geometry {
                rows: label.row,
                cols: label.col,
            };
            Some(acc.map_or(here, |geometry| geometry.union(&here)))
        });

        let duplicates = store
            .duplicate_cells(Some(box_id))?
            .into_iter()
            .map(|group| DuplicateLabel {
                cell_id: group.cell_id,
                rows: group.row_ids.len(),
                row_ids: group.row_ids,
            })
            .collect::<Vec<_>>();

        let distinct_cells = cells
            .iter()
            .map(|cell| canonical_label(&cell.cell_id))
            .collect::<BTreeSet<_>>()
            .len();

        let mut audit = BoxAudit {
            box_id: box_id.to_string(),
            cell_rows: cells.len(),
            distinct_cells,
            duplicates,
            invalid_labels,
            noncanonical_labels,
            inferred,
            stored,
            geometry_mismatch: matches!(
                (stored, inferred),
                (Some(stored), Some(inferred)) if !stored.covers(&inferred)
            ),
            expected_cells: 0,
            missing_count: 0,
            missing_cells: Vec::new(),
            missing_truncated: false,
            error: None,
            description: stored_row
                .map(|row| row.description)
                .unwrap_or_default(),
        };

        let Some(geometry) = audit.effective() else {
            warn!(event = "geometry_unknown", box_id);
            audit.error = Some(NO_GEOMETRY.to_string());
            return Ok(audit);
        };

        let present_in_grid = present
            .iter()
            .filter(|label| label.fits(geometry.rows, geometry.cols))
            .count() as u64;
        audit.expected_cells = geometry.cell_count();
        audit.missing_count = audit.expected_cells - present_in_grid;
        audit.missing_cells = grid_labels(geometry.rows, geometry.cols)
            .filter(|label| !present.contains(label))
            .take(self.config.missing_cells_cap)
            .map(|label| label.to_string())
            .collect();
        audit.missing_truncated = audit.missing_count > audit.missing_cells.len() as u64;
        Ok(audit)
    }

    fn plan(audit: &BoxAudit, geometry: Geometry) -> Vec<RepairStep> {
        let mut steps = Vec::new();
        match audit.stored {
            None => steps.push(RepairStep::CreateBox { to: geometry }),
            Some(stored) if stored != geometry => steps.push(RepairStep::GrowBox {
                from: stored,
                to: geometry,
            }),
            Some(_) => {}
        }
        let mut removed_rows = BTreeSet::new();
        for duplicate in &audit.duplicates {
            if let Some((kept, removed)) = duplicate.row_ids.split_first() {
                removed_rows.extend(removed.iter().copied());
                steps.push(RepairStep::RemoveDuplicates {
                    label: duplicate.cell_id.clone(),
                    kept_id: *kept,
                    removed_ids: removed.to_vec(),
                });
            }
        }
        // rows merged away above are not respelled
        for spelling in &audit.noncanonical_labels {
            if !removed_rows.contains(&spelling.row_id) {
                steps.push(RepairStep::RenameLabel {
                    row_id: spelling.row_id,
                    from: spelling.cell_id.clone(),
                    to: spelling.canonical.clone(),
                });
            }
        }
        if audit.missing_count > 0 {
            steps.push(RepairStep::FillMissing {
                count: audit.missing_count,
            });
        }
        steps
    }

    /// Plans (and unless `dry_run`, applies) the repair of every box in `report`.
    pub fn repair(
        &self,
        store: &mut OccupancyStore,
        report: &AuditReport,
        dry_run: bool,
    ) -> Result<RepairReport, AuditorError> {
        let batch_id = new_batch_id();
        let mut repairs = RepairReport {
            dry_run,
            batch_id: batch_id.clone(),
            ..RepairReport::default()
        };

        for audit in &report.boxes {
            let mut repair = BoxRepair {
                box_id: audit.box_id.clone(),
                ..BoxRepair::default()
            };
            let Some(geometry) = audit.effective().filter(|_| audit.error.is_none()) else {
                repair.error = Some(audit.error.clone().unwrap_or_else(|| NO_GEOMETRY.to_string()));
                repairs.failed_boxes.push(audit.box_id.clone());
                repairs.boxes.push(repair);
                continue;
            };
            repair.steps = Self::plan(audit, geometry);

            if audit.missing_count > self.config.max_fill_cells {
                warn!(
                    event = "fill_limit_exceeded",
                    box_id = %audit.box_id,
                    missing = audit.missing_count,
                    limit = self.config.max_fill_cells
                );
                repair.error = Some(format!(
                    "{} missing cells exceed the fill limit of {}",
                    audit.missing_count, self.config.max_fill_cells
                ));
                repairs.failed_boxes.push(audit.box_id.clone());
                repairs.boxes.push(repair);
                continue;
            }

            if dry_run {
                repair.cells_created = audit.missing_count;
                repair.rows_removed = audit
                    .duplicates
                    .iter()
                    .map(|duplicate| duplicate.rows - 1)
                    .sum();
                repair.labels_renamed = repair
                    .steps
                    .iter()
                    .filter(|step| matches!(step, RepairStep::RenameLabel { .. }))
                    .count();
                repairs.boxes.push(repair);
                continue;
            }
            if repair.steps.is_empty() {
                repairs.boxes.push(repair);
                continue;
            }

            match self.apply_box(store, audit, geometry, &mut repair, &batch_id) {
                Ok(records) => {
                    repair.applied = true;
                    info!(
                        event = "box_repaired",
                        box_id = %repair.box_id,
                        cells_created = repair.cells_created,
                        rows_removed = repair.rows_removed,
                        labels_renamed = repair.labels_renamed,
                        references_moved = repair.references_moved,
                        allocations_dropped = repair.allocations_dropped
                    );
                    for record in records {
                        emit_change(&self.audit, record);
                    }
                }
                Err(err) => {
                    warn!(event = "box_repair_failed", box_id = %repair.box_id, error = %err);
                    repair.cells_created = 0;
                    repair.rows_removed = 0;
                    repair.labels_renamed = 0;
                    repair.references_moved = 0;
                    repair.allocations_dropped = 0;
                    repair.error = Some(err.to_string());
                    repairs.failed_boxes.push(audit.box_id.clone());
                }
            }
            repairs.boxes.push(repair);
        }

        Ok(repairs)
    }

    /// One transaction per box. Only cell rows are locked; sample rows are
    /// rewritten through their cell references.
    fn apply_box(
        &self,
        store: &mut OccupancyStore,
        audit: &BoxAudit,
        geometry: Geometry,
        repair: &mut BoxRepair,
        batch_id: &str,
    ) -> Result<Vec<ChangeRecord>, StorageError> {
        let box_id = audit.box_id.as_str();
        let mut records = Vec::new();
        let mut txn = store.begin()?;

        match audit.stored {
            None => {
                txn.upsert_box(box_id, geometry.rows, geometry.cols, &audit.description)?;
                records.push(
                    ChangeRecord::new(ContentType::StorageBox, box_id, AuditAction::Create)
                        .new_values(json!({ "rows": geometry.rows, "cols": geometry.cols }))
                        .comment("box metadata created from observed cells"),
                );
            }
            Some(stored) if stored != geometry => {
                txn.upsert_box(box_id, geometry.rows, geometry.cols, &audit.description)?;
                records.push(
                    ChangeRecord::new(ContentType::StorageBox, box_id, AuditAction::Update)
                        .old_values(json!({ "rows": stored.rows, "cols": stored.cols }))
                        .new_values(json!({ "rows": geometry.rows, "cols": geometry.cols }))
                        .comment("box geometry grown to cover observed cells"),
                );
            }
            Some(_) => {}
        }

        let steps = repair.steps.clone();
        for step in &steps {
            match step {
                RepairStep::RemoveDuplicates {
                    label,
                    kept_id,
                    removed_ids,
                } => {
                    let merge = DuplicateMerge {
                        box_id,
                        label,
                        kept_id: *kept_id,
                        removed_ids,
                    };
                    merge.apply(&mut txn, repair, &mut records)?;
                }
                RepairStep::RenameLabel { row_id, from, to } => {
                    if txn.lock_cell_by_id(*row_id)?.is_none() {
                        continue;
                    }
                    txn.rename_cell(*row_id, to)?;
                    repair.labels_renamed += 1;
                    records.push(
                        ChangeRecord::new(ContentType::StorageCell, row_id, AuditAction::Update)
                            .old_values(json!({ "box_id": box_id, "cell_id": from }))
                            .new_values(json!({ "box_id": box_id, "cell_id": to }))
                            .comment("cell label respelled canonically"),
                    );
                }
                RepairStep::CreateBox { .. }
                | RepairStep::GrowBox { .. }
                | RepairStep::FillMissing { .. } => {}
            }
        }

        let created = txn.ensure_cells(box_id, geometry.rows, geometry.cols)?;
        repair.cells_created = created as u64;
        if created > 0 {
            records.push(
                ChangeRecord::new(ContentType::StorageCell, box_id, AuditAction::BulkUpdate)
                    .new_values(json!({
                        "created": created,
                        "rows": geometry.rows,
                        "cols": geometry.cols,
                    }))
                    .comment("missing cells generated"),
            );
        }

        txn.commit()?;
        Ok(records
            .into_iter()
            .map(|record| record.batch(Some(batch_id)))
            .collect())
    }
}
