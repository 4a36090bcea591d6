//! Allocation Service: the only writer of cell/sample relationships.
//!
//! Each operation runs in a single write transaction that locks the cell row
//! and then the sample row, checks occupancy under those locks and commits
//! before the audit record is emitted.

use crate::audit::{emit_change, AuditSink};
use crate::error::{clear_call, unallocate_call, AllocationError, Entity, ErrorKind};
use cellalloc_core::{
    canonical_label, new_batch_id, AuditAction, ChangeRecord, ContentType, Placement, SampleId,
};
use cellalloc_storage::{CellRow, LockedTxn, OccupancyStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkItem {
    pub sample_id: SampleId,
    pub cell_id: String,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemError {
    #[serde(flatten)]
    pub item: BulkItem,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Result of a bulk call: successes are committed, failures are listed per item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub box_id: String,
    pub batch_id: String,
    pub requested: usize,
    pub successful: usize,
    pub failed: usize,
    pub placements: Vec<Placement>,
    pub errors: Vec<BulkItemError>,
}

impl BulkOutcome {
    /// The failed subset, ready to be resubmitted once remediated.
    pub fn retry_items(&self) -> Vec<BulkItem> {
        self.errors.iter().map(|error| error.item.clone()).collect()
    }
}

pub(crate) struct AssignOutcome {
    pub placement: Placement,
    pub changed: bool,
}

pub(crate) fn location_json(cell: Option<(&str, &str)>) -> Value {
    match cell {
        Some((box_id, cell_id)) => json!({ "box_id": box_id, "cell_id": cell_id }),
        None => json!({ "box_id": null, "cell_id": null }),
    }
}

fn same_label(left: &CellRow, right: &CellRow) -> bool {
    left.box_id == right.box_id && canonical_label(&left.cell_id) == canonical_label(&right.cell_id)
}

/// Primary assignment inside an open transaction: locks cell, then sample.
pub(crate) fn assign_in_txn(
    txn: &mut LockedTxn<'_>,
    sample_id: SampleId,
    box_id: &str,
    cell_id: &str,
) -> Result<AssignOutcome, AllocationError> {
    let cell = txn
        .lock_cell(box_id, cell_id)?
        .ok_or_else(|| AllocationError::not_found(Entity::Cell, format!("{box_id}/{cell_id}")))?;
    txn.lock_sample(sample_id)?
        .ok_or_else(|| AllocationError::not_found(Entity::Sample, sample_id))?;

    let occupancy = txn.cell_occupancy(box_id, cell_id)?;
    if let Some(allocation) = occupancy
        .allocation
        .as_ref()
        .filter(|allocation| allocation.sample_id != sample_id)
    {
        return Err(AllocationError::CellOccupied {
            box_id: box_id.to_string(),
            cell_id: cell_id.to_string(),
            occupant: allocation.sample_id,
            remediation: unallocate_call(allocation.sample_id, box_id, cell_id),
        });
    }
    if let Some(holder) = occupancy
        .primary_holders
        .iter()
        .copied()
        .find(|holder| *holder != sample_id)
    {
        return Err(AllocationError::CellOccupied {
            box_id: box_id.to_string(),
            cell_id: cell_id.to_string(),
            occupant: holder,
            remediation: clear_call(box_id, cell_id),
        });
    }

    let placement = Placement {
        sample_id,
        box_id: cell.box_id.clone(),
        cell_id: canonical_label(&cell.cell_id),
        is_primary: true,
        allocation_id: None,
    };

    if let Some(current) = txn.sample_location(sample_id)? {
        if same_label(&current, &cell) {
            return Ok(AssignOutcome {
                placement,
                changed: false,
            });
        }
        return Err(AllocationError::SampleAlreadyPlaced {
            sample_id,
            remediation: clear_call(&current.box_id, &current.cell_id),
            box_id: current.box_id,
            cell_id: current.cell_id,
        });
    }

    let allocations = txn.allocations_for_sample(sample_id)?;
    if let Some(first) = allocations.first() {
        return Err(AllocationError::SampleHasAllocations {
            sample_id,
            count: allocations.len(),
            remediation: unallocate_call(sample_id, &first.box_id, &first.cell_id),
        });
    }

    txn.set_primary_cell(sample_id, Some(cell.id))?;
    Ok(AssignOutcome {
        placement,
        changed: true,
    })
}

pub struct AllocationService<A> {
    audit: A,
}

impl<A: AuditSink> AllocationService<A> {
    pub fn new(audit: A) -> Self {
        Self { audit }
    }

    pub fn audit_sink(&self) -> &A {
        &self.audit
    }

    pub fn assign_primary(
        &self,
        store: &mut OccupancyStore,
        sample_id: SampleId,
        box_id: &str,
        cell_id: &str,
    ) -> Result<Placement, AllocationError> {
        self.assign_with(store, sample_id, box_id, cell_id, None)
    }

    fn assign_with(
        &self,
        store: &mut OccupancyStore,
        sample_id: SampleId,
        box_id: &str,
        cell_id: &str,
        batch_id: Option<&str>,
    ) -> Result<Placement, AllocationError> {
        let cell_id = canonical_label(cell_id);
        let mut txn = store.begin()?;
        let outcome = assign_in_txn(&mut txn, sample_id, box_id, &cell_id)?;
        let trace = txn.commit()?;
        debug!(event = "lock_trace", operation = "assign_primary", ?trace);

        if outcome.changed {
            info!(event = "primary_assigned", sample_id, box_id, cell_id = %cell_id);
            let action = if batch_id.is_some() {
                AuditAction::BulkUpdate
            } else {
                AuditAction::Update
            };
            emit_change(
                &self.audit,
                ChangeRecord::new(ContentType::Sample, sample_id, action)
                    .old_values(location_json(None))
                    .new_values(location_json(Some((box_id, &cell_id))))
                    .comment("primary location assigned")
                    .batch(batch_id),
            );
        }
        Ok(outcome.placement)
    }

    /// Frees a cell, whichever representation holds it. Returns what was removed.
    pub fn clear_primary(
        &self,
        store: &mut OccupancyStore,
        box_id: &str,
        cell_id: &str,
    ) -> Result<Placement, AllocationError> {
        let cell_id = canonical_label(cell_id);
        let mut txn = store.begin()?;
        txn.lock_cell(box_id, &cell_id)?
            .ok_or_else(|| AllocationError::not_found(Entity::Cell, format!("{box_id}/{cell_id}")))?;
        let occupancy = txn.cell_occupancy(box_id, &cell_id)?;

        let (placement, record) = if let Some(allocation) = occupancy.allocation {
            txn.lock_sample(allocation.sample_id)?;
            txn.delete_allocation(allocation.id)?;
            if allocation.is_primary {
                txn.set_primary_cell(allocation.sample_id, None)?;
            }
            let record = ChangeRecord::new(ContentType::Allocation, allocation.id, AuditAction::Delete)
                .old_values(json!({
                    "sample_id": allocation.sample_id,
                    "box_id": allocation.box_id,
                    "cell_id": allocation.cell_id,
                    "is_primary": allocation.is_primary,
                }))
                .comment("cell cleared");
            let placement = Placement {
                sample_id: allocation.sample_id,
                box_id: allocation.box_id,
                cell_id: allocation.cell_id,
                is_primary: allocation.is_primary,
                allocation_id: Some(allocation.id),
            };
            (placement, record)
        } else if let Some(holder) = occupancy.primary_holders.first().copied() {
            txn.lock_sample(holder)?;
            txn.set_primary_cell(holder, None)?;
            let record = ChangeRecord::new(ContentType::Sample, holder, AuditAction::Update)
                .old_values(location_json(Some((box_id, &cell_id))))
                .new_values(location_json(None))
                .comment("primary location cleared");
            let placement = Placement {
                sample_id: holder,
                box_id: box_id.to_string(),
                cell_id: cell_id.clone(),
                is_primary: true,
                allocation_id: None,
            };
            (placement, record)
        } else {
            return Err(AllocationError::CellAlreadyFree {
                box_id: box_id.to_string(),
                cell_id,
            });
        };

        txn.commit()?;
        info!(
            event = "cell_cleared",
            box_id,
            cell_id = %cell_id,
            sample_id = placement.sample_id
        );
        emit_change(&self.audit, record);
        Ok(placement)
    }

    pub fn allocate(
        &self,
        store: &mut OccupancyStore,
        sample_id: SampleId,
        box_id: &str,
        cell_id: &str,
        is_primary: bool,
    ) -> Result<Placement, AllocationError> {
        self.allocate_with(store, sample_id, box_id, cell_id, is_primary, None)
    }

    fn allocate_with(
        &self,
        store: &mut OccupancyStore,
        sample_id: SampleId,
        box_id: &str,
        cell_id: &str,
        is_primary: bool,
        batch_id: Option<&str>,
    ) -> Result<Placement, AllocationError> {
        let cell_id = canonical_label(cell_id);
        let mut txn = store.begin()?;
        let cell = txn
            .lock_cell(box_id, &cell_id)?
            .ok_or_else(|| AllocationError::not_found(Entity::Cell, format!("{box_id}/{cell_id}")))?;
        txn.lock_sample(sample_id)?
            .ok_or_else(|| AllocationError::not_found(Entity::Sample, sample_id))?;

        let occupancy = txn.cell_occupancy(box_id, &cell_id)?;
        if let Some(holder) = occupancy
            .legacy_holder()
            .filter(|holder| *holder != sample_id)
        {
            return Err(AllocationError::LegacyCellOccupied {
                box_id: box_id.to_string(),
                occupant: holder,
                remediation: clear_call(box_id, &cell_id),
                cell_id,
            });
        }

        let previous = txn.sample_location(sample_id)?;
        // A cell already referenced as this sample's primary can only be its primary allocation.
        let is_primary = is_primary
            || previous
                .as_ref()
                .is_some_and(|current| same_label(current, &cell));

        let (allocation_id, action, changed, effective_primary) = match occupancy.allocation {
            Some(existing) if existing.sample_id != sample_id => {
                return Err(AllocationError::AllocationOccupied {
                    box_id: box_id.to_string(),
                    occupant: existing.sample_id,
                    remediation: unallocate_call(existing.sample_id, box_id, &cell_id),
                    cell_id,
                });
            }
            Some(existing) if existing.is_primary || !is_primary => {
                (existing.id, AuditAction::Update, false, existing.is_primary)
            }
            Some(existing) => {
                txn.demote_primary_allocations(sample_id)?;
                txn.set_allocation_primary(existing.id, true)?;
                txn.set_primary_cell(sample_id, Some(existing.cell))?;
                (existing.id, AuditAction::Update, true, true)
            }
            None => {
                if is_primary {
                    txn.demote_primary_allocations(sample_id)?;
                }
                let id = txn.insert_allocation(sample_id, cell.id, is_primary)?;
                if is_primary {
                    txn.set_primary_cell(sample_id, Some(cell.id))?;
                }
                (id, AuditAction::Create, true, is_primary)
            }
        };

        let trace = txn.commit()?;
        debug!(event = "lock_trace", operation = "allocate", ?trace);

        if changed {
            info!(
                event = "cell_allocated",
                sample_id,
                box_id,
                cell_id = %cell_id,
                is_primary = effective_primary
            );
            let old_values = if effective_primary {
                json!({
                    "sample_primary": location_json(
                        previous.as_ref().map(|current| (current.box_id.as_str(), current.cell_id.as_str()))
                    )
                })
            } else {
                Value::Null
            };
            emit_change(
                &self.audit,
                ChangeRecord::new(ContentType::Allocation, allocation_id, action)
                    .old_values(old_values)
                    .new_values(json!({
                        "sample_id": sample_id,
                        "box_id": box_id,
                        "cell_id": cell_id,
                        "is_primary": effective_primary,
                    }))
                    .comment(if effective_primary {
                        "primary allocation"
                    } else {
                        "secondary allocation"
                    })
                    .batch(batch_id),
            );
        }

        Ok(Placement {
            sample_id,
            box_id: cell.box_id,
            cell_id,
            is_primary: effective_primary,
            allocation_id: Some(allocation_id),
        })
    }

    pub fn unallocate(
        &self,
        store: &mut OccupancyStore,
        sample_id: SampleId,
        box_id: &str,
        cell_id: &str,
    ) -> Result<Placement, AllocationError> {
        let cell_id = canonical_label(cell_id);
        let mut txn = store.begin()?;
        txn.lock_cell(box_id, &cell_id)?
            .ok_or_else(|| AllocationError::not_found(Entity::Cell, format!("{box_id}/{cell_id}")))?;
        txn.lock_sample(sample_id)?
            .ok_or_else(|| AllocationError::not_found(Entity::Sample, sample_id))?;

        let occupancy = txn.cell_occupancy(box_id, &cell_id)?;
        let Some(allocation) = occupancy
            .allocation
            .filter(|allocation| allocation.sample_id == sample_id)
        else {
            return Err(AllocationError::AllocationNotFound {
                sample_id,
                box_id: box_id.to_string(),
                cell_id,
            });
        };

        txn.delete_allocation(allocation.id)?;
        if allocation.is_primary {
            txn.set_primary_cell(sample_id, None)?;
        }
        txn.commit()?;

        info!(event = "cell_unallocated", sample_id, box_id, cell_id = %cell_id);
        emit_change(
            &self.audit,
            ChangeRecord::new(ContentType::Allocation, allocation.id, AuditAction::Delete)
                .old_values(json!({
                    "sample_id": sample_id,
                    "box_id": allocation.box_id,
                    "cell_id": allocation.cell_id,
                    "is_primary": allocation.is_primary,
                }))
                .comment("allocation removed"),
        );

        Ok(Placement {
            sample_id,
            cell_id: canonical_label(&allocation.cell_id),
            box_id: allocation.box_id,
            is_primary: allocation.is_primary,
            allocation_id: Some(allocation.id),
        })
    }

    pub fn bulk_assign_primary(
        &self,
        store: &mut OccupancyStore,
        box_id: &str,
        items: &[BulkItem],
    ) -> Result<BulkOutcome, AllocationError> {
        self.run_bulk(store, box_id, items, "bulk_assign_primary", |service, store, batch, item| {
            service.assign_with(store, item.sample_id, box_id, &item.cell_id, Some(batch))
        })
    }

    pub fn bulk_allocate(
        &self,
        store: &mut OccupancyStore,
        box_id: &str,
        items: &[BulkItem],
    ) -> Result<BulkOutcome, AllocationError> {
        self.run_bulk(store, box_id, items, "bulk_allocate", |service, store, batch, item| {
            service.allocate_with(
                store,
                item.sample_id,
                box_id,
                &item.cell_id,
                item.is_primary,
                Some(batch),
            )
        })
    }

    /// Runs one committed transaction per item; an item's failure never touches the others.
    fn run_bulk<F>(
        &self,
        store: &mut OccupancyStore,
        box_id: &str,
        items: &[BulkItem],
        operation: &'static str,
        mut apply: F,
    ) -> Result<BulkOutcome, AllocationError>
    where
        F: FnMut(&Self, &mut OccupancyStore, &str, &BulkItem) -> Result<Placement, AllocationError>,
    {
        if items.is_empty() {
            return Err(AllocationError::EmptyRequest);
        }

        let batch_id = new_batch_id();
        let mut outcome = BulkOutcome {
            box_id: box_id.to_string(),
            batch_id: batch_id.clone(),
            requested: items.len(),
            ..BulkOutcome::default()
        };

        for item in items {
            match apply(self, store, &batch_id, item) {
                Ok(placement) => {
                    outcome.successful += 1;
                    outcome.placements.push(placement);
                }
                Err(err) => {
                    warn!(
                        event = "bulk_item_failed",
                        operation,
                        sample_id = item.sample_id,
                        cell_id = %item.cell_id,
                        kind = ?err.kind(),
                        error = %err
                    );
                    outcome.failed += 1;
                    outcome.errors.push(BulkItemError {
                        item: item.clone(),
                        kind: err.kind(),
                        message: err.to_string(),
                        remediation: err.remediation().map(str::to_string),
                    });
                }
            }
        }

        info!(
            event = "bulk_complete",
            operation,
            box_id,
            batch_id = %batch_id,
            requested = outcome.requested,
            successful = outcome.successful,
            failed = outcome.failed
        );
        Ok(outcome)
    }

    /// The sample's primary location, with the allocation id when it is allocation-backed.
    pub fn placement_of(
        &self,
        store: &OccupancyStore,
        sample_id: SampleId,
    ) -> Result<Option<Placement>, AllocationError> {
        if store.sample(sample_id)?.is_none() {
            return Err(AllocationError::not_found(Entity::Sample, sample_id));
        }
        let Some(cell) = store.sample_location(sample_id)? else {
            return Ok(None);
        };
        let allocation_id = store
            .allocations_for_sample(sample_id)?
            .into_iter()
            .find(|allocation| {
                allocation.is_primary
                    && allocation.box_id == cell.box_id
                    && canonical_label(&allocation.cell_id) == canonical_label(&cell.cell_id)
            })
            .map(|allocation| allocation.id);
        Ok(Some(Placement {
            sample_id,
            cell_id: canonical_label(&cell.cell_id),
            box_id: cell.box_id,
            is_primary: true,
            allocation_id,
        }))
    }

    pub fn occupant_of(
        &self,
        store: &OccupancyStore,
        box_id: &str,
        cell_id: &str,
    ) -> Result<Option<SampleId>, AllocationError> {
        let cell_id = canonical_label(cell_id);
        if store.cell(box_id, &cell_id)?.is_none() {
            return Err(AllocationError::not_found(
                Entity::Cell,
                format!("{box_id}/{cell_id}"),
            ));
        }
        let occupancy = store.cell_occupancy(box_id, &cell_id)?;
        Ok(occupancy
            .allocation
            .map(|allocation| allocation.sample_id)
            .or_else(|| occupancy.primary_holders.first().copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, RecordingAuditSink};
    use cellalloc_storage::NewSample;

    fn store_with(box_id: &str, rows: u32, cols: u32, samples: &[SampleId]) -> OccupancyStore {
        let mut store = OccupancyStore::open_in_memory().expect("open store");
        store.ensure_cells(box_id, rows, cols).expect("grid");
        for id in samples {
            store
                .insert_sample(&NewSample {
                    id: Some(*id),
                    ..NewSample::default()
                })
                .expect("sample");
        }
        store
    }

    #[test]
    fn second_sample_cannot_take_an_occupied_cell() {
        let mut store = store_with("BOX1", 1, 1, &[10, 11]);
        let service = AllocationService::new(RecordingAuditSink::new());

        let placement = service
            .assign_primary(&mut store, 10, "BOX1", "A1")
            .expect("first assignment");
        assert_eq!(placement.cell_id, "A1");

        let err = service
            .assign_primary(&mut store, 11, "BOX1", "A1")
            .expect_err("cell is taken");
        assert_eq!(err.kind(), ErrorKind::CellOccupied);
        assert_eq!(err.occupant(), Some(10));
        assert_eq!(err.remediation(), Some("cellalloc clear --box BOX1 --cell A1"));

        let records = service.audit_sink().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_id, "10");
        assert_eq!(records[0].action, AuditAction::Update);
        assert_eq!(records[0].new_values["cell_id"], "A1");
        assert!(store.sample_location(11).expect("location").is_none());
    }

    #[test]
    fn legacy_lowercase_row_is_the_same_cell() {
        let mut store = OccupancyStore::open_in_memory_with(cellalloc_storage::StoreConfig::legacy())
            .expect("open store");
        store.insert_cell_row("FULL", "A1").expect("row");
        let lower = store.insert_cell_row("FULL", "a1").expect("lowercase row");
        store
            .insert_sample(&NewSample {
                id: Some(30),
                primary_cell: Some(lower),
                ..NewSample::default()
            })
            .expect("holder");
        store
            .insert_sample(&NewSample {
                id: Some(31),
                ..NewSample::default()
            })
            .expect("newcomer");
        let service = AllocationService::new(RecordingAuditSink::new());

        let err = service
            .assign_primary(&mut store, 31, "FULL", "A1")
            .expect_err("position is held through the lowercase row");
        assert_eq!(err.kind(), ErrorKind::CellOccupied);
        assert_eq!(err.occupant(), Some(30));
        assert_eq!(service.occupant_of(&store, "FULL", "A1").expect("occupant"), Some(30));

        let placement = service
            .placement_of(&store, 30)
            .expect("placement")
            .expect("placed");
        assert_eq!(placement.cell_id, "A1");
        assert!(service.audit_sink().is_empty());
    }

    #[test]
    fn assign_is_idempotent_and_rejects_second_location() {
        let mut store = store_with("BOX1", 1, 2, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());

        service
            .assign_primary(&mut store, 10, "BOX1", "a1")
            .expect("assign");
        service
            .assign_primary(&mut store, 10, "BOX1", "A1")
            .expect("same cell again");
        assert_eq!(service.audit_sink().len(), 1);

        let err = service
            .assign_primary(&mut store, 10, "BOX1", "A2")
            .expect_err("already placed");
        assert_eq!(err.kind(), ErrorKind::SampleAlreadyPlaced);
        assert_eq!(err.remediation(), Some("cellalloc clear --box BOX1 --cell A1"));
    }

    #[test]
    fn assign_refuses_samples_using_allocations() {
        let mut store = store_with("BOX1", 1, 2, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());

        service
            .allocate(&mut store, 10, "BOX1", "A2", false)
            .expect("secondary allocation");
        let err = service
            .assign_primary(&mut store, 10, "BOX1", "A1")
            .expect_err("mixed representations");
        assert_eq!(err.kind(), ErrorKind::SampleHasAllocations);
        assert_eq!(
            err.remediation(),
            Some("cellalloc unallocate --sample 10 --box BOX1 --cell A2")
        );
    }

    #[test]
    fn assign_reports_missing_rows() {
        let mut store = store_with("BOX1", 1, 1, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());

        let err = service
            .assign_primary(&mut store, 10, "BOX1", "Z9")
            .expect_err("no such cell");
        assert!(matches!(
            err,
            AllocationError::NotFound {
                entity: Entity::Cell,
                ..
            }
        ));
        let err = service
            .assign_primary(&mut store, 99, "BOX1", "A1")
            .expect_err("no such sample");
        assert!(matches!(
            err,
            AllocationError::NotFound {
                entity: Entity::Sample,
                ..
            }
        ));
        assert!(service.audit_sink().is_empty());
    }

    #[test]
    fn clear_releases_legacy_primary_and_then_reports_free() {
        let mut store = store_with("BOX1", 1, 1, &[10, 11]);
        let service = AllocationService::new(RecordingAuditSink::new());
        service
            .assign_primary(&mut store, 10, "BOX1", "A1")
            .expect("assign");

        let cleared = service
            .clear_primary(&mut store, "BOX1", "A1")
            .expect("clear");
        assert_eq!(cleared.sample_id, 10);
        assert!(store.sample_location(10).expect("location").is_none());

        let err = service
            .clear_primary(&mut store, "BOX1", "A1")
            .expect_err("nothing left");
        assert_eq!(err.kind(), ErrorKind::CellAlreadyFree);

        service
            .assign_primary(&mut store, 11, "BOX1", "A1")
            .expect("cell reusable");
        assert_eq!(service.audit_sink().len(), 3);
    }

    #[test]
    fn clear_deletes_primary_allocation_and_reference() {
        let mut store = store_with("BOX1", 1, 1, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());
        let placement = service
            .allocate(&mut store, 10, "BOX1", "A1", true)
            .expect("primary allocation");
        assert_eq!(
            store
                .sample_location(10)
                .expect("location")
                .map(|cell| cell.cell_id),
            Some("A1".to_string())
        );

        let cleared = service
            .clear_primary(&mut store, "BOX1", "A1")
            .expect("clear");
        assert_eq!(cleared.allocation_id, placement.allocation_id);
        assert!(store.sample_location(10).expect("location").is_none());
        assert!(store.allocations_for_sample(10).expect("allocations").is_empty());

        let last = service.audit_sink().records().pop().expect("record");
        assert_eq!(last.content_type, ContentType::Allocation);
        assert_eq!(last.action, AuditAction::Delete);
    }

    #[test]
    fn secondary_allocation_keeps_existing_primary() {
        let mut store = store_with("BOX1", 1, 2, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());
        service
            .assign_primary(&mut store, 10, "BOX1", "A2")
            .expect("legacy primary");

        let placement = service
            .allocate(&mut store, 10, "BOX1", "A1", false)
            .expect("secondary");
        assert!(!placement.is_primary);
        assert_eq!(
            store
                .sample_location(10)
                .expect("location")
                .map(|cell| cell.cell_id),
            Some("A2".to_string())
        );
    }

    #[test]
    fn allocate_rejects_cells_held_by_other_samples() {
        let mut store = store_with("BOX1", 1, 2, &[10, 11]);
        let service = AllocationService::new(RecordingAuditSink::new());
        service
            .assign_primary(&mut store, 10, "BOX1", "A1")
            .expect("legacy primary");
        service
            .allocate(&mut store, 10, "BOX1", "A2", false)
            .expect("allocation");

        let legacy = service
            .allocate(&mut store, 11, "BOX1", "A1", false)
            .expect_err("legacy owner");
        assert_eq!(legacy.kind(), ErrorKind::LegacyCellOccupied);
        assert_eq!(legacy.occupant(), Some(10));

        let allocated = service
            .allocate(&mut store, 11, "BOX1", "A2", true)
            .expect_err("allocation owner");
        assert_eq!(allocated.kind(), ErrorKind::AllocationOccupied);
        assert_eq!(
            allocated.remediation(),
            Some("cellalloc unallocate --sample 10 --box BOX1 --cell A2")
        );
    }

    #[test]
    fn primary_allocation_moves_and_demotes_previous_primary() {
        let mut store = store_with("BOX1", 1, 3, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());

        service
            .allocate(&mut store, 10, "BOX1", "A1", true)
            .expect("first primary");
        service
            .allocate(&mut store, 10, "BOX1", "A2", true)
            .expect("second primary");

        let allocations = store.allocations_for_sample(10).expect("allocations");
        assert_eq!(allocations.len(), 2);
        let primaries = allocations
            .iter()
            .filter(|allocation| allocation.is_primary)
            .collect::<Vec<_>>();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].cell_id, "A2");
        assert_eq!(
            store
                .sample_location(10)
                .expect("location")
                .map(|cell| cell.cell_id),
            Some("A2".to_string())
        );

        // promoting an existing secondary row reuses it
        let promoted = service
            .allocate(&mut store, 10, "BOX1", "A1", true)
            .expect("promote");
        assert_eq!(promoted.allocation_id, Some(allocations[0].id));
        let placement = service
            .placement_of(&store, 10)
            .expect("placement")
            .expect("placed");
        assert_eq!(placement.cell_id, "A1");
        assert_eq!(placement.allocation_id, Some(allocations[0].id));
    }

    #[test]
    fn allocate_is_idempotent_for_same_pair() {
        let mut store = store_with("BOX1", 1, 1, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());

        let first = service
            .allocate(&mut store, 10, "BOX1", "A1", true)
            .expect("allocate");
        let again = service
            .allocate(&mut store, 10, "BOX1", "A1", false)
            .expect("repeat");
        assert_eq!(first.allocation_id, again.allocation_id);
        assert!(again.is_primary);
        assert_eq!(service.audit_sink().len(), 1);
    }

    #[test]
    fn unallocate_removes_row_and_primary_reference() {
        let mut store = store_with("BOX1", 1, 2, &[10]);
        let service = AllocationService::new(RecordingAuditSink::new());
        service
            .allocate(&mut store, 10, "BOX1", "A1", true)
            .expect("primary");

        let err = service
            .unallocate(&mut store, 10, "BOX1", "A2")
            .expect_err("nothing there");
        assert_eq!(err.kind(), ErrorKind::AllocationNotFound);

        let removed = service
            .unallocate(&mut store, 10, "BOX1", "A1")
            .expect("unallocate");
        assert!(removed.is_primary);
        assert!(store.sample_location(10).expect("location").is_none());
        assert_eq!(service.occupant_of(&store, "BOX1", "A1").expect("occupant"), None);
    }

    #[test]
    fn bulk_assign_isolates_failures() {
        let mut store = store_with("BOX1", 2, 2, &[1, 2, 3, 4, 9]);
        let service = AllocationService::new(RecordingAuditSink::new());
        service
            .assign_primary(&mut store, 9, "BOX1", "B2")
            .expect("pre-existing occupant");

        let items = vec![
            BulkItem {
                sample_id: 1,
                cell_id: "A1".to_string(),
                is_primary: false,
            },
            BulkItem {
                sample_id: 2,
                cell_id: "B2".to_string(),
                is_primary: false,
            },
            BulkItem {
                sample_id: 3,
                cell_id: "A2".to_string(),
                is_primary: false,
            },
            BulkItem {
                sample_id: 4,
                cell_id: "Q7".to_string(),
                is_primary: false,
            },
        ];
        let outcome = service
            .bulk_assign_primary(&mut store, "BOX1", &items)
            .expect("bulk");

        assert_eq!(outcome.requested, 4);
        assert_eq!(outcome.successful, 2);
        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.errors[0].item.sample_id, 2);
        assert_eq!(outcome.errors[0].kind, ErrorKind::CellOccupied);
        assert_eq!(
            outcome.errors[0].remediation.as_deref(),
            Some("cellalloc clear --box BOX1 --cell B2")
        );
        assert_eq!(outcome.errors[1].kind, ErrorKind::NotFound);
        assert_eq!(outcome.retry_items(), vec![items[1].clone(), items[3].clone()]);

        for (sample_id, cell_id) in [(1, "A1"), (3, "A2")] {
            let cell = store
                .sample_location(sample_id)
                .expect("location")
                .expect("persisted");
            assert_eq!(cell.cell_id, cell_id);
        }

        let batch_records = service
            .audit_sink()
            .records()
            .into_iter()
            .filter(|record| record.batch_id.as_deref() == Some(outcome.batch_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(batch_records.len(), 2);
        assert!(batch_records
            .iter()
            .all(|record| record.action == AuditAction::BulkUpdate));
    }

    #[test]
    fn bulk_calls_reject_empty_requests() {
        let mut store = store_with("BOX1", 1, 1, &[]);
        let service = AllocationService::new(RecordingAuditSink::new());
        let err = service
            .bulk_allocate(&mut store, "BOX1", &[])
            .expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::EmptyRequest);
    }

    #[test]
    fn bulk_allocate_shares_one_batch_id() {
        let mut store = store_with("BOX1", 1, 3, &[1, 2]);
        let service = AllocationService::new(RecordingAuditSink::new());
        let items = vec![
            BulkItem {
                sample_id: 1,
                cell_id: "A1".to_string(),
                is_primary: true,
            },
            BulkItem {
                sample_id: 1,
                cell_id: "A2".to_string(),
                is_primary: false,
            },
            BulkItem {
                sample_id: 2,
                cell_id: "A2".to_string(),
                is_primary: false,
            },
        ];
        let outcome = service
            .bulk_allocate(&mut store, "BOX1", &items)
            .expect("bulk");
        assert_eq!((outcome.successful, outcome.failed), (2, 1));
        assert_eq!(outcome.errors[0].kind, ErrorKind::AllocationOccupied);

        let records = service.audit_sink().records();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|record| record.batch_id.as_deref() == Some(outcome.batch_id.as_str())));
    }

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn record_change(&self, _record: ChangeRecord) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }
    }

    #[test]
    fn audit_failures_do_not_undo_committed_mutations() {
        let mut store = store_with("BOX1", 1, 1, &[10]);
        let service = AllocationService::new(BrokenSink);

        service
            .assign_primary(&mut store, 10, "BOX1", "A1")
            .expect("assignment still succeeds");
        assert_eq!(
            service.occupant_of(&store, "BOX1", "A1").expect("occupant"),
            Some(10)
        );
    }
}
