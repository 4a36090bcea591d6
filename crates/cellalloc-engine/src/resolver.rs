//! Duplicate Resolver: one winner per cell shared as primary by several samples.
//!
//! The plan (winner and losers per conflicting label) is computed from a
//! read-only snapshot, so a dry run and the execute run that follows it
//! produce the same decisions and the same `plan_digest`. Execution then
//! processes each group in its own transaction and re-verifies the conflict
//! under lock before clearing anything.

use crate::allocation::{assign_in_txn, location_json};
use crate::audit::{emit_change, AuditSink};
use crate::error::{AllocationError, ErrorKind};
use cellalloc_core::{
    canonical_label, canonical_payload_hash, new_batch_id, AuditAction, ChangeRecord, ContentType,
    CoreContractError, Fallback, Prefer, SampleId,
};
use cellalloc_storage::{CellRow, OccupancyStore, SampleRow, SharedPrimaryGroup, StorageError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

const STRAIN_SCORE: u32 = 10;
const SAMPLE_NUMBER_SCORE: u32 = 5;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Contract(#[from] CoreContractError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub prefer: Prefer,
    /// Write changes; otherwise only report the plan.
    pub execute: bool,
    pub limit: Option<usize>,
    pub reallocate: bool,
    pub fallback: Fallback,
    pub boxes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub sample_id: SampleId,
    pub score: u32,
    pub has_strain: bool,
    pub has_sample_number: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Candidate {
    fn from_sample(sample: &SampleRow) -> Self {
        let has_strain = sample.strain_id.is_some();
        let has_sample_number = sample
            .sample_number
            .as_deref()
            .is_some_and(|number| !number.trim().is_empty());
        let mut score = 0;
        if has_strain {
            score += STRAIN_SCORE;
        }
        if has_sample_number {
            score += SAMPLE_NUMBER_SCORE;
        }
        Self {
            sample_id: sample.id,
            score,
            has_strain,
            has_sample_number,
            created_at: sample.created_at,
            updated_at: sample.updated_at,
        }
    }
}

/// Winner first. Every strategy ends on the sample id, so the order is total.
fn rank(prefer: Prefer, left: &Candidate, right: &Candidate) -> Ordering {
    let ordering = match prefer {
        Prefer::WithStrain => right
            .score
            .cmp(&left.score)
            .then_with(|| left.created_at.cmp(&right.created_at)),
        Prefer::CreatedAt => left.created_at.cmp(&right.created_at),
        Prefer::UpdatedAt => right.updated_at.cmp(&left.updated_at),
    };
    ordering.then_with(|| left.sample_id.cmp(&right.sample_id))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reallocation {
    pub sample_id: SampleId,
    pub box_id: Option<String>,
    pub cell_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDecision {
    pub box_id: String,
    pub cell_id: String,
    pub winner: Candidate,
    pub losers: Vec<Candidate>,
    pub applied: bool,
    pub skipped: bool,
    pub reallocations: Vec<Reallocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveFailure {
    pub box_id: String,
    pub cell_id: String,
    pub sample_id: Option<SampleId>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolverReport {
    pub dry_run: bool,
    pub prefer: Prefer,
    pub batch_id: Option<String>,
    pub groups_found: usize,
    pub groups_processed: usize,
    pub groups_skipped: usize,
    pub decisions: Vec<GroupDecision>,
    pub cleared: usize,
    pub reallocated: usize,
    pub unplaced: usize,
    pub errors: Vec<ResolveFailure>,
    pub plan_digest: String,
}

#[derive(Serialize)]
struct PlanEntry<'a> {
    box_id: &'a str,
    cell_id: &'a str,
    winner: SampleId,
    losers: Vec<SampleId>,
}

pub struct DuplicateResolver<A> {
    config: ResolverConfig,
    audit: A,
}

impl<A: AuditSink> DuplicateResolver<A> {
    pub fn new(config: ResolverConfig, audit: A) -> Self {
        Self { config, audit }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Conflict groups in `(box, row, col)` order, filtered by the configured boxes.
    fn conflict_groups(&self, store: &OccupancyStore) -> Result<Vec<SharedPrimaryGroup>, StorageError> {
        let groups = store.shared_primary_groups()?;
        if self.config.boxes.is_empty() {
            return Ok(groups);
        }
        Ok(groups
            .into_iter()
            .filter(|group| self.config.boxes.contains(&group.box_id))
            .collect())
    }

    fn decide(
        &self,
        store: &OccupancyStore,
        group: &SharedPrimaryGroup,
    ) -> Result<Option<GroupDecision>, StorageError> {
        let mut candidates = Vec::new();
        for sample_id in &group.sample_ids {
            if let Some(sample) = store.sample(*sample_id)? {
                candidates.push(Candidate::from_sample(&sample));
            }
        }
        candidates.sort_by(|left, right| rank(self.config.prefer, left, right));
        let mut ranked = candidates.into_iter();
        let Some(winner) = ranked.next() else {
            return Ok(None);
        };
        Ok(Some(GroupDecision {
            box_id: group.box_id.clone(),
            cell_id: group.cell_id.clone(),
            winner,
            losers: ranked.collect(),
            applied: false,
            skipped: false,
            reallocations: Vec::new(),
        }))
    }

    pub fn run(&self, store: &mut OccupancyStore) -> Result<ResolverReport, ResolverError> {
        let groups = self.conflict_groups(store)?;
        let groups_found = groups.len();
        let limit = self.config.limit.unwrap_or(usize::MAX);

        let mut decisions = Vec::new();
        for group in groups.iter().take(limit) {
            if let Some(decision) = self.decide(store, group)? {
                decisions.push(decision);
            }
        }

        let plan = decisions
            .iter()
            .map(|decision| PlanEntry {
                box_id: &decision.box_id,
                cell_id: &decision.cell_id,
                winner: decision.winner.sample_id,
                losers: decision
                    .losers
                    .iter()
                    .map(|loser| loser.sample_id)
                    .collect(),
            })
            .collect::<Vec<_>>();
        let plan_digest = canonical_payload_hash(&plan)?;

        let mut report = ResolverReport {
            dry_run: !self.config.execute,
            prefer: self.config.prefer,
            batch_id: None,
            groups_found,
            groups_processed: 0,
            groups_skipped: 0,
            decisions: Vec::new(),
            cleared: 0,
            reallocated: 0,
            unplaced: 0,
            errors: Vec::new(),
            plan_digest,
        };

        if self.config.execute {
            let batch_id = new_batch_id();
            report.batch_id = Some(batch_id.clone());
            for decision in decisions {
                self.execute_group(store, decision, &batch_id, &mut report)?;
            }
        } else {
            self.predict(store, decisions, &mut report)?;
        }

        info!(
            event = "duplicates_resolved",
            dry_run = report.dry_run,
            prefer = self.config.prefer.as_str(),
            groups_found = report.groups_found,
            groups_processed = report.groups_processed,
            groups_skipped = report.groups_skipped,
            cleared = report.cleared,
            reallocated = report.reallocated,
            unplaced = report.unplaced,
            errors = report.errors.len(),
            plan_digest = %report.plan_digest
        );
        Ok(report)
    }

    /// Dry run: predicted reallocation targets never reuse a cell.
    fn predict(
        &self,
        store: &OccupancyStore,
        decisions: Vec<GroupDecision>,
        report: &mut ResolverReport,
    ) -> Result<(), StorageError> {
        let mut reserved = BTreeSet::new();
        for mut decision in decisions {
            report.groups_processed += 1;
            report.cleared += decision.losers.len();
            if self.config.reallocate {
                for loser in &decision.losers {
                    let target = self
                        .free_candidates(store, &decision.box_id)?
                        .into_iter()
                        .map(|cell| (cell.box_id, canonical_label(&cell.cell_id)))
                        .find(|target| !reserved.contains(target));
                    let reallocation = match target {
                        Some((box_id, cell_id)) => {
                            reserved.insert((box_id.clone(), cell_id.clone()));
                            report.reallocated += 1;
                            Reallocation {
                                sample_id: loser.sample_id,
                                box_id: Some(box_id),
                                cell_id: Some(cell_id),
                            }
                        }
                        None => Reallocation {
                            sample_id: loser.sample_id,
                            box_id: None,
                            cell_id: None,
                        },
                    };
                    decision.reallocations.push(reallocation);
                }
            }
            report.unplaced = report.cleared - report.reallocated;
            report.decisions.push(decision);
        }
        Ok(())
    }

    /// Same box first, then every other box when the fallback allows it.
    fn free_candidates(&self, store: &OccupancyStore, box_id: &str) -> Result<Vec<CellRow>, StorageError> {
        let mut cells = store.free_cells(Some(box_id))?;
        if self.config.fallback == Fallback::AnyBox {
            cells.extend(
                store
                    .free_cells(None)?
                    .into_iter()
                    .filter(|cell| cell.box_id != box_id),
            );
        }
        Ok(cells)
    }

    fn execute_group(
        &self,
        store: &mut OccupancyStore,
        mut decision: GroupDecision,
        batch_id: &str,
        report: &mut ResolverReport,
    ) -> Result<(), ResolverError> {
        let cleared = match self.clear_losers(store, &decision, batch_id) {
            Ok(Some(cleared)) => cleared,
            Ok(None) => {
                info!(
                    event = "group_skipped",
                    box_id = %decision.box_id,
                    cell_id = %decision.cell_id,
                    winner = decision.winner.sample_id
                );
                decision.skipped = true;
                report.groups_skipped += 1;
                report.decisions.push(decision);
                return Ok(());
            }
            Err(err) => {
                warn!(
                    event = "group_failed",
                    box_id = %decision.box_id,
                    cell_id = %decision.cell_id,
                    error = %err
                );
                report.errors.push(ResolveFailure {
                    box_id: decision.box_id.clone(),
                    cell_id: decision.cell_id.clone(),
                    sample_id: None,
                    kind: err.kind(),
                    message: err.to_string(),
                });
                report.decisions.push(decision);
                return Ok(());
            }
        };

        decision.applied = true;
        report.groups_processed += 1;
        report.cleared += cleared.len();

        let mut placed = 0;
        if self.config.reallocate {
            for sample_id in &cleared {
                let reallocation = self.reallocate_loser(store, &decision, *sample_id, batch_id, report)?;
                if reallocation.cell_id.is_some() {
                    placed += 1;
                }
                decision.reallocations.push(reallocation);
            }
        }
        report.reallocated += placed;
        report.unplaced += cleared.len() - placed;
        report.decisions.push(decision);
        Ok(())
    }

    /// Clears every loser still holding the cell. `None` when the conflict is gone.
    fn clear_losers(
        &self,
        store: &mut OccupancyStore,
        decision: &GroupDecision,
        batch_id: &str,
    ) -> Result<Option<Vec<SampleId>>, AllocationError> {
        let box_id = decision.box_id.as_str();
        let cell_id = decision.cell_id.as_str();
        let mut involved = decision
            .losers
            .iter()
            .map(|loser| loser.sample_id)
            .chain(std::iter::once(decision.winner.sample_id))
            .collect::<Vec<_>>();
        involved.sort_unstable();

        let mut txn = store.begin()?;
        if txn.lock_cell(box_id, cell_id)?.is_none() {
            return Ok(None);
        }
        for sample_id in &involved {
            txn.lock_sample(*sample_id)?;
        }

        let holders = txn.cell_occupancy(box_id, cell_id)?.primary_holders;
        if holders.len() < 2 || !holders.contains(&decision.winner.sample_id) {
            txn.rollback()?;
            return Ok(None);
        }

        let mut cleared = Vec::new();
        let mut records = Vec::new();
        for loser in &decision.losers {
            if !holders.contains(&loser.sample_id) {
                continue;
            }
            let dropped = txn
                .allocations_for_sample(loser.sample_id)?
                .into_iter()
                .find(|allocation| {
                    allocation.is_primary
                        && allocation.box_id == box_id
                        && canonical_label(&allocation.cell_id) == cell_id
                });
            if let Some(allocation) = &dropped {
                txn.delete_allocation(allocation.id)?;
            }
            txn.set_primary_cell(loser.sample_id, None)?;

            let mut before = location_json(Some((box_id, cell_id)));
            if let Some(allocation) = &dropped {
                before["allocation_id"] = json!(allocation.id);
            }
            records.push(
                ChangeRecord::new(ContentType::Sample, loser.sample_id, AuditAction::Update)
                    .old_values(before)
                    .new_values(location_json(None))
                    .comment(format!(
                        "duplicate primary location released; kept by sample {}",
                        decision.winner.sample_id
                    ))
                    .batch(Some(batch_id)),
            );
            cleared.push(loser.sample_id);
        }

        let trace = txn.commit()?;
        debug!(event = "lock_trace", operation = "resolve_group", ?trace);
        info!(
            event = "group_resolved",
            box_id,
            cell_id,
            winner = decision.winner.sample_id,
            cleared = cleared.len()
        );
        for record in records {
            emit_change(&self.audit, record);
        }
        Ok(Some(cleared))
    }

    /// Free-cell search is a snapshot; the assignment re-checks occupancy under lock.
    fn reallocate_loser(
        &self,
        store: &mut OccupancyStore,
        decision: &GroupDecision,
        sample_id: SampleId,
        batch_id: &str,
        report: &mut ResolverReport,
    ) -> Result<Reallocation, ResolverError> {
        let unplaced = Reallocation {
            sample_id,
            box_id: None,
            cell_id: None,
        };
        let Some(target) = self
            .free_candidates(store, &decision.box_id)?
            .into_iter()
            .next()
        else {
            info!(event = "no_free_cell", sample_id, box_id = %decision.box_id);
            return Ok(unplaced);
        };

        let target_cell = canonical_label(&target.cell_id);
        let attempt = store.begin().map_err(AllocationError::from).and_then(|mut txn| {
            let outcome = assign_in_txn(&mut txn, sample_id, &target.box_id, &target_cell)?;
            txn.commit()?;
            Ok(outcome)
        });
        match attempt {
            Ok(outcome) => {
                info!(
                    event = "loser_reallocated",
                    sample_id,
                    box_id = %outcome.placement.box_id,
                    cell_id = %outcome.placement.cell_id
                );
                emit_change(
                    &self.audit,
                    ChangeRecord::new(ContentType::Sample, sample_id, AuditAction::Update)
                        .old_values(location_json(None))
                        .new_values(location_json(Some((
                            outcome.placement.box_id.as_str(),
                            outcome.placement.cell_id.as_str(),
                        ))))
                        .comment(format!(
                            "reallocated after losing {}/{}",
                            decision.box_id, decision.cell_id
                        ))
                        .batch(Some(batch_id)),
                );
                Ok(Reallocation {
                    sample_id,
                    box_id: Some(outcome.placement.box_id),
                    cell_id: Some(outcome.placement.cell_id),
                })
            }
            Err(err) => {
                warn!(
                    event = "reallocation_failed",
                    sample_id,
                    box_id = %target.box_id,
                    cell_id = %target_cell,
                    error = %err
                );
                report.errors.push(ResolveFailure {
                    box_id: target.box_id,
                    cell_id: target_cell,
                    sample_id: Some(sample_id),
                    kind: err.kind(),
                    message: err.to_string(),
                });
                Ok(unplaced)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use cellalloc_storage::{NewSample, StoreConfig};
    use chrono::{Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single().expect("timestamp") + Duration::minutes(minutes)
    }

    fn legacy_store() -> OccupancyStore {
        OccupancyStore::open_in_memory_with(StoreConfig::legacy()).expect("open store")
    }

    fn sample(store: &OccupancyStore, id: SampleId, cell: i64, strain: Option<i64>, minutes: i64) {
        store
            .insert_sample(&NewSample {
                id: Some(id),
                strain_id: strain,
                primary_cell: Some(cell),
                created_at: Some(at(minutes)),
                updated_at: Some(at(minutes)),
                ..NewSample::default()
            })
            .expect("sample");
    }

    fn resolver(config: ResolverConfig) -> DuplicateResolver<RecordingAuditSink> {
        DuplicateResolver::new(config, RecordingAuditSink::new())
    }

    #[test]
    fn strain_holder_keeps_shared_cell() {
        let mut store = legacy_store();
        store.ensure_cells("BOX1", 2, 2).expect("grid");
        let b2 = store.cell("BOX1", "B2").expect("cell").expect("row").id;
        sample(&store, 20, b2, Some(7), 5);
        sample(&store, 21, b2, None, 0);

        let resolver = resolver(ResolverConfig {
            execute: true,
            ..ResolverConfig::default()
        });
        let report = resolver.run(&mut store).expect("run");

        assert_eq!(report.groups_found, 1);
        assert_eq!(report.cleared, 1);
        assert_eq!(report.decisions[0].winner.sample_id, 20);
        assert!(report.decisions[0].applied);
        assert_eq!(
            store.sample(20).expect("sample").expect("row").primary_cell,
            Some(b2)
        );
        assert_eq!(store.sample(21).expect("sample").expect("row").primary_cell, None);

        let records = resolver.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_id, "21");
        assert_eq!(records[0].action, AuditAction::Update);
        assert_eq!(records[0].old_values["cell_id"], "B2");
        assert_eq!(records[0].batch_id, report.batch_id);
    }

    #[test]
    fn ranking_strategies_are_total_orders() {
        let early = Candidate {
            sample_id: 2,
            score: 0,
            has_strain: false,
            has_sample_number: false,
            created_at: at(0),
            updated_at: at(30),
        };
        let late = Candidate {
            sample_id: 1,
            score: 15,
            has_strain: true,
            has_sample_number: true,
            created_at: at(10),
            updated_at: at(10),
        };
        assert_eq!(rank(Prefer::WithStrain, &late, &early), Ordering::Less);
        assert_eq!(rank(Prefer::CreatedAt, &early, &late), Ordering::Less);
        assert_eq!(rank(Prefer::UpdatedAt, &early, &late), Ordering::Less);

        let twin = Candidate {
            sample_id: 3,
            ..early.clone()
        };
        assert_eq!(rank(Prefer::CreatedAt, &early, &twin), Ordering::Less);
    }

    #[test]
    fn dry_runs_are_repeatable_and_write_nothing() {
        let mut store = legacy_store();
        store.ensure_cells("BOX1", 1, 3).expect("grid");
        let a1 = store.cell("BOX1", "A1").expect("cell").expect("row").id;
        let a2 = store.cell("BOX1", "A2").expect("cell").expect("row").id;
        sample(&store, 1, a1, None, 3);
        sample(&store, 2, a1, None, 1);
        sample(&store, 3, a2, None, 0);
        sample(&store, 4, a2, None, 0);

        let config = ResolverConfig {
            prefer: Prefer::CreatedAt,
            reallocate: true,
            ..ResolverConfig::default()
        };
        let first = resolver(config.clone()).run(&mut store).expect("first");
        let second = resolver(config.clone()).run(&mut store).expect("second");
        assert!(first.dry_run);
        assert_eq!(first.plan_digest, second.plan_digest);
        assert_eq!(first.decisions, second.decisions);
        assert_eq!(first.decisions[0].winner.sample_id, 2);
        assert_eq!(first.decisions[1].winner.sample_id, 3);

        // only one free cell: the second loser is predicted unplaced
        assert_eq!(first.reallocated, 1);
        assert_eq!(first.unplaced, 1);
        assert_eq!(
            first.decisions[0].reallocations[0].cell_id.as_deref(),
            Some("A3")
        );
        assert_eq!(first.decisions[1].reallocations[0].cell_id, None);
        assert_eq!(store.shared_primary_groups().expect("groups").len(), 2);

        let executed = resolver(ResolverConfig {
            execute: true,
            ..config
        })
        .run(&mut store)
        .expect("execute");
        assert_eq!(executed.plan_digest, first.plan_digest);
        assert!(store.shared_primary_groups().expect("groups").is_empty());
    }

    #[test]
    fn limit_and_box_filter_bound_the_run() {
        let mut store = legacy_store();
        store.ensure_cells("BOX1", 1, 2).expect("grid");
        store.ensure_cells("BOX2", 1, 1).expect("grid");
        let a1 = store.cell("BOX1", "A1").expect("cell").expect("row").id;
        let a2 = store.cell("BOX1", "A2").expect("cell").expect("row").id;
        let other = store.cell("BOX2", "A1").expect("cell").expect("row").id;
        for (id, cell) in [(1, a1), (2, a1), (3, a2), (4, a2), (5, other), (6, other)] {
            sample(&store, id, cell, None, id);
        }

        let limited = resolver(ResolverConfig {
            execute: true,
            limit: Some(1),
            boxes: vec!["BOX1".to_string()],
            ..ResolverConfig::default()
        })
        .run(&mut store)
        .expect("run");
        assert_eq!(limited.groups_found, 2);
        assert_eq!(limited.groups_processed, 1);
        assert_eq!(limited.decisions[0].cell_id, "A1");

        let remaining = store.shared_primary_groups().expect("groups");
        let remaining = remaining
            .iter()
            .map(|group| (group.box_id.as_str(), group.cell_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(remaining, vec![("BOX1", "A2"), ("BOX2", "A1")]);
    }

    #[test]
    fn losers_move_to_other_boxes_with_fallback() {
        let mut store = legacy_store();
        store.ensure_cells("FULL", 1, 1).expect("grid");
        store.ensure_cells("SPARE", 1, 2).expect("grid");
        let shared = store.cell("FULL", "A1").expect("cell").expect("row").id;
        sample(&store, 30, shared, Some(1), 0);
        sample(&store, 31, shared, None, 1);
        sample(&store, 32, shared, None, 2);

        let resolver = resolver(ResolverConfig {
            execute: true,
            reallocate: true,
            fallback: Fallback::AnyBox,
            ..ResolverConfig::default()
        });
        let report = resolver.run(&mut store).expect("run");

        assert_eq!(report.cleared, 2);
        assert_eq!(report.reallocated, 2);
        assert_eq!(report.unplaced, 0);
        let targets = report.decisions[0]
            .reallocations
            .iter()
            .map(|reallocation| (reallocation.sample_id, reallocation.cell_id.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            targets,
            vec![(31, Some("A1".to_string())), (32, Some("A2".to_string()))]
        );
        let moved = store
            .sample_location(31)
            .expect("location")
            .expect("placed");
        assert_eq!(moved.box_id, "SPARE");
        assert_eq!(resolver.audit.len(), 4);
    }

    #[test]
    fn without_fallback_losers_stay_unplaced() {
        let mut store = legacy_store();
        store.ensure_cells("FULL", 1, 1).expect("grid");
        store.ensure_cells("SPARE", 1, 1).expect("grid");
        let shared = store.cell("FULL", "A1").expect("cell").expect("row").id;
        sample(&store, 40, shared, None, 0);
        sample(&store, 41, shared, None, 1);

        let report = resolver(ResolverConfig {
            execute: true,
            reallocate: true,
            ..ResolverConfig::default()
        })
        .run(&mut store)
        .expect("run");
        assert_eq!(report.unplaced, 1);
        assert!(store.sample_location(41).expect("location").is_none());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn lowercase_legacy_row_is_never_a_free_target() {
        let mut store = legacy_store();
        let upper = store.insert_cell_row("FULL", "A1").expect("row");
        store.insert_cell_row("FULL", "a1").expect("lowercase row");
        sample(&store, 30, upper, Some(4), 0);
        sample(&store, 31, upper, None, 1);

        let config = ResolverConfig {
            execute: true,
            reallocate: true,
            ..ResolverConfig::default()
        };
        let report = resolver(config.clone()).run(&mut store).expect("run");
        assert_eq!(report.decisions[0].winner.sample_id, 30);
        assert_eq!(report.reallocated, 0);
        assert_eq!(report.unplaced, 1);
        assert!(store.sample_location(31).expect("location").is_none());

        // a genuinely free position is still used, under its canonical name
        let mut store = legacy_store();
        let upper = store.insert_cell_row("FULL", "A1").expect("row");
        store.insert_cell_row("FULL", "a1").expect("lowercase row");
        store.insert_cell_row("FULL", "a2").expect("free lowercase row");
        sample(&store, 30, upper, Some(4), 0);
        sample(&store, 31, upper, None, 1);

        let report = resolver(config).run(&mut store).expect("run");
        assert_eq!(report.reallocated, 1);
        assert_eq!(
            report.decisions[0].reallocations[0].cell_id.as_deref(),
            Some("A2")
        );
        let winner = store.sample_location(30).expect("location").expect("placed");
        let loser = store.sample_location(31).expect("location").expect("placed");
        assert_ne!(
            winner.cell_id.to_uppercase(),
            loser.cell_id.to_uppercase()
        );
    }
}
