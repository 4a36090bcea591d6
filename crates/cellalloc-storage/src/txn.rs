//! Explicit row locking on top of SQLite write transactions.
//!
//! Every transaction is opened with `BEGIN IMMEDIATE`, so writers are already
//! serialized by the time a row is touched. The row "locks" bump `lock_version`
//! before reading, which mirrors `SELECT ... FOR UPDATE` and keeps the
//! acquisition order visible. Cells must be locked before samples.

use crate::{
    grid, now_rfc3339, query_allocations_for_sample, query_box, query_cell, query_cell_by_id,
    query_cell_occupancy, query_free_cells, query_sample, query_sample_location, read_allocation,
    upsert_box_row, AllocationRow, BoxRow, CellOccupancy, CellRow, SampleRow, StorageError,
    ALLOCATION_COLUMNS,
};
use cellalloc_core::SampleId;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockedRow {
    Cell { id: i64, box_id: String, cell_id: String },
    Sample(SampleId),
}

pub struct LockedTxn<'conn> {
    tx: Transaction<'conn>,
    trace: Vec<LockedRow>,
    first_sample: Option<SampleId>,
}

impl<'conn> LockedTxn<'conn> {
    pub(crate) fn new(tx: Transaction<'conn>) -> Self {
        Self {
            tx,
            trace: Vec::new(),
            first_sample: None,
        }
    }

    /// Locks the oldest row carrying the position `cell_id` names (any spelling);
    /// `None` when the cell does not exist.
    pub fn lock_cell(&mut self, box_id: &str, cell_id: &str) -> Result<Option<CellRow>, StorageError> {
        self.check_cell_order(&format!("{box_id}/{cell_id}"))?;
        let Some(cell) = query_cell(&self.tx, box_id, cell_id)? else {
            return Ok(None);
        };
        self.touch_cell(cell)
    }

    pub fn lock_cell_by_id(&mut self, id: i64) -> Result<Option<CellRow>, StorageError> {
        self.check_cell_order(&format!("#{id}"))?;
        let Some(cell) = query_cell_by_id(&self.tx, id)? else {
            return Ok(None);
        };
        self.touch_cell(cell)
    }

    pub fn lock_sample(&mut self, sample_id: SampleId) -> Result<Option<SampleRow>, StorageError> {
        let touched = self.tx.execute(
            "UPDATE samples SET lock_version = lock_version + 1 WHERE id = ?1",
            [sample_id],
        )?;
        if touched == 0 {
            return Ok(None);
        }
        self.first_sample.get_or_insert(sample_id);
        self.trace.push(LockedRow::Sample(sample_id));
        query_sample(&self.tx, sample_id)
    }

    fn check_cell_order(&self, requested: &str) -> Result<(), StorageError> {
        match self.first_sample {
            Some(held) => Err(StorageError::LockOrderViolation {
                requested: requested.to_string(),
                held,
            }),
            None => Ok(()),
        }
    }

    fn touch_cell(&mut self, cell: CellRow) -> Result<Option<CellRow>, StorageError> {
        self.tx.execute(
            "UPDATE storage_cells SET lock_version = lock_version + 1 WHERE id = ?1",
            [cell.id],
        )?;
        self.trace.push(LockedRow::Cell {
            id: cell.id,
            box_id: cell.box_id.clone(),
            cell_id: cell.cell_id.clone(),
        });
        Ok(Some(cell))
    }

    pub fn lock_trace(&self) -> &[LockedRow] {
        &self.trace
    }

    pub fn commit(self) -> Result<Vec<LockedRow>, StorageError> {
        self.tx.commit()?;
        Ok(self.trace)
    }

    pub fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback()?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.tx
    }

    pub fn cell_occupancy(&self, box_id: &str, cell_id: &str) -> Result<CellOccupancy, StorageError> {
        query_cell_occupancy(&self.tx, box_id, cell_id)
    }

    pub fn sample_location(&self, sample_id: SampleId) -> Result<Option<CellRow>, StorageError> {
        query_sample_location(&self.tx, sample_id)
    }

    pub fn allocations_for_sample(
        &self,
        sample_id: SampleId,
    ) -> Result<Vec<AllocationRow>, StorageError> {
        query_allocations_for_sample(&self.tx, sample_id)
    }

    pub fn free_cells(&self, box_id: Option<&str>) -> Result<Vec<CellRow>, StorageError> {
        query_free_cells(&self.tx, box_id)
    }

    pub fn storage_box(&self, box_id: &str) -> Result<Option<BoxRow>, StorageError> {
        query_box(&self.tx, box_id)
    }

    pub fn set_primary_cell(
        &self,
        sample_id: SampleId,
        cell: Option<i64>,
    ) -> Result<(), StorageError> {
        self.tx.execute(
            "UPDATE samples SET primary_cell = ?1, updated_at = ?2 WHERE id = ?3",
            params![cell, now_rfc3339(), sample_id],
        )?;
        Ok(())
    }

    pub fn insert_allocation(
        &self,
        sample_id: SampleId,
        cell: i64,
        is_primary: bool,
    ) -> Result<i64, StorageError> {
        self.tx.execute(
            "
            INSERT INTO allocations (sample_id, cell, is_primary, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![sample_id, cell, i64::from(is_primary), now_rfc3339()],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    pub fn set_allocation_primary(&self, allocation_id: i64, is_primary: bool) -> Result<(), StorageError> {
        self.tx.execute(
            "UPDATE allocations SET is_primary = ?1 WHERE id = ?2",
            params![i64::from(is_primary), allocation_id],
        )?;
        Ok(())
    }

    /// Clears the primary flag on every allocation of the sample; returns how many changed.
    pub fn demote_primary_allocations(&self, sample_id: SampleId) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            "UPDATE allocations SET is_primary = 0 WHERE sample_id = ?1 AND is_primary = 1",
            [sample_id],
        )?)
    }

    pub fn delete_allocation(&self, allocation_id: i64) -> Result<(), StorageError> {
        self.tx
            .execute("DELETE FROM allocations WHERE id = ?1", [allocation_id])?;
        Ok(())
    }

    pub fn upsert_box(
        &self,
        box_id: &str,
        rows: u32,
        cols: u32,
        description: &str,
    ) -> Result<(), StorageError> {
        upsert_box_row(&self.tx, box_id, rows, cols, description)
    }

    pub fn ensure_cells(&self, box_id: &str, rows: u32, cols: u32) -> Result<usize, StorageError> {
        grid::insert_missing_cells(&self.tx, box_id, rows, cols)
    }

    /// Moves sample references from a duplicate cell row onto the row being kept.
    pub fn repoint_primary_refs(&self, from_cell: i64, to_cell: i64) -> Result<usize, StorageError> {
        Ok(self.tx.execute(
            "UPDATE samples SET primary_cell = ?1, updated_at = ?2 WHERE primary_cell = ?3",
            params![to_cell, now_rfc3339(), from_cell],
        )?)
    }

    /// Moves the allocation on `from_cell` onto `to_cell` unless `to_cell` already
    /// has one. Returns the allocation that could not move (still on `from_cell`).
    pub fn repoint_allocation(
        &self,
        from_cell: i64,
        to_cell: i64,
    ) -> Result<Option<AllocationRow>, StorageError> {
        let occupied: bool = self.tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM allocations WHERE cell = ?1)",
            [to_cell],
            |row| row.get(0),
        )?;
        let stranded = self.allocation_on_cell(from_cell)?;
        if stranded.is_none() {
            return Ok(None);
        }
        if occupied {
            return Ok(stranded);
        }
        self.tx.execute(
            "UPDATE allocations SET cell = ?1 WHERE cell = ?2",
            params![to_cell, from_cell],
        )?;
        Ok(None)
    }

    fn allocation_on_cell(&self, cell: i64) -> Result<Option<AllocationRow>, StorageError> {
        let sql = format!(
            "
            SELECT {ALLOCATION_COLUMNS}
            FROM allocations a
            JOIN storage_cells c ON c.id = a.cell
            WHERE a.cell = ?1
            "
        );
        Ok(self
            .tx
            .query_row(&sql, [cell], read_allocation)
            .optional()?)
    }

    /// Rewrites a row's label text, e.g. a legacy `a1` to `A1`.
    pub fn rename_cell(&self, cell: i64, cell_id: &str) -> Result<(), StorageError> {
        self.tx.execute(
            "UPDATE storage_cells SET cell_id = ?1 WHERE id = ?2",
            params![cell_id, cell],
        )?;
        Ok(())
    }

    pub fn delete_cell_row(&self, cell: i64) -> Result<(), StorageError> {
        self.tx
            .execute("DELETE FROM storage_cells WHERE id = ?1", [cell])?;
        Ok(())
    }
}
