use cellalloc_core::{canonical_label, CellLabel, SampleId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

mod grid;
mod txn;

pub use txn::{LockedRow, LockedTxn};

pub const CELL_SCHEMA_VERSION: i64 = 2;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("lock wait failed: {0}")]
    LockTimeout(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("lock order violation: cell {requested} requested after sample {held} was locked")]
    LockOrderViolation { requested: String, held: SampleId },
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error(
        "uniqueness constraints blocked: {duplicate_cells} duplicated cell labels, {shared_primaries} cells shared as primary"
    )]
    ConstraintsBlocked {
        duplicate_cells: i64,
        shared_primaries: i64,
    },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return StorageError::LockTimeout(detail);
                }
                ErrorCode::ConstraintViolation => return StorageError::Constraint(detail),
                _ => {}
            }
        }
        StorageError::Sqlite(err)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a connection waits on another writer before `LockTimeout`.
    pub busy_timeout: Duration,
    /// Advance to the schema with uniqueness indexes when the data allows it.
    pub enforce_constraints: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            enforce_constraints: true,
        }
    }
}

impl StoreConfig {
    /// Legacy layout: duplicate cell rows and shared primaries are accepted.
    pub fn legacy() -> Self {
        Self {
            enforce_constraints: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoxRow {
    pub box_id: String,
    pub rows: u32,
    pub cols: u32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellRow {
    pub id: i64,
    pub box_id: String,
    pub cell_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleRow {
    pub id: SampleId,
    pub strain_id: Option<i64>,
    pub sample_number: Option<String>,
    pub primary_cell: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationRow {
    pub id: i64,
    pub sample_id: SampleId,
    pub cell: i64,
    pub box_id: String,
    pub cell_id: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Who claims a cell label, across every physical row carrying that label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellOccupancy {
    pub primary_holders: Vec<SampleId>,
    pub allocation: Option<AllocationRow>,
}

impl CellOccupancy {
    pub fn is_free(&self) -> bool {
        self.primary_holders.is_empty() && self.allocation.is_none()
    }

    /// A sample holding the cell through its primary reference only.
    pub fn legacy_holder(&self) -> Option<SampleId> {
        let allocated = self.allocation.as_ref().map(|allocation| allocation.sample_id);
        self.primary_holders
            .iter()
            .copied()
            .find(|holder| Some(*holder) != allocated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateCellGroup {
    pub box_id: String,
    pub cell_id: String,
    /// Physical rows carrying the label, oldest first.
    pub row_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedPrimaryGroup {
    pub box_id: String,
    pub cell_id: String,
    pub sample_ids: Vec<SampleId>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSample {
    pub id: Option<SampleId>,
    pub strain_id: Option<i64>,
    pub sample_number: Option<String>,
    pub primary_cell: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct OccupancyStore {
    conn: Connection,
    config: StoreConfig,
}

impl OccupancyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path, StoreConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(config.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(event = "store_open", journal_mode = %mode);
        Self::init(conn, config)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with(StoreConfig::default())
    }

    pub fn open_in_memory_with(config: StoreConfig) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: StoreConfig) -> Result<Self, StorageError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn, config };
        store.migrate()?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CELL_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CELL_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_cell_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        if self.config.enforce_constraints {
            match self.enforce_constraints() {
                Ok(()) => {}
                Err(StorageError::ConstraintsBlocked {
                    duplicate_cells,
                    shared_primaries,
                }) => {
                    warn!(
                        event = "constraints_deferred",
                        duplicate_cells, shared_primaries
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    pub fn constraints_enforced(&self) -> Result<bool, StorageError> {
        Ok(self.schema_version()? >= 2)
    }

    /// Installs the uniqueness indexes once legacy duplicates have been repaired.
    pub fn enforce_constraints(&self) -> Result<(), StorageError> {
        if self.constraints_enforced()? {
            return Ok(());
        }

        let duplicate_cells = count_duplicate_labels(&self.conn)?;
        let shared_primaries = count_shared_primaries(&self.conn)?;
        if duplicate_cells > 0 || shared_primaries > 0 {
            return Err(StorageError::ConstraintsBlocked {
                duplicate_cells,
                shared_primaries,
            });
        }

        let sql = include_str!("../migrations/0002_occupancy_uniqueness.sql");
        self.conn.execute_batch(sql)?;
        self.conn
            .execute("PRAGMA user_version = 2", [])
            .map(|_| ())?;
        Ok(())
    }

    /// Starts a write transaction that takes the database write lock up front.
    pub fn begin(&mut self) -> Result<LockedTxn<'_>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(LockedTxn::new(tx))
    }

    /// Grid Generator: creates the missing cells of a `rows x cols` box.
    pub fn ensure_cells(&mut self, box_id: &str, rows: u32, cols: u32) -> Result<usize, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created = grid::insert_missing_cells(&tx, box_id, rows, cols)?;
        tx.commit()?;
        debug!(event = "cells_ensured", box_id, rows, cols, created);
        Ok(created)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Every box known through metadata or through at least one cell row.
    pub fn box_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT box_id FROM storage_boxes
            UNION
            SELECT box_id FROM storage_cells
            ORDER BY box_id ASC
            ",
        )?;
        let rows = statement.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn storage_box(&self, box_id: &str) -> Result<Option<BoxRow>, StorageError> {
        query_box(&self.conn, box_id)
    }

    pub fn cells_in_box(&self, box_id: &str) -> Result<Vec<CellRow>, StorageError> {
        query_cells_in_box(&self.conn, box_id)
    }

    pub fn cell(&self, box_id: &str, cell_id: &str) -> Result<Option<CellRow>, StorageError> {
        query_cell(&self.conn, box_id, cell_id)
    }

    pub fn cell_count(&self, box_id: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM storage_cells WHERE box_id = ?1",
            [box_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn sample(&self, sample_id: SampleId) -> Result<Option<SampleRow>, StorageError> {
        query_sample(&self.conn, sample_id)
    }

    pub fn sample_location(&self, sample_id: SampleId) -> Result<Option<CellRow>, StorageError> {
        query_sample_location(&self.conn, sample_id)
    }

    pub fn allocations_for_sample(
        &self,
        sample_id: SampleId,
    ) -> Result<Vec<AllocationRow>, StorageError> {
        query_allocations_for_sample(&self.conn, sample_id)
    }

    pub fn cell_occupancy(&self, box_id: &str, cell_id: &str) -> Result<CellOccupancy, StorageError> {
        query_cell_occupancy(&self.conn, box_id, cell_id)
    }

    pub fn duplicate_cells(&self, box_id: Option<&str>) -> Result<Vec<DuplicateCellGroup>, StorageError> {
        query_duplicate_cells(&self.conn, box_id)
    }

    pub fn shared_primary_groups(&self) -> Result<Vec<SharedPrimaryGroup>, StorageError> {
        query_shared_primary_groups(&self.conn)
    }

    /// Free cells in natural `(box, row, col)` order, one row per label.
    pub fn free_cells(&self, box_id: Option<&str>) -> Result<Vec<CellRow>, StorageError> {
        query_free_cells(&self.conn, box_id)
    }

    pub fn upsert_box(
        &self,
        box_id: &str,
        rows: u32,
        cols: u32,
        description: &str,
    ) -> Result<(), StorageError> {
        upsert_box_row(&self.conn, box_id, rows, cols, description)
    }

    /// Raw cell insert without duplicate checks, for seeding legacy layouts.
    pub fn insert_cell_row(&self, box_id: &str, cell_id: &str) -> Result<i64, StorageError> {
        self.conn.execute(
            "INSERT INTO storage_cells (box_id, cell_id, created_at) VALUES (?1, ?2, ?3)",
            params![box_id, cell_id, now_rfc3339()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Raw sample insert; the primary reference is written as given.
    pub fn insert_sample(&self, sample: &NewSample) -> Result<SampleId, StorageError> {
        let created_at = sample.created_at.unwrap_or_else(Utc::now);
        let updated_at = sample.updated_at.unwrap_or(created_at);
        self.conn.execute(
            "
            INSERT INTO samples (id, strain_id, sample_number, primary_cell, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                sample.id,
                sample.strain_id,
                sample.sample_number,
                sample.primary_cell,
                format_timestamp(created_at),
                format_timestamp(updated_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

pub(crate) fn now_rfc3339() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(index)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn count_column(row: &Row<'_>, index: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(index)?;
    u32::try_from(value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Integer,
            Box::new(err),
        )
    })
}

const CELL_COLUMNS: &str = "c.id, c.box_id, c.cell_id, c.created_at";
const SAMPLE_COLUMNS: &str =
    "s.id, s.strain_id, s.sample_number, s.primary_cell, s.created_at, s.updated_at";
const ALLOCATION_COLUMNS: &str =
    "a.id, a.sample_id, a.cell, c.box_id, c.cell_id, a.is_primary, a.created_at";

fn read_cell(row: &Row<'_>) -> rusqlite::Result<CellRow> {
    Ok(CellRow {
        id: row.get(0)?,
        box_id: row.get(1)?,
        cell_id: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
    })
}

fn read_sample(row: &Row<'_>) -> rusqlite::Result<SampleRow> {
    Ok(SampleRow {
        id: row.get(0)?,
        strain_id: row.get(1)?,
        sample_number: row.get(2)?,
        primary_cell: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        updated_at: timestamp_column(row, 5)?,
    })
}

fn read_allocation(row: &Row<'_>) -> rusqlite::Result<AllocationRow> {
    Ok(AllocationRow {
        id: row.get(0)?,
        sample_id: row.get(1)?,
        cell: row.get(2)?,
        box_id: row.get(3)?,
        cell_id: row.get(4)?,
        is_primary: row.get::<_, i64>(5)? != 0,
        created_at: timestamp_column(row, 6)?,
    })
}

pub(crate) fn query_box(conn: &Connection, box_id: &str) -> Result<Option<BoxRow>, StorageError> {
    let row = conn
        .query_row(
            "
            SELECT box_id, row_count, col_count, description
            FROM storage_boxes
            WHERE box_id = ?1
            ",
            [box_id],
            |row| {
                Ok(BoxRow {
                    box_id: row.get(0)?,
                    rows: count_column(row, 1)?,
                    cols: count_column(row, 2)?,
                    description: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn upsert_box_row(
    conn: &Connection,
    box_id: &str,
    rows: u32,
    cols: u32,
    description: &str,
) -> Result<(), StorageError> {
    let now = now_rfc3339();
    conn.execute(
        "
        INSERT INTO storage_boxes (box_id, row_count, col_count, description, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        ON CONFLICT(box_id) DO UPDATE SET
            row_count=excluded.row_count,
            col_count=excluded.col_count,
            description=excluded.description,
            updated_at=excluded.updated_at
        ",
        params![box_id, i64::from(rows), i64::from(cols), description, now],
    )?;
    Ok(())
}

/// Oldest row of the box whose label names the same position as `cell_id`.
pub(crate) fn query_cell(
    conn: &Connection,
    box_id: &str,
    cell_id: &str,
) -> Result<Option<CellRow>, StorageError> {
    let wanted = canonical_label(cell_id);
    Ok(query_cells_in_box(conn, box_id)?
        .into_iter()
        .find(|cell| canonical_label(&cell.cell_id) == wanted))
}

pub(crate) fn query_cell_by_id(conn: &Connection, id: i64) -> Result<Option<CellRow>, StorageError> {
    let sql = format!("SELECT {CELL_COLUMNS} FROM storage_cells c WHERE c.id = ?1");
    Ok(conn.query_row(&sql, [id], read_cell).optional()?)
}

pub(crate) fn query_cells_in_box(conn: &Connection, box_id: &str) -> Result<Vec<CellRow>, StorageError> {
    let sql = format!(
        "
        SELECT {CELL_COLUMNS}
        FROM storage_cells c
        WHERE c.box_id = ?1
        ORDER BY c.id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([box_id], read_cell)?;
    let mut cells = Vec::new();
    for row in rows {
        cells.push(row?);
    }
    Ok(cells)
}

fn query_cells(conn: &Connection, box_id: Option<&str>) -> Result<Vec<CellRow>, StorageError> {
    let sql = format!(
        "
        SELECT {CELL_COLUMNS}
        FROM storage_cells c
        WHERE (?1 IS NULL OR c.box_id = ?1)
        ORDER BY c.box_id ASC, c.id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([box_id], read_cell)?;
    let mut cells = Vec::new();
    for row in rows {
        cells.push(row?);
    }
    Ok(cells)
}

pub(crate) fn query_sample(
    conn: &Connection,
    sample_id: SampleId,
) -> Result<Option<SampleRow>, StorageError> {
    let sql = format!("SELECT {SAMPLE_COLUMNS} FROM samples s WHERE s.id = ?1");
    Ok(conn.query_row(&sql, [sample_id], read_sample).optional()?)
}

pub(crate) fn query_sample_location(
    conn: &Connection,
    sample_id: SampleId,
) -> Result<Option<CellRow>, StorageError> {
    let sql = format!(
        "
        SELECT {CELL_COLUMNS}
        FROM samples s
        JOIN storage_cells c ON c.id = s.primary_cell
        WHERE s.id = ?1
        "
    );
    Ok(conn.query_row(&sql, [sample_id], read_cell).optional()?)
}

pub(crate) fn query_allocations_for_sample(
    conn: &Connection,
    sample_id: SampleId,
) -> Result<Vec<AllocationRow>, StorageError> {
    let sql = format!(
        "
        SELECT {ALLOCATION_COLUMNS}
        FROM allocations a
        JOIN storage_cells c ON c.id = a.cell
        WHERE a.sample_id = ?1
        ORDER BY a.id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([sample_id], read_allocation)?;
    let mut allocations = Vec::new();
    for row in rows {
        allocations.push(row?);
    }
    Ok(allocations)
}

/// Occupancy of a label, matched by position so `a1` and `A1` are one cell.
pub(crate) fn query_cell_occupancy(
    conn: &Connection,
    box_id: &str,
    cell_id: &str,
) -> Result<CellOccupancy, StorageError> {
    let wanted = canonical_label(cell_id);
    let mut statement = conn.prepare(
        "
        SELECT s.id, c.cell_id
        FROM samples s
        JOIN storage_cells c ON c.id = s.primary_cell
        WHERE c.box_id = ?1
        ORDER BY s.id ASC
        ",
    )?;
    let rows = statement.query_map([box_id], |row| {
        Ok((row.get::<_, SampleId>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut primary_holders = Vec::new();
    for row in rows {
        let (sample_id, label) = row?;
        if canonical_label(&label) == wanted {
            primary_holders.push(sample_id);
        }
    }

    let sql = format!(
        "
        SELECT {ALLOCATION_COLUMNS}
        FROM allocations a
        JOIN storage_cells c ON c.id = a.cell
        WHERE c.box_id = ?1
        ORDER BY a.id ASC
        "
    );
    let mut statement = conn.prepare(&sql)?;
    let rows = statement.query_map([box_id], read_allocation)?;
    let mut allocation = None;
    for row in rows {
        let candidate = row?;
        if canonical_label(&candidate.cell_id) == wanted {
            allocation = Some(candidate);
            break;
        }
    }

    Ok(CellOccupancy {
        primary_holders,
        allocation,
    })
}

type LabelKey = (String, Option<CellLabel>, String);

fn label_key(box_id: &str, cell_id: &str) -> LabelKey {
    (
        box_id.to_string(),
        label_order(cell_id),
        canonical_label(cell_id),
    )
}

/// Labels carried by more than one row, grouped by position rather than spelling.
pub(crate) fn query_duplicate_cells(
    conn: &Connection,
    box_id: Option<&str>,
) -> Result<Vec<DuplicateCellGroup>, StorageError> {
    let mut by_label: BTreeMap<LabelKey, Vec<i64>> = BTreeMap::new();
    for cell in query_cells(conn, box_id)? {
        by_label
            .entry(label_key(&cell.box_id, &cell.cell_id))
            .or_default()
            .push(cell.id);
    }

    Ok(by_label
        .into_iter()
        .filter(|(_, row_ids)| row_ids.len() > 1)
        .map(|((box_id, _, cell_id), row_ids)| DuplicateCellGroup {
            box_id,
            cell_id,
            row_ids,
        })
        .collect())
}

pub(crate) fn query_shared_primary_groups(
    conn: &Connection,
) -> Result<Vec<SharedPrimaryGroup>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT c.box_id, c.cell_id, s.id
        FROM samples s
        JOIN storage_cells c ON c.id = s.primary_cell
        ORDER BY s.id ASC
        ",
    )?;
    let rows = statement.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, SampleId>(2)?,
        ))
    })?;

    let mut by_label: BTreeMap<LabelKey, Vec<SampleId>> = BTreeMap::new();
    for row in rows {
        let (box_id, cell_id, sample_id) = row?;
        by_label
            .entry(label_key(&box_id, &cell_id))
            .or_default()
            .push(sample_id);
    }

    Ok(by_label
        .into_iter()
        .filter(|(_, sample_ids)| sample_ids.len() > 1)
        .map(|((box_id, _, cell_id), sample_ids)| SharedPrimaryGroup {
            box_id,
            cell_id,
            sample_ids,
        })
        .collect())
}

fn occupied_labels(
    conn: &Connection,
    box_id: Option<&str>,
) -> Result<BTreeSet<(String, String)>, StorageError> {
    let mut statement = conn.prepare(
        "
        SELECT c.box_id, c.cell_id
        FROM samples s
        JOIN storage_cells c ON c.id = s.primary_cell
        WHERE (?1 IS NULL OR c.box_id = ?1)
        UNION ALL
        SELECT c.box_id, c.cell_id
        FROM allocations a
        JOIN storage_cells c ON c.id = a.cell
        WHERE (?1 IS NULL OR c.box_id = ?1)
        ",
    )?;
    let rows = statement.query_map([box_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut occupied = BTreeSet::new();
    for row in rows {
        let (box_id, cell_id) = row?;
        occupied.insert((box_id, canonical_label(&cell_id)));
    }
    Ok(occupied)
}

/// Rows whose label parses and whose position nobody holds, oldest row per position.
pub(crate) fn query_free_cells(
    conn: &Connection,
    box_id: Option<&str>,
) -> Result<Vec<CellRow>, StorageError> {
    let occupied = occupied_labels(conn, box_id)?;
    let mut by_label: BTreeMap<(String, CellLabel), CellRow> = BTreeMap::new();
    for cell in query_cells(conn, box_id)? {
        let Ok(label) = CellLabel::parse(&cell.cell_id) else {
            continue;
        };
        if occupied.contains(&(cell.box_id.clone(), label.to_string())) {
            continue;
        }
        by_label.entry((cell.box_id.clone(), label)).or_insert(cell);
    }
    Ok(by_label.into_values().collect())
}

fn label_order(cell_id: &str) -> Option<CellLabel> {
    CellLabel::parse(cell_id).ok()
}

fn count_duplicate_labels(conn: &Connection) -> Result<i64, StorageError> {
    Ok(query_duplicate_cells(conn, None)?.len() as i64)
}

fn count_shared_primaries(conn: &Connection) -> Result<i64, StorageError> {
    Ok(query_shared_primary_groups(conn)?.len() as i64)
}
