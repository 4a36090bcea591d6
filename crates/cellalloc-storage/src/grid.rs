use crate::{now_rfc3339, query_cells_in_box, StorageError};
use cellalloc_core::{grid_labels, CellLabel};
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

/// Inserts every absent label of a `rows x cols` grid; returns how many were created.
///
/// A position already carried by a legacy spelling (`a1`, `A01`) counts as present.
/// The existence check is also part of the insert, so it holds on the legacy schema
/// where `(box_id, cell_id)` carries no unique index for `INSERT OR IGNORE` to lean on.
pub(crate) fn insert_missing_cells(
    conn: &Connection,
    box_id: &str,
    rows: u32,
    cols: u32,
) -> Result<usize, StorageError> {
    let present = query_cells_in_box(conn, box_id)?
        .iter()
        .filter_map(|cell| CellLabel::parse(&cell.cell_id).ok())
        .collect::<BTreeSet<_>>();
    let created_at = now_rfc3339();
    let mut statement = conn.prepare_cached(
        "
        INSERT INTO storage_cells (box_id, cell_id, created_at)
        SELECT ?1, ?2, ?3
        WHERE NOT EXISTS (
            SELECT 1 FROM storage_cells WHERE box_id = ?1 AND cell_id = ?2
        )
        ",
    )?;

    let mut created = 0;
    for label in grid_labels(rows, cols).filter(|label| !present.contains(label)) {
        created += statement.execute(params![box_id, label.to_string(), created_at])?;
    }
    Ok(created)
}
