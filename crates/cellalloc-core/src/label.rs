//! Spreadsheet-style cell labels: letters select the row, digits the column.
//!
//! Rows use bijective base-26 (`1 -> A`, `26 -> Z`, `27 -> AA`), so there is no
//! zero digit and every positive row has exactly one spelling.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("row index must be at least 1")]
    ZeroRow,
    #[error("column index must be at least 1")]
    ZeroColumn,
    #[error("malformed cell label: {0:?}")]
    Malformed(String),
    #[error("cell label out of range: {0:?}")]
    Overflow(String),
}

fn label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([A-Za-z]+)([0-9]+)?$").expect("static label regex"))
}

/// Row letters for a 1-based row index.
pub fn row_label(row: u32) -> Result<String, LabelError> {
    if row == 0 {
        return Err(LabelError::ZeroRow);
    }
    Ok(row_letters(row))
}

fn row_letters(row: u32) -> String {
    let mut remaining = row;
    let mut letters = Vec::new();
    while remaining > 0 {
        remaining -= 1;
        letters.push(b'A' + (remaining % 26) as u8);
        remaining /= 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// 1-based row index encoded by the leading letters of `label`.
///
/// Accepts bare letters (`"AB"`) or a full label (`"AB12"`); case is ignored.
pub fn label_to_row(label: &str) -> Result<u32, LabelError> {
    let trimmed = label.trim();
    let captures = label_pattern()
        .captures(trimmed)
        .ok_or_else(|| LabelError::Malformed(label.to_string()))?;
    letters_to_row(&captures[1]).ok_or_else(|| LabelError::Overflow(label.to_string()))
}

fn letters_to_row(letters: &str) -> Option<u32> {
    letters.bytes().try_fold(0_u32, |acc, byte| {
        let digit = u32::from(byte.to_ascii_uppercase() - b'A') + 1;
        acc.checked_mul(26)?.checked_add(digit)
    })
}

/// A parsed `(row, col)` cell position. Ordering is row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellLabel {
    pub row: u32,
    pub col: u32,
}

impl CellLabel {
    pub fn new(row: u32, col: u32) -> Result<Self, LabelError> {
        if row == 0 {
            return Err(LabelError::ZeroRow);
        }
        if col == 0 {
            return Err(LabelError::ZeroColumn);
        }
        Ok(Self { row, col })
    }

    pub fn parse(label: &str) -> Result<Self, LabelError> {
        let trimmed = label.trim();
        let captures = label_pattern()
            .captures(trimmed)
            .ok_or_else(|| LabelError::Malformed(label.to_string()))?;
        let digits = captures
            .get(2)
            .ok_or_else(|| LabelError::Malformed(label.to_string()))?;
        let row = letters_to_row(&captures[1])
            .ok_or_else(|| LabelError::Overflow(label.to_string()))?;
        let col = digits
            .as_str()
            .parse::<u32>()
            .map_err(|_| LabelError::Overflow(label.to_string()))?;
        Self::new(row, col)
    }

    pub fn fits(&self, rows: u32, cols: u32) -> bool {
        self.row <= rows && self.col <= cols
    }
}

impl fmt::Display for CellLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", row_letters(self.row), self.col)
    }
}

impl FromStr for CellLabel {
    type Err = LabelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

/// Canonical spelling of a stored or requested label (`" a01 "` -> `"A1"`).
///
/// Labels that do not parse come back trimmed, so they still compare by text.
pub fn canonical_label(label: &str) -> String {
    CellLabel::parse(label)
        .map(|parsed| parsed.to_string())
        .unwrap_or_else(|_| label.trim().to_string())
}

/// Every label of a `rows x cols` grid in row-major order.
pub fn grid_labels(rows: u32, cols: u32) -> impl Iterator<Item = CellLabel> {
    (1..=rows).flat_map(move |row| (1..=cols).map(move |col| CellLabel { row, col }))
}
