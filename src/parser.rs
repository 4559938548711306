//! Row-level parsing of election result CSV rows.
//!
//! A row is looked up through a [`HeaderIndex`] built once from the header
//! record, so column order in the file does not matter and unknown columns are
//! ignored. Failures are reported per row; the caller decides what to do with
//! them.

use crate::models::{Category, ElectionRecord, Municipality, Party, PartyVotes, UnknownVariant};
use csv::StringRecord;
use rustc_hash::FxHashMap;
use std::fmt;
use thiserror::Error;

pub const COL_CATEGORY: &str = "Kategoria";
pub const COL_MUNICIPALITY: &str = "Komuna";
pub const COL_POLLING_CENTER: &str = "Qendra_e_votimit";
pub const COL_POLLING_PLACE: &str = "Vendvotimi";

/// Why a single row could not become an [`ElectionRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid value for field '{field}': {source}")]
    InvalidEnum {
        field: &'static str,
        #[source]
        source: UnknownVariant,
    },

    #[error("invalid vote count '{value}' for field '{field}': {reason}")]
    InvalidVotes {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// A row error pinned to its 1-based line number (the header is line 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub line: usize,
    pub error: RowError,
}

impl fmt::Display for RowFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.error)
    }
}

/// Column name to position, built from the (trimmed) header record.
#[derive(Debug, Clone, Default)]
pub struct HeaderIndex {
    positions: FxHashMap<String, usize>,
}

impl HeaderIndex {
    pub fn new(headers: &StringRecord) -> Self {
        let mut positions = FxHashMap::default();
        for (i, name) in headers.iter().enumerate() {
            // First occurrence wins for duplicated header names
            positions.entry(name.trim().to_string()).or_insert(i);
        }
        Self { positions }
    }

    /// Trimmed cell for `name`, or `None` when the column is absent or the row is short.
    pub fn field<'r>(&self, record: &'r StringRecord, name: &str) -> Option<&'r str> {
        self.positions
            .get(name)
            .and_then(|&i| record.get(i))
            .map(str::trim)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Columns the schema expects that the header does not carry.
    pub fn missing_columns(&self) -> Vec<&'static str> {
        [COL_CATEGORY, COL_MUNICIPALITY, COL_POLLING_CENTER, COL_POLLING_PLACE]
            .into_iter()
            .chain(Party::ALL.iter().map(|p| p.as_str()))
            .filter(|name| !self.contains(name))
            .collect()
    }
}

/// Turn one header-mapped row into a record.
///
/// `Kategoria` and `Komuna` must be present and name a valid member. Party
/// columns default to 0 when absent or blank, and otherwise must parse as a
/// non-negative 32-bit integer. Text columns are trimmed and default to "".
pub fn parse_row(headers: &HeaderIndex, record: &StringRecord) -> Result<ElectionRecord, RowError> {
    let category: Category = parse_enum(headers, record, COL_CATEGORY)?;
    let municipality: Municipality = parse_enum(headers, record, COL_MUNICIPALITY)?;

    let mut votes = PartyVotes::default();
    for party in Party::ALL {
        votes.set(*party, parse_votes(headers, record, *party)?);
    }

    Ok(ElectionRecord {
        category,
        municipality,
        polling_center: text_field(headers, record, COL_POLLING_CENTER),
        polling_place: text_field(headers, record, COL_POLLING_PLACE),
        votes,
    })
}

fn parse_enum<T>(headers: &HeaderIndex, record: &StringRecord, field: &'static str) -> Result<T, RowError>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    match headers.field(record, field) {
        None | Some("") => Err(RowError::MissingField(field)),
        Some(raw) => raw
            .parse()
            .map_err(|source| RowError::InvalidEnum { field, source }),
    }
}

fn parse_votes(headers: &HeaderIndex, record: &StringRecord, party: Party) -> Result<u32, RowError> {
    match headers.field(record, party.as_str()) {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse::<u32>().map_err(|e| RowError::InvalidVotes {
            field: party.as_str(),
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn text_field(headers: &HeaderIndex, record: &StringRecord, field: &str) -> String {
    headers
        .field(record, field)
        .map(str::to_string)
        .unwrap_or_default()
}
