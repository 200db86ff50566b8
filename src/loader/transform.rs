//! Source row normalization onto the canonical trip schema.

use serde_json::Value;

use crate::loader::source::RawRow;
use crate::schema::{CANONICAL_FIELDS, CanonicalField, FieldError, NewTrip, coerce};

/// A row that could not be normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    /// Position of the row in the source file, zero-based.
    pub row: usize,
    pub error: FieldError,
}

/// The normalized contents of one chunk.
#[derive(Debug, Default)]
pub struct NormalizedChunk {
    pub trips: Vec<NewTrip>,
    pub rejected: Vec<RowRejection>,
}

/// Find the source value for `field`: exact alias match first, then an ASCII
/// case-insensitive match.
fn lookup<'a>(row: &'a RawRow, field: &CanonicalField) -> Option<&'a Value> {
    field
        .aliases
        .iter()
        .find_map(|alias| row.get(*alias))
        .or_else(|| {
            row.iter()
                .find(|(key, _)| field.aliases.iter().any(|a| a.eq_ignore_ascii_case(key)))
                .map(|(_, value)| value)
        })
}

/// Map one source row onto a [`NewTrip`].
///
/// Absent and null fields keep their defaults and non-canonical columns are
/// ignored. A present value that cannot be coerced rejects the row.
pub fn normalize_row(row: &RawRow) -> Result<NewTrip, FieldError> {
    let mut trip = NewTrip::default();
    for field in &CANONICAL_FIELDS {
        let Some(raw) = lookup(row, field) else {
            continue;
        };
        if let Some(value) = coerce(field, raw)? {
            let applied = trip.set(field.name, value);
            debug_assert!(applied, "coerced kind must match {}", field.name);
        }
    }
    Ok(trip)
}

/// Normalize a chunk whose first row sits at `first_row` in the source.
pub fn normalize_chunk(rows: &[RawRow], first_row: usize) -> NormalizedChunk {
    let mut chunk = NormalizedChunk {
        trips: Vec::with_capacity(rows.len()),
        rejected: Vec::new(),
    };
    for (offset, row) in rows.iter().enumerate() {
        match normalize_row(row) {
            Ok(trip) => chunk.trips.push(trip),
            Err(error) => chunk.rejected.push(RowRejection {
                row: first_row + offset,
                error,
            }),
        }
    }
    chunk
}
