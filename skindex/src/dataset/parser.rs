//! Record parsing and field cleansing.
//!
//! Text and numeric values are normalized aggressively so that query terms
//! match indexed terms: symbols become spaces, everything lowercases,
//! leading zeros and ordinal suffixes are stripped, and `_null`, empty and
//! zero numerics collapse into one equivalence class represented by `"0"`
//! (an indexed zero is therefore indistinguishable from an absent value).

use crate::errors::{IndexError, IndexResult};

use super::schema::Schema;

const NULL_CONSTANT: &str = "_null";

/// One parsed data row.
#[derive(Debug, Clone)]
pub struct Record {
    data: String,
    reference: u64,
    lat: f64,
    lon: f64,
    text_values: Option<Vec<String>>,
    numeric_values: Option<Vec<f64>>,
}

impl Record {
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Byte offset of the row in the data file.
    pub fn reference(&self) -> u64 {
        self.reference
    }

    pub fn set_reference(&mut self, reference: u64) {
        self.reference = reference;
    }

    pub fn latitude(&self) -> f64 {
        self.lat
    }

    pub fn longitude(&self) -> f64 {
        self.lon
    }

    /// Cleansed text field values, in schema text-field order.
    pub fn text_values(&self) -> Option<&[String]> {
        self.text_values.as_deref()
    }

    /// Numeric field values in schema number-field order; unparsable fields
    /// are NaN, zero stands for zero/empty/null alike.
    pub fn numeric_values(&self) -> Option<&[f64]> {
        self.numeric_values.as_deref()
    }
}

pub struct RecordParser {
    lat_field_index: usize,
    lon_field_index: usize,
    text_field_indexes: Vec<usize>,
    number_field_indexes: Vec<usize>,
    field_count: usize,
}

impl RecordParser {
    pub fn new(schema: &Schema) -> Self {
        Self {
            lat_field_index: schema.latitude_field_index(),
            lon_field_index: schema.longitude_field_index(),
            text_field_indexes: schema.text_field_indexes().to_vec(),
            number_field_indexes: schema.number_field_indexes().to_vec(),
            field_count: schema.field_count(),
        }
    }

    /// Parses one tab-delimited row. Field-count mismatches and unparsable
    /// or out-of-range coordinates are malformed; callers skip and log.
    pub fn parse(
        &self,
        line: &str,
        parse_text_fields: bool,
        parse_numeric_fields: bool,
    ) -> IndexResult<Record> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != self.field_count {
            return Err(IndexError::MalformedRecord(format!(
                "field mismatch: found {} fields, expected {}",
                fields.len(),
                self.field_count
            )));
        }

        let lat: f64 = fields[self.lat_field_index].parse().map_err(|_| {
            IndexError::MalformedRecord(format!(
                "invalid latitude '{}'",
                fields[self.lat_field_index]
            ))
        })?;
        let lon: f64 = fields[self.lon_field_index].parse().map_err(|_| {
            IndexError::MalformedRecord(format!(
                "invalid longitude '{}'",
                fields[self.lon_field_index]
            ))
        })?;

        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(IndexError::MalformedRecord(format!(
                "coordinates out of range: lat={lat}, lon={lon}"
            )));
        }

        let text_values = parse_text_fields.then(|| {
            self.text_field_indexes
                .iter()
                .map(|&i| cleanse_text_field(fields[i]))
                .collect()
        });

        let numeric_values = parse_numeric_fields.then(|| {
            self.number_field_indexes
                .iter()
                .map(|&i| parse_numeric_field(fields[i]))
                .collect()
        });

        Ok(Record {
            data: line.to_owned(),
            reference: 0,
            lat,
            lon,
            text_values,
            numeric_values,
        })
    }
}

fn parse_numeric_field(raw: &str) -> f64 {
    match cleanse_numeric_field(raw).parse::<f64>() {
        // Zeros are not indexed; keep the slot at the zero/empty/null class.
        Ok(v) if v != 0.0 => v,
        Ok(_) => 0.0,
        Err(_) => f64::NAN,
    }
}

// ============================================================================
// Cleansing
// ============================================================================

/// Normalizes a numeric field to digits, dot and minus: `_null` and empty
/// collapse to `"0"`, leading zeros are stripped, date-shaped values are
/// truncated to a compact sortable form.
pub fn cleanse_numeric_field(value: &str) -> String {
    let mut value = value.trim().to_owned();
    if value.is_empty() || value.eq_ignore_ascii_case(NULL_CONSTANT) {
        value = "0".to_owned();
    }

    value = cleanse_leading_zeros(&value);

    if is_date_shaped(&value) {
        value = truncate_date(&value);
    }

    value
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}

/// Strips leading spaces, plus signs, underscores and zeros; values that
/// evaluate to zero become exactly `"0"`.
fn cleanse_leading_zeros(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let stripped = value
        .trim_start_matches([' ', '+', '_'])
        .trim_start_matches('0');

    if let Ok(v) = stripped.parse::<f32>() {
        if v == 0.0 {
            return "0".to_owned();
        }
    }
    if stripped.is_empty() {
        // The value was all zeros.
        return "0".to_owned();
    }

    stripped.to_owned()
}

/// `YYYY-MM-DD`, optionally followed by ` HH:MM` or ` HH:MM:SS`.
fn is_date_shaped(value: &str) -> bool {
    fn digits(s: &str, n: usize) -> bool {
        s.len() == n && s.bytes().all(|b| b.is_ascii_digit())
    }

    let (date, time) = match value.split_once(' ') {
        Some((d, t)) => (d, Some(t)),
        None => (value, None),
    };

    let mut parts = date.split('-');
    let date_ok = matches!(
        (parts.next(), parts.next(), parts.next(), parts.next()),
        (Some(y), Some(m), Some(d), None) if digits(y, 4) && digits(m, 2) && digits(d, 2)
    );
    if !date_ok {
        return false;
    }

    match time {
        None => true,
        Some(t) => {
            let mut parts = t.split(':');
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(m), None, _) => digits(h, 2) && digits(m, 2),
                (Some(h), Some(m), Some(s), None) => digits(h, 2) && digits(m, 2) && digits(s, 2),
                _ => false,
            }
        }
    }
}

/// `"YYYY-MM-DD ..."` becomes `"CYYMMDD"` with the century folded into one
/// leading digit, keeping dates ordered while fitting float precision.
fn truncate_date(value: &str) -> String {
    let mut compact: String = value.chars().filter(|c| *c != '-').collect();
    if let Some(cut) = compact.find(' ') {
        compact.truncate(cut);
    }

    if compact.len() < 8 {
        return value.to_owned();
    }

    let century = if &compact[0..4] >= "2000" { "2" } else { "1" };
    format!("{century}{}", &compact[2..])
}

/// Normalizes a text field: `_null` empties it, non-printable characters
/// and symbols become spaces, whitespace collapses, everything lowercases,
/// and numeric terms lose leading zeros and ordinal suffixes.
pub fn cleanse_text_field(text: &str) -> String {
    if text.eq_ignore_ascii_case(NULL_CONSTANT) {
        return String::new();
    }

    const SYMBOLS: &str = "!@#$%^&*()/_=`'-+,.:;\"?~<>{}[]\\|";
    let replaced: String = text
        .chars()
        .map(|c| {
            if !(' '..='~').contains(&c) || SYMBOLS.contains(c) {
                ' '
            } else {
                c
            }
        })
        .collect();

    let cleansed = replaced
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if !cleansed.bytes().any(|b| b.is_ascii_digit()) {
        return cleansed;
    }

    cleansed
        .split(' ')
        .map(|term| {
            let term = cleanse_leading_zeros(term);
            strip_ordinal_suffix(&term)
        })
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_owned()
}

/// `"42nd"` becomes `"42"`; applies only to all-digit stems.
fn strip_ordinal_suffix(term: &str) -> String {
    for suffix in ["st", "nd", "rd", "th"] {
        if let Some(stem) = term.strip_suffix(suffix) {
            if !stem.is_empty() && stem.bytes().all(|b| b.is_ascii_digit()) {
                return stem.to_owned();
            }
        }
    }
    term.to_owned()
}
