//! Header-file schema: field order, the designated coordinate fields, and
//! the text/number classification of every other field.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, IndexResult};

const FIELD_DEFINITIONS_MARKER: &str = "FIELD DEFINITIONS";
const SECTION_END: &str = "=";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    field_count: usize,
    lat_field_index: usize,
    lon_field_index: usize,
    text_field_indexes: Vec<usize>,
    number_field_indexes: Vec<usize>,
    field_index_map: HashMap<String, usize>,
}

impl Schema {
    /// Parses the `FIELD DEFINITIONS` section of a header file. Each field
    /// row starts with `FIELD-`, is tab-delimited with the field name in the
    /// second column, and may carry a `T:` type tag; untagged and unknown
    /// types count as strings. The section ends at a `=` line or EOF.
    pub fn parse(path: &Path) -> IndexResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        loop {
            match lines.next() {
                Some(line) => {
                    if line?.starts_with(FIELD_DEFINITIONS_MARKER) {
                        break;
                    }
                }
                None => {
                    return Err(IndexError::MalformedRecord(format!(
                        "header {} has no {FIELD_DEFINITIONS_MARKER} section",
                        path.display()
                    )))
                }
            }
        }

        let mut schema = Self {
            field_count: 0,
            lat_field_index: 0,
            lon_field_index: 0,
            text_field_indexes: Vec::new(),
            number_field_indexes: Vec::new(),
            field_index_map: HashMap::new(),
        };

        for line in lines {
            let line = line?;
            if line == SECTION_END {
                break;
            }
            if !line.starts_with("FIELD-") {
                continue;
            }

            let columns: Vec<&str> = line.split('\t').collect();
            let name = columns.get(1).copied().unwrap_or("");
            let index = schema.field_count;
            schema.field_index_map.insert(name.to_owned(), index);

            if name.eq_ignore_ascii_case("latitude") {
                schema.lat_field_index = index;
            } else if name.eq_ignore_ascii_case("longitude") {
                schema.lon_field_index = index;
            } else {
                match columns.iter().find(|c| c.starts_with("T:")) {
                    Some(tag) if tag.eq_ignore_ascii_case("t:number") => {
                        schema.number_field_indexes.push(index);
                    }
                    // Untagged and unknown types are treated as strings.
                    _ => schema.text_field_indexes.push(index),
                }
            }
            schema.field_count += 1;
        }

        Ok(schema)
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn latitude_field_index(&self) -> usize {
        self.lat_field_index
    }

    pub fn longitude_field_index(&self) -> usize {
        self.lon_field_index
    }

    pub fn text_field_indexes(&self) -> &[usize] {
        &self.text_field_indexes
    }

    pub fn number_field_indexes(&self) -> &[usize] {
        &self.number_field_indexes
    }

    /// Position of a named field in the record, if the header defines it.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_index_map.get(name).copied()
    }
}
