//! Dataset access: header-driven schema, record parsing and cleansing, and
//! sequential/random readers over the tab-delimited data file.

mod parser;
mod reader;
mod schema;

pub use parser::{cleanse_numeric_field, cleanse_text_field, Record, RecordParser};
pub use reader::{DatasetReader, RandomDatasetReader};
pub use schema::Schema;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::IndexResult;

/// A data file plus the header file describing its fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    data_path: PathBuf,
    header_path: PathBuf,
    schema: Schema,
}

impl Dataset {
    pub fn open(data_path: impl Into<PathBuf>, header_path: impl Into<PathBuf>) -> IndexResult<Self> {
        let header_path = header_path.into();
        let schema = Schema::parse(&header_path)?;
        Ok(Self {
            data_path: data_path.into(),
            header_path,
            schema,
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn header_path(&self) -> &Path {
        &self.header_path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}
