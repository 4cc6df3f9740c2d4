//! Sequential and random-access readers over the data file.
//!
//! The sequential reader tracks byte offsets so that each record's offset
//! can serve as its stable reference; the random reader dereferences such
//! an offset back into a parsed record at query time.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};

use crate::errors::{IndexError, IndexResult};

use super::parser::{Record, RecordParser};
use super::Dataset;

/// Forward reader used by the build; `read_record` returns `Ok(None)` at
/// EOF and a `MalformedRecord` error for rows the caller should skip (the
/// offset still advances past them).
pub struct DatasetReader {
    reader: BufReader<File>,
    parser: RecordParser,
    eol_bytes: u64,
    offset: u64,
}

impl DatasetReader {
    pub fn open(dataset: &Dataset) -> IndexResult<Self> {
        let eol_bytes = detect_eol_width(dataset)?;
        Ok(Self {
            reader: BufReader::new(File::open(dataset.data_path())?),
            parser: RecordParser::new(dataset.schema()),
            eol_bytes,
            offset: 0,
        })
    }

    pub fn read_record(
        &mut self,
        parse_text_fields: bool,
        parse_numeric_fields: bool,
    ) -> IndexResult<Option<Record>> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line)?;
        if read == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        let record_offset = self.offset;
        self.offset += trimmed.len() as u64 + self.eol_bytes;

        let mut record = self
            .parser
            .parse(trimmed, parse_text_fields, parse_numeric_fields)?;
        record.set_reference(record_offset);
        Ok(Some(record))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Counts EOL bytes from the first line terminator in the file; the data
/// file is uniform, either LF or CRLF throughout.
fn detect_eol_width(dataset: &Dataset) -> IndexResult<u64> {
    let mut file = BufReader::new(File::open(dataset.data_path())?);
    let mut byte = [0u8; 1];

    loop {
        if file.read(&mut byte)? == 0 {
            return Ok(1);
        }
        match byte[0] {
            b'\n' => return Ok(1),
            b'\r' => {
                return if file.read(&mut byte)? == 1 && byte[0] == b'\n' {
                    Ok(2)
                } else {
                    Ok(1)
                }
            }
            _ => {}
        }
    }
}

/// Query-side reader resolving record references (byte offsets) back into
/// records. One instance per result iterator; never shared.
pub struct RandomDatasetReader {
    file: BufReader<File>,
    parser: RecordParser,
}

impl RandomDatasetReader {
    pub fn open(dataset: &Dataset) -> IndexResult<Self> {
        Ok(Self {
            file: BufReader::new(File::open(dataset.data_path())?),
            parser: RecordParser::new(dataset.schema()),
        })
    }

    pub fn record_at(&mut self, offset: u64) -> IndexResult<Record> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        if self.file.read_line(&mut line)? == 0 {
            return Err(IndexError::Store(format!(
                "record reference {offset} is past end of data file"
            )));
        }

        let mut record = self
            .parser
            .parse(line.trim_end_matches(['\r', '\n']), true, true)?;
        record.set_reference(offset);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_dataset(rows: &[&str], eol: &str) -> (tempfile::TempDir, Dataset) {
        let dir = tempdir().unwrap();
        let header = dir.path().join("d.header");
        let data = dir.path().join("d.data");

        let mut f = File::create(&header).unwrap();
        writeln!(f, "FIELD DEFINITIONS").unwrap();
        writeln!(f, "FIELD-1\tname\tT:string").unwrap();
        writeln!(f, "FIELD-2\tlatitude").unwrap();
        writeln!(f, "FIELD-3\tlongitude").unwrap();

        let mut f = File::create(&data).unwrap();
        for row in rows {
            write!(f, "{row}{eol}").unwrap();
        }

        let dataset = Dataset::open(&data, &header).unwrap();
        (dir, dataset)
    }

    #[test]
    fn test_sequential_read_tracks_offsets() {
        let (_d, dataset) = write_dataset(
            &["First Place\t1.0\t2.0", "Second Place\t3.0\t4.0"],
            "\n",
        );
        let mut reader = DatasetReader::open(&dataset).unwrap();

        let r1 = reader.read_record(true, false).unwrap().unwrap();
        assert_eq!(r1.reference(), 0);
        assert_eq!(r1.text_values().unwrap(), ["first place"]);

        let r2 = reader.read_record(true, false).unwrap().unwrap();
        assert_eq!(r2.reference(), 20);
        assert!(reader.read_record(true, false).unwrap().is_none());
    }

    #[test]
    fn test_crlf_offsets() {
        let (_d, dataset) = write_dataset(&["A\t1.0\t2.0", "B\t3.0\t4.0"], "\r\n");
        let mut reader = DatasetReader::open(&dataset).unwrap();

        let r1 = reader.read_record(false, false).unwrap().unwrap();
        let r2 = reader.read_record(false, false).unwrap().unwrap();
        assert_eq!(r1.reference(), 0);
        assert_eq!(r2.reference(), 11);
    }

    #[test]
    fn test_malformed_row_is_skippable() {
        let (_d, dataset) = write_dataset(
            &["bad row", "Good\t1.0\t2.0"],
            "\n",
        );
        let mut reader = DatasetReader::open(&dataset).unwrap();

        assert!(reader.read_record(true, false).is_err());
        // The offset advanced past the bad row.
        let good = reader.read_record(true, false).unwrap().unwrap();
        assert_eq!(good.reference(), 8);
    }

    #[test]
    fn test_random_reader_resolves_references() {
        let (_d, dataset) = write_dataset(
            &["First\t1.0\t2.0", "Second\t3.0\t4.0", "Third\t5.0\t6.0"],
            "\n",
        );

        let mut seq = DatasetReader::open(&dataset).unwrap();
        let mut refs = Vec::new();
        while let Some(rec) = seq.read_record(false, false).unwrap() {
            refs.push(rec.reference());
        }

        let mut random = RandomDatasetReader::open(&dataset).unwrap();
        let rec = random.record_at(refs[2]).unwrap();
        assert_eq!(rec.text_values().unwrap(), ["third"]);
        let rec = random.record_at(refs[0]).unwrap();
        assert_eq!(rec.text_values().unwrap(), ["first"]);

        assert!(random.record_at(10_000).is_err());
    }
}
