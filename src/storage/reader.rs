//! Lazy Phase-1 reader
//!
//! Streams `BasicRecord`s back out of a Phase-1 file one row at a time.
//! A torn trailing row (crawler crashed mid-write and was not re-run) is
//! skipped rather than handed to enrichment half-written.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csv::StringRecord;
use tracing::warn;

use super::schema::{
    DETAIL_REFERENCE, EXTRACTED_AT, OutputSchema, PRIMARY_ID, REGION, REGION_ID, SUBREGION,
    SUBREGION_ID,
};
use crate::crawling::errors::WriteError;
use crate::domain::BasicRecord;
use crate::infrastructure::config::SchemaConfig;

#[derive(Debug, Clone, Copy)]
struct Columns {
    primary_id: usize,
    region: usize,
    region_id: usize,
    subregion: usize,
    subregion_id: usize,
    extracted_at: usize,
    detail_reference: usize,
}

pub struct BasicRecordReader {
    path: PathBuf,
    reader: csv::Reader<File>,
    schema: OutputSchema,
    columns: Columns,
    record_fields: Vec<(String, usize)>,
    total_bytes: u64,
    torn_tail: bool,
    line: u64,
    record: StringRecord,
}

impl BasicRecordReader {
    pub fn open(path: &Path, schema_config: &SchemaConfig, missing_value: &str) -> Result<Self, WriteError> {
        let schema = OutputSchema::phase1(schema_config, missing_value);
        let mut file = File::open(path)?;
        let total_bytes = file.metadata()?.len();
        let torn_tail = if total_bytes == 0 {
            false
        } else {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            file.seek(SeekFrom::Start(0))?;
            last[0] != b'\n'
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);
        let headers = reader.headers()?.clone();
        if !headers.iter().eq(schema.columns().iter().map(String::as_str)) {
            return Err(WriteError::SchemaMismatch {
                path: path.to_path_buf(),
                expected: schema.columns().to_vec(),
                found: headers.iter().map(String::from).collect(),
            });
        }

        let index = |column: &str| schema.column_index(column).unwrap_or(0);
        let columns = Columns {
            primary_id: index(PRIMARY_ID),
            region: index(REGION),
            region_id: index(REGION_ID),
            subregion: index(SUBREGION),
            subregion_id: index(SUBREGION_ID),
            extracted_at: index(EXTRACTED_AT),
            detail_reference: index(DETAIL_REFERENCE),
        };
        let record_fields = schema_config
            .record_fields
            .iter()
            .map(|f| (f.clone(), index(f)))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            schema,
            columns,
            record_fields,
            total_bytes,
            torn_tail,
            line: 1,
            record: StringRecord::new(),
        })
    }

    fn value(&self, index: usize) -> Option<String> {
        self.record
            .get(index)
            .filter(|v| !self.schema.is_blank_value(v))
            .map(|v| v.trim().to_string())
    }

    fn corrupt(&self, reason: impl Into<String>) -> WriteError {
        WriteError::Corrupt {
            path: self.path.clone(),
            line: self.line,
            reason: reason.into(),
        }
    }

    fn parse(&self) -> Result<BasicRecord, WriteError> {
        if self.record.len() != self.schema.columns().len() {
            return Err(self.corrupt(format!(
                "expected {} columns, found {}",
                self.schema.columns().len(),
                self.record.len()
            )));
        }
        let primary_id = self
            .value(self.columns.primary_id)
            .ok_or_else(|| self.corrupt("blank primary identifier"))?;
        let raw_timestamp = self.record.get(self.columns.extracted_at).unwrap_or("");
        let extracted_at = DateTime::parse_from_rfc3339(raw_timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.corrupt(format!("bad timestamp '{raw_timestamp}': {e}")))?;
        let fields: BTreeMap<String, String> = self
            .record_fields
            .iter()
            .filter_map(|(name, index)| self.value(*index).map(|v| (name.clone(), v)))
            .collect();

        Ok(BasicRecord {
            primary_id,
            region_id: self.value(self.columns.region_id).unwrap_or_default(),
            region_name: self.value(self.columns.region).unwrap_or_default(),
            subregion_id: self.value(self.columns.subregion_id).unwrap_or_default(),
            subregion_name: self.value(self.columns.subregion).unwrap_or_default(),
            extracted_at,
            fields,
            detail_reference: self.value(self.columns.detail_reference),
        })
    }
}

impl Iterator for BasicRecordReader {
    type Item = Result<BasicRecord, WriteError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(false) => None,
            Ok(true) => {
                self.line += 1;
                if self.torn_tail && self.reader.position().byte() >= self.total_bytes {
                    warn!(path = %self.path.display(), line = self.line, "Skipping torn trailing row");
                    return None;
                }
                Some(self.parse())
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::checkpoint::{CheckpointedWriter, WriterOptions};
    use std::io::Write;

    fn record(id: &str, detail: Option<&str>) -> BasicRecord {
        BasicRecord {
            primary_id: id.into(),
            region_id: "n".into(),
            region_name: "North".into(),
            subregion_id: "n1".into(),
            subregion_name: "North One".into(),
            extracted_at: "2024-05-01T10:00:00.250Z".parse().unwrap(),
            fields: BTreeMap::from([
                ("name".to_string(), format!("Name {id}")),
                ("address".to_string(), "1, Main Road".to_string()),
            ]),
            detail_reference: detail.map(String::from),
        }
    }

    fn write_all(path: &Path, records: &[BasicRecord]) {
        let schema = OutputSchema::phase1(&SchemaConfig::default(), "N/A");
        let mut writer = CheckpointedWriter::open(path, schema, WriterOptions { fsync: false }).unwrap();
        for r in records {
            writer.write(r).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_reads_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NORTH_phase1.csv");
        let written = vec![record("A1", Some("https://x/d/A1")), record("A2", None)];
        write_all(&path, &written);

        let read: Vec<BasicRecord> = BasicRecordReader::open(&path, &SchemaConfig::default(), "N/A")
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, written);
        assert!(!read[1].has_detail_reference());
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NORTH_phase1.csv");
        write_all(&path, &[record("A1", None)]);
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"true,true,North,n,North One,n1,2024-05-01T10:00:00.000Z,A2,Name")
            .unwrap();
        drop(file);

        let ids: Vec<String> = BasicRecordReader::open(&path, &SchemaConfig::default(), "N/A")
            .unwrap()
            .map(|r| r.unwrap().primary_id)
            .collect();
        assert_eq!(ids, vec!["A1".to_string()]);
    }

    #[test]
    fn test_wrong_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();
        let err = BasicRecordReader::open(&path, &SchemaConfig::default(), "N/A").err().unwrap();
        assert!(matches!(err, WriteError::SchemaMismatch { .. }));
    }
}
