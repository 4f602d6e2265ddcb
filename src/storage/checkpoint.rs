//! Checkpointed writer
//!
//! The output file is the checkpoint. Opening a writer scans existing rows
//! to rebuild the set of written primary ids, repairing a torn trailing row
//! left by a crash mid-write. Every `write` reaches the disk before it
//! returns, so a crash after record N leaves exactly N complete rows.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use csv::{StringRecord, Terminator};
use tracing::{debug, info, warn};

use super::schema::{OutputSchema, PRIMARY_ID, TabularRecord};
use crate::crawling::errors::WriteError;

/// Primary identifiers already present in one output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointSet {
    ids: HashSet<String>,
}

impl CheckpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CheckpointSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterOptions {
    /// `sync_data` after each row, not just a buffer flush
    pub fsync: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// What a scan of an existing output found.
#[derive(Debug, Default)]
struct Recovered {
    checkpoint: CheckpointSet,
    needs_header: bool,
    truncated_bytes: u64,
}

/// Rebuilds the checkpoint from `path` and repairs a torn tail in place.
pub fn recover_checkpoint(path: &Path, schema: &OutputSchema) -> Result<CheckpointSet, WriteError> {
    recover(path, schema).map(|r| r.checkpoint)
}

fn recover(path: &Path, schema: &OutputSchema) -> Result<Recovered, WriteError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Recovered {
                needs_header: true,
                ..Recovered::default()
            });
        }
        Err(e) => return Err(e.into()),
    };
    let total = bytes.len() as u64;

    let Some(header_end) = bytes.iter().position(|&b| b == b'\n') else {
        if total > 0 {
            warn!(path = %path.display(), bytes = total, "Output holds only a torn header, rewriting it");
            truncate(path, 0)?;
        }
        return Ok(Recovered {
            needs_header: true,
            truncated_bytes: total,
            ..Recovered::default()
        });
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader.headers()?.clone();
    if !headers.iter().eq(schema.columns().iter().map(String::as_str)) {
        return Err(WriteError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: schema.columns().to_vec(),
            found: headers.iter().map(String::from).collect(),
        });
    }
    let id_index = schema.column_index(PRIMARY_ID).unwrap_or(0);
    let torn_tail = bytes.last() != Some(&b'\n');

    let mut recovered = Recovered::default();
    let mut valid_end = header_end as u64 + 1;
    let mut record = StringRecord::new();
    let mut line = 1;
    let mut duplicates = 0usize;
    loop {
        let read = reader.read_record(&mut record);
        line += 1;
        let end = reader.position().byte();
        let is_last = end >= total;
        match read {
            Ok(false) => break,
            Ok(true) if is_last && torn_tail => break,
            Ok(true) if record.len() != headers.len() => {
                if is_last {
                    break;
                }
                return Err(WriteError::Corrupt {
                    path: path.to_path_buf(),
                    line,
                    reason: format!("expected {} columns, found {}", headers.len(), record.len()),
                });
            }
            Ok(true) => {
                let id = record.get(id_index).unwrap_or("").trim();
                if id.is_empty() {
                    return Err(WriteError::Corrupt {
                        path: path.to_path_buf(),
                        line,
                        reason: "blank primary identifier".into(),
                    });
                }
                if !recovered.checkpoint.insert(id) {
                    duplicates += 1;
                }
                valid_end = end;
            }
            Err(_) if torn_tail && is_last => break,
            Err(e) => {
                return Err(WriteError::Corrupt {
                    path: path.to_path_buf(),
                    line,
                    reason: e.to_string(),
                });
            }
        }
    }

    if valid_end < total {
        warn!(
            path = %path.display(),
            dropped_bytes = total - valid_end,
            "Truncating torn trailing row"
        );
        truncate(path, valid_end)?;
        recovered.truncated_bytes = total - valid_end;
    }
    if duplicates > 0 {
        warn!(path = %path.display(), duplicates, "Output already contained duplicate identifiers");
    }
    Ok(recovered)
}

fn truncate(path: &Path, len: u64) -> Result<(), WriteError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// Append-only, resume-aware writer for one output file.
pub struct CheckpointedWriter {
    path: PathBuf,
    schema: OutputSchema,
    writer: csv::Writer<File>,
    checkpoint: CheckpointSet,
    options: WriterOptions,
    written: usize,
}

impl std::fmt::Debug for CheckpointedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointedWriter")
            .field("path", &self.path)
            .field("existing", &self.checkpoint.len())
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl CheckpointedWriter {
    pub fn open(
        path: impl Into<PathBuf>,
        schema: OutputSchema,
        options: WriterOptions,
    ) -> Result<Self, WriteError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let recovered = recover(&path, &schema)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(file);

        let mut this = Self {
            path,
            schema,
            writer,
            checkpoint: recovered.checkpoint,
            options,
            written: 0,
        };
        if recovered.needs_header {
            this.writer.write_record(this.schema.columns())?;
            this.sync()?;
        }
        info!(
            path = %this.path.display(),
            existing = this.checkpoint.len(),
            repaired_bytes = recovered.truncated_bytes,
            "Output opened"
        );
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn schema(&self) -> &OutputSchema {
        &self.schema
    }

    pub fn contains(&self, id: &str) -> bool {
        self.checkpoint.contains(id)
    }

    pub const fn checkpoint(&self) -> &CheckpointSet {
        &self.checkpoint
    }

    /// Rows written through this handle.
    pub const fn written(&self) -> usize {
        self.written
    }

    /// Rows in the file, including those found on open.
    pub fn len(&self) -> usize {
        self.checkpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoint.is_empty()
    }

    /// Appends one row and makes it durable. Rejects known identifiers.
    pub fn write<R: TabularRecord + ?Sized>(&mut self, record: &R) -> Result<(), WriteError> {
        let id = record.primary_id();
        if self.checkpoint.contains(id) {
            return Err(WriteError::Duplicate(id.to_string()));
        }
        let row = self.schema.row(record);
        self.writer.write_record(&row)?;
        self.sync()?;
        self.checkpoint.insert(id);
        self.written += 1;
        debug!(path = %self.path.display(), primary_id = id, "Row written");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), WriteError> {
        self.sync()
    }

    /// Flushes and releases the file. Returns the rows written by this handle.
    pub fn close(mut self) -> Result<usize, WriteError> {
        self.sync()?;
        info!(path = %self.path.display(), written = self.written, total = self.checkpoint.len(), "Output closed");
        Ok(self.written)
    }

    fn sync(&mut self) -> Result<(), WriteError> {
        self.writer.flush()?;
        if self.options.fsync {
            self.writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}
