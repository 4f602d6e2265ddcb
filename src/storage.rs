//! Storage module - durable tabular output
//!
//! - `schema`: column layout of both phases and file naming
//! - `checkpoint`: the resume-aware writer; its output doubles as checkpoint
//! - `reader`: lazy Phase-1 reader feeding enrichment

pub mod checkpoint;
pub mod reader;
pub mod schema;

pub use checkpoint::{CheckpointSet, CheckpointedWriter, WriterOptions, recover_checkpoint};
pub use reader::BasicRecordReader;
pub use schema::{OutputLayout, OutputSchema, Phase, TabularRecord};
