#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Core data model for `paceforge`: authorities, scraped records and their
//! validation, record sinks, data-quality accounting, and the run log.

/// Interned authority labels.
pub mod authority;
/// Environment-variable helpers shared by the engine and the CLI.
pub mod env;
/// Per-authority error-budget tracking.
pub mod quality;
/// The scraped-record model and its validation rules.
pub mod record;
/// Persistent per-run summary and per-authority log tables.
pub mod runlog;
/// Record sinks: the file-backed store and the in-memory buffer.
pub mod sink;

pub use authority::Authority;
pub use quality::{DataQualityMonitor, UnprocessableSite};
pub use record::{Record, RecordError};
pub use runlog::{RunLog, RunStatus, ScrapeLogEntry, ScrapeSummary};
pub use sink::{JsonRecordStore, MemorySink, RecordSink, SinkError};
