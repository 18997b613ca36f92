use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::sink::{write_atomic, SinkError};

/// Log rows older than this many days are removed when a run is recorded.
const LOG_RETENTION_DAYS: i64 = 30;

/// Terminal state of one authority in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The authority's task returned normally.
    Succeeded,
    /// The authority's task raised; the error column holds the message.
    Failed,
    /// The run stopped before the authority finished.
    Interrupted,
}

/// One row of the `scrape_summary` table (primary key `run_at`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeSummary {
    /// Run start time, RFC 3339; the table's primary key.
    pub run_at: String,
    /// Wall-clock run duration in seconds.
    pub duration_s: f64,
    /// Authorities that completed without error.
    pub successful: Vec<String>,
    /// Authorities recorded in the exceptions map.
    pub failed: Vec<String>,
    /// Records saved across all authorities.
    pub records_saved: u64,
    /// Unprocessable records across all authorities.
    pub unprocessable: u64,
    /// Worker resumes performed by the scheduler.
    pub resume_count: u64,
    /// Seconds the scheduler spent waiting on politeness delays.
    pub wait_delay_s: f64,
    /// Seconds the scheduler spent waiting on in-flight responses.
    pub wait_response_s: f64,
}

/// One row of the `scrape_log` table (primary key `(authority_label, run_at)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeLogEntry {
    /// The authority this row describes.
    pub authority_label: String,
    /// Run start time, RFC 3339; pairs with `authority_label` as the key.
    pub run_at: String,
    /// How the authority's task ended.
    pub status: RunStatus,
    /// Error message for failed authorities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Records saved for this authority.
    pub records_saved: u64,
    /// Unprocessable records seen for this authority.
    pub unprocessable: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SummaryFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    runs: Vec<ScrapeSummary>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: Vec<ScrapeLogEntry>,
}

/// The logger-owned pair of run tables, persisted as versioned JSON under
/// one directory: `scrape-summary.json` and `scrape-log.json`.
pub struct RunLog {
    summary_path: PathBuf,
    log_path: PathBuf,
    summaries: BTreeMap<String, ScrapeSummary>,
    entries: BTreeMap<(String, String), ScrapeLogEntry>,
}

impl RunLog {
    /// Opens (or initializes) the run log under `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let dir = dir.into();
        let summary_path = dir.join("scrape-summary.json");
        let log_path = dir.join("scrape-log.json");

        let mut summaries = BTreeMap::new();
        if summary_path.exists() {
            let raw = std::fs::read_to_string(&summary_path)?;
            let file: SummaryFile = serde_json::from_str(&raw)?;
            for run in file.runs {
                summaries.insert(run.run_at.clone(), run);
            }
        }

        let mut entries = BTreeMap::new();
        if log_path.exists() {
            let raw = std::fs::read_to_string(&log_path)?;
            let file: LogFile = serde_json::from_str(&raw)?;
            for entry in file.entries {
                entries.insert((entry.authority_label.clone(), entry.run_at.clone()), entry);
            }
        }

        Ok(Self {
            summary_path,
            log_path,
            summaries,
            entries,
        })
    }

    /// Records one completed run: upserts the summary row and one log row
    /// per authority, applies retention, and persists both tables.
    pub fn record_run(
        &mut self,
        summary: ScrapeSummary,
        entries: Vec<ScrapeLogEntry>,
    ) -> Result<(), SinkError> {
        self.summaries.insert(summary.run_at.clone(), summary);
        for entry in entries {
            self.entries
                .insert((entry.authority_label.clone(), entry.run_at.clone()), entry);
        }
        self.apply_retention(Utc::now());
        self.persist()
    }

    /// Summary rows, oldest first.
    pub fn summaries(&self) -> impl Iterator<Item = &ScrapeSummary> {
        self.summaries.values()
    }

    /// Log rows for one authority, oldest first.
    pub fn entries_for(&self, authority_label: &str) -> Vec<&ScrapeLogEntry> {
        self.entries
            .values()
            .filter(|entry| entry.authority_label == authority_label)
            .collect()
    }

    fn apply_retention(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(LOG_RETENTION_DAYS);
        let keep = |run_at: &str| match DateTime::parse_from_rfc3339(run_at) {
            Ok(t) => t.with_timezone(&Utc) >= cutoff,
            Err(_) => true,
        };
        self.summaries.retain(|run_at, _| keep(run_at));
        self.entries.retain(|(_, run_at), _| keep(run_at));
    }

    fn persist(&self) -> Result<(), SinkError> {
        let summary_file = SummaryFile {
            version: 1,
            runs: self.summaries.values().cloned().collect(),
        };
        write_atomic(
            &self.summary_path,
            &serde_json::to_string_pretty(&summary_file)?,
        )?;

        let log_file = LogFile {
            version: 1,
            entries: self.entries.values().cloned().collect(),
        };
        write_atomic(&self.log_path, &serde_json::to_string_pretty(&log_file)?)?;
        Ok(())
    }
}
