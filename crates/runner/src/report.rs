use std::collections::HashMap;
use std::time::Duration;

use paceforge_core::{
    Authority, DataQualityMonitor, RunStatus, ScrapeLogEntry, ScrapeSummary,
};
use paceforge_engine::{EngineError, RunStats};

/// Outcome of comparing the run against expectations.
#[derive(Debug, Default)]
pub struct Assessment {
    /// Surprises that do not fail the run (expected-bad sites that worked).
    pub warnings: Vec<String>,
    /// Failures that make the run exit non-zero.
    pub errors: Vec<String>,
}

impl Assessment {
    /// Exit code under the CLI contract: 0 on success, 1 on reported
    /// errors. (Global timeouts exit 124 from the watchdog directly.)
    pub fn exit_code(&self) -> u8 {
        if self.errors.is_empty() {
            0
        } else {
            1
        }
    }
}

fn status_for(error: &anyhow::Error) -> RunStatus {
    match error.downcast_ref::<EngineError>() {
        Some(err) if err.is_aborted() => RunStatus::Interrupted,
        _ => RunStatus::Failed,
    }
}

/// Builds the run's summary row, one log row per authority, and the
/// expectation assessment against `expect_bad`.
pub fn build(
    run_at: &str,
    authorities: &[String],
    exceptions: &HashMap<Authority, anyhow::Error>,
    expect_bad: &[String],
    monitor: &DataQualityMonitor,
    stats: RunStats,
    duration: Duration,
) -> (ScrapeSummary, Vec<ScrapeLogEntry>, Assessment) {
    let mut successful = Vec::new();
    let mut failed = Vec::new();
    let mut entries = Vec::new();
    let mut assessment = Assessment::default();

    for name in authorities {
        let authority = Authority::new(name);
        let (saved, unprocessable) = monitor.counts(&authority);

        match exceptions.get(&authority) {
            None => {
                successful.push(name.clone());
                if expect_bad.contains(name) {
                    assessment
                        .warnings
                        .push(format!("{name} was expected to fail but succeeded"));
                }
                entries.push(ScrapeLogEntry {
                    authority_label: name.clone(),
                    run_at: run_at.to_string(),
                    status: RunStatus::Succeeded,
                    error: None,
                    records_saved: saved,
                    unprocessable,
                });
            }
            Some(error) => {
                failed.push(name.clone());
                let message = format!("{error:#}");
                if !expect_bad.contains(name) {
                    assessment
                        .errors
                        .push(format!("{name} failed unexpectedly: {message}"));
                }
                entries.push(ScrapeLogEntry {
                    authority_label: name.clone(),
                    run_at: run_at.to_string(),
                    status: status_for(error),
                    error: Some(message),
                    records_saved: saved,
                    unprocessable,
                });
            }
        }
    }

    let (records_saved, unprocessable) = monitor.totals();
    let summary = ScrapeSummary {
        run_at: run_at.to_string(),
        duration_s: duration.as_secs_f64(),
        successful,
        failed,
        records_saved,
        unprocessable,
        resume_count: stats.resume_count,
        wait_delay_s: stats.wait_delay.as_secs_f64(),
        wait_response_s: stats.wait_response.as_secs_f64(),
    };
    (summary, entries, assessment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Vec<String>, HashMap<Authority, anyhow::Error>, DataQualityMonitor) {
        let authorities = vec!["ok".to_string(), "bad".to_string(), "flaky".to_string()];
        let mut exceptions = HashMap::new();
        exceptions.insert(Authority::new("bad"), anyhow::anyhow!("boom"));
        exceptions.insert(
            Authority::new("flaky"),
            anyhow::Error::from(EngineError::Aborted),
        );

        let mut monitor = DataQualityMonitor::new();
        monitor.record_saved(&Authority::new("ok"));
        monitor.record_saved(&Authority::new("ok"));
        (authorities, exceptions, monitor)
    }

    #[test]
    fn unexpected_failures_become_errors() {
        let (authorities, exceptions, monitor) = fixture();
        let (summary, entries, assessment) = build(
            "2025-03-01T00:00:00Z",
            &authorities,
            &exceptions,
            &[],
            &monitor,
            RunStats::default(),
            Duration::from_secs(3),
        );

        assert_eq!(summary.successful, vec!["ok".to_string()]);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(summary.records_saved, 2);
        assert_eq!(entries.len(), 3);
        assert_eq!(assessment.errors.len(), 2);
        assert_eq!(assessment.exit_code(), 1);
    }

    #[test]
    fn expected_failures_do_not_fail_the_run() {
        let (authorities, exceptions, monitor) = fixture();
        let expect_bad = vec!["bad".to_string(), "flaky".to_string()];
        let (_, _, assessment) = build(
            "2025-03-01T00:00:00Z",
            &authorities,
            &exceptions,
            &expect_bad,
            &monitor,
            RunStats::default(),
            Duration::from_secs(3),
        );

        assert!(assessment.errors.is_empty());
        assert!(assessment.warnings.is_empty());
        assert_eq!(assessment.exit_code(), 0);
    }

    #[test]
    fn surprise_successes_only_warn() {
        let (authorities, exceptions, monitor) = fixture();
        let expect_bad = vec!["ok".to_string(), "bad".to_string(), "flaky".to_string()];
        let (_, _, assessment) = build(
            "2025-03-01T00:00:00Z",
            &authorities,
            &exceptions,
            &expect_bad,
            &monitor,
            RunStats::default(),
            Duration::from_secs(3),
        );

        assert_eq!(assessment.warnings.len(), 1);
        assert!(assessment.warnings[0].contains("ok"));
        assert_eq!(assessment.exit_code(), 0);
    }

    #[test]
    fn aborted_tasks_log_as_interrupted() {
        let (authorities, exceptions, monitor) = fixture();
        let (_, entries, _) = build(
            "2025-03-01T00:00:00Z",
            &authorities,
            &exceptions,
            &[],
            &monitor,
            RunStats::default(),
            Duration::from_secs(3),
        );

        let flaky = entries
            .iter()
            .find(|entry| entry.authority_label == "flaky")
            .unwrap();
        assert_eq!(flaky.status, RunStatus::Interrupted);

        let bad = entries
            .iter()
            .find(|entry| entry.authority_label == "bad")
            .unwrap();
        assert_eq!(bad.status, RunStatus::Failed);
    }
}
