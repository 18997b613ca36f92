use std::time::Duration;

use paceforge_core::env;

/// Scheduler configuration, loaded once and immutable for the run.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// When false, no I/O tasks are spawned and every request executes
    /// inline on its worker's own context.
    pub threaded: bool,
    /// Maximum number of simultaneously live workers; registrations past
    /// this bound synchronously run the scheduler until the batch drains.
    pub max_workers: usize,
    /// False when `MORPH_MAX_WORKERS=0` asked for one-at-a-time execution.
    pub interleave: bool,
    /// Global run timeout enforced by the watchdog (exit code 124).
    pub run_timeout: Duration,
    /// Upper bound on any single scheduler poll sleep.
    pub poll_period: Duration,
    /// How long to wait for worker tasks when closing them.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            max_workers: 50,
            interleave: true,
            run_timeout: Duration::from_secs(21_600),
            poll_period: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `MORPH_DISABLE_THREADS`, `MORPH_MAX_WORKERS`
    /// and `MORPH_RUN_TIMEOUT`.
    ///
    /// `MORPH_MAX_WORKERS=0` floors the worker bound at 1 and records that
    /// interleaving was disabled.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if env::flag("MORPH_DISABLE_THREADS") {
            cfg.threaded = false;
        }
        if let Some(max_workers) = env::parse::<i64>("MORPH_MAX_WORKERS") {
            if max_workers <= 0 {
                cfg.max_workers = 1;
                cfg.interleave = false;
            } else {
                cfg.max_workers = max_workers as usize;
            }
        }
        if let Some(secs) = env::parse::<u64>("MORPH_RUN_TIMEOUT") {
            cfg.run_timeout = Duration::from_secs(secs);
        }
        cfg
    }
}

/// Aggregate counters for one scheduler run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunStats {
    /// Number of worker resumes performed.
    pub resume_count: u64,
    /// Scheduler wait time attributed to politeness delays.
    pub wait_delay: Duration,
    /// Scheduler wait time attributed to in-flight responses.
    pub wait_response: Duration,
}

/// Formats a duration the way run logs print it: `2h 13m 5s`, `45s`,
/// `320ms`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.threaded);
        assert!(cfg.interleave);
        assert_eq!(cfg.max_workers, 50);
        assert_eq!(cfg.run_timeout, Duration::from_secs(21_600));
    }

    #[test]
    fn durations_format_humanely() {
        assert_eq!(format_duration(Duration::from_millis(320)), "320ms");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7985)), "2h 13m 5s");
        assert_eq!(format_duration(Duration::from_secs(21_600)), "6h 0m 0s");
    }
}
