mod cli;
mod report;
mod shutdown;
mod sites;

use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use clap::Parser;
use rand::seq::SliceRandom;
use tracing::{error, info, warn};

use paceforge_core::sink::{RecordSink as _, DEFAULT_RETENTION_DAYS};
use paceforge_core::{env, DataQualityMonitor, JsonRecordStore, RunLog};
use paceforge_engine::{Scheduler, SchedulerConfig};
use paceforge_plan::{calculate_date_ranges, today_home_zone, PlannerConfig};

use crate::cli::Cli;

fn init_tracing(debug_level: u8) {
    let default = match debug_level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(env::debug_level());

    let run_at = Utc::now().to_rfc3339();
    let started = tokio::time::Instant::now();

    let mut sites = sites::load_roster(&cli.sites)?;
    if !cli.authorities.is_empty() {
        sites.retain(|site| cli.authorities.contains(&site.authority));
    }
    if sites.is_empty() {
        anyhow::bail!("no sites selected (roster {}, filter {:?})", cli.sites.display(), cli.authorities);
    }
    if !(cli.sequential || env::flag("MORPH_PROCESS_SEQUENTIALLY")) {
        sites.shuffle(&mut rand::rng());
    }

    let today = today_home_zone();
    let ranges = calculate_date_ranges(PlannerConfig::from_env(), today);
    info!(
        "paceforge {} — {} site(s), {} date window(s) for {today}",
        env!("CARGO_PKG_VERSION"),
        sites.len(),
        ranges.len()
    );

    let store = Arc::new(Mutex::new(JsonRecordStore::open(
        cli.data_dir.join("data.json"),
    )?));
    let monitor = Arc::new(Mutex::new(DataQualityMonitor::new()));

    let mut scheduler = Scheduler::new(SchedulerConfig::from_env());
    shutdown::spawn_ctrl_c_handler(scheduler.stop_flag());

    let authorities: Vec<String> = sites.iter().map(|site| site.authority.clone()).collect();
    sites::register_sites(&mut scheduler, sites, &ranges, &store, &monitor).await?;
    scheduler.run_operations().await;

    let monitor = lock(&monitor);
    let (summary, entries, assessment) = report::build(
        &run_at,
        &authorities,
        scheduler.exceptions(),
        &cli.expect_bad,
        &monitor,
        scheduler.stats(),
        started.elapsed(),
    );
    for warning in &assessment.warnings {
        warn!("{warning}");
    }
    for failure in &assessment.errors {
        error!("{failure}");
    }
    info!(
        "run finished: {} succeeded, {} failed, {} record(s) saved",
        summary.successful.len(),
        summary.failed.len(),
        summary.records_saved
    );

    RunLog::open(&cli.data_dir)?.record_run(summary, entries)?;
    let removed = lock(&store).cleanup_old(DEFAULT_RETENTION_DAYS)?;
    if removed > 0 {
        info!("removed {removed} record(s) past the {DEFAULT_RETENTION_DAYS}-day retention");
    }

    Ok(ExitCode::from(assessment.exit_code()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
