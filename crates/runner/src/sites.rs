use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use paceforge_core::sink::RecordSink as _;
use paceforge_core::{Authority, DataQualityMonitor, JsonRecordStore, Record, SinkError};
use paceforge_engine::{AgentCommand, AgentConfig, OperationContext, PoliteAgent};
use paceforge_plan::DateRange;

/// One scraping target from the roster file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSpec {
    /// Authority label; doubles as the record `authority_label`.
    pub authority: String,
    /// Page URL template; `{from}` and `{to}` expand to ISO dates.
    pub url_template: String,
    /// robots.txt crawl delay for this host, seconds, when known.
    #[serde(default)]
    pub crawl_delay_s: Option<u64>,
    /// Route this site through `MORPH_AUSTRALIAN_PROXY`.
    #[serde(default)]
    pub use_proxy: bool,
    /// Per-site override for the throttle's target load percentage.
    #[serde(default)]
    pub max_load_pct: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SiteRoster {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    sites: Vec<SiteSpec>,
}

/// Loads the site roster from a JSON file.
pub fn load_roster(path: &Path) -> anyhow::Result<Vec<SiteSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading site roster {}", path.display()))?;
    let roster: SiteRoster = serde_json::from_str(&raw)
        .with_context(|| format!("parsing site roster {}", path.display()))?;
    Ok(roster.sites)
}

impl SiteSpec {
    /// Agent settings for this site: environment defaults plus the
    /// roster's per-site overrides.
    pub fn agent_config(&self) -> AgentConfig {
        let mut config = AgentConfig::from_env(self.use_proxy);
        config.throttle.crawl_delay = self.crawl_delay_s.map(Duration::from_secs);
        if let Some(pct) = self.max_load_pct {
            config.throttle.max_load_pct = pct;
        }
        config
    }

    /// Expands the URL template for one date window.
    pub fn url_for(&self, range: &DateRange) -> anyhow::Result<Url> {
        let expanded = self
            .url_template
            .replace("{from}", &range.from.format("%Y-%m-%d").to_string())
            .replace("{to}", &range.to.format("%Y-%m-%d").to_string());
        Url::parse(&expanded)
            .with_context(|| format!("site {}: bad URL {expanded:?}", self.authority))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The task body for one site: fetch every planned date window, decode
/// the JSON record payloads, and feed them through the sink.
///
/// Unprocessable records are dropped and counted; the authority aborts
/// only when the quality monitor's budget runs out.
pub async fn scrape_site(
    mut ctx: OperationContext,
    site: SiteSpec,
    agent: Arc<PoliteAgent>,
    ranges: Vec<DateRange>,
    store: Arc<Mutex<JsonRecordStore>>,
    monitor: Arc<Mutex<DataQualityMonitor>>,
) -> anyhow::Result<()> {
    let authority = ctx.authority().clone();
    let today = paceforge_plan::today_home_zone()
        .format("%Y-%m-%d")
        .to_string();

    for range in &ranges {
        let url = site.url_for(range)?;
        debug!(authority = %authority, url = %url, label = %range.label, "fetching window");

        let payload = ctx.execute(&agent, AgentCommand::Get(url.clone())).await?;
        if payload.status != 200 {
            anyhow::bail!("{url} returned HTTP {}", payload.status);
        }

        let records: Vec<Record> = serde_json::from_str(&payload.body)
            .with_context(|| format!("decoding records from {url}"))?;
        for mut record in records {
            if record.authority_label.is_none() {
                record.authority_label = Some(site.authority.clone());
            }
            record.date_scraped = today.clone();

            match lock(&store).save(record) {
                Ok(()) => lock(&monitor).record_saved(&authority),
                Err(SinkError::Unprocessable(err)) => {
                    warn!(authority = %authority, error = %err, "dropping unprocessable record");
                    lock(&monitor).record_unprocessable(&authority)?;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
    Ok(())
}

/// Registers one scheduler operation per roster site.
pub async fn register_sites(
    scheduler: &mut paceforge_engine::Scheduler,
    sites: Vec<SiteSpec>,
    ranges: &[DateRange],
    store: &Arc<Mutex<JsonRecordStore>>,
    monitor: &Arc<Mutex<DataQualityMonitor>>,
) -> anyhow::Result<()> {
    for site in sites {
        let authority = Authority::new(&site.authority);
        let agent = Arc::new(PoliteAgent::new(authority.clone(), site.agent_config())?);
        let ranges = ranges.to_vec();
        let store = Arc::clone(store);
        let monitor = Arc::clone(monitor);

        scheduler
            .register_operation(authority, move |ctx| {
                scrape_site(ctx, site, agent, ranges, store, monitor)
            })
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn range() -> DateRange {
        DateRange {
            from: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2025, 2, 4).unwrap(),
            label: "everytime".to_string(),
        }
    }

    #[test]
    fn url_template_expands_both_dates() {
        let site = SiteSpec {
            authority: "ballina".to_string(),
            url_template: "https://da.example/list?from={from}&to={to}".to_string(),
            crawl_delay_s: None,
            use_proxy: false,
            max_load_pct: None,
        };
        let url = site.url_for(&range()).unwrap();
        assert_eq!(
            url.as_str(),
            "https://da.example/list?from=2025-02-01&to=2025-02-04"
        );
    }

    #[test]
    fn bad_templates_are_rejected_with_the_site_name() {
        let site = SiteSpec {
            authority: "bega".to_string(),
            url_template: "not a url {from}".to_string(),
            crawl_delay_s: None,
            use_proxy: false,
            max_load_pct: None,
        };
        let err = site.url_for(&range()).unwrap_err();
        assert!(format!("{err:#}").contains("bega"));
    }

    #[test]
    fn roster_overrides_flow_into_the_throttle() {
        let site = SiteSpec {
            authority: "yarra".to_string(),
            url_template: "https://h.example/".to_string(),
            crawl_delay_s: Some(7),
            use_proxy: false,
            max_load_pct: Some(35.0),
        };
        let config = site.agent_config();
        assert_eq!(config.throttle.crawl_delay, Some(Duration::from_secs(7)));
        assert_eq!(config.throttle.max_load_pct, 35.0);
    }

    #[test]
    fn roster_files_parse_with_defaults() {
        let json = r#"{
            "version": 1,
            "sites": [
                { "authority": "ballina", "url_template": "https://h.example/{from}" }
            ]
        }"#;
        let roster: SiteRoster = serde_json::from_str(json).unwrap();
        assert_eq!(roster.sites.len(), 1);
        assert!(!roster.sites[0].use_proxy);
        assert!(roster.sites[0].crawl_delay_s.is_none());
    }
}
