use chrono::{Datelike, Duration, NaiveDate};

use paceforge_core::env;

/// The Fibonacci progression of re-check periods, in days.
const PERIODS: [i64; 4] = [2, 3, 5, 8];

/// Offset from days-since-CE to the astronomical julian day number.
const JULIAN_DAY_OFFSET: i64 = 1_721_425;

/// Integer julian day number for `date`; stable across processes and
/// time zones, which makes date-keyed rotation deterministic.
pub fn julian_day(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce()) + JULIAN_DAY_OFFSET
}

/// Today's date in the default planning zone (UTC+09:30).
pub fn today_home_zone() -> NaiveDate {
    paceforge_core::record::today_home_zone()
}

/// Planner inputs; see [`calculate_date_ranges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannerConfig {
    /// Total history window to keep covered, in days.
    pub days: i64,
    /// Most recent days checked on every run, regardless of rotation.
    pub everytime: i64,
    /// Cap on how long any one date may go unchecked, in days.
    pub max_period: i64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            days: 33,
            everytime: 4,
            max_period: 3,
        }
    }
}

impl PlannerConfig {
    /// Defaults overridden by `MORPH_DAYS`, `MORPH_EVERYTIME` and
    /// `MORPH_MAX_PERIOD`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            days: env::parse("MORPH_DAYS").unwrap_or(defaults.days),
            everytime: env::parse("MORPH_EVERYTIME").unwrap_or(defaults.everytime),
            max_period: env::parse("MORPH_MAX_PERIOD").unwrap_or(defaults.max_period),
        }
    }
}

/// One planned window: check `[from, to]` inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    /// First date of the window.
    pub from: NaiveDate,
    /// Last date of the window.
    pub to: NaiveDate,
    /// Which schedule tier(s) produced this window.
    pub label: String,
}

impl DateRange {
    fn single(date: NaiveDate, label: impl Into<String>) -> Self {
        Self {
            from: date,
            to: date,
            label: label.into(),
        }
    }
}

/// Plans the date windows for one run.
///
/// The most recent `everytime` days are always checked. Older dates fall
/// into consecutive tiers, one per allowed period `{2, 3, 5, 8} ≤
/// max_period`, with the remaining history at the largest allowed period
/// `P*`. A tier of period `p` emits the dates whose julian-day distance
/// from the tier start is a multiple of `p`, so every date is re-checked
/// at least every `p` days while it ages through the tier and again the
/// day it enters the next tier. The oldest date of the window is always
/// emitted so the horizon edge cannot slip out unchecked.
///
/// Guarantees: any `P*` consecutive runs cover the whole window; no date
/// inside the window goes more than `P*` days unchecked; each run checks
/// roughly `days / P* + everytime` dates. Adjacent or overlapping
/// emissions merge, labels joined with `,`; output is oldest-first.
pub fn calculate_date_ranges(config: PlannerConfig, today: NaiveDate) -> Vec<DateRange> {
    let PlannerConfig {
        days,
        everytime,
        max_period,
    } = config;
    let everytime = everytime.max(0);

    if max_period <= 0 || days <= 0 {
        return Vec::new();
    }
    if max_period == 1 || everytime >= days {
        return vec![DateRange {
            from: today - Duration::days(days - 1),
            to: today,
            label: "everything".to_string(),
        }];
    }

    let allowed: Vec<i64> = PERIODS.iter().copied().filter(|p| *p <= max_period).collect();
    let Some(&cap) = allowed.last() else {
        // max_period >= 2 always admits period 2.
        return Vec::new();
    };

    let horizon = days - 1;
    let mut emitted: Vec<DateRange> = Vec::new();

    if everytime > 0 {
        emitted.push(DateRange {
            from: today - Duration::days(everytime - 1),
            to: today,
            label: "everytime".to_string(),
        });
    }

    let mut tier_start = everytime;
    let mut horizon_emitted = false;
    for &period in &allowed {
        if tier_start > horizon {
            break;
        }
        let tier_end = if period == cap {
            horizon
        } else {
            (tier_start + period - 1).min(horizon)
        };

        let mut age = tier_start;
        while age <= tier_end {
            emitted.push(DateRange::single(
                today - Duration::days(age),
                format!("{period}days"),
            ));
            if age == horizon {
                horizon_emitted = true;
            }
            age += period;
        }
        tier_start = tier_end + 1;
    }

    if !horizon_emitted {
        emitted.push(DateRange::single(
            today - Duration::days(horizon),
            format!("{cap}days"),
        ));
    }

    merge_ranges(emitted)
}

/// Sorts emissions oldest-first and merges adjacent or overlapping ranges,
/// concatenating distinct labels with `,`. Overlaps never survive: the
/// merged range absorbs both.
fn merge_ranges(mut ranges: Vec<DateRange>) -> Vec<DateRange> {
    ranges.sort_by_key(|range| (range.from, range.to));

    let mut merged: Vec<DateRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.from <= last.to + Duration::days(1) => {
                if range.to > last.to {
                    last.to = range.to;
                }
                if !last
                    .label
                    .split(',')
                    .any(|existing| existing == range.label)
                {
                    last.label.push(',');
                    last.label.push_str(&range.label);
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}
