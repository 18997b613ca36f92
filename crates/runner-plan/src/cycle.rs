use chrono::NaiveDate;

use paceforge_core::env;

use crate::date_ranges::{julian_day, today_home_zone};

/// Deterministic position within a cycle of length `cycle`:
/// `julian_day(date) mod cycle`, in `[0, cycle)`.
///
/// `CYCLE_POSITION` overrides the computed position (reduced modulo the
/// cycle length) so tests can pin the rotation. A zero-length cycle
/// yields position 0.
pub fn position(cycle: usize, date: Option<NaiveDate>) -> usize {
    if cycle == 0 {
        return 0;
    }
    if let Some(forced) = env::parse::<usize>("CYCLE_POSITION") {
        return forced % cycle;
    }
    let date = date.unwrap_or_else(today_home_zone);
    julian_day(date).rem_euclid(cycle as i64) as usize
}

/// Picks the option for the day from `values`, rotating one step per day.
/// Returns `None` only for an empty slice.
pub fn pick<T>(values: &[T], date: Option<NaiveDate>) -> Option<&T> {
    if values.is_empty() {
        return None;
    }
    Some(&values[position(values.len(), date)])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn position_is_pure_and_bounded() {
        let day = date(2024, 1, 2);
        for cycle in 1..10 {
            let first = position(cycle, Some(day));
            assert!(first < cycle);
            assert_eq!(first, position(cycle, Some(day)));
        }
        assert_eq!(position(0, Some(day)), 0);
    }

    #[test]
    fn rotation_steps_daily_through_the_options() {
        let regions = ["north", "central", "south"];

        // 2024-01-02 is julian day 2460312, a multiple of three.
        assert_eq!(pick(&regions, Some(date(2024, 1, 2))), Some(&"north"));
        assert_eq!(pick(&regions, Some(date(2024, 1, 3))), Some(&"central"));
        assert_eq!(pick(&regions, Some(date(2024, 1, 4))), Some(&"south"));
        assert_eq!(pick(&regions, Some(date(2024, 1, 5))), Some(&"north"));
    }

    #[test]
    fn empty_option_set_yields_none() {
        let empty: [&str; 0] = [];
        assert_eq!(pick(&empty, Some(date(2024, 1, 2))), None);
    }
}
