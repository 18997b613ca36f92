#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Deterministic run planning for `paceforge`: which historical date
//! windows a run re-checks, and julian-day-keyed rotation across option
//! sets. Everything here is a pure function of its inputs so repeated
//! runs on the same day produce identical plans.

/// Julian-day-indexed rotation across option sets.
pub mod cycle;
/// The Fibonacci-tiered date-range planner.
pub mod date_ranges;

pub use cycle::{pick, position};
pub use date_ranges::{calculate_date_ranges, julian_day, today_home_zone, DateRange, PlannerConfig};
