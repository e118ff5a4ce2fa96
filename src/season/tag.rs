//! Season calendar: maps capture timestamps to season tags.
//!
//! Tags read `"{year}-{period}"`. A period runs from its start day until the
//! next period starts; the last period wraps over New Year and keeps the
//! year in which it started.

use crate::config::SeasonPeriod;
use chrono::{DateTime, Datelike, Utc};

/// Calendar of named season periods.
#[derive(Debug, Clone)]
pub struct SeasonCalendar {
    periods: Vec<SeasonPeriod>,
}

impl SeasonCalendar {
    /// Build a calendar. Periods are sorted by start date.
    pub fn new(periods: &[SeasonPeriod]) -> Self {
        let mut periods = periods.to_vec();
        periods.sort_by_key(|p| (p.start_month, p.start_day));
        Self { periods }
    }

    /// Season tag for a timestamp.
    pub fn tag(&self, at: DateTime<Utc>) -> String {
        let (year, name) = self.period_at(at.year(), at.month(), at.day());
        format!("{year}-{name}")
    }

    /// Year and period name for a calendar date.
    pub fn period_at(&self, year: i32, month: u32, day: u32) -> (i32, &str) {
        let current = self
            .periods
            .iter()
            .rev()
            .find(|p| (p.start_month, p.start_day) <= (month, day));

        match (current, self.periods.last()) {
            (Some(period), _) => (year, period.name.as_str()),
            // Before the first start date: still in last year's final period.
            (None, Some(last)) => (year - 1, last.name.as_str()),
            (None, None) => (year, "all"),
        }
    }

    /// Period names in calendar order.
    pub fn period_names(&self) -> impl Iterator<Item = &str> {
        self.periods.iter().map(|p| p.name.as_str())
    }
}
