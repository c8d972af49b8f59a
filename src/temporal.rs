//! # Temporal Module
//!
//! Validity intervals and closure bookkeeping for entity versions.
//! All run dates are calendar dates; a scrape run is stamped with the day it observed the catalog.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

/// The date a scrape run observed the catalog.
pub type RunDate = Date;

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> anyhow::Result<RunDate> {
    Date::parse(raw.trim(), DATE_FORMAT)
        .map_err(|err| anyhow::anyhow!("invalid date '{}': {}", raw, err))
}

/// Format a date as `YYYY-MM-DD`.
pub fn format_date(date: RunDate) -> String {
    date.format(DATE_FORMAT)
        .unwrap_or_else(|_| date.to_string())
}

/// A validity interval `[from, to)`; `to = None` means the interval is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Validity {
    /// First day the version was visible (inclusive)
    pub from: RunDate,
    /// Day the version was found missing (exclusive)
    pub to: Option<RunDate>,
}

impl Validity {
    /// Create an open interval starting at `from`
    pub fn open(from: RunDate) -> Self {
        Self { from, to: None }
    }

    /// Create a closed interval, rejecting a closing date before the opening date
    pub fn closed(from: RunDate, to: RunDate) -> anyhow::Result<Self> {
        if to < from {
            anyhow::bail!(
                "Invalid validity: closed at {} before opening at {}",
                format_date(to),
                format_date(from)
            );
        }
        Ok(Self { from, to: Some(to) })
    }

    pub fn is_open(&self) -> bool {
        self.to.is_none()
    }

    /// Check whether the version was visible on `date`
    pub fn contains(&self, date: RunDate) -> bool {
        self.from <= date && self.to.is_none_or(|to| date < to)
    }

    /// Number of days covered, `None` while open
    pub fn days(&self) -> Option<i64> {
        self.to.map(|to| (to - self.from).whole_days())
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to {
            Some(to) => write!(f, "[{}, {})", format_date(self.from), format_date(to)),
            None => write!(f, "[{}, open)", format_date(self.from)),
        }
    }
}

/// Multiset of closing dates collected for one identity.
///
/// Closing dates arrive from two sources: the `valid_to` of closed rows, and the
/// `previous_closures` lists already carried on rows. Carried lists are views of the
/// same history and may overlap each other, so they contribute the maximum count seen
/// for a date; raw `valid_to` stamps are distinct closures and contribute their sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosureLedger {
    stamped: BTreeMap<RunDate, usize>,
    carried: BTreeMap<RunDate, usize>,
}

impl ClosureLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the `valid_to` of a closed row.
    pub fn stamp(&mut self, closed_at: RunDate) {
        *self.stamped.entry(closed_at).or_insert(0) += 1;
    }

    /// Merge a carried `previous_closures` list.
    pub fn carry(&mut self, closures: &[RunDate]) {
        let mut counts: BTreeMap<RunDate, usize> = BTreeMap::new();
        for date in closures {
            *counts.entry(*date).or_insert(0) += 1;
        }
        for (date, count) in counts {
            let slot = self.carried.entry(date).or_insert(0);
            *slot = (*slot).max(count);
        }
    }

    /// Latest closing date, if any.
    pub fn last(&self) -> Option<RunDate> {
        let stamped = self.stamped.keys().next_back().copied();
        let carried = self.carried.keys().next_back().copied();
        stamped.max(carried)
    }

    pub fn is_empty(&self) -> bool {
        self.stamped.is_empty() && self.carried.is_empty()
    }

    /// Ascending list of closures, each date repeated as often as it was closed.
    pub fn into_sorted(self) -> Vec<RunDate> {
        let mut merged = self.carried;
        for (date, count) in self.stamped {
            let slot = merged.entry(date).or_insert(0);
            *slot = (*slot).max(count);
        }
        merged
            .into_iter()
            .flat_map(|(date, count)| std::iter::repeat_n(date, count))
            .collect()
    }
}

/// Check that a closure list is ascending
pub fn is_ascending(closures: &[RunDate]) -> bool {
    closures.windows(2).all(|pair| pair[0] <= pair[1])
}
