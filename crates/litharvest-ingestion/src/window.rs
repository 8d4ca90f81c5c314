//! Date windows.
//!
//! Providers page unreliably at large offsets, so a long date range is
//! split into bounded windows that are each paged from offset 0.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate};
use litharvest_common::{HarvestError, Result};
use serde::{Deserialize, Serialize};

use crate::models::DateRange;

/// Width of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WindowSpan {
    /// Calendar months; windows break on the 1st.
    Months(u32),
    Days(u32),
}

impl Default for WindowSpan {
    fn default() -> Self {
        WindowSpan::Months(1)
    }
}

impl FromStr for WindowSpan {
    type Err = HarvestError;

    /// `"1m"`, `"3 months"`, `"14d"`, `"month"`, `"day"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        let unit = s[digits.len()..].trim();
        let count = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<u32>()
                .map_err(|e| HarvestError::Config(format!("invalid window span '{s}': {e}")))?
        };
        match unit {
            "m" | "mo" | "month" | "months" => Ok(WindowSpan::Months(count)),
            "d" | "day" | "days" => Ok(WindowSpan::Days(count)),
            _ => Err(HarvestError::Config(format!(
                "invalid window span '{s}' (expected e.g. \"1m\" or \"7d\")"
            ))),
        }
    }
}

impl TryFrom<String> for WindowSpan {
    type Error = HarvestError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<WindowSpan> for String {
    fn from(span: WindowSpan) -> Self {
        span.to_string()
    }
}

impl fmt::Display for WindowSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpan::Months(n) => write!(f, "{n}m"),
            WindowSpan::Days(n) => write!(f, "{n}d"),
        }
    }
}

/// Order in which windows are visited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOrder {
    Chronological,
    /// Newest window first.
    #[default]
    MostRecentFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Pending,
    Active,
    /// Paged to the end.
    Exhausted,
    /// Gave up after too many consecutive failures.
    Aborted,
}

/// One bounded slice of the requested date range plus its paging cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Position in visiting order.
    pub index: usize,
    pub range: DateRange,
    pub offset: usize,
    pub status: WindowStatus,
    pub consecutive_failures: u32,
}

impl Window {
    fn new(index: usize, range: DateRange) -> Self {
        Self { index, range, offset: 0, status: WindowStatus::Pending, consecutive_failures: 0 }
    }

    pub fn activate(&mut self) {
        self.status = WindowStatus::Active;
        self.offset = 0;
        self.consecutive_failures = 0;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, WindowStatus::Exhausted | WindowStatus::Aborted)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}]", self.index, self.range)
    }
}

fn last_day_of_span(start: NaiveDate, span: WindowSpan) -> Option<NaiveDate> {
    match span {
        WindowSpan::Months(n) => {
            let month_start = start.with_day(1)?;
            month_start.checked_add_months(Months::new(n))?.pred_opt()
        }
        WindowSpan::Days(n) => start.checked_add_days(Days::new(u64::from(n) - 1)),
    }
}

/// Split `range` into contiguous, non-overlapping windows of `span`.
///
/// Month windows end on month boundaries: the first one runs from
/// `range.start` to the end of its span and the last is clipped to
/// `range.end`.
pub fn plan_windows(range: DateRange, span: WindowSpan, order: WindowOrder) -> Result<Vec<Window>> {
    if range.start > range.end {
        return Err(HarvestError::Config(format!(
            "start date {} is after end date {}",
            range.start, range.end
        )));
    }
    if matches!(span, WindowSpan::Months(0) | WindowSpan::Days(0)) {
        return Err(HarvestError::Config("window span must be at least 1".to_string()));
    }

    let mut ranges = Vec::new();
    let mut start = range.start;
    loop {
        let end = last_day_of_span(start, span).map_or(range.end, |d| d.min(range.end));
        ranges.push(DateRange::new(start, end));
        match end.succ_opt() {
            Some(next) if end < range.end => start = next,
            _ => break,
        }
    }

    if order == WindowOrder::MostRecentFirst {
        ranges.reverse();
    }
    Ok(ranges.into_iter().enumerate().map(|(i, r)| Window::new(i, r)).collect())
}
