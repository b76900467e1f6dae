//! Reporting periods.
//!
//! A requested timestamp resolves to the calendar month containing it. The
//! month is encoded three ways: `YYYYMM` for DHIS2, `YYYY-MM` for target
//! document intervals, and `Month, YYYY` for people.

use crate::error::ExportError;
use crate::models::PeriodChoice;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// A calendar month plus the date the export is completed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Period {
    pub year: i32,
    pub month: u32,
    pub complete_date: NaiveDate,
}

impl Period {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        Self {
            year: date.year(),
            month: date.month(),
            complete_date: date,
        }
    }

    /// DHIS2 period code, e.g. `200002`.
    pub fn code(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Target document interval, e.g. `2000-02`.
    pub fn interval(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// e.g. `February, 2000`
    pub fn description(&self) -> String {
        self.first_day().format("%B, %Y").to_string()
    }

    pub fn complete_date_string(&self) -> String {
        self.complete_date.format("%Y-%m-%d").to_string()
    }

    fn first_day(&self) -> NaiveDate {
        self.complete_date.with_day(1).unwrap_or(self.complete_date)
    }
}

fn invalid(input: &str, reason: impl Into<String>) -> ExportError {
    ExportError::InvalidPeriod {
        input: input.to_string(),
        reason: reason.into(),
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::default()))
}

/// Parse a period argument.
///
/// Accepts `YYYY-MM`, `YYYYMM`, `YYYY-MM-DD`, RFC 3339 timestamps and epoch
/// milliseconds.
pub fn parse_period(input: &str) -> Result<DateTime<Utc>, ExportError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid(input, "empty period"));
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        if s.len() == 6 {
            let date = NaiveDate::parse_from_str(&format!("{}01", s), "%Y%m%d")
                .map_err(|e| invalid(input, e.to_string()))?;
            return Ok(start_of_day(date));
        }
        let millis: i64 = s.parse().map_err(|_| invalid(input, "timestamp out of range"))?;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| invalid(input, "timestamp out of range"));
    }

    if s.len() == 7 {
        let date = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d")
            .map_err(|e| invalid(input, e.to_string()))?;
        return Ok(start_of_day(date));
    }

    if s.len() == 10 {
        let date =
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| invalid(input, e.to_string()))?;
        return Ok(start_of_day(date));
    }

    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| invalid(input, e.to_string()))
}

/// The `count` most recent months ending with the month of `now`, newest first.
///
/// Timestamps are the first instant of each month in UTC, so they do not
/// depend on the machine's time zone. A browser-side form would use local
/// midnight instead, which differs by the UTC offset.
pub fn recent_periods(now: DateTime<Utc>, count: usize) -> Vec<PeriodChoice> {
    let today = now.date_naive();
    let current = today.year() * 12 + today.month0() as i32;

    (0..count as i32)
        .filter_map(|back| {
            let index = current - back;
            let first = NaiveDate::from_ymd_opt(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)?;
            Some(PeriodChoice {
                timestamp: start_of_day(first).timestamp_millis().to_string(),
                description: first.format("%B, %Y").to_string(),
            })
        })
        .collect()
}
