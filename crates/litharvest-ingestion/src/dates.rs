//! Publication date resolution.
//!
//! Providers hand out dates in pieces (`<Year>`, `<Month>`, `<Day>`) or as a
//! free-text fallback (`<MedlineDate>2019 Mar-Apr</MedlineDate>`). Resolution
//! tries the most precise form first and never invents a date: anything that
//! can't be read becomes [`PublicationDate::Unresolved`] with the raw text.

use chrono::{DateTime, NaiveDate};
use litharvest_common::PublicationDate;

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december",
];

/// `"3"`, `"03"`, `"Mar"`, `"March"`, `"mar."` → 3.
pub fn parse_month(s: &str) -> Option<u32> {
    let s = s.trim().trim_end_matches('.');
    if let Ok(n) = s.parse::<u32>() {
        return (1..=12).contains(&n).then_some(n);
    }
    if s.len() < 3 || !s.is_ascii() {
        return None;
    }
    // Any prefix of a month name of at least three letters ("Sept", "Dec").
    let lower = s.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| m.starts_with(&lower))
        .map(|idx| idx as u32 + 1)
}

fn parse_year(s: &str) -> Option<i32> {
    let s = s.trim();
    if s.len() != 4 {
        return None;
    }
    s.parse::<i32>().ok().filter(|y| (1000..=9999).contains(y))
}

/// Resolve a date from its parts, falling back to the free-text field.
pub fn resolve(
    year: Option<&str>,
    month: Option<&str>,
    day: Option<&str>,
    free_text: Option<&str>,
) -> PublicationDate {
    if let Some(y) = year.and_then(parse_year) {
        match month.and_then(parse_month) {
            Some(m) => {
                let d = day
                    .and_then(|d| d.trim().parse::<u32>().ok())
                    .and_then(|d| NaiveDate::from_ymd_opt(y, m, d));
                return match d {
                    Some(date) => PublicationDate::Day { date },
                    None => PublicationDate::Month { year: y, month: m },
                };
            }
            None => return PublicationDate::Year { year: y },
        }
    }

    if let Some(resolved) = free_text.and_then(parse_free_text) {
        return resolved;
    }

    let raw = [year, month, day, free_text]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    PublicationDate::Unresolved { raw: (!raw.is_empty()).then_some(raw) }
}

/// Read a free-text date such as `"2019 Mar-Apr"`, `"1998 Dec-1999 Jan"`,
/// `"2000 Spring"` or `"2015-2016"`. The first year found wins; a month is
/// taken only when it directly follows that year.
pub fn parse_free_text(raw: &str) -> Option<PublicationDate> {
    let tokens: Vec<&str> = raw
        .split(|c: char| c.is_whitespace() || c == '-' || c == '/' || c == ',')
        .filter(|t| !t.is_empty())
        .collect();

    let pos = tokens.iter().position(|t| parse_year(t).is_some())?;
    let year = parse_year(tokens[pos])?;

    match tokens.get(pos + 1).and_then(|t| parse_month_name(t)) {
        Some(month) => {
            let day = tokens
                .get(pos + 2)
                .and_then(|t| t.parse::<u32>().ok())
                .and_then(|d| NaiveDate::from_ymd_opt(year, month, d));
            Some(match day {
                Some(date) => PublicationDate::Day { date },
                None => PublicationDate::Month { year, month },
            })
        }
        None => Some(PublicationDate::Year { year }),
    }
}

/// Month names only; a bare number after a year in free text is usually
/// another year or a page range.
fn parse_month_name(s: &str) -> Option<u32> {
    if s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    parse_month(s)
}

/// Atom timestamps (`2023-01-02T18:00:00Z`) or bare `YYYY-MM-DD`.
pub fn parse_timestamp(raw: &str) -> PublicationDate {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return PublicationDate::Day { date: dt.date_naive() };
    }
    if let Some(date) = s.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()) {
        return PublicationDate::Day { date };
    }
    PublicationDate::Unresolved { raw: (!s.is_empty()).then(|| s.to_string()) }
}
