//! Core fixture model plus the date-label and team-blob normalizers shared by
//! adapters and the ingestion sink.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "matchday-core";

/// First month of a football season. Year-elided labels for earlier months
/// seen on or after this month belong to the next calendar year.
pub const SEASON_START_MONTH: u32 = 8;

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Adapter output: one fixture as published, date still a free-text label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFixture {
    pub date_label: String,
    pub time: String,
    pub home_team: String,
    pub away_team: String,
    pub competition: String,
    pub channel: String,
}

/// Canonical persisted fixture. `date` is `YYYY-MM-DD` or empty when the label
/// could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub date: String,
    pub home_team: String,
    pub away_team: String,
    pub time: String,
    pub competition: String,
    pub channel: String,
}

impl FixtureRecord {
    /// Builds the canonical record for a raw fixture. Unparseable labels map to
    /// an empty date so the record stays insertable.
    pub fn from_raw(raw: RawFixture, label_style: DateLabelStyle, reference: NaiveDate) -> Self {
        let date = normalize_date_label(&raw.date_label, reference, label_style.has_explicit_year())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        Self {
            date,
            home_team: raw.home_team.trim().to_string(),
            away_team: raw.away_team.trim().to_string(),
            time: raw.time,
            competition: raw.competition,
            channel: raw.channel,
        }
    }

    pub fn natural_identity(&self) -> (&str, &str, &str, &str) {
        (&self.date, &self.home_team, &self.away_team, &self.time)
    }
}

/// A fixture row as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFixture {
    pub id: i64,
    #[serde(flatten)]
    pub fixture: FixtureRecord,
}

/// How a source writes its date labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateLabelStyle {
    /// `Thu 4th December`
    YearElided,
    /// `Tuesday 25th November 2025`
    ExplicitYear,
}

impl DateLabelStyle {
    pub fn has_explicit_year(self) -> bool {
        matches!(self, DateLabelStyle::ExplicitYear)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateParseError {
    #[error("date label {label:?} is not parseable: {reason}")]
    NotParseable { label: String, reason: &'static str },
}

fn not_parseable(label: &str, reason: &'static str) -> DateParseError {
    DateParseError::NotParseable {
        label: label.to_string(),
        reason,
    }
}

fn strip_ordinal_suffix(token: &str) -> &str {
    ["st", "nd", "rd", "th"]
        .iter()
        .find_map(|suffix| token.strip_suffix(suffix))
        .unwrap_or(token)
}

fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    MONTH_NAMES
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
}

/// Resolves the year of a year-elided label using the season rollover rule.
pub fn season_year(reference: NaiveDate, month: u32) -> i32 {
    if reference.month() >= SEASON_START_MONTH && month < SEASON_START_MONTH {
        reference.year() + 1
    } else {
        reference.year()
    }
}

/// Parses `Weekday Day(st|nd|rd|th) Month [Year]` into a calendar date.
///
/// The weekday token is never checked against the resulting date; sources are
/// trusted to publish consistent labels.
pub fn normalize_date_label(
    label: &str,
    reference: NaiveDate,
    has_explicit_year: bool,
) -> Result<NaiveDate, DateParseError> {
    let tokens: Vec<&str> = label.split_whitespace().collect();
    let min_tokens = if has_explicit_year { 4 } else { 3 };
    if tokens.len() < min_tokens {
        return Err(not_parseable(label, "too few tokens"));
    }

    let day: u32 = strip_ordinal_suffix(tokens[1])
        .parse()
        .map_err(|_| not_parseable(label, "day is not an integer"))?;
    let month = month_from_name(tokens[2]).ok_or_else(|| not_parseable(label, "unknown month name"))?;
    let year = if has_explicit_year {
        tokens[3]
            .parse::<i32>()
            .map_err(|_| not_parseable(label, "year is not an integer"))?
    } else {
        season_year(reference, month)
    };

    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| not_parseable(label, "not a calendar date"))
}

/// Splits a `Home v Away` blob. Falls back to `(whole text, "")` when no
/// separator is present.
pub fn split_teams(text: &str) -> (String, String) {
    for separator in [" v ", " vs "] {
        if let Some((home, away)) = text.split_once(separator) {
            return (home.trim().to_string(), away.trim().to_string());
        }
    }
    (text.trim().to_string(), String::new())
}
