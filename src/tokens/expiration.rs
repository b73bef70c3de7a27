use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Deserialize;

use crate::errors::AppError;

/// Date format accepted for explicit expirations, e.g. `31-12-2030`.
pub const DATE_FORMAT: &str = "%d-%m-%Y";

/// Expiration as it arrives on the wire: a JSON integer of days, or a string
/// holding `never`, a day count, or a `DD-MM-YYYY` date. Any other JSON
/// value lands in `Other` so the request body still parses and the field
/// itself is reported as invalid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ExpirationInput {
    Days(i64),
    Text(String),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationDirective {
    Never,
    InDays(u32),
    /// Expires at midnight UTC starting the given day.
    On(NaiveDate),
}

impl ExpirationDirective {
    /// `Ok(None)` for blank text: the caller falls back to its default.
    pub fn parse(input: &ExpirationInput) -> Result<Option<Self>, AppError> {
        match input {
            ExpirationInput::Days(days) => Self::from_day_count(*days).map(Some),
            ExpirationInput::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                if text.eq_ignore_ascii_case("never") {
                    return Ok(Some(Self::Never));
                }
                if let Ok(days) = text.parse::<i64>() {
                    return Self::from_day_count(days).map(Some);
                }
                NaiveDate::parse_from_str(text, DATE_FORMAT)
                    .map(|date| Some(Self::On(date)))
                    .map_err(|_| AppError::InvalidInput("expiration"))
            }
            ExpirationInput::Other(_) => Err(AppError::InvalidInput("expiration")),
        }
    }

    fn from_day_count(days: i64) -> Result<Self, AppError> {
        u32::try_from(days)
            .map(Self::InDays)
            .map_err(|_| AppError::InvalidInput("expiration"))
    }

    /// Absolute expiry relative to `now`. Explicit dates must lie in the
    /// future.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, AppError> {
        match self {
            Self::Never => Ok(None),
            Self::InDays(days) => now
                .checked_add_signed(Duration::days(i64::from(*days)))
                .map(Some)
                .ok_or(AppError::InvalidInput("expiration")),
            Self::On(date) => {
                let midnight = date
                    .and_hms_opt(0, 0, 0)
                    .ok_or(AppError::InvalidInput("expiration"))?;
                let at = Utc.from_utc_datetime(&midnight);
                if at <= now {
                    return Err(AppError::InvalidInput("expiration"));
                }
                Ok(Some(at))
            }
        }
    }
}
