use chrono::{
    DateTime, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat,
    TimeZone, Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid date format '{0}'. Use YYYY-MM-DD")]
pub struct InvalidDate(pub String);

/// Parses a purge cutoff. Dates and naive date-times are interpreted in
/// `zone`; RFC 3339 input keeps its own offset.
pub fn parse_cutoff(raw: &str, zone: Tz) -> Result<DateTime<FixedOffset>, InvalidDate> {
    let value = raw.trim();
    let invalid = || InvalidDate(raw.to_string());

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed);
    }

    let naive = if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        date.and_time(NaiveTime::MIN)
    } else {
        ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"]
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
            .ok_or_else(invalid)?
    };

    localize(naive, zone).ok_or_else(invalid)
}

/// `[start, end)` of the calendar day containing `now`, shifted by
/// `days_back` days, in `zone`.
pub fn day_window(
    now: DateTime<Utc>,
    zone: Tz,
    days_back: i64,
) -> Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    let today = now.with_timezone(&zone).date_naive();
    let day = today.checked_sub_signed(Duration::days(days_back))?;
    let next = day.succ_opt()?;
    let start = localize(day.and_time(NaiveTime::MIN), zone)?;
    let end = localize(next.and_time(NaiveTime::MIN), zone)?;
    Some((start, end))
}

pub fn to_iso(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, false)
}

pub fn to_display(value: &DateTime<FixedOffset>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn localize(naive: NaiveDateTime, zone: Tz) -> Option<DateTime<FixedOffset>> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(value) => Some(value.fixed_offset()),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.fixed_offset()),
        // Spring-forward gap: move past it.
        LocalResult::None => zone
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|value| value.fixed_offset()),
    }
}
