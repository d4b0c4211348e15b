use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Europe::Berlin;

/// Timestamp layout used by the timetable feed (`yyMMddHHmm`, local time).
pub const FEED_TIMESTAMP: &str = "%y%m%d%H%M";

/// Local hour at which the daily rankings roll over.
pub const ROLLOVER_HOUR: i64 = 3;

pub fn berlin_now() -> NaiveDateTime {
    Utc::now().with_timezone(&Berlin).naive_local()
}

pub fn parse_feed_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), FEED_TIMESTAMP).ok()
}

/// The rollover instant on the given calendar day.
pub fn boundary_on(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN) + Duration::hours(ROLLOVER_HOUR)
}

/// Most recent rollover instant at or before `now`.
pub fn last_boundary(now: NaiveDateTime) -> NaiveDateTime {
    let today = boundary_on(now.date());
    if now < today {
        today - Duration::days(1)
    } else {
        today
    }
}

/// Next rollover instant strictly after `now`.
pub fn next_boundary(now: NaiveDateTime) -> NaiveDateTime {
    let today = boundary_on(now.date());
    if now < today {
        today
    } else {
        today + Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> NaiveDateTime {
        parse_feed_timestamp(raw).unwrap()
    }

    #[test]
    fn parses_feed_timestamps() {
        assert_eq!(
            at("2610181007").format("%Y-%m-%d %H:%M").to_string(),
            "2026-10-18 10:07"
        );
        assert!(parse_feed_timestamp("26101810").is_none());
        assert!(parse_feed_timestamp("unknown").is_none());
    }

    #[test]
    fn boundaries_around_three_am() {
        // Before 03:00 the current window started yesterday.
        assert_eq!(last_boundary(at("2610180200")), at("2610170300"));
        assert_eq!(next_boundary(at("2610180200")), at("2610180300"));

        assert_eq!(last_boundary(at("2610180300")), at("2610180300"));
        assert_eq!(next_boundary(at("2610180300")), at("2610190300"));

        assert_eq!(last_boundary(at("2610182359")), at("2610180300"));
        assert_eq!(next_boundary(at("2610182359")), at("2610190300"));
    }
}
