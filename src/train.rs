use std::cmp::Ordering;
use std::fmt;

use chrono::{Duration, NaiveDateTime};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock;
use crate::timetable_types::{StopEvent, TimetableStop};

/// High-speed categories that are never tracked.
const EXCLUDED_CATEGORIES: [&str; 3] = ["ICE", "EST", "FLX"];

/// Minutes after its real departure during which a train is still shown.
pub const DEPARTURE_GRACE_MINUTES: i64 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrainError {
    #[error("Timetable record has no id")]
    MissingId,
    #[error("Train {0} has no planned departure")]
    MissingDeparture(CompactString),
    #[error("Train {id}: unparseable timestamp {value:?}")]
    BadTimestamp { id: CompactString, value: String },
}

/// A train departing from a monitored station.
///
/// Identity and schedule are fixed once parsed; the live fields only move
/// through [`Train::apply_change`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Train {
    id: CompactString,
    line: CompactString,
    eligible: bool,
    planned_departure: NaiveDateTime,
    real_departure: NaiveDateTime,
    platform: Option<CompactString>,
    platform_history: String,
    last_stop: String,
    canceled: bool,
}

impl Train {
    /// Builds a train from a planned record. `fallback_last_stop` is used
    /// when the record carries no departure path.
    pub fn parse(record: &TimetableStop, fallback_last_stop: &str) -> Result<Self, TrainError> {
        let id = record
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(CompactString::from)
            .ok_or(TrainError::MissingId)?;

        let departure = record
            .departure
            .as_ref()
            .ok_or_else(|| TrainError::MissingDeparture(id.clone()))?;
        let planned_raw = departure
            .planned_time
            .as_deref()
            .ok_or_else(|| TrainError::MissingDeparture(id.clone()))?;
        let planned_departure = parse_timestamp(&id, planned_raw)?;

        let mut category = "";
        let mut number = "";
        if let Some(label) = &record.trip_label {
            category = label.category.as_deref().unwrap_or(category);
            number = label.number.as_deref().unwrap_or(number);
        }

        let mut train = Train {
            eligible: !EXCLUDED_CATEGORIES.contains(&category),
            line: CompactString::default(),
            planned_departure,
            real_departure: planned_departure,
            platform: None,
            platform_history: String::new(),
            last_stop: fallback_last_stop.to_string(),
            canceled: false,
            id,
        };

        // Departure wins over arrival, arrival over the trip label.
        for event in [record.arrival.as_ref(), Some(departure)].into_iter().flatten() {
            if let Some(platform) = &event.planned_platform {
                train.set_platform(platform);
            }
            number = event.line.as_deref().unwrap_or(number);
        }
        train.line = CompactString::from(format!("{category}{number}"));

        if let Some(stop) = departure.planned_path.as_deref().and_then(last_path_segment) {
            train.last_stop = stop.to_string();
        }

        Ok(train)
    }

    /// Applies a record from a changes document. Nothing is modified when
    /// the record carries an unparseable change time.
    pub fn apply_change(&mut self, record: &TimetableStop) -> Result<(), TrainError> {
        let Some(departure) = record.departure.as_ref() else {
            return Ok(());
        };

        if let Some(raw) = departure.changed_time.as_deref() {
            self.real_departure = parse_timestamp(&self.id, raw)?;
        }

        if let Some(stop) = changed_last_stop(departure) {
            self.last_stop = stop.to_string();
        }

        if let Some(platform) = departure
            .changed_platform
            .as_deref()
            .or(departure.planned_platform.as_deref())
        {
            self.set_platform(platform);
        }

        match departure.changed_status.as_deref() {
            Some("c") => self.canceled = true,
            Some("p") | Some("a") => self.canceled = false,
            _ => {}
        }

        Ok(())
    }

    fn set_platform(&mut self, value: &str) {
        if self.platform.as_deref() == Some(value) {
            return;
        }
        if !self.platform_history.is_empty() {
            self.platform_history.push_str(" -> ");
        }
        self.platform_history.push_str(value);
        self.platform = Some(CompactString::from(value));
    }

    pub fn has_departed(&self, now: NaiveDateTime) -> bool {
        now > self.real_departure + Duration::minutes(DEPARTURE_GRACE_MINUTES)
    }

    /// Difference between real and planned departure in whole minutes.
    pub fn delay_minutes(&self) -> i64 {
        (self.real_departure - self.planned_departure).num_minutes()
    }

    /// Order by real departure, earliest first.
    pub fn cmp_departure(&self, other: &Train) -> Ordering {
        self.real_departure.cmp(&other.real_departure)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn is_eligible(&self) -> bool {
        self.eligible
    }

    pub fn planned_departure(&self) -> NaiveDateTime {
        self.planned_departure
    }

    pub fn real_departure(&self) -> NaiveDateTime {
        self.real_departure
    }

    pub fn platform(&self) -> Option<&str> {
        self.platform.as_deref()
    }

    pub fn platform_history(&self) -> &str {
        &self.platform_history
    }

    pub fn last_stop(&self) -> &str {
        &self.last_stop
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn view(&self) -> TrainView {
        TrainView {
            l: self.line.to_string(),
            dep: self.planned_departure.format("%H:%M").to_string(),
            dde: self.real_departure().format("%H:%M").to_string(),
            end: self.last_stop().to_string(),
            plt: self.platform_history().to_string(),
            del: self.delay_minutes().to_string(),
            can: self.is_canceled(),
            dat: self.planned_departure.format("%d.%m.%Y").to_string(),
        }
    }
}

impl fmt::Display for Train {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (to {}) dp {} - {}",
            self.line,
            self.last_stop,
            self.planned_departure.format("%H:%M"),
            self.real_departure.format("%H:%M"),
        )?;
        let delay = self.delay_minutes();
        if delay != 0 {
            write!(f, " ({delay:+})")?;
        }
        if let Some(platform) = self.platform() {
            write!(f, " from {platform}")?;
        }
        write!(f, " [{}]", self.id)
    }
}

/// Flat JSON projection of a train.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainView {
    pub l: String,
    pub dep: String,
    pub dde: String,
    pub end: String,
    pub plt: String,
    pub del: String,
    pub can: bool,
    pub dat: String,
}

fn parse_timestamp(id: &CompactString, raw: &str) -> Result<NaiveDateTime, TrainError> {
    clock::parse_feed_timestamp(raw).ok_or_else(|| TrainError::BadTimestamp {
        id: id.clone(),
        value: raw.to_string(),
    })
}

fn last_path_segment(path: &str) -> Option<&str> {
    path.rsplit('|').next().filter(|stop| !stop.is_empty())
}

// The changed path takes precedence over the planned one.
fn changed_last_stop(event: &StopEvent) -> Option<&str> {
    event
        .changed_path
        .as_deref()
        .and_then(last_path_segment)
        .or_else(|| event.planned_path.as_deref().and_then(last_path_segment))
}
