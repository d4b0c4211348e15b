use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock;
use crate::train::{Train, TrainView};

pub const DEFAULT_DAY_COUNT: usize = 3;
pub const DEFAULT_WEEK_COUNT: usize = 5;

const WEEK_DAYS: i64 = 7;
/// Entries this close to the oldest top-ranked one survive the weekly trim.
const WEEK_TIE_MINUTES: i64 = 1;

/// Both ranking windows, each sorted by descending delay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rankings {
    pub today: Vec<Train>,
    pub week: Vec<Train>,
}

/// Most-delayed trains over the current day and the last seven days.
///
/// Station boards forward every registration to the global board they were
/// created with. All mutations happen under one write lock, so readers only
/// ever see fully sorted and pruned rankings.
#[derive(Debug)]
pub struct Scoreboard {
    day_count: usize,
    week_count: usize,
    rankings: RwLock<Rankings>,
    global: Option<Arc<Scoreboard>>,
}

impl Scoreboard {
    pub fn new_global() -> Self {
        Self::with_counts(DEFAULT_DAY_COUNT, DEFAULT_WEEK_COUNT, None)
    }

    pub fn for_station(global: Arc<Scoreboard>) -> Self {
        Self::with_counts(DEFAULT_DAY_COUNT, DEFAULT_WEEK_COUNT, Some(global))
    }

    pub fn with_counts(day_count: usize, week_count: usize, global: Option<Arc<Scoreboard>>) -> Self {
        Self {
            day_count,
            week_count,
            rankings: RwLock::new(Rankings::default()),
            global,
        }
    }

    pub fn is_global(&self) -> bool {
        self.global.is_none()
    }

    /// Adds the train to both windows. A train already ranked (by id) is
    /// refreshed in place rather than added twice.
    pub fn register(&self, train: &Train, now: NaiveDateTime) {
        {
            let mut rankings = self.write();
            upsert(&mut rankings.today, train, now);
            upsert(&mut rankings.week, train, now);
        }
        if let Some(global) = &self.global {
            global.register(train, now);
        }
    }

    /// Drops entries that fell out of the day and week windows.
    pub fn rollover(&self, now: NaiveDateTime) {
        let today_start = clock::last_boundary(now);
        let week_start = today_start - Duration::days(WEEK_DAYS);

        let mut rankings = self.write();
        rankings
            .today
            .retain(|train| train.planned_departure() >= today_start);
        rankings
            .week
            .retain(|train| train.planned_departure() >= week_start);

        if rankings.week.len() < self.week_count {
            return;
        }
        // Keep everything departing around or after the oldest of the top entries.
        let oldest_top = rankings
            .week
            .iter()
            .take(self.week_count)
            .map(Train::planned_departure)
            .min();
        if let Some(oldest_top) = oldest_top {
            let cutoff = oldest_top - Duration::minutes(WEEK_TIE_MINUTES);
            rankings
                .week
                .retain(|train| train.planned_departure() >= cutoff);
        }
        debug!(
            today = rankings.today.len(),
            week = rankings.week.len(),
            global = self.is_global(),
            "Scoreboard rolled over"
        );
    }

    pub fn top_today(&self, now: NaiveDateTime) -> Vec<Train> {
        top(&self.read().today, self.day_count, now)
    }

    pub fn top_week(&self, now: NaiveDateTime) -> Vec<Train> {
        top(&self.read().week, self.week_count, now)
    }

    pub fn view(&self, now: NaiveDateTime) -> ScoreboardView {
        ScoreboardView {
            day: self.top_today(now).iter().map(Train::view).collect(),
            week: self.top_week(now).iter().map(Train::view).collect(),
        }
    }

    pub fn snapshot(&self) -> Rankings {
        self.read().clone()
    }

    pub fn restore(&self, mut rankings: Rankings) {
        rankings.today.sort_by(by_delay_desc);
        rankings.week.sort_by(by_delay_desc);
        *self.write() = rankings;
    }

    fn read(&self) -> RwLockReadGuard<'_, Rankings> {
        self.rankings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Rankings> {
        self.rankings.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreboardView {
    pub day: Vec<TrainView>,
    pub week: Vec<TrainView>,
}

fn by_delay_desc(a: &Train, b: &Train) -> std::cmp::Ordering {
    b.delay_minutes().cmp(&a.delay_minutes())
}

fn upsert(ranking: &mut Vec<Train>, train: &Train, now: NaiveDateTime) {
    match ranking.iter_mut().find(|ranked| ranked.id() == train.id()) {
        Some(ranked) => *ranked = train.clone(),
        None => ranking.push(train.clone()),
    }
    ranking.sort_by(by_delay_desc);
    ranking.retain(|ranked| !(ranked.has_departed(now) && ranked.delay_minutes() <= 0));
}

// Trains of the current day window with a real delay, best first.
fn top(ranking: &[Train], count: usize, now: NaiveDateTime) -> Vec<Train> {
    let horizon = clock::next_boundary(now);
    ranking
        .iter()
        .filter(|train| train.planned_departure() < horizon && train.delay_minutes() > 0)
        .take(count)
        .cloned()
        .collect()
}
