use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use compact_str::CompactString;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::feed::{FeedRequest, FetchOutcome, TimetableFeed};
use crate::scoreboard::Scoreboard;
use crate::timetable_types::{Timetable, parse_timetable};
use crate::train::Train;

pub const DEFAULT_CAPACITY: usize = 10;

/// How many hourly plan documents are looked at when filling the list.
const MAX_HOUR_OFFSET: i64 = 10;
/// Recent-only changes are enough if the last refresh is at most this old.
const INCREMENTAL_WINDOW_SECS: i64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("Timetable feed rejected station {0}")]
    InvalidStation(CompactString),
}

/// Keeps the next departures from one station towards the destination.
pub struct StationReconciler<F> {
    eva: CompactString,
    destination: String,
    capacity: usize,
    feed: Arc<F>,
    scoreboard: Arc<Scoreboard>,
    station_name: Option<String>,
    trains: Vec<Train>,
    last_refresh: Option<NaiveDateTime>,
}

impl<F: TimetableFeed> StationReconciler<F> {
    pub fn new(
        eva: CompactString,
        destination: impl Into<String>,
        capacity: usize,
        feed: Arc<F>,
        scoreboard: Arc<Scoreboard>,
    ) -> Self {
        Self {
            eva,
            destination: destination.into(),
            capacity,
            feed,
            scoreboard,
            station_name: None,
            trains: Vec::new(),
            last_refresh: None,
        }
    }

    pub fn station_name(&self) -> Option<&str> {
        self.station_name.as_deref()
    }

    /// Tracked trains, ordered by real departure.
    pub fn trains(&self) -> &[Train] {
        &self.trains
    }

    /// One polling round. The tracked list is only replaced at the very end,
    /// so a failed or abandoned tick leaves the previous list in place.
    pub async fn tick(&mut self, now: NaiveDateTime) -> Result<(), ReconcileError> {
        let mut survivors: Vec<Train> = self
            .trains
            .iter()
            .filter(|train| !train.has_departed(now))
            .cloned()
            .collect();

        // A full list only needs its live state refreshed.
        let backfilled = survivors.len() < self.capacity;
        if backfilled {
            self.backfill(&mut survivors, now).await?;
        }

        self.refresh(&mut survivors, backfilled, now).await?;

        survivors.sort_by(Train::cmp_departure);
        survivors.retain(|train| !train.has_departed(now));
        survivors.truncate(self.capacity);
        self.trains = survivors;

        for train in &self.trains {
            self.scoreboard.register(train, now);
        }
        trace!(eva = %self.eva, trains = self.trains.len(), backfilled, "Tick complete");
        Ok(())
    }

    async fn backfill(
        &mut self,
        survivors: &mut Vec<Train>,
        now: NaiveDateTime,
    ) -> Result<(), ReconcileError> {
        // Planned-only data may show a delayed train as gone; it stays in the
        // list for the refresh but does not take up a slot yet.
        let upcoming = |trains: &[Train]| trains.iter().filter(|t| !t.has_departed(now)).count();
        let mut offset = 0;
        while upcoming(survivors.as_slice()) < self.capacity && offset < MAX_HOUR_OFFSET {
            let request = FeedRequest::plan(self.eva.clone(), now + Duration::hours(offset));
            if let Some(timetable) = self.fetch_timetable(&request).await? {
                self.absorb_plan(survivors, &timetable);
            }
            offset += 1;
        }
        Ok(())
    }

    fn absorb_plan(&mut self, survivors: &mut Vec<Train>, timetable: &Timetable) {
        if let Some(eva) = timetable.eva.as_deref().filter(|eva| *eva != self.eva.as_str()) {
            warn!(eva = %self.eva, document_eva = eva, "Plan document is for another station");
        }
        if let Some(name) = &timetable.station {
            self.station_name = Some(name.clone());
        }
        let fallback = self.station_name.as_deref().unwrap_or_default();

        for record in &timetable.stops {
            let Some(id) = record.id.as_deref().map(str::trim) else {
                debug!(eva = %self.eva, "Skipping planned record without id");
                continue;
            };
            let heads_to_destination = record
                .departure
                .as_ref()
                .is_some_and(|dp| dp.heads_to(&self.destination));
            if !heads_to_destination {
                continue;
            }
            if survivors.iter().any(|train| train.id() == id) {
                continue;
            }

            match Train::parse(record, fallback) {
                Ok(train) if train.is_eligible() => {
                    debug!(eva = %self.eva, train = %train, "Tracking train");
                    survivors.push(train);
                }
                Ok(train) => trace!(eva = %self.eva, line = train.line(), "Skipping excluded category"),
                Err(e) => warn!(eva = %self.eva, error = %e, "Skipping malformed planned record"),
            }
        }
    }

    async fn refresh(
        &mut self,
        survivors: &mut [Train],
        force_full: bool,
        now: NaiveDateTime,
    ) -> Result<(), ReconcileError> {
        let stale = self.last_refresh.is_none_or(|at| {
            now - at > Duration::seconds(INCREMENTAL_WINDOW_SECS)
        });
        let request = FeedRequest::changes(self.eva.clone(), force_full || stale);
        let Some(timetable) = self.fetch_timetable(&request).await? else {
            return Ok(());
        };
        self.last_refresh = Some(now);

        for record in &timetable.stops {
            let Some(id) = record.id.as_deref().map(str::trim) else {
                continue;
            };
            let Some(train) = survivors.iter_mut().find(|train| train.id() == id) else {
                continue;
            };
            if let Err(e) = train.apply_change(record) {
                warn!(eva = %self.eva, error = %e, "Skipping malformed change record");
            }
        }
        Ok(())
    }

    async fn fetch_timetable(
        &self,
        request: &FeedRequest,
    ) -> Result<Option<Timetable>, ReconcileError> {
        match self.feed.fetch(request).await {
            FetchOutcome::Document(body) => match parse_timetable(&body) {
                Ok(timetable) => Ok(Some(timetable)),
                Err(e) => {
                    warn!(request = %request.target(), error = %e, "Unparseable timetable document");
                    Ok(None)
                }
            },
            FetchOutcome::InvalidStation => Err(ReconcileError::InvalidStation(self.eva.clone())),
            FetchOutcome::Unavailable => {
                debug!(request = %request.target(), "No timetable data this tick");
                Ok(None)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::clock::parse_feed_timestamp;
    use crate::feed::testing::FakeFeed;

    const EVA: &str = "8000207";
    const AACHEN: &str = "Köln-Ehrenfeld|Düren|Aachen Hbf";

    fn at(raw: &str) -> NaiveDateTime {
        parse_feed_timestamp(raw).unwrap()
    }

    fn reconciler(capacity: usize, feed: &Arc<FakeFeed>) -> StationReconciler<FakeFeed> {
        StationReconciler::new(
            EVA.into(),
            "Aachen Hbf",
            capacity,
            feed.clone(),
            Arc::new(Scoreboard::new_global()),
        )
    }

    fn ids(reconciler: &StationReconciler<FakeFeed>) -> Vec<&str> {
        reconciler.trains().iter().map(Train::id).collect()
    }

    #[tokio::test]
    async fn test_backfill_filters_and_orders() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[
                planned_stop("re-2", "RE", "2610180950", AACHEN),
                planned_stop("ice", "ICE", "2610180940", AACHEN),
                planned_stop("s-bonn", "S", "2610180945", "Köln Süd|Bonn Hbf"),
                planned_stop("re-1", "RE", "2610180935", AACHEN),
                r#"<s><tl c="RE"/><dp pt="2610180955" ppth="Aachen Hbf"/></s>"#.to_string(),
                planned_stop("broken", "RE", "yesterday", AACHEN),
            ]),
        );
        feed.document(
            "plan/8000207/261018/10",
            document(&[
                planned_stop("re-3", "RE", "2610181005", AACHEN),
                // Shows up again in the next hour's document.
                planned_stop("re-2", "RE", "2610180950", AACHEN),
            ]),
        );

        let mut reconciler = reconciler(10, &feed);
        reconciler.tick(at("2610180930")).await.unwrap();

        assert_eq!(ids(&reconciler), ["re-1", "re-2", "re-3"]);
        assert_eq!(reconciler.station_name(), Some("Köln Hbf"));
        assert_eq!(reconciler.trains()[0].last_stop(), "Aachen Hbf");

        // Not full, so every hour up to the bound was asked for, then a full refresh.
        let targets = feed.targets();
        assert_eq!(targets.len(), 11);
        assert_eq!(targets[0], "plan/8000207/261018/09");
        assert_eq!(targets[9], "plan/8000207/261018/18");
        assert_eq!(targets[10], "fchg/8000207");
    }

    #[tokio::test]
    async fn test_backfill_stops_when_full_and_truncates() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[
                planned_stop("c", "RE", "2610180955", AACHEN),
                planned_stop("a", "RE", "2610180935", AACHEN),
                planned_stop("b", "RB", "2610180945", AACHEN),
            ]),
        );

        let mut reconciler = reconciler(2, &feed);
        reconciler.tick(at("2610180930")).await.unwrap();

        assert_eq!(ids(&reconciler), ["a", "b"]);
        assert_eq!(feed.targets(), ["plan/8000207/261018/09", "fchg/8000207"]);
    }

    #[tokio::test]
    async fn test_full_list_skips_backfill() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[
                planned_stop("a", "RE", "2610180935", AACHEN),
                planned_stop("b", "RE", "2610180945", AACHEN),
            ]),
        );

        let mut reconciler = reconciler(2, &feed);
        reconciler.tick(at("2610180930")).await.unwrap();
        assert_eq!(ids(&reconciler), ["a", "b"]);

        feed.document("fchg/8000207", document(&[]));
        feed.document("rchg/8000207", document(&[change_stop("b", "2610180949")]));

        // The unavailable refresh of the first tick did not count as a refresh.
        feed.clear_requests();
        reconciler.tick(at("2610180931")).await.unwrap();
        assert_eq!(feed.targets(), ["fchg/8000207"]);

        // Within a minute of the last refresh only recent changes are fetched.
        feed.clear_requests();
        reconciler.tick(at("2610180932")).await.unwrap();
        assert_eq!(feed.targets(), ["rchg/8000207"]);
        assert_eq!(reconciler.trains()[1].delay_minutes(), 4);

        // More than a minute later the full changes are fetched again.
        feed.clear_requests();
        reconciler.tick(at("2610180934")).await.unwrap();
        assert_eq!(feed.targets(), ["fchg/8000207"]);
    }

    #[tokio::test]
    async fn test_changes_update_delay_and_scoreboard() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[planned_stop("x", "RE", "2610181000", AACHEN)]),
        );
        feed.document(
            "fchg/8000207",
            document(&[
                change_stop("x", "2610181007"),
                change_stop("unknown", "2610181010"),
                r#"<s><dp ct="2610181010"/></s>"#.to_string(),
            ]),
        );

        let board = Arc::new(Scoreboard::new_global());
        let mut reconciler =
            StationReconciler::new(EVA.into(), "Aachen Hbf", 10, feed.clone(), board.clone());
        let now = at("2610180930");
        reconciler.tick(now).await.unwrap();

        assert_eq!(ids(&reconciler), ["x"]);
        assert_eq!(reconciler.trains()[0].delay_minutes(), 7);
        let top = board.top_today(now);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].id(), "x");
    }

    #[tokio::test]
    async fn test_on_time_train_is_registered_but_not_ranked() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[planned_stop("x", "RE", "2610181000", AACHEN)]),
        );

        let board = Arc::new(Scoreboard::new_global());
        let mut reconciler =
            StationReconciler::new(EVA.into(), "Aachen Hbf", 10, feed.clone(), board.clone());
        let now = at("2610180930");
        reconciler.tick(now).await.unwrap();

        assert_eq!(reconciler.trains()[0].delay_minutes(), 0);
        assert_eq!(board.snapshot().today.len(), 1);
        assert!(board.top_today(now).is_empty());
    }

    #[tokio::test]
    async fn test_departed_trains_are_dropped_and_replaced() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[
                planned_stop("a", "RE", "2610180935", AACHEN),
                planned_stop("b", "RE", "2610180945", AACHEN),
            ]),
        );
        let mut reconciler = reconciler(2, &feed);
        reconciler.tick(at("2610180930")).await.unwrap();
        assert_eq!(ids(&reconciler), ["a", "b"]);

        feed.document(
            "plan/8000207/261018/09",
            document(&[
                planned_stop("a", "RE", "2610180935", AACHEN),
                planned_stop("b", "RE", "2610180945", AACHEN),
            ]),
        );
        feed.document(
            "plan/8000207/261018/10",
            document(&[planned_stop("c", "RE", "2610181005", AACHEN)]),
        );
        reconciler.tick(at("2610180941")).await.unwrap();
        assert_eq!(ids(&reconciler), ["b", "c"]);
    }

    #[tokio::test]
    async fn test_departed_plan_entries_cost_one_more_hour() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[
                planned_stop("gone-1", "RE", "2610180900", AACHEN),
                planned_stop("gone-2", "RE", "2610180905", AACHEN),
                planned_stop("a", "RE", "2610180950", AACHEN),
            ]),
        );
        feed.document(
            "plan/8000207/261018/10",
            document(&[
                planned_stop("b", "RE", "2610181010", AACHEN),
                planned_stop("c", "RE", "2610181020", AACHEN),
            ]),
        );

        let mut reconciler = reconciler(2, &feed);
        reconciler.tick(at("2610180930")).await.unwrap();

        // The departed entries do not fill the list, so exactly one more hour
        // is fetched and the search stops as soon as it is full.
        assert_eq!(ids(&reconciler), ["a", "b"]);
        assert_eq!(
            feed.targets(),
            ["plan/8000207/261018/09", "plan/8000207/261018/10", "fchg/8000207"]
        );

        // A full list fetches no plans at all.
        feed.clear_requests();
        reconciler.tick(at("2610180931")).await.unwrap();
        assert!(feed.targets().iter().all(|target| !target.starts_with("plan/")));
        assert_eq!(ids(&reconciler), ["a", "b"]);
    }

    #[tokio::test]
    async fn test_delayed_train_survives_past_planned_time() {
        let feed = Arc::new(FakeFeed::default());
        feed.document(
            "plan/8000207/261018/09",
            document(&[planned_stop("late", "RE", "2610180905", AACHEN)]),
        );
        feed.document("fchg/8000207", document(&[change_stop("late", "2610180950")]));

        let mut reconciler = reconciler(10, &feed);
        reconciler.tick(at("2610180930")).await.unwrap();
        assert_eq!(ids(&reconciler), ["late"]);
        assert_eq!(reconciler.trains()[0].delay_minutes(), 45);
    }

    #[tokio::test]
    async fn test_unparseable_documents_are_not_fatal() {
        let feed = Arc::new(FakeFeed::default());
        feed.document("plan/8000207/261018/09", "<html>Bad Gateway");
        feed.document("fchg/8000207", "not xml at all <");

        let mut reconciler = reconciler(10, &feed);
        assert!(reconciler.tick(at("2610180930")).await.is_ok());
        assert!(reconciler.trains().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_station_aborts_tick() {
        let feed = Arc::new(FakeFeed::default());
        feed.respond("plan/8000207/261018/09", FetchOutcome::InvalidStation);

        let mut reconciler = reconciler(10, &feed);
        assert_eq!(
            reconciler.tick(at("2610180930")).await,
            Err(ReconcileError::InvalidStation(EVA.into()))
        );
        assert_eq!(feed.targets(), ["plan/8000207/261018/09"]);
    }

    #[tokio::test]
    async fn test_list_never_exceeds_capacity_or_repeats_ids() {
        let feed = Arc::new(FakeFeed::default());
        for hour in 9..19 {
            let stops: Vec<String> = (0..4)
                .map(|n| {
                    planned_stop(
                        &format!("t{}", (hour + n) % 12),
                        if n == 3 { "FLX" } else { "RE" },
                        &format!("261018{hour:02}{:02}", 10 * n + 5),
                        AACHEN,
                    )
                })
                .collect();
            feed.document(&format!("plan/8000207/261018/{hour:02}"), document(&stops));
        }

        let mut reconciler = reconciler(5, &feed);
        let mut now = at("2610180900");
        for _ in 0..30 {
            reconciler.tick(now).await.unwrap();
            let trains = reconciler.trains();
            assert!(trains.len() <= 5);
            let mut seen: Vec<&str> = trains.iter().map(Train::id).collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), trains.len());
            assert!(trains.iter().all(Train::is_eligible));
            assert!(trains.windows(2).all(|w| w[0].real_departure() <= w[1].real_departure()));
            now += Duration::minutes(3);
        }
    }
}
