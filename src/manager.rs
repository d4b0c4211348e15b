use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::NaiveDateTime;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::config::Config;
use crate::feed::TimetableFeed;
use crate::reconciler::{ReconcileError, StationReconciler};
use crate::scoreboard::{Rankings, Scoreboard, ScoreboardView};
use crate::train::{Train, TrainView};

/// How long a stopping station task may take before it is aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

type Registry = Arc<DashMap<CompactString, Arc<Station>>>;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub destination: String,
    pub capacity: usize,
    pub poll_interval: Duration,
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            destination: config.end_station.clone(),
            capacity: config.trains_per_station,
            poll_interval: config.poll_interval,
        }
    }
}

/// What readers see of a station: replaced as a whole after every tick.
#[derive(Debug, Default)]
struct Published {
    name: Option<String>,
    trains: Vec<Train>,
}

/// A monitored station and its polling task.
pub struct Station {
    eva: CompactString,
    position: usize,
    scoreboard: Arc<Scoreboard>,
    published: RwLock<Arc<Published>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Station {
    pub fn eva(&self) -> &str {
        &self.eva
    }

    pub fn name(&self) -> Option<String> {
        self.current().name.clone()
    }

    #[cfg(test)]
    pub fn trains(&self) -> Vec<Train> {
        self.current().trains.clone()
    }

    pub fn scoreboard(&self) -> &Arc<Scoreboard> {
        &self.scoreboard
    }

    pub fn is_running(&self) -> bool {
        !*self.stop_tx.borrow()
    }

    pub fn view(&self, now: NaiveDateTime) -> StationView {
        StationView {
            next: self.current().trains.iter().map(Train::view).collect(),
            score: self.scoreboard.view(now),
        }
    }

    /// Stops polling, interrupting a pending sleep or fetch. The task gets
    /// [`STOP_GRACE`] to wind down before it is aborted.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!(eva = %self.eva, "Station task did not stop in time, aborting");
                task.abort();
            }
        }
    }

    fn current(&self) -> Arc<Published> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish<F: TimetableFeed>(&self, reconciler: &StationReconciler<F>) {
        let published = Arc::new(Published {
            name: reconciler.station_name().map(str::to_string),
            trains: reconciler.trains().to_vec(),
        });
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = published;
    }
}

/// Owns the global scoreboard and every monitored station.
pub struct StationManager {
    global: Arc<Scoreboard>,
    stations: Registry,
}

impl Default for StationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StationManager {
    pub fn new() -> Self {
        Self {
            global: Arc::new(Scoreboard::new_global()),
            stations: Arc::new(DashMap::new()),
        }
    }

    pub fn global(&self) -> &Arc<Scoreboard> {
        &self.global
    }

    /// Registers a station and starts polling it. `restored` seeds the
    /// station's scoreboard before the first tick.
    pub fn monitor<F: TimetableFeed>(
        &self,
        eva: CompactString,
        position: usize,
        feed: Arc<F>,
        settings: &MonitorSettings,
        restored: Option<Rankings>,
    ) -> Arc<Station> {
        let scoreboard = Arc::new(Scoreboard::for_station(self.global.clone()));
        if let Some(rankings) = restored {
            scoreboard.restore(rankings);
        }
        let reconciler = StationReconciler::new(
            eva.clone(),
            settings.destination.clone(),
            settings.capacity,
            feed,
            scoreboard.clone(),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let station = Arc::new(Station {
            eva: eva.clone(),
            position,
            scoreboard,
            published: RwLock::new(Arc::default()),
            stop_tx,
            task: Mutex::new(None),
        });
        if let Some(previous) = self.stations.insert(eva.clone(), station.clone()) {
            warn!(%eva, "Station configured twice, replacing previous monitor");
            previous.stop_tx.send_replace(true);
        }

        let task = tokio::spawn(poll(
            station.clone(),
            reconciler,
            self.stations.clone(),
            settings.poll_interval,
            stop_rx,
        ));
        *station.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        station
    }

    pub fn station(&self, eva: &str) -> Option<Arc<Station>> {
        self.stations.get(eva).map(|entry| entry.value().clone())
    }

    /// Live stations in configuration order.
    pub fn stations(&self) -> Vec<Arc<Station>> {
        let mut stations: Vec<Arc<Station>> = self
            .stations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        stations.sort_by_key(|station| station.position);
        stations
    }

    /// Stops a station and removes it from the listing.
    pub async fn stop_station(&self, eva: &str) -> bool {
        let Some((_, station)) = self.stations.remove(eva) else {
            return false;
        };
        station.stop().await;
        info!(%eva, "Stopped monitoring station");
        true
    }

    pub async fn shutdown(&self) {
        for station in self.stations() {
            self.stop_station(station.eva()).await;
        }
    }

    /// Daily rollover across the global board and every live station board.
    pub fn rollover_all(&self, now: NaiveDateTime) {
        self.global.rollover(now);
        for station in self.stations() {
            station.scoreboard.rollover(now);
        }
        info!(stations = self.stations.len(), "Scoreboards rolled over");
    }

    pub fn listing(&self) -> StationListView {
        StationListView {
            list: self
                .stations()
                .iter()
                .map(|station| StationEntry {
                    eva: station.eva.to_string(),
                    name: station.name().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StationView {
    pub next: Vec<TrainView>,
    pub score: ScoreboardView,
}

#[derive(Debug, Serialize)]
pub struct StationEntry {
    pub eva: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct StationListView {
    pub list: Vec<StationEntry>,
}

async fn poll<F: TimetableFeed>(
    station: Arc<Station>,
    mut reconciler: StationReconciler<F>,
    registry: Registry,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(eva = %station.eva, "Start monitoring station");
    loop {
        if !station.is_running() {
            break;
        }

        let outcome = tokio::select! {
            outcome = reconciler.tick(clock::berlin_now()) => outcome,
            _ = stop_rx.changed() => break,
        };
        match outcome {
            Ok(()) => {
                station.publish(&reconciler);
                if reconciler.trains().is_empty() {
                    debug!(eva = %station.eva, "No trains in list");
                }
            }
            Err(ReconcileError::InvalidStation(eva)) => {
                error!(%eva, "Invalid station, disabling monitoring for this station");
                registry.remove_if(&eva, |_, current| Arc::ptr_eq(current, &station));
                station.stop_tx.send_replace(true);
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop_rx.changed() => break,
        }
    }
    debug!(eva = %station.eva, "Station task finished");
}
