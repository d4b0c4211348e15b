use std::future::Future;
use std::time::Duration;

use chrono::NaiveDateTime;
use compact_str::CompactString;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str =
    "https://apis.deutschebahn.com/db-api-marketplace/apis/timetables/v1/";

/// A request against the timetable feed, relative to its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedRequest {
    /// Planned schedule for one station, date (`yyMMdd`) and hour (`HH`).
    Plan {
        eva: CompactString,
        date: String,
        hour: String,
    },
    /// Live changes for one station, full or recent-only.
    Changes { eva: CompactString, full: bool },
}

impl FeedRequest {
    pub fn plan(eva: CompactString, at: NaiveDateTime) -> Self {
        FeedRequest::Plan {
            eva,
            date: at.format("%y%m%d").to_string(),
            hour: at.format("%H").to_string(),
        }
    }

    pub fn changes(eva: CompactString, full: bool) -> Self {
        FeedRequest::Changes { eva, full }
    }

    pub fn target(&self) -> String {
        match self {
            FeedRequest::Plan { eva, date, hour } => format!("plan/{eva}/{date}/{hour}"),
            FeedRequest::Changes { eva, full: true } => format!("fchg/{eva}"),
            FeedRequest::Changes { eva, full: false } => format!("rchg/{eva}"),
        }
    }
}

/// What the reconciler gets back from a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Document(String),
    /// The feed rejected the request; the station id is not valid.
    InvalidStation,
    /// Nothing usable this time (network trouble, server error, no data).
    Unavailable,
}

pub trait TimetableFeed: Send + Sync + 'static {
    fn fetch(&self, request: &FeedRequest) -> impl Future<Output = FetchOutcome> + Send;
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Timetable API client for the DB API marketplace.
pub struct DbTimetableClient {
    client: Client,
    base_url: String,
    client_id: String,
    api_key: String,
}

impl DbTimetableClient {
    pub fn new(base_url: &str, client_id: &str, api_key: &str) -> Result<Self, FeedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            client_id: client_id.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

impl TimetableFeed for DbTimetableClient {
    async fn fetch(&self, request: &FeedRequest) -> FetchOutcome {
        let url = format!("{}{}", self.base_url, request.target());

        let response = match self
            .client
            .get(&url)
            .header("DB-Client-Id", &self.client_id)
            .header("DB-Api-Key", &self.api_key)
            .header("accept", "application/xml")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(%url, error = %e, "Timetable request failed");
                return FetchOutcome::Unavailable;
            }
        };

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            warn!(%url, "Timetable feed rejected request");
            return FetchOutcome::InvalidStation;
        }
        if !status.is_success() {
            debug!(%url, %status, "Timetable feed returned no data");
            return FetchOutcome::Unavailable;
        }

        match response.text().await {
            Ok(body) => FetchOutcome::Document(body),
            Err(e) => {
                warn!(%url, error = %e, "Failed to read timetable response");
                FetchOutcome::Unavailable
            }
        }
    }
}
