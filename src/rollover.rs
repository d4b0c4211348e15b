use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Europe::Berlin;
use chrono_tz::Tz;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock;
use crate::manager::StationManager;

const FALLBACK_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Time left until the next rollover instant in `now`'s time zone.
pub fn until_next_rollover(now: DateTime<Tz>) -> Duration {
    let tz = now.timezone();
    (0..=2)
        .map(|days| clock::boundary_on(now.date_naive() + chrono::Duration::days(days)))
        .filter_map(|local| tz.from_local_datetime(&local).earliest())
        .find(|candidate| *candidate > now)
        .and_then(|next| (next - now).to_std().ok())
        .unwrap_or(FALLBACK_WAIT)
}

/// Rolls every scoreboard over once a day until `shutdown` flips.
pub async fn run(manager: Arc<StationManager>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = until_next_rollover(Utc::now().with_timezone(&Berlin));
        info!(wait_secs = wait.as_secs(), "Next scoreboard rollover scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        manager.rollover_all(clock::berlin_now());
    }
    warn!("Rollover scheduler stopped");
}
