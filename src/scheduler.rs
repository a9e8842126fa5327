//! In-process cron ticker for scheduled all-rules runs.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::{info, warn};

use crate::engine::Orchestrator;
use crate::error::ConfigError;

/// Parse a cron expression (seconds field first).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: "CLEANMAIL_SCHEDULE".to_string(),
        message: format!("invalid cron {expr:?}: {e}"),
    })
}

/// Next fire time strictly after `after`.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run every active rule each time `schedule` fires.
///
/// The orchestrator serialises runs, so a tick that lands while an
/// HTTP-triggered run is in progress waits for it instead of overlapping.
pub fn spawn_schedule(
    orchestrator: Arc<Orchestrator>,
    schedule: Schedule,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now) else {
                warn!("Schedule has no upcoming fire time, ticker stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next, "Next scheduled run");
            tokio::time::sleep(wait).await;

            let outcome = orchestrator.run_all_active_rules().await;
            let moved: usize = outcome.results.iter().map(|r| r.moved).sum();
            let failed: usize = outcome.results.iter().map(|r| r.failed).sum();
            info!(
                success = outcome.success,
                rules = outcome.results.len(),
                moved,
                failed,
                "Scheduled run finished"
            );
        }
    })
}
