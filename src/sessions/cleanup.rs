use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::SessionStore;
use crate::audit::AuditStore;
use crate::clock::Clock;
use crate::error::{StoreError, StoreResult};

/// Outcome of one sweep. Each half succeeds or fails on its own.
#[derive(Debug)]
pub struct CleanupReport {
    pub expired_sessions: StoreResult<u64>,
    pub purged_audit_entries: StoreResult<u64>,
}

/// One sweep: deletes expired sessions and, when a retention window is set,
/// audit entries older than it.
pub async fn run_cleanup_tick(
    sessions: &dyn SessionStore,
    audit: &dyn AuditStore,
    audit_retention: Option<time::Duration>,
    clock: &dyn Clock,
) -> CleanupReport {
    let expired_sessions = sessions.delete_expired_sessions().await;
    let purged_audit_entries = match audit_retention {
        Some(retention) => match clock.now().checked_sub(retention) {
            Some(cutoff) => audit.delete_older_than(cutoff).await,
            None => Err(StoreError::TimeOverflow("audit retention cutoff")),
        },
        None => Ok(0),
    };
    CleanupReport {
        expired_sessions,
        purged_audit_entries,
    }
}

fn log_report(report: &CleanupReport) {
    match &report.expired_sessions {
        Ok(0) => debug!("no expired sessions to remove"),
        Ok(n) => info!(expired_sessions = n, "removed expired sessions"),
        Err(e) => error!(error = %e, "expired session sweep failed"),
    }
    match &report.purged_audit_entries {
        Ok(0) => {}
        Ok(n) => info!(purged_audit_entries = n, "purged old audit entries"),
        Err(e) => error!(error = %e, "audit retention purge failed"),
    }
}

/// Runs `run_cleanup_tick` every `period` until `shutdown` is cancelled.
/// A failed sweep is logged and the loop carries on with the next tick.
pub fn spawn_session_cleanup(
    sessions: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditStore>,
    audit_retention: Option<time::Duration>,
    clock: Arc<dyn Clock>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "session cleanup started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("session cleanup stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = run_cleanup_tick(
                        sessions.as_ref(),
                        audit.as_ref(),
                        audit_retention,
                        clock.as_ref(),
                    )
                    .await;
                    log_report(&report);
                }
            }
        }
    })
}
