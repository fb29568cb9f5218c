use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::event::EventIds;
use crate::registry::ConnectionRegistry;
use crate::relay::close_with_notice;
use crate::storage::SessionStore;

const EXPIRED_REASON: &str = "session expired";

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub force_closed: usize,
    pub errors: usize,
    pub reset: bool,
}

/// Periodically expires sessions idle for longer than the configured lifetime.
pub struct Janitor {
    sessions: SessionStore,
    registry: Arc<ConnectionRegistry>,
    ids: Arc<EventIds>,
    lifetime: Duration,
    period: Duration,
}

impl Janitor {
    pub fn new(
        sessions: SessionStore,
        registry: Arc<ConnectionRegistry>,
        ids: Arc<EventIds>,
        lifetime: Duration,
        period: Duration,
    ) -> Self {
        Self {
            sessions,
            registry,
            ids,
            lifetime,
            period,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let report = self.sweep().await;
                counter!("chat_relay_sweeps_total", 1);
                if report.expired > 0 || report.errors > 0 {
                    info!(
                        scanned = report.scanned,
                        expired = report.expired,
                        force_closed = report.force_closed,
                        errors = report.errors,
                        reset = report.reset,
                        "session sweep finished"
                    );
                }
            }
        })
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now().timestamp()).await
    }

    /// Sweep as if the wall clock read `now` (unix seconds). Store failures
    /// are counted and skipped; the next period retries.
    pub async fn sweep_at(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();
        let activity = match self.sessions.activity().await {
            Ok(activity) => activity,
            Err(err) => {
                warn!(error = %err, "failed to read session activity");
                report.errors += 1;
                return report;
            }
        };
        if activity.is_empty() {
            return report;
        }

        let lifetime = i64::try_from(self.lifetime.as_secs()).unwrap_or(i64::MAX);
        for (session_id, last_active) in activity {
            report.scanned += 1;
            let expired = match last_active.parse::<i64>() {
                // An age that does not fit in i64 is far past any lifetime.
                Ok(last_active) => now
                    .checked_sub(last_active)
                    .map_or(true, |age| age > lifetime),
                Err(_) => {
                    debug!(session_id = %session_id, %last_active, "unparseable activity timestamp");
                    true
                }
            };
            if expired {
                self.expire(&session_id, &mut report).await;
            }
        }

        if report.expired > 0 {
            match self.sessions.activity().await {
                Ok(remaining) if remaining.is_empty() => match self.sessions.reset_tables().await {
                    Ok(()) => report.reset = true,
                    Err(err) => {
                        warn!(error = %err, "failed to reset session tables");
                        report.errors += 1;
                    }
                },
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "failed to re-read session activity");
                    report.errors += 1;
                }
            }
        }

        report
    }

    async fn expire(&self, session_id: &str, report: &mut SweepReport) {
        match self.sessions.bound_connection(session_id).await {
            Ok(Some(bound)) => {
                if self.close_local(session_id, &bound) {
                    report.force_closed += 1;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to read binding");
                report.errors += 1;
            }
        }

        // Owning connection may live on a sibling process; clean up regardless.
        if let Err(err) = self.sessions.remove_binding(session_id).await {
            warn!(session_id = %session_id, error = %err, "failed to remove binding");
            report.errors += 1;
        }
        if let Err(err) = self.sessions.remove_display_name(session_id).await {
            warn!(session_id = %session_id, error = %err, "failed to remove display name");
            report.errors += 1;
        }
        if let Err(err) = self.sessions.remove_activity(session_id).await {
            warn!(session_id = %session_id, error = %err, "failed to remove activity");
            report.errors += 1;
            return;
        }

        report.expired += 1;
        counter!("chat_relay_sessions_expired_total", 1);
        info!(session_id = %session_id, "session expired");
    }

    /// Close the bound connection if it lives on this process and still
    /// belongs to the session. Resource ids are only unique per process.
    fn close_local(&self, session_id: &str, bound: &str) -> bool {
        let Ok(resource_id) = bound.parse::<u64>() else {
            return false;
        };
        match self.registry.find(resource_id) {
            Some((handle, owner)) if owner == session_id => {
                close_with_notice(&self.ids, &handle, session_id, EXPIRED_REASON);
                self.registry.unbind(resource_id);
                true
            }
            _ => false,
        }
    }
}
