//! Notification and telemetry sink. The sync driver reports aggregated
//! events here; presentation of them is somebody else's problem.

use async_trait::async_trait;
use chrono::NaiveDate;

/// Receiver of user-facing sync events. All methods default to no-ops so
/// implementations only pick up what they present.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// One aggregated notice after a classifier pass found failures.
    async fn actions_failed(&self, _credential_id: i64, _failed: u64) {}

    /// Broadcast-style signal that a sync attempt went wrong overall.
    async fn sync_failed(&self, _credential_id: i64) {}

    /// Telemetry record of every classifier pass, failures or not.
    async fn action_sync_recorded(&self, _credential_id: i64, _failed: u64, _succeeded: u64) {}

    async fn credit_changed(&self, _credential_id: i64, _from: Option<i64>, _to: Option<i64>) {}

    async fn low_credit(&self, _credential_id: i64, _credit: i64, _threshold: i64) {}

    async fn new_menu(&self, _portal_id: i64, _portal_name: &str, _until: NaiveDate) {}

    /// A sibling portion could not be canceled and went into the shared
    /// food stock instead.
    async fn stock_forced(&self, _credential_id: i64, _portal_id: i64) {}
}

/// Sink that writes every event to the log.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn actions_failed(&self, credential_id: i64, failed: u64) {
        tracing::warn!(credential_id, failed, "order changes were rejected by the portal");
    }

    async fn sync_failed(&self, credential_id: i64) {
        tracing::warn!(credential_id, "sync failed");
    }

    async fn action_sync_recorded(&self, credential_id: i64, failed: u64, succeeded: u64) {
        tracing::info!(credential_id, failed, succeeded, "action sync recorded");
    }

    async fn credit_changed(&self, credential_id: i64, from: Option<i64>, to: Option<i64>) {
        tracing::info!(credential_id, ?from, ?to, "credit changed");
    }

    async fn low_credit(&self, credential_id: i64, credit: i64, threshold: i64) {
        tracing::warn!(credential_id, credit, threshold, "credit below threshold");
    }

    async fn new_menu(&self, portal_id: i64, portal_name: &str, until: NaiveDate) {
        tracing::info!(portal_id, portal_name, %until, "new menu available");
    }

    async fn stock_forced(&self, credential_id: i64, portal_id: i64) {
        tracing::info!(credential_id, portal_id, "portion offered into food stock");
    }
}
