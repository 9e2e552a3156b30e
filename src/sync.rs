//! Sync driver: plans the task mask of every credential/portal scope, runs
//! the plugin sessions, then classifies in-flight actions and emits the
//! aggregated notifications.

use crate::classify::{self, SyncTally};
use crate::db::{repo, LogData, Pool};
use crate::notify::EventSink;
use crate::plugin::{SessionContext, SessionReport, SessionRunner, TaskKind, TaskMask, TaskResult};
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// What a sync run is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Everything: menus, actions, credit.
    Full,
    /// Only what changes between menu publications: pending actions and
    /// credit.
    Changes,
    /// Remaining-portion counts (and credit), optionally for one credential.
    Remaining { credential: Option<i64> },
}

impl RunMode {
    fn filter(self) -> TaskMask {
        match self {
            RunMode::Full => TaskMask::all(),
            RunMode::Changes => [TaskKind::ActionPresentSync, TaskKind::CreditSync]
                .into_iter()
                .collect(),
            RunMode::Remaining { .. } => [
                TaskKind::RemainingToOrderSync,
                TaskKind::RemainingToTakeSync,
                TaskKind::CreditSync,
            ]
            .into_iter()
            .collect(),
        }
    }

    fn credential(self) -> Option<i64> {
        match self {
            RunMode::Remaining { credential } => credential,
            _ => None,
        }
    }
}

/// Requested masks per scope. Scopes must be ordered by credential group,
/// then portal: every credential refreshes its own credit, the first scope
/// on a portal carries the menu work, later scopes on the same portal
/// re-sync group menus only when the portal needs it per group.
pub fn scope_masks(scopes: &[LogData], mode: RunMode) -> Vec<TaskMask> {
    let mut seen_portals = HashSet::new();
    let filter = mode.filter();

    scopes
        .iter()
        .map(|scope| {
            let mut mask: TaskMask = [
                TaskKind::ActionPresentSync,
                TaskKind::ActionHistorySync,
                TaskKind::CreditSync,
            ]
            .into_iter()
            .collect();
            if seen_portals.insert(scope.portal_id) {
                mask.insert(TaskKind::MenuSync);
                mask.insert(TaskKind::GroupMenuSync);
                mask.insert(TaskKind::RemainingToTakeSync);
                mask.insert(TaskKind::RemainingToOrderSync);
            } else if scope.features.group_full_sync() {
                mask.insert(TaskKind::GroupMenuSync);
            }
            mask.intersection(filter)
        })
        .collect()
}

/// Result of one scope's session.
#[derive(Debug)]
pub struct ScopeOutcome {
    pub credential_id: i64,
    pub portal_id: i64,
    pub requested: TaskMask,
    pub report: SessionReport,
}

/// Result of one whole sync run.
#[derive(Debug)]
pub struct SyncSummary {
    pub scopes: Vec<ScopeOutcome>,
    pub worst: TaskResult,
    pub tallies: Vec<(i64, SyncTally)>,
}

/// Drives sync runs over the registered portal plugins.
pub struct SyncEngine {
    pool: Pool,
    plugins: HashMap<String, SessionRunner>,
    sink: Arc<dyn EventSink>,
    plugin_timeout: Duration,
}

impl SyncEngine {
    pub fn new(pool: Pool, sink: Arc<dyn EventSink>, plugin_timeout: Duration) -> Self {
        Self {
            pool,
            plugins: HashMap::new(),
            sink,
            plugin_timeout,
        }
    }

    pub fn register_plugin(&mut self, name: impl Into<String>, runner: SessionRunner) {
        self.plugins.insert(name.into(), runner);
    }

    #[instrument(skip(self))]
    pub async fn run(&self, mode: RunMode) -> Result<SyncSummary> {
        let scopes = repo::load_log_data(&self.pool, mode.credential()).await?;
        let masks = scope_masks(&scopes, mode);

        // FAILED rows a newer edit superseded must go before their keys can
        // clash with the classifier below.
        for credential_id in distinct(scopes.iter().map(|s| s.credential_id)) {
            repo::delete_conflicting_failed(&self.pool, credential_id).await?;
        }

        let menu_dates = self.snapshot_menu_dates(&scopes).await?;
        let credits: HashMap<i64, Option<i64>> = scopes
            .iter()
            .map(|s| (s.credential_id, s.credit))
            .collect();

        let mut outcomes = Vec::with_capacity(scopes.len());
        for (scope, requested) in scopes.into_iter().zip(masks) {
            if requested.is_empty() {
                continue;
            }
            let report = self.run_scope(&scope, requested).await;
            outcomes.push(ScopeOutcome {
                credential_id: scope.credential_id,
                portal_id: scope.portal_id,
                requested,
                report,
            });
        }

        let worst = outcomes
            .iter()
            .map(|o| o.report.worst())
            .max()
            .unwrap_or(TaskResult::NotSupported);

        let mut tallies = Vec::new();
        // A transport-level failure leaves the synced layer untouched, so
        // diffing local actions against it would only produce noise.
        let conclusive = !matches!(
            worst,
            TaskResult::IoError
                | TaskResult::PortalInaccessible
                | TaskResult::PluginTimeout
                | TaskResult::Cancelled
        );
        if conclusive {
            for credential_id in distinct(outcomes.iter().map(|o| o.credential_id)) {
                let tally = classify::finalize_sync(&self.pool, credential_id).await?;
                self.sink
                    .action_sync_recorded(credential_id, tally.failed, tally.succeeded)
                    .await;
                if tally.failed > 0 {
                    self.sink.actions_failed(credential_id, tally.failed).await;
                    self.sink.sync_failed(credential_id).await;
                }
                tallies.push((credential_id, tally));
            }
            repo::set_meta(&self.pool, "last_sync", &chrono::Utc::now().to_rfc3339()).await?;
        }

        self.notify_menu_changes(&menu_dates).await?;
        self.notify_credit_changes(&credits).await?;

        Ok(SyncSummary {
            scopes: outcomes,
            worst,
            tallies,
        })
    }

    async fn run_scope(&self, scope: &LogData, requested: TaskMask) -> SessionReport {
        let Some(runner) = self.plugins.get(&scope.plugin) else {
            tracing::warn!(plugin = %scope.plugin, "no such plugin registered");
            let mut report = SessionReport::default();
            for kind in requested.iter() {
                report.results.insert(kind, TaskResult::NotSupported);
            }
            return report;
        };

        let mut ctx = SessionContext::new(self.pool.clone(), scope.clone(), self.plugin_timeout);
        match tokio::time::timeout(self.plugin_timeout, runner.run_session(&mut ctx, requested))
            .await
        {
            Ok(report) => {
                if let Err(err) = ctx.persist().await {
                    tracing::warn!(error = %err, "failed to persist session state");
                }
                report
            }
            Err(_) => {
                tracing::warn!(
                    credential_id = scope.credential_id,
                    plugin = %scope.plugin,
                    "session timed out"
                );
                let mut report = SessionReport::default();
                for kind in requested.iter() {
                    report.results.insert(kind, TaskResult::PluginTimeout);
                }
                report
            }
        }
    }

    async fn snapshot_menu_dates(
        &self,
        scopes: &[LogData],
    ) -> Result<HashMap<i64, Option<NaiveDate>>> {
        let mut dates = HashMap::new();
        for portal_id in distinct(scopes.iter().map(|s| s.portal_id)) {
            dates.insert(portal_id, repo::last_menu_date(&self.pool, portal_id).await?);
        }
        Ok(dates)
    }

    async fn notify_menu_changes(&self, before: &HashMap<i64, Option<NaiveDate>>) -> Result<()> {
        for (&portal_id, &old_date) in before {
            let new_date = repo::last_menu_date(&self.pool, portal_id).await?;
            let Some(new_date) = new_date else { continue };
            if old_date.map(|d| new_date > d).unwrap_or(true) {
                let (name, wanted) = repo::portal_notification_info(&self.pool, portal_id).await?;
                if wanted {
                    self.sink.new_menu(portal_id, &name, new_date).await;
                }
            }
        }
        Ok(())
    }

    async fn notify_credit_changes(&self, before: &HashMap<i64, Option<i64>>) -> Result<()> {
        for (&credential_id, &old_credit) in before {
            let status = repo::credit_status(&self.pool, credential_id).await?;
            let Some(credit) = status.credit else { continue };
            if status.notify_credit_increase && old_credit.map(|c| credit > c).unwrap_or(false) {
                self.sink
                    .credit_changed(credential_id, old_credit, Some(credit))
                    .await;
            }
            if status.notify_low_credit
                && status.low_credit_threshold > 0
                && credit < status.low_credit_threshold
            {
                self.sink
                    .low_credit(credential_id, credit, status.low_credit_threshold)
                    .await;
            }
        }
        Ok(())
    }
}

fn distinct(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortalFeatures, SecurityMode};

    fn scope(credential_id: i64, portal_id: i64, group_id: i64, features: u32) -> LogData {
        LogData {
            portal_id,
            credential_id,
            credential_group_id: group_id,
            portal_name: "canteen".into(),
            plugin: "icanteen".into(),
            reference: "https://example.cz".into(),
            security: SecurityMode::TrustTrusted,
            features: PortalFeatures(features),
            credential_name: format!("user{credential_id}"),
            secret: String::new(),
            credit: None,
            portal_extra: None,
            credential_extra: None,
        }
    }

    #[test]
    fn first_scope_carries_menu_and_credit() {
        let scopes = vec![scope(1, 1, 1, 0)];
        let masks = scope_masks(&scopes, RunMode::Full);
        let mask = masks[0];
        for kind in TaskKind::ALL {
            assert!(mask.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn second_credential_on_portal_skips_menu_work() {
        let scopes = vec![scope(1, 1, 1, 0), scope(2, 1, 1, 0)];
        let masks = scope_masks(&scopes, RunMode::Full);
        let second = masks[1];
        assert!(second.contains(TaskKind::ActionPresentSync));
        assert!(second.contains(TaskKind::ActionHistorySync));
        assert!(second.contains(TaskKind::CreditSync));
        assert!(!second.contains(TaskKind::MenuSync));
        assert!(!second.contains(TaskKind::GroupMenuSync));
    }

    // Credit is per credential, not per credential group: later members of
    // a group must still have theirs refreshed or it goes stale forever.
    #[test]
    fn every_credential_syncs_its_own_credit() {
        let scopes = vec![scope(1, 1, 7, 0), scope(2, 2, 7, 0)];
        let masks = scope_masks(&scopes, RunMode::Full);
        assert!(masks[0].contains(TaskKind::CreditSync));
        assert!(masks[1].contains(TaskKind::CreditSync));
    }

    #[test]
    fn group_full_sync_portal_repeats_group_menu() {
        let scopes = vec![
            scope(1, 1, 1, PortalFeatures::GROUP_FULL_SYNC),
            scope(2, 1, 2, PortalFeatures::GROUP_FULL_SYNC),
        ];
        let masks = scope_masks(&scopes, RunMode::Full);
        assert!(masks[1].contains(TaskKind::GroupMenuSync));
        assert!(masks[1].contains(TaskKind::CreditSync));
    }

    #[test]
    fn mode_filter_applies_last() {
        let scopes = vec![scope(1, 1, 1, 0)];
        let masks = scope_masks(&scopes, RunMode::Changes);
        let mask = masks[0];
        assert!(mask.contains(TaskKind::ActionPresentSync));
        assert!(mask.contains(TaskKind::CreditSync));
        assert!(!mask.contains(TaskKind::MenuSync));
        assert!(!mask.contains(TaskKind::ActionHistorySync));

        let masks = scope_masks(&scopes, RunMode::Remaining { credential: None });
        assert!(masks[0].contains(TaskKind::RemainingToOrderSync));
        assert!(!masks[0].contains(TaskKind::ActionPresentSync));
    }
}
