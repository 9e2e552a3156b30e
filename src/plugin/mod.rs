//! Plugin task framework: task identities, the session context handed to
//! portal plugins, and the orchestrator that runs a sync session.

pub mod http;
pub mod merge;
pub mod runner;

pub use runner::{
    NoHooks, RegistrationError, SessionHooks, SessionReport, SessionRunner, TaskRegistry,
    TaskResult,
};

use crate::db::{repo, ActionRow, GroupMenuEntry, LogData, MenuEntry, Pool};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One unit of sync work a plugin can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    MenuSync,
    GroupMenuSync,
    RemainingToTakeSync,
    RemainingToOrderSync,
    ActionPresentSync,
    ActionHistorySync,
    CreditSync,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::MenuSync,
        TaskKind::GroupMenuSync,
        TaskKind::RemainingToTakeSync,
        TaskKind::RemainingToOrderSync,
        TaskKind::ActionPresentSync,
        TaskKind::ActionHistorySync,
        TaskKind::CreditSync,
    ];

    pub fn bit(self) -> u32 {
        match self {
            TaskKind::MenuSync => 1,
            TaskKind::GroupMenuSync => 1 << 1,
            TaskKind::RemainingToTakeSync => 1 << 2,
            TaskKind::RemainingToOrderSync => 1 << 3,
            TaskKind::ActionPresentSync => 1 << 4,
            TaskKind::ActionHistorySync => 1 << 5,
            TaskKind::CreditSync => 1 << 6,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::MenuSync => "menu",
            TaskKind::GroupMenuSync => "group_menu",
            TaskKind::RemainingToTakeSync => "remaining_to_take",
            TaskKind::RemainingToOrderSync => "remaining_to_order",
            TaskKind::ActionPresentSync => "action_present",
            TaskKind::ActionHistorySync => "action_history",
            TaskKind::CreditSync => "credit",
        };
        f.write_str(name)
    }
}

/// Set of task bits. Callers compose it from [`TaskKind`]s rather than raw
/// integers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskMask(u32);

impl TaskMask {
    pub const EMPTY: TaskMask = TaskMask(0);

    pub fn all() -> TaskMask {
        TaskKind::ALL.iter().copied().collect()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, kind: TaskKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn intersects(self, other: TaskMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: TaskMask) -> TaskMask {
        TaskMask(self.0 | other.0)
    }

    pub fn intersection(self, other: TaskMask) -> TaskMask {
        TaskMask(self.0 & other.0)
    }

    pub fn difference(self, other: TaskMask) -> TaskMask {
        TaskMask(self.0 & !other.0)
    }

    pub fn insert(&mut self, kind: TaskKind) {
        self.0 |= kind.bit();
    }

    pub fn iter(self) -> impl Iterator<Item = TaskKind> {
        TaskKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl FromIterator<TaskKind> for TaskMask {
    fn from_iter<I: IntoIterator<Item = TaskKind>>(iter: I) -> Self {
        let mut mask = TaskMask::EMPTY;
        for kind in iter {
            mask.insert(kind);
        }
        mask
    }
}

impl From<TaskKind> for TaskMask {
    fn from(kind: TaskKind) -> Self {
        TaskMask(kind.bit())
    }
}

impl fmt::Display for TaskMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for kind in self.iter() {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{kind}")?;
            first = false;
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// Failure raised inside a task body. Never escapes the session boundary;
/// the runner folds it into the per-bit results.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("portal rejected the credentials")]
    WrongCredentials,
    #[error("portal temporarily unavailable: {0}")]
    ServerUnavailable(String),
    #[error("portal page no longer matches the expected format: {0}")]
    FormatChanged(String),
}

/// One registered sync task. Tasks are registered in dependency order and
/// executed strictly sequentially within a session.
#[async_trait]
pub trait TaskGroup: Send + Sync {
    /// Bits this task satisfies. Must not overlap other registered tasks.
    fn provides(&self) -> TaskMask;

    /// Bits that must be satisfied before this task runs. Must be provided
    /// by tasks registered earlier.
    fn depends(&self) -> TaskMask {
        TaskMask::EMPTY
    }

    async fn run(&self, ctx: &mut SessionContext) -> Result<(), PluginError>;
}

/// Everything one sync session works with: the store, the joined
/// portal/credential view, an HTTP client for the portal's security mode
/// and a cancellation flag checked at task boundaries.
pub struct SessionContext {
    pool: Pool,
    pub log: LogData,
    connect_timeout: Duration,
    http: Option<reqwest::Client>,
    cancelled: Arc<AtomicBool>,
}

impl SessionContext {
    pub fn new(pool: Pool, log: LogData, connect_timeout: Duration) -> Self {
        Self {
            pool,
            log,
            connect_timeout,
            http: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Handle for aborting the session from another task.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Lazily built HTTP client honoring the portal's security mode.
    pub fn http_client(&mut self) -> Result<&reqwest::Client, PluginError> {
        let client = match self.http.take() {
            Some(client) => client,
            None => http::build_client(self.log.security, self.connect_timeout)?,
        };
        Ok(self.http.insert(client))
    }

    /// Replace the portal's menu with the reported list: stale stored
    /// entries inside the window are deleted, the rest upserted. Both the
    /// window's stored entries and `reported` must be strictly ascending by
    /// relative id.
    pub async fn merge_menu_entries(
        &self,
        window_start: NaiveDate,
        reported: &[MenuEntry],
    ) -> Result<(), PluginError> {
        let stored = repo::menu_entries_since(&self.pool, self.log.portal_id, window_start).await?;
        let stale = merge::stale_stored(&stored, reported, |e| e.relative_id);
        repo::delete_menu_entries(&self.pool, self.log.portal_id, &stale).await?;
        repo::upsert_menu_entries(&self.pool, reported).await?;
        Ok(())
    }

    /// Same protocol for the credential's server-confirmed actions.
    pub async fn merge_synced_actions(
        &self,
        window_start: NaiveDate,
        reported: &[ActionRow],
    ) -> Result<(), PluginError> {
        let stored = repo::synced_actions_since(
            &self.pool,
            self.log.credential_id,
            self.log.portal_id,
            window_start,
        )
        .await?;
        let stale = merge::stale_stored(&stored, reported, |a| a.relative_id);
        repo::delete_actions(
            &self.pool,
            self.log.credential_id,
            self.log.portal_id,
            crate::model::SyncStatus::Synced,
            &stale,
        )
        .await?;
        repo::upsert_actions(&self.pool, reported).await?;
        Ok(())
    }

    pub async fn save_group_menu_entries(
        &self,
        entries: &[GroupMenuEntry],
    ) -> Result<(), PluginError> {
        repo::upsert_group_menu_entries(&self.pool, entries).await?;
        Ok(())
    }

    pub async fn save_actions(&self, actions: &[ActionRow]) -> Result<(), PluginError> {
        repo::upsert_actions(&self.pool, actions).await?;
        Ok(())
    }

    pub async fn set_remaining_to_order(
        &self,
        relative_id: i64,
        remaining: Option<i32>,
    ) -> Result<(), PluginError> {
        repo::update_remaining_to_order(&self.pool, self.log.portal_id, relative_id, remaining)
            .await?;
        Ok(())
    }

    pub async fn set_remaining_to_take(
        &self,
        relative_id: i64,
        remaining: Option<i32>,
    ) -> Result<(), PluginError> {
        repo::update_remaining_to_take(&self.pool, self.log.portal_id, relative_id, remaining)
            .await?;
        Ok(())
    }

    pub async fn last_menu_entry(&self) -> Result<Option<MenuEntry>, PluginError> {
        Ok(repo::last_menu_entry(&self.pool, self.log.portal_id).await?)
    }

    pub async fn last_synced_action(&self) -> Result<Option<ActionRow>, PluginError> {
        Ok(repo::last_synced_action(&self.pool, self.log.credential_id).await?)
    }

    /// Pending LOCAL actions the plugin should push to the portal.
    pub async fn pending_actions(&self) -> Result<Vec<ActionRow>, PluginError> {
        Ok(
            repo::actions_by_status(&self.pool, self.log.credential_id, crate::model::SyncStatus::Local)
                .await?,
        )
    }

    /// Record the credit the portal reported; persisted at session end.
    pub fn set_credit(&mut self, credit: Option<i64>) {
        self.log.credit = credit;
    }

    /// Persist session-mutated credential state.
    pub(crate) async fn persist(&self) -> Result<(), PluginError> {
        repo::update_credit(&self.pool, self.log.credential_id, self.log.credit).await?;
        Ok(())
    }

    pub fn portal_extra(&self) -> Result<Option<serde_json::Value>, PluginError> {
        match &self.log.portal_extra {
            Some(raw) => Ok(Some(
                serde_json::from_str(raw).map_err(|e| anyhow!("portal extra: {e}"))?,
            )),
            None => Ok(None),
        }
    }
}
