//! Typed entities and view models returned by the repositories.

use crate::model::{EntryType, MenuStatus, PortalFeatures, SecurityMode, SyncStatus};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One offered meal, keyed by `(portal_id, relative_id)`. Replaced wholesale
/// on each menu sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MenuEntry {
    pub portal_id: i64,
    pub relative_id: i64,
    pub date: NaiveDate,
    pub label: String,
    pub text: String,
    pub group_id: i64,
    pub group_name: String,
    pub price: Option<i64>,
    /// None when the portal did not report a count.
    pub remaining_to_order: Option<i32>,
    pub remaining_to_take: Option<i32>,
    pub extra: Option<String>,
}

/// Per-credential-group price and orderability of one menu entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMenuEntry {
    pub portal_id: i64,
    pub relative_id: i64,
    pub group_id: i64,
    pub price: Option<i64>,
    pub status: MenuStatus,
}

/// One reservation layer row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRow {
    pub credential_id: i64,
    pub portal_id: i64,
    pub relative_id: i64,
    pub sync_status: SyncStatus,
    pub entry_type: EntryType,
    pub reserved: i32,
    pub offered: i32,
    pub taken: i32,
    pub price: Option<i64>,
    /// Payment rows only.
    pub description: Option<String>,
    pub last_change: DateTime<Utc>,
}

impl ActionRow {
    pub fn key(&self) -> ActionKey {
        ActionKey {
            credential_id: self.credential_id,
            portal_id: self.portal_id,
            relative_id: self.relative_id,
        }
    }
}

/// Identity of an action regardless of its sync layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionKey {
    pub credential_id: i64,
    pub portal_id: i64,
    pub relative_id: i64,
}

/// Per-session context handed to a plugin: the joined portal + credential
/// view. Tasks may mutate `credit`; the driver persists it at session end.
#[derive(Debug, Clone)]
pub struct LogData {
    pub portal_id: i64,
    pub credential_id: i64,
    pub credential_group_id: i64,
    pub portal_name: String,
    pub plugin: String,
    pub reference: String,
    pub security: SecurityMode,
    pub features: PortalFeatures,
    pub credential_name: String,
    pub secret: String,
    pub credit: Option<i64>,
    pub portal_extra: Option<String>,
    pub credential_extra: Option<String>,
}

/// Layered view of one menu entry for one credential: the entry itself, its
/// group status, and the edit/local/synced action amounts stacked on it.
#[derive(Debug, Clone, PartialEq)]
pub struct MenuSlot {
    pub credential_id: i64,
    pub portal_id: i64,
    pub relative_id: i64,
    pub date: NaiveDate,
    pub label: String,
    pub group_id: i64,
    pub price: Option<i64>,
    pub status: MenuStatus,
    pub features: PortalFeatures,
    pub remaining_to_order: Option<i32>,
    pub remaining_to_take: Option<i32>,
    pub synced_reserved: i32,
    pub synced_offered: i32,
    pub synced_taken: i32,
    pub local_reserved: Option<i32>,
    pub local_offered: Option<i32>,
    pub edit_reserved: Option<i32>,
    pub edit_offered: Option<i32>,
}

impl MenuSlot {
    /// Amounts of the layer a new edit competes against: local when present,
    /// otherwise synced.
    pub fn authoritative_amounts(&self) -> (i32, i32) {
        match (self.local_reserved, self.local_offered) {
            (Some(r), Some(o)) => (r, o),
            _ => (self.synced_reserved, self.synced_offered),
        }
    }

    pub fn has_edit(&self) -> bool {
        self.edit_reserved.is_some()
    }
}

/// Credit and notification gating for one credential.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditStatus {
    pub credential_id: i64,
    pub name: String,
    pub credit: Option<i64>,
    pub low_credit_threshold: i64,
    pub notify_credit_increase: bool,
    pub notify_low_credit: bool,
}

/// One mutation of the actions table. A reconciliation batch is a list of
/// these, applied in order inside a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionMutation {
    /// Drop the EDIT row of a single menu entry.
    DeleteEntryEdits {
        credential_id: i64,
        portal_id: i64,
        relative_id: i64,
    },
    /// Drop every EDIT row across one menu group on one day.
    DeleteGroupEdits {
        credential_id: i64,
        portal_id: i64,
        group_id: i64,
        date: NaiveDate,
    },
    Insert(ActionRow),
}
