use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Sync layer of an order action. `Edit` shadows `Local` shadows `Synced`;
/// `Failed` is terminal and only informational.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncStatus {
    Edit,
    Local,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Edit => "edit",
            SyncStatus::Local => "local",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<SyncStatus> {
        match s {
            "edit" => Some(SyncStatus::Edit),
            "local" => Some(SyncStatus::Local),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Origin of an action row. `Virtual` rows are side effects of the
/// one-order-per-group rule; `Payment` rows come from the history sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryType {
    Standard,
    Virtual,
    Payment,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Standard => "standard",
            EntryType::Virtual => "virtual",
            EntryType::Payment => "payment",
        }
    }

    pub fn parse_type(s: &str) -> Option<EntryType> {
        match s {
            "standard" => Some(EntryType::Standard),
            "virtual" => Some(EntryType::Virtual),
            "payment" => Some(EntryType::Payment),
            _ => None,
        }
    }
}

/// How the portal connection treats TLS.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// HTTPS with regular certificate validation.
    TrustTrusted,
    /// HTTPS accepting any certificate (self-signed canteen servers).
    TrustAll,
    /// Plain HTTP.
    NotEncrypted,
}

impl SecurityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::TrustTrusted => "trust_trusted",
            SecurityMode::TrustAll => "trust_all",
            SecurityMode::NotEncrypted => "not_encrypted",
        }
    }

    pub fn parse_mode(s: &str) -> Option<SecurityMode> {
        match s {
            "trust_trusted" => Some(SecurityMode::TrustTrusted),
            "trust_all" => Some(SecurityMode::TrustAll),
            "not_encrypted" => Some(SecurityMode::NotEncrypted),
            _ => None,
        }
    }
}

/// Portal capability flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalFeatures(pub u32);

impl PortalFeatures {
    /// Group menu data must be refreshed for every credential, not just the
    /// first one on the portal.
    pub const GROUP_FULL_SYNC: u32 = 1;
    pub const FOOD_STOCK: u32 = 1 << 2;
    pub const REMAINING_FOOD: u32 = 1 << 3;
    pub const MULTIPLE_ORDERS: u32 = 1 << 4;
    pub const ONE_ORDER_PER_GROUP: u32 = 1 << 5;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn one_order_per_group(&self) -> bool {
        self.contains(Self::ONE_ORDER_PER_GROUP)
    }

    pub fn group_full_sync(&self) -> bool {
        self.contains(Self::GROUP_FULL_SYNC)
    }
}

/// Per-group orderability of one menu entry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MenuStatus(pub u32);

impl MenuStatus {
    pub const ORDERABLE: u32 = 1;
    pub const CANCELABLE: u32 = 1 << 1;
    pub const COULD_USE_STOCK: u32 = 1 << 2;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn orderable(&self) -> bool {
        self.contains(Self::ORDERABLE)
    }

    pub fn cancelable(&self) -> bool {
        self.contains(Self::CANCELABLE)
    }

    pub fn could_use_stock(&self) -> bool {
        self.contains(Self::COULD_USE_STOCK)
    }

    pub fn any_capability(&self) -> bool {
        self.orderable() || self.cancelable() || self.could_use_stock()
    }
}

/// Today's date at day granularity; menu entries strictly before this are
/// read-only.
pub fn today() -> chrono::NaiveDate {
    Utc::now().date_naive()
}
