use super::model::{
    ActionMutation, ActionRow, CreditStatus, GroupMenuEntry, LogData, MenuEntry, MenuSlot,
};
use crate::config::Config;
use crate::model::{EntryType, MenuStatus, PortalFeatures, SecurityMode, SyncStatus};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// -------------------------------------------------------------------------
// Portals and credentials
// -------------------------------------------------------------------------

/// Upsert the configured portals and credentials. Synced state (credit) on
/// existing credential rows is preserved.
#[instrument(skip_all)]
pub async fn seed_config(pool: &Pool, cfg: &Config) -> Result<()> {
    let mut tx = pool.begin().await?;
    for portal in &cfg.portals {
        sqlx::query(
            "INSERT INTO portals (id, name, plugin, reference, security, features, extra, notify_new_menu) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
               name = excluded.name, plugin = excluded.plugin, reference = excluded.reference, \
               security = excluded.security, features = excluded.features, extra = excluded.extra, \
               notify_new_menu = excluded.notify_new_menu",
        )
        .bind(portal.id)
        .bind(&portal.name)
        .bind(&portal.plugin)
        .bind(&portal.reference)
        .bind(portal.security.as_str())
        .bind(portal.features.to_features().0 as i64)
        .bind(portal.extra.as_ref().map(|v| v.to_string()))
        .bind(portal.notify_new_menu)
        .execute(&mut *tx)
        .await?;
    }
    for credential in &cfg.credentials {
        sqlx::query(
            "INSERT INTO credentials (id, portal_id, group_id, name, secret, low_credit_threshold, \
                                      notify_credit_increase, notify_low_credit, extra) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
               portal_id = excluded.portal_id, group_id = excluded.group_id, name = excluded.name, \
               secret = excluded.secret, low_credit_threshold = excluded.low_credit_threshold, \
               notify_credit_increase = excluded.notify_credit_increase, \
               notify_low_credit = excluded.notify_low_credit, extra = excluded.extra",
        )
        .bind(credential.id)
        .bind(credential.portal)
        .bind(credential.group)
        .bind(&credential.name)
        .bind(&credential.secret)
        .bind(credential.low_credit_threshold)
        .bind(credential.notify_credit_increase)
        .bind(credential.notify_low_credit)
        .bind(credential.extra.as_ref().map(|v| v.to_string()))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn log_data_from_row(row: &SqliteRow) -> Result<LogData> {
    let security: String = row.get("security");
    Ok(LogData {
        portal_id: row.get("portal_id"),
        credential_id: row.get("credential_id"),
        credential_group_id: row.get("group_id"),
        portal_name: row.get("portal_name"),
        plugin: row.get("plugin"),
        reference: row.get("reference"),
        security: SecurityMode::parse_mode(&security)
            .ok_or_else(|| anyhow!("unknown security mode {}", security))?,
        features: PortalFeatures(row.get::<i64, _>("features") as u32),
        credential_name: row.get("credential_name"),
        secret: row.get("secret"),
        credit: row.get("credit"),
        portal_extra: row.get("portal_extra"),
        credential_extra: row.get("credential_extra"),
    })
}

/// Load the session contexts for all credentials (or one), ordered by
/// credential group, then portal. The order drives the task-mask planning.
#[instrument(skip_all)]
pub async fn load_log_data(pool: &Pool, credential_id: Option<i64>) -> Result<Vec<LogData>> {
    let sql = "SELECT c.portal_id, c.id AS credential_id, c.group_id, c.credit, c.secret, \
                      c.name AS credential_name, c.extra AS credential_extra, \
                      p.name AS portal_name, p.plugin, p.reference, p.security, p.features, \
                      p.extra AS portal_extra \
               FROM credentials c JOIN portals p ON p.id = c.portal_id \
               WHERE (?1 IS NULL OR c.id = ?1) \
               ORDER BY c.group_id ASC, c.portal_id ASC, c.id ASC";
    let rows = sqlx::query(sql).bind(credential_id).fetch_all(pool).await?;
    rows.iter().map(log_data_from_row).collect()
}

#[instrument(skip_all)]
pub async fn update_credit(pool: &Pool, credential_id: i64, credit: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE credentials SET credit = ? WHERE id = ?")
        .bind(credit)
        .bind(credential_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn credit_status(pool: &Pool, credential_id: i64) -> Result<CreditStatus> {
    let row = sqlx::query(
        "SELECT id, name, credit, low_credit_threshold, notify_credit_increase, notify_low_credit \
         FROM credentials WHERE id = ?",
    )
    .bind(credential_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Err(anyhow!("credential {} not found", credential_id));
    };

    Ok(CreditStatus {
        credential_id: row.get("id"),
        name: row.get("name"),
        credit: row.get("credit"),
        low_credit_threshold: row.get("low_credit_threshold"),
        notify_credit_increase: row.get("notify_credit_increase"),
        notify_low_credit: row.get("notify_low_credit"),
    })
}

/// Name and new-menu notification flag of one portal.
pub async fn portal_notification_info(pool: &Pool, portal_id: i64) -> Result<(String, bool)> {
    let row = sqlx::query("SELECT name, notify_new_menu FROM portals WHERE id = ?")
        .bind(portal_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(anyhow!("portal {} not found", portal_id));
    };
    Ok((row.get("name"), row.get("notify_new_menu")))
}

// -------------------------------------------------------------------------
// Menu entries
// -------------------------------------------------------------------------

fn menu_entry_from_row(row: &SqliteRow) -> MenuEntry {
    MenuEntry {
        portal_id: row.get("portal_id"),
        relative_id: row.get("relative_id"),
        date: row.get("date"),
        label: row.get("label"),
        text: row.get("text"),
        group_id: row.get("group_id"),
        group_name: row.get("group_name"),
        price: row.get("price"),
        remaining_to_order: row.get("remaining_to_order"),
        remaining_to_take: row.get("remaining_to_take"),
        extra: row.get("extra"),
    }
}

/// Stored menu entries of one portal from `since` on, ascending by relative
/// id — the stored side of the merge co-iteration.
#[instrument(skip_all)]
pub async fn menu_entries_since(
    pool: &Pool,
    portal_id: i64,
    since: NaiveDate,
) -> Result<Vec<MenuEntry>> {
    let rows = sqlx::query(
        "SELECT * FROM menu_entries WHERE portal_id = ? AND date >= ? ORDER BY relative_id ASC",
    )
    .bind(portal_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(menu_entry_from_row).collect())
}

/// Latest menu entry of one portal (largest relative id), if any.
pub async fn last_menu_entry(pool: &Pool, portal_id: i64) -> Result<Option<MenuEntry>> {
    let row = sqlx::query(
        "SELECT * FROM menu_entries WHERE portal_id = ? ORDER BY relative_id DESC LIMIT 1",
    )
    .bind(portal_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(menu_entry_from_row))
}

/// Date of the newest menu entry in a portal, if the portal has any menu.
pub async fn last_menu_date(pool: &Pool, portal_id: i64) -> Result<Option<NaiveDate>> {
    let date: Option<NaiveDate> =
        sqlx::query_scalar("SELECT MAX(date) FROM menu_entries WHERE portal_id = ?")
            .bind(portal_id)
            .fetch_one(pool)
            .await?;
    Ok(date)
}

#[instrument(skip_all)]
pub async fn upsert_menu_entries(pool: &Pool, entries: &[MenuEntry]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for entry in entries {
        sqlx::query(
            "INSERT INTO menu_entries (portal_id, relative_id, date, label, text, group_id, \
                                       group_name, price, remaining_to_order, remaining_to_take, extra) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (portal_id, relative_id) DO UPDATE SET \
               date = excluded.date, label = excluded.label, text = excluded.text, \
               group_id = excluded.group_id, group_name = excluded.group_name, \
               price = excluded.price, remaining_to_order = excluded.remaining_to_order, \
               remaining_to_take = excluded.remaining_to_take, extra = excluded.extra",
        )
        .bind(entry.portal_id)
        .bind(entry.relative_id)
        .bind(entry.date)
        .bind(&entry.label)
        .bind(&entry.text)
        .bind(entry.group_id)
        .bind(&entry.group_name)
        .bind(entry.price)
        .bind(entry.remaining_to_order)
        .bind(entry.remaining_to_take)
        .bind(&entry.extra)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_menu_entries(pool: &Pool, portal_id: i64, relative_ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for relative_id in relative_ids {
        sqlx::query("DELETE FROM menu_entries WHERE portal_id = ? AND relative_id = ?")
            .bind(portal_id)
            .bind(relative_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn update_remaining_to_order(
    pool: &Pool,
    portal_id: i64,
    relative_id: i64,
    remaining: Option<i32>,
) -> Result<()> {
    sqlx::query("UPDATE menu_entries SET remaining_to_order = ? WHERE portal_id = ? AND relative_id = ?")
        .bind(remaining)
        .bind(portal_id)
        .bind(relative_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_remaining_to_take(
    pool: &Pool,
    portal_id: i64,
    relative_id: i64,
    remaining: Option<i32>,
) -> Result<()> {
    sqlx::query("UPDATE menu_entries SET remaining_to_take = ? WHERE portal_id = ? AND relative_id = ?")
        .bind(remaining)
        .bind(portal_id)
        .bind(relative_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_group_menu_entries(pool: &Pool, entries: &[GroupMenuEntry]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for entry in entries {
        sqlx::query(
            "INSERT INTO group_menu_entries (portal_id, relative_id, group_id, price, status) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (portal_id, relative_id, group_id) DO UPDATE SET \
               price = excluded.price, status = excluded.status",
        )
        .bind(entry.portal_id)
        .bind(entry.relative_id)
        .bind(entry.group_id)
        .bind(entry.price)
        .bind(entry.status.0 as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

// -------------------------------------------------------------------------
// Menu slots (layered view)
// -------------------------------------------------------------------------

const SLOT_SELECT: &str =
    "SELECT c.id AS credential_id, m.portal_id, m.relative_id, m.date, m.label, m.group_id, \
            COALESCE(g.price, m.price) AS price, \
            COALESCE(g.status, 0) AS status, \
            p.features AS features, \
            m.remaining_to_order, m.remaining_to_take, \
            COALESCE(s.reserved, 0) AS synced_reserved, \
            COALESCE(s.offered, 0) AS synced_offered, \
            COALESCE(s.taken, 0) AS synced_taken, \
            l.reserved AS local_reserved, l.offered AS local_offered, \
            e.reserved AS edit_reserved, e.offered AS edit_offered \
     FROM menu_entries m \
     JOIN portals p ON p.id = m.portal_id \
     JOIN credentials c ON c.id = ?1 \
     LEFT JOIN group_menu_entries g ON g.portal_id = m.portal_id \
          AND g.relative_id = m.relative_id AND g.group_id = c.group_id \
     LEFT JOIN actions s ON s.credential_id = c.id AND s.portal_id = m.portal_id \
          AND s.relative_id = m.relative_id AND s.sync_status = 'synced' AND s.entry_type != 'payment' \
     LEFT JOIN actions l ON l.credential_id = c.id AND l.portal_id = m.portal_id \
          AND l.relative_id = m.relative_id AND l.sync_status = 'local' AND l.entry_type != 'payment' \
     LEFT JOIN actions e ON e.credential_id = c.id AND e.portal_id = m.portal_id \
          AND e.relative_id = m.relative_id AND e.sync_status = 'edit' AND e.entry_type != 'payment'";

fn slot_from_row(row: &SqliteRow) -> MenuSlot {
    MenuSlot {
        credential_id: row.get("credential_id"),
        portal_id: row.get("portal_id"),
        relative_id: row.get("relative_id"),
        date: row.get("date"),
        label: row.get("label"),
        group_id: row.get("group_id"),
        price: row.get("price"),
        status: MenuStatus(row.get::<i64, _>("status") as u32),
        features: PortalFeatures(row.get::<i64, _>("features") as u32),
        remaining_to_order: row.get("remaining_to_order"),
        remaining_to_take: row.get("remaining_to_take"),
        synced_reserved: row.get("synced_reserved"),
        synced_offered: row.get("synced_offered"),
        synced_taken: row.get("synced_taken"),
        local_reserved: row.get("local_reserved"),
        local_offered: row.get("local_offered"),
        edit_reserved: row.get("edit_reserved"),
        edit_offered: row.get("edit_offered"),
    }
}

/// One layered menu slot, or None for an unknown entry reference.
#[instrument(skip_all)]
pub async fn menu_slot(
    pool: &Pool,
    credential_id: i64,
    portal_id: i64,
    relative_id: i64,
) -> Result<Option<MenuSlot>> {
    let sql = format!("{SLOT_SELECT} WHERE m.portal_id = ?2 AND m.relative_id = ?3");
    let row = sqlx::query(&sql)
        .bind(credential_id)
        .bind(portal_id)
        .bind(relative_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(slot_from_row))
}

/// Every slot of one menu group on one day, the edited entry included.
#[instrument(skip_all)]
pub async fn group_menu_slots(
    pool: &Pool,
    credential_id: i64,
    portal_id: i64,
    group_id: i64,
    date: NaiveDate,
) -> Result<Vec<MenuSlot>> {
    let sql = format!(
        "{SLOT_SELECT} WHERE m.portal_id = ?2 AND m.group_id = ?3 AND m.date = ?4 \
         ORDER BY m.relative_id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(credential_id)
        .bind(portal_id)
        .bind(group_id)
        .bind(date)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| slot_from_row(r)).collect())
}

/// Slots of one credential's portal from `since` on, for listing.
#[instrument(skip_all)]
pub async fn menu_slots_since(
    pool: &Pool,
    credential_id: i64,
    portal_id: i64,
    since: NaiveDate,
) -> Result<Vec<MenuSlot>> {
    let sql = format!(
        "{SLOT_SELECT} WHERE m.portal_id = ?2 AND m.date >= ?3 \
         ORDER BY m.date ASC, m.relative_id ASC"
    );
    let rows = sqlx::query(&sql)
        .bind(credential_id)
        .bind(portal_id)
        .bind(since)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(|r| slot_from_row(r)).collect())
}

// -------------------------------------------------------------------------
// Actions
// -------------------------------------------------------------------------

fn action_from_row(row: &SqliteRow) -> Result<ActionRow> {
    let status: String = row.get("sync_status");
    let entry_type: String = row.get("entry_type");
    Ok(ActionRow {
        credential_id: row.get("credential_id"),
        portal_id: row.get("portal_id"),
        relative_id: row.get("relative_id"),
        sync_status: SyncStatus::parse_status(&status)
            .ok_or_else(|| anyhow!("unknown sync status {}", status))?,
        entry_type: EntryType::parse_type(&entry_type)
            .ok_or_else(|| anyhow!("unknown entry type {}", entry_type))?,
        reserved: row.get("reserved"),
        offered: row.get("offered"),
        taken: row.get("taken"),
        price: row.get("price"),
        description: row.get("description"),
        last_change: row.get("last_change"),
    })
}

/// All actions of one credential in one sync layer.
#[instrument(skip_all)]
pub async fn actions_by_status(
    pool: &Pool,
    credential_id: i64,
    status: SyncStatus,
) -> Result<Vec<ActionRow>> {
    let rows = sqlx::query(
        "SELECT * FROM actions WHERE credential_id = ? AND sync_status = ? \
         ORDER BY portal_id ASC, relative_id ASC",
    )
    .bind(credential_id)
    .bind(status.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(action_from_row).collect()
}

/// Latest server-confirmed standard action of one credential, if any.
pub async fn last_synced_action(pool: &Pool, credential_id: i64) -> Result<Option<ActionRow>> {
    let row = sqlx::query(
        "SELECT * FROM actions WHERE credential_id = ? AND sync_status = 'synced' \
           AND entry_type = 'standard' \
         ORDER BY relative_id DESC LIMIT 1",
    )
    .bind(credential_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(action_from_row).transpose()
}

/// Server-confirmed standard actions joined to their menu entry dates from
/// `since` on, ascending by relative id — the stored side of the action merge.
#[instrument(skip_all)]
pub async fn synced_actions_since(
    pool: &Pool,
    credential_id: i64,
    portal_id: i64,
    since: NaiveDate,
) -> Result<Vec<ActionRow>> {
    let rows = sqlx::query(
        "SELECT a.* FROM actions a \
         JOIN menu_entries m ON m.portal_id = a.portal_id AND m.relative_id = a.relative_id \
         WHERE a.credential_id = ? AND a.portal_id = ? AND m.date >= ? \
           AND a.sync_status = 'synced' AND a.entry_type = 'standard' \
         ORDER BY a.relative_id ASC",
    )
    .bind(credential_id)
    .bind(portal_id)
    .bind(since)
    .fetch_all(pool)
    .await?;
    rows.iter().map(action_from_row).collect()
}

async fn upsert_action_tx(tx: &mut Transaction<'_, Sqlite>, action: &ActionRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO actions (credential_id, portal_id, relative_id, sync_status, entry_type, \
                              reserved, offered, taken, price, description, last_change) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (credential_id, portal_id, relative_id, sync_status) DO UPDATE SET \
           entry_type = excluded.entry_type, reserved = excluded.reserved, \
           offered = excluded.offered, taken = excluded.taken, price = excluded.price, \
           description = excluded.description, last_change = excluded.last_change",
    )
    .bind(action.credential_id)
    .bind(action.portal_id)
    .bind(action.relative_id)
    .bind(action.sync_status.as_str())
    .bind(action.entry_type.as_str())
    .bind(action.reserved)
    .bind(action.offered)
    .bind(action.taken)
    .bind(action.price)
    .bind(&action.description)
    .bind(action.last_change)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_actions(pool: &Pool, actions: &[ActionRow]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for action in actions {
        upsert_action_tx(&mut tx, action).await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_actions(
    pool: &Pool,
    credential_id: i64,
    portal_id: i64,
    status: SyncStatus,
    relative_ids: &[i64],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for relative_id in relative_ids {
        sqlx::query(
            "DELETE FROM actions WHERE credential_id = ? AND portal_id = ? \
             AND relative_id = ? AND sync_status = ?",
        )
        .bind(credential_id)
        .bind(portal_id)
        .bind(relative_id)
        .bind(status.as_str())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Apply one reconciliation batch atomically; partial application is never
/// observable.
#[instrument(skip_all)]
pub async fn apply_action_mutations(pool: &Pool, mutations: &[ActionMutation]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for mutation in mutations {
        match mutation {
            ActionMutation::DeleteEntryEdits {
                credential_id,
                portal_id,
                relative_id,
            } => {
                sqlx::query(
                    "DELETE FROM actions WHERE credential_id = ? AND portal_id = ? \
                     AND relative_id = ? AND sync_status = 'edit'",
                )
                .bind(credential_id)
                .bind(portal_id)
                .bind(relative_id)
                .execute(&mut *tx)
                .await?;
            }
            ActionMutation::DeleteGroupEdits {
                credential_id,
                portal_id,
                group_id,
                date,
            } => {
                sqlx::query(
                    "DELETE FROM actions WHERE credential_id = ? AND portal_id = ? \
                     AND sync_status = 'edit' \
                     AND EXISTS (SELECT 1 FROM menu_entries m \
                                 WHERE m.portal_id = actions.portal_id \
                                   AND m.relative_id = actions.relative_id \
                                   AND m.group_id = ? AND m.date = ?)",
                )
                .bind(credential_id)
                .bind(portal_id)
                .bind(group_id)
                .bind(date)
                .execute(&mut *tx)
                .await?;
            }
            ActionMutation::Insert(action) => {
                upsert_action_tx(&mut tx, action).await?;
            }
        }
    }
    tx.commit().await?;
    Ok(())
}

/// Promote EDIT rows to LOCAL: LOCAL rows shadowed by an EDIT on the same key
/// are dropped first, then EDIT rows that actually change something against
/// SYNCED become LOCAL, and the remaining no-op EDIT rows are deleted.
/// Returns (promoted, dropped).
#[instrument(skip_all)]
pub async fn promote_edits(pool: &Pool, credential_id: i64) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await?;

    let conflicts = sqlx::query(
        "DELETE FROM actions WHERE credential_id = ?1 AND sync_status = 'local' \
         AND EXISTS (SELECT 1 FROM actions e \
                     WHERE e.credential_id = actions.credential_id \
                       AND e.portal_id = actions.portal_id \
                       AND e.relative_id = actions.relative_id \
                       AND e.sync_status = 'edit')",
    )
    .bind(credential_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if conflicts > 0 {
        tracing::debug!(conflicts, "dropped local rows shadowed by new edits");
    }

    let promoted = sqlx::query(
        "UPDATE actions SET sync_status = 'local', last_change = ?2 \
         WHERE credential_id = ?1 AND sync_status = 'edit' AND ( \
           (NOT EXISTS (SELECT 1 FROM actions s \
                        WHERE s.credential_id = actions.credential_id \
                          AND s.portal_id = actions.portal_id \
                          AND s.relative_id = actions.relative_id \
                          AND s.sync_status = 'synced') \
            AND (actions.reserved > 0 OR actions.offered > 0)) \
           OR EXISTS (SELECT 1 FROM actions s \
                      WHERE s.credential_id = actions.credential_id \
                        AND s.portal_id = actions.portal_id \
                        AND s.relative_id = actions.relative_id \
                        AND s.sync_status = 'synced' \
                        AND (s.reserved != actions.reserved OR s.offered != actions.offered)))",
    )
    .bind(credential_id)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let dropped = sqlx::query("DELETE FROM actions WHERE credential_id = ? AND sync_status = 'edit'")
        .bind(credential_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok((promoted, dropped))
}

/// Delete all unsaved edits of one credential.
#[instrument(skip_all)]
pub async fn discard_edits(pool: &Pool, credential_id: i64) -> Result<u64> {
    let affected = sqlx::query("DELETE FROM actions WHERE credential_id = ? AND sync_status = 'edit'")
        .bind(credential_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(affected)
}

/// Delete FAILED rows superseded by a newer LOCAL row on the same key.
#[instrument(skip_all)]
pub async fn delete_conflicting_failed(pool: &Pool, credential_id: i64) -> Result<u64> {
    let affected = sqlx::query(
        "DELETE FROM actions WHERE credential_id = ? AND sync_status = 'failed' \
         AND EXISTS (SELECT 1 FROM actions l \
                     WHERE l.credential_id = actions.credential_id \
                       AND l.portal_id = actions.portal_id \
                       AND l.relative_id = actions.relative_id \
                       AND l.sync_status = 'local')",
    )
    .bind(credential_id)
    .execute(pool)
    .await?
    .rows_affected();
    if affected > 0 {
        tracing::warn!(affected, "deleted stale failed actions");
    }
    Ok(affected)
}

/// Flip one LOCAL row to FAILED, replacing any stale FAILED row on the key.
pub async fn fail_local_action_tx(
    tx: &mut Transaction<'_, Sqlite>,
    action: &ActionRow,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM actions WHERE credential_id = ? AND portal_id = ? \
         AND relative_id = ? AND sync_status = 'failed'",
    )
    .bind(action.credential_id)
    .bind(action.portal_id)
    .bind(action.relative_id)
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        "UPDATE actions SET sync_status = 'failed', last_change = ? \
         WHERE credential_id = ? AND portal_id = ? AND relative_id = ? AND sync_status = 'local'",
    )
    .bind(now)
    .bind(action.credential_id)
    .bind(action.portal_id)
    .bind(action.relative_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete one LOCAL row that was absorbed by the synced state.
pub async fn delete_local_action_tx(
    tx: &mut Transaction<'_, Sqlite>,
    action: &ActionRow,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM actions WHERE credential_id = ? AND portal_id = ? \
         AND relative_id = ? AND sync_status = 'local'",
    )
    .bind(action.credential_id)
    .bind(action.portal_id)
    .bind(action.relative_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// -------------------------------------------------------------------------
// Meta
// -------------------------------------------------------------------------

pub async fn set_meta(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO meta (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_meta(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntryType;
    use chrono::NaiveDate;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_example(pool: &Pool) {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        seed_config(pool, &cfg).await.unwrap();
    }

    fn entry(relative_id: i64, date: NaiveDate) -> MenuEntry {
        MenuEntry {
            portal_id: 1,
            relative_id,
            date,
            label: format!("Lunch {relative_id}"),
            text: String::new(),
            group_id: 1,
            group_name: "Lunch".into(),
            price: Some(3200),
            remaining_to_order: None,
            remaining_to_take: None,
            extra: None,
        }
    }

    fn action(relative_id: i64, status: SyncStatus, reserved: i32) -> ActionRow {
        ActionRow {
            credential_id: 1,
            portal_id: 1,
            relative_id,
            sync_status: status,
            entry_type: EntryType::Standard,
            reserved,
            offered: 0,
            taken: 0,
            price: Some(3200),
            description: None,
            last_change: Utc::now(),
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://host/db"),
            "postgres://host/db"
        );
        assert!(prepare_sqlite_url("sqlite://tmp.db").starts_with("sqlite://"));
    }

    #[tokio::test]
    async fn seed_preserves_credit() {
        let pool = setup_pool().await;
        seed_example(&pool).await;
        update_credit(&pool, 1, Some(12000)).await.unwrap();
        // Re-seeding must not wipe the synced credit.
        seed_example(&pool).await;
        let status = credit_status(&pool, 1).await.unwrap();
        assert_eq!(status.credit, Some(12000));
    }

    #[tokio::test]
    async fn slot_layers_resolve() {
        let pool = setup_pool().await;
        seed_example(&pool).await;
        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        upsert_menu_entries(&pool, &[entry(10, date)]).await.unwrap();
        upsert_group_menu_entries(
            &pool,
            &[GroupMenuEntry {
                portal_id: 1,
                relative_id: 10,
                group_id: 1,
                price: Some(2900),
                status: MenuStatus(MenuStatus::ORDERABLE),
            }],
        )
        .await
        .unwrap();
        upsert_actions(&pool, &[action(10, SyncStatus::Synced, 1)])
            .await
            .unwrap();

        let slot = menu_slot(&pool, 1, 1, 10).await.unwrap().unwrap();
        assert_eq!(slot.price, Some(2900));
        assert!(slot.status.orderable());
        assert_eq!(slot.synced_reserved, 1);
        assert_eq!(slot.local_reserved, None);
        assert_eq!(slot.authoritative_amounts(), (1, 0));

        upsert_actions(&pool, &[action(10, SyncStatus::Local, 0)])
            .await
            .unwrap();
        let slot = menu_slot(&pool, 1, 1, 10).await.unwrap().unwrap();
        assert_eq!(slot.authoritative_amounts(), (0, 0));
    }

    #[tokio::test]
    async fn promote_edits_flow() {
        let pool = setup_pool().await;
        seed_example(&pool).await;
        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        upsert_menu_entries(&pool, &[entry(10, date), entry(11, date)])
            .await
            .unwrap();

        // Edit over stale local on entry 10, no-op edit on entry 11.
        upsert_actions(
            &pool,
            &[
                action(10, SyncStatus::Local, 2),
                action(10, SyncStatus::Edit, 1),
                action(11, SyncStatus::Edit, 0),
            ],
        )
        .await
        .unwrap();

        let (promoted, dropped) = promote_edits(&pool, 1).await.unwrap();
        assert_eq!(promoted, 1);
        assert_eq!(dropped, 1);

        let locals = actions_by_status(&pool, 1, SyncStatus::Local).await.unwrap();
        assert_eq!(locals.len(), 1);
        assert_eq!(locals[0].relative_id, 10);
        assert_eq!(locals[0].reserved, 1);
        assert!(actions_by_status(&pool, 1, SyncStatus::Edit)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn conflicting_failed_rows_removed() {
        let pool = setup_pool().await;
        seed_example(&pool).await;
        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        upsert_menu_entries(&pool, &[entry(10, date), entry(11, date)])
            .await
            .unwrap();
        upsert_actions(
            &pool,
            &[
                action(10, SyncStatus::Failed, 1),
                action(10, SyncStatus::Local, 1),
                action(11, SyncStatus::Failed, 1),
            ],
        )
        .await
        .unwrap();

        let affected = delete_conflicting_failed(&pool, 1).await.unwrap();
        assert_eq!(affected, 1);
        let failed = actions_by_status(&pool, 1, SyncStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].relative_id, 11);
    }

    #[tokio::test]
    async fn group_edit_deletion_is_scoped() {
        let pool = setup_pool().await;
        seed_example(&pool).await;
        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        let other_date = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        upsert_menu_entries(&pool, &[entry(10, date), entry(11, date), entry(20, other_date)])
            .await
            .unwrap();
        upsert_actions(
            &pool,
            &[
                action(10, SyncStatus::Edit, 1),
                action(11, SyncStatus::Edit, 1),
                action(20, SyncStatus::Edit, 1),
            ],
        )
        .await
        .unwrap();

        apply_action_mutations(
            &pool,
            &[ActionMutation::DeleteGroupEdits {
                credential_id: 1,
                portal_id: 1,
                group_id: 1,
                date,
            }],
        )
        .await
        .unwrap();

        let edits = actions_by_status(&pool, 1, SyncStatus::Edit).await.unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].relative_id, 20);
    }
}
