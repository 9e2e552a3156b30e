//! Reconciliation engine: turns a requested reservation change into the
//! batch of action mutations that realizes it, honoring the
//! one-order-per-group rule.

use crate::db::{repo, ActionMutation, ActionRow, MenuSlot, Pool};
use crate::model::{EntryType, SyncStatus};
use crate::notify::EventSink;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::instrument;

/// The computed mutation batch for one edit, plus whether a sibling was
/// forced into the shared food stock instead of being canceled.
#[derive(Debug, Clone, PartialEq)]
pub struct EditPlan {
    pub mutations: Vec<ActionMutation>,
    pub stock_forced: bool,
}

impl EditPlan {
    pub fn is_noop(&self) -> bool {
        self.mutations.is_empty()
    }
}

fn standard_edit(slot: &MenuSlot, reserved: i32, offered: i32, now: DateTime<Utc>) -> ActionRow {
    ActionRow {
        credential_id: slot.credential_id,
        portal_id: slot.portal_id,
        relative_id: slot.relative_id,
        sync_status: SyncStatus::Edit,
        entry_type: EntryType::Standard,
        reserved,
        offered,
        taken: slot.synced_taken,
        price: slot.price,
        description: None,
        last_change: now,
    }
}

fn virtual_edit(slot: &MenuSlot, reserved: i32, offered: i32, now: DateTime<Utc>) -> ActionRow {
    ActionRow {
        entry_type: EntryType::Virtual,
        ..standard_edit(slot, reserved, offered, now)
    }
}

/// A sibling holds a portion the group rule has to displace when it has a
/// net reservable amount on either the synced or the local layer.
fn sibling_qualifies(slot: &MenuSlot) -> bool {
    let taken = slot.synced_taken;
    slot.synced_reserved - taken > 0
        || slot.local_reserved.map(|r| r - taken > 0).unwrap_or(false)
}

/// Compute the mutation batch for one requested edit. Pure; `group_slots`
/// must hold every slot of the entry's group on its day (the edited slot
/// included) when the portal restricts to one order per group, and may be
/// empty otherwise.
pub fn propose_edit(
    slot: &MenuSlot,
    group_slots: &[MenuSlot],
    new_reserved: i32,
    new_offered: i32,
    now: DateTime<Utc>,
) -> EditPlan {
    let changed = (new_reserved, new_offered) != slot.authoritative_amounts();

    if !slot.features.one_order_per_group() {
        let mut mutations = Vec::new();
        if slot.has_edit() {
            mutations.push(ActionMutation::DeleteEntryEdits {
                credential_id: slot.credential_id,
                portal_id: slot.portal_id,
                relative_id: slot.relative_id,
            });
        }
        if changed {
            mutations.push(ActionMutation::Insert(standard_edit(
                slot,
                new_reserved,
                new_offered,
                now,
            )));
        }
        return EditPlan {
            mutations,
            stock_forced: false,
        };
    }

    let mut forced = Vec::new();
    let mut stock_forced = false;
    for sibling in group_slots {
        if sibling.relative_id == slot.relative_id || !sibling_qualifies(sibling) {
            continue;
        }
        if sibling.status.cancelable() {
            forced.push(ActionMutation::Insert(virtual_edit(sibling, 0, 0, now)));
        } else if sibling.status.could_use_stock() {
            // Cannot be canceled any more; the portion goes into the shared
            // stock instead.
            forced.push(ActionMutation::Insert(virtual_edit(
                sibling,
                sibling.synced_reserved,
                sibling.synced_reserved,
                now,
            )));
            stock_forced = true;
        }
    }

    let any_edit = group_slots.iter().any(MenuSlot::has_edit) || slot.has_edit();
    if !changed && forced.is_empty() && !any_edit {
        return EditPlan {
            mutations: Vec::new(),
            stock_forced: false,
        };
    }

    let mut mutations = Vec::new();
    if any_edit {
        mutations.push(ActionMutation::DeleteGroupEdits {
            credential_id: slot.credential_id,
            portal_id: slot.portal_id,
            group_id: slot.group_id,
            date: slot.date,
        });
    }
    mutations.extend(forced);
    mutations.push(ActionMutation::Insert(standard_edit(
        slot,
        new_reserved,
        new_offered,
        now,
    )));
    EditPlan {
        mutations,
        stock_forced,
    }
}

/// Load the slot (and its group when required), compute the plan and apply
/// it in one transaction. A forced stock offer is reported through the
/// sink.
#[instrument(skip(pool, sink))]
pub async fn make_edit(
    pool: &Pool,
    sink: &dyn EventSink,
    credential_id: i64,
    portal_id: i64,
    relative_id: i64,
    new_reserved: i32,
    new_offered: i32,
) -> Result<EditPlan> {
    let slot = repo::menu_slot(pool, credential_id, portal_id, relative_id)
        .await?
        .ok_or_else(|| anyhow!("menu entry {}/{} not found", portal_id, relative_id))?;

    let group_slots = if slot.features.one_order_per_group() {
        repo::group_menu_slots(pool, credential_id, portal_id, slot.group_id, slot.date)
            .await
            .context("load group slots")?
    } else {
        Vec::new()
    };

    let plan = propose_edit(&slot, &group_slots, new_reserved, new_offered, Utc::now());
    if !plan.is_noop() {
        repo::apply_action_mutations(pool, &plan.mutations).await?;
    }
    if plan.stock_forced {
        sink.stock_forced(credential_id, portal_id).await;
    }
    tracing::debug!(
        mutations = plan.mutations.len(),
        stock_forced = plan.stock_forced,
        "edit planned"
    );
    Ok(plan)
}

/// Promote the credential's EDIT rows to LOCAL. Returns (promoted, dropped).
pub async fn save_edits(pool: &Pool, credential_id: i64) -> Result<(u64, u64)> {
    repo::promote_edits(pool, credential_id).await
}

/// Throw away the credential's unsaved EDIT rows.
pub async fn discard_edits(pool: &Pool, credential_id: i64) -> Result<u64> {
    repo::discard_edits(pool, credential_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MenuStatus, PortalFeatures};
    use chrono::NaiveDate;

    fn slot(relative_id: i64, features: u32, status: u32) -> MenuSlot {
        MenuSlot {
            credential_id: 1,
            portal_id: 1,
            relative_id,
            date: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            label: format!("Lunch {relative_id}"),
            group_id: 1,
            price: Some(3200),
            status: MenuStatus(status),
            features: PortalFeatures(features),
            remaining_to_order: None,
            remaining_to_take: None,
            synced_reserved: 0,
            synced_offered: 0,
            synced_taken: 0,
            local_reserved: None,
            local_offered: None,
            edit_reserved: None,
            edit_offered: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn noop_edit_produces_no_mutations() {
        let s = slot(10, 0, MenuStatus::ORDERABLE);
        let plan = propose_edit(&s, &[], 0, 0, now());
        assert!(plan.is_noop());
    }

    #[test]
    fn noop_group_edit_produces_no_mutations() {
        let s = slot(10, PortalFeatures::ONE_ORDER_PER_GROUP, MenuStatus::ORDERABLE);
        let group = vec![s.clone(), slot(11, PortalFeatures::ONE_ORDER_PER_GROUP, MenuStatus::ORDERABLE)];
        let plan = propose_edit(&s, &group, 0, 0, now());
        assert!(plan.is_noop());
    }

    #[test]
    fn plain_edit_inserts_standard_row() {
        let s = slot(10, 0, MenuStatus::ORDERABLE);
        let plan = propose_edit(&s, &[], 1, 0, now());
        assert_eq!(plan.mutations.len(), 1);
        match &plan.mutations[0] {
            ActionMutation::Insert(row) => {
                assert_eq!(row.sync_status, SyncStatus::Edit);
                assert_eq!(row.entry_type, EntryType::Standard);
                assert_eq!(row.reserved, 1);
            }
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[test]
    fn existing_edit_is_replaced() {
        let mut s = slot(10, 0, MenuStatus::ORDERABLE);
        s.edit_reserved = Some(1);
        s.edit_offered = Some(0);
        let plan = propose_edit(&s, &[], 1, 0, now());
        // The stale edit row is dropped before the new one goes in.
        assert_eq!(plan.mutations.len(), 2);
        assert!(matches!(
            plan.mutations[0],
            ActionMutation::DeleteEntryEdits { relative_id: 10, .. }
        ));
    }

    #[test]
    fn revert_edit_deletes_without_insert() {
        let mut s = slot(10, 0, MenuStatus::ORDERABLE);
        s.edit_reserved = Some(1);
        s.edit_offered = Some(0);
        let plan = propose_edit(&s, &[], 0, 0, now());
        assert_eq!(
            plan.mutations,
            vec![ActionMutation::DeleteEntryEdits {
                credential_id: 1,
                portal_id: 1,
                relative_id: 10,
            }]
        );
    }

    #[test]
    fn group_exclusivity_zeroes_cancelable_sibling() {
        let s = slot(
            10,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::ORDERABLE,
        );
        let mut sibling = slot(
            11,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::CANCELABLE,
        );
        sibling.synced_reserved = 1;
        let group = vec![s.clone(), sibling];

        let plan = propose_edit(&s, &group, 1, 0, now());
        let inserts: Vec<_> = plan
            .mutations
            .iter()
            .filter_map(|m| match m {
                ActionMutation::Insert(row) => Some(row),
                _ => None,
            })
            .collect();
        assert_eq!(inserts.len(), 2);

        let forced = inserts.iter().find(|r| r.relative_id == 11).unwrap();
        assert_eq!(forced.entry_type, EntryType::Virtual);
        assert_eq!((forced.reserved, forced.offered), (0, 0));

        let standard = inserts.iter().find(|r| r.relative_id == 10).unwrap();
        assert_eq!(standard.entry_type, EntryType::Standard);
        assert_eq!(standard.reserved, 1);
        assert!(!plan.stock_forced);
    }

    #[test]
    fn uncancelable_sibling_goes_into_stock() {
        let s = slot(
            10,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::ORDERABLE,
        );
        let mut sibling = slot(
            11,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::COULD_USE_STOCK,
        );
        sibling.synced_reserved = 1;
        let group = vec![s.clone(), sibling];

        let plan = propose_edit(&s, &group, 1, 0, now());
        assert!(plan.stock_forced);
        let forced = plan
            .mutations
            .iter()
            .find_map(|m| match m {
                ActionMutation::Insert(row) if row.relative_id == 11 => Some(row),
                _ => None,
            })
            .unwrap();
        assert_eq!((forced.reserved, forced.offered), (1, 1));
    }

    // The sibling qualification deliberately checks the synced OR the local
    // layer for a net amount, not the authoritative one. A sibling whose
    // local layer already canceled its synced portion still qualifies.
    #[test]
    fn sibling_qualification_checks_both_layers() {
        let s = slot(
            10,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::ORDERABLE,
        );
        let mut sibling = slot(
            11,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::CANCELABLE,
        );
        sibling.synced_reserved = 1;
        sibling.local_reserved = Some(0);
        sibling.local_offered = Some(0);
        let group = vec![s.clone(), sibling];

        let plan = propose_edit(&s, &group, 1, 0, now());
        assert!(plan.mutations.iter().any(|m| matches!(
            m,
            ActionMutation::Insert(row) if row.relative_id == 11 && row.entry_type == EntryType::Virtual
        )));
    }

    #[derive(Default)]
    struct RecordingSink {
        stock_notices: std::sync::Mutex<Vec<(i64, i64)>>,
    }

    #[async_trait::async_trait]
    impl EventSink for RecordingSink {
        async fn stock_forced(&self, credential_id: i64, portal_id: i64) {
            self.stock_notices
                .lock()
                .unwrap()
                .push((credential_id, portal_id));
        }
    }

    #[tokio::test]
    async fn forced_stock_offer_reaches_the_sink() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let cfg: crate::config::Config = serde_yaml::from_str(crate::config::example()).unwrap();
        repo::seed_config(&pool, &cfg).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        let entry = |relative_id: i64| crate::db::MenuEntry {
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
        };
        repo::upsert_menu_entries(&pool, &[entry(10), entry(11)])
            .await
            .unwrap();
        // Sibling 11 holds a portion that can no longer be canceled, only
        // offered into the stock.
        repo::upsert_group_menu_entries(
            &pool,
            &[
                crate::db::GroupMenuEntry {
                    portal_id: 1,
                    relative_id: 10,
                    group_id: 1,
                    price: Some(3200),
                    status: MenuStatus(MenuStatus::ORDERABLE),
                },
                crate::db::GroupMenuEntry {
                    portal_id: 1,
                    relative_id: 11,
                    group_id: 1,
                    price: Some(3200),
                    status: MenuStatus(MenuStatus::COULD_USE_STOCK),
                },
            ],
        )
        .await
        .unwrap();
        repo::upsert_actions(
            &pool,
            &[ActionRow {
                credential_id: 1,
                portal_id: 1,
                relative_id: 11,
                sync_status: SyncStatus::Synced,
                entry_type: EntryType::Standard,
                reserved: 1,
                offered: 0,
                taken: 0,
                price: Some(3200),
                description: None,
                last_change: Utc::now(),
            }],
        )
        .await
        .unwrap();

        let sink = RecordingSink::default();
        let plan = make_edit(&pool, &sink, 1, 1, 10, 1, 0).await.unwrap();
        assert!(plan.stock_forced);
        assert_eq!(*sink.stock_notices.lock().unwrap(), vec![(1, 1)]);
    }

    #[test]
    fn group_edit_deletes_whole_group_when_edits_exist() {
        let mut s = slot(
            10,
            PortalFeatures::ONE_ORDER_PER_GROUP,
            MenuStatus::ORDERABLE,
        );
        s.edit_reserved = Some(1);
        s.edit_offered = Some(0);
        let group = vec![s.clone()];
        let plan = propose_edit(&s, &group, 1, 0, now());
        assert!(matches!(
            plan.mutations[0],
            ActionMutation::DeleteGroupEdits { group_id: 1, .. }
        ));
    }
}
