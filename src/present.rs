//! Derives the single user-facing action currently valid for a menu slot
//! from its overlapping failed/edit/local/synced layers.

use crate::db::MenuSlot;
use chrono::NaiveDate;

/// The layer a slot's effective amounts come from. The first present layer
/// wins, in edit > local > synced order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveLayer {
    Edit { reserved: i32, offered: i32 },
    Local { reserved: i32, offered: i32 },
    Synced,
}

pub fn active_layer(slot: &MenuSlot) -> ActiveLayer {
    if let (Some(reserved), Some(offered)) = (slot.edit_reserved, slot.edit_offered) {
        return ActiveLayer::Edit { reserved, offered };
    }
    if let (Some(reserved), Some(offered)) = (slot.local_reserved, slot.local_offered) {
        return ActiveLayer::Local { reserved, offered };
    }
    ActiveLayer::Synced
}

/// What a single tap on the slot does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Disabled,
    ReserveNew,
    CancelOld,
    ReserveFromStock,
    OfferInStock,
    RemoveFromStock,
    ShowDetail,
    CancelEdit,
}

/// Resolve the valid action for one slot. Total over every layer and flag
/// combination.
pub fn resolve_action(slot: &MenuSlot, today: NaiveDate) -> EntryAction {
    // Past entries are read-only, whatever their layers say.
    if slot.date < today {
        return EntryAction::Disabled;
    }

    let layer = active_layer(slot);
    let taken = slot.synced_taken;
    let active_reserved = match layer {
        ActiveLayer::Edit { reserved, .. } | ActiveLayer::Local { reserved, .. } => reserved,
        ActiveLayer::Synced => slot.synced_reserved,
    };

    // More than one editable portion cannot be handled by a single tap.
    if active_reserved - taken > 1 || slot.synced_reserved - taken > 1 {
        return if slot.status.any_capability() {
            EntryAction::ShowDetail
        } else {
            EntryAction::Disabled
        };
    }

    match layer {
        ActiveLayer::Edit { reserved, offered }
            if reserved == slot.synced_reserved && offered == slot.synced_offered =>
        {
            // A no-op shadow left behind by a prior revert; read through to
            // the synced baseline.
            resolve_synced(slot)
        }
        ActiveLayer::Edit { .. } | ActiveLayer::Local { .. } => EntryAction::CancelEdit,
        ActiveLayer::Synced => resolve_synced(slot),
    }
}

fn resolve_synced(slot: &MenuSlot) -> EntryAction {
    let status = slot.status;
    let stock = status.could_use_stock();
    match slot.synced_offered {
        0 => match slot.synced_reserved - slot.synced_taken {
            0 => {
                if status.orderable() {
                    EntryAction::ReserveNew
                } else if stock && slot.remaining_to_order.map(|n| n > 0).unwrap_or(false) {
                    EntryAction::ReserveFromStock
                } else {
                    EntryAction::Disabled
                }
            }
            1 => {
                if status.cancelable() {
                    EntryAction::CancelOld
                } else if stock {
                    EntryAction::OfferInStock
                } else {
                    EntryAction::Disabled
                }
            }
            _ => {
                if status.any_capability() {
                    EntryAction::ShowDetail
                } else {
                    EntryAction::Disabled
                }
            }
        },
        1 => {
            if stock {
                EntryAction::RemoveFromStock
            } else {
                EntryAction::Disabled
            }
        }
        _ => {
            if status.any_capability() {
                EntryAction::ShowDetail
            } else {
                EntryAction::Disabled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MenuStatus, PortalFeatures};

    fn slot(status: u32) -> MenuSlot {
        MenuSlot {
            credential_id: 1,
            portal_id: 1,
            relative_id: 10,
            date: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            label: "Lunch".into(),
            group_id: 1,
            price: Some(3200),
            status: MenuStatus(status),
            features: PortalFeatures::default(),
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

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, 1).unwrap()
    }

    #[test]
    fn reserve_then_cancel_edit() {
        let mut s = slot(MenuStatus::ORDERABLE);
        assert_eq!(resolve_action(&s, today()), EntryAction::ReserveNew);

        s.edit_reserved = Some(1);
        s.edit_offered = Some(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::CancelEdit);
    }

    #[test]
    fn noop_edit_reads_through_to_synced() {
        let mut s = slot(MenuStatus::ORDERABLE);
        s.edit_reserved = Some(0);
        s.edit_offered = Some(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::ReserveNew);
    }

    #[test]
    fn local_layer_only_reverts() {
        let mut s = slot(MenuStatus::ORDERABLE | MenuStatus::CANCELABLE);
        s.local_reserved = Some(1);
        s.local_offered = Some(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::CancelEdit);
    }

    #[test]
    fn synced_reservation_branches() {
        let mut s = slot(MenuStatus::CANCELABLE);
        s.synced_reserved = 1;
        assert_eq!(resolve_action(&s, today()), EntryAction::CancelOld);

        s.status = MenuStatus(MenuStatus::COULD_USE_STOCK);
        assert_eq!(resolve_action(&s, today()), EntryAction::OfferInStock);

        s.status = MenuStatus(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::Disabled);
    }

    #[test]
    fn stock_branches() {
        let mut s = slot(MenuStatus::COULD_USE_STOCK);
        assert_eq!(resolve_action(&s, today()), EntryAction::Disabled);

        s.remaining_to_order = Some(3);
        assert_eq!(resolve_action(&s, today()), EntryAction::ReserveFromStock);

        s.remaining_to_order = Some(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::Disabled);

        s.synced_offered = 1;
        assert_eq!(resolve_action(&s, today()), EntryAction::RemoveFromStock);
        s.status = MenuStatus(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::Disabled);
    }

    #[test]
    fn multi_portion_collapses_to_detail() {
        let mut s = slot(MenuStatus::ORDERABLE | MenuStatus::CANCELABLE);
        s.synced_reserved = 3;
        assert_eq!(resolve_action(&s, today()), EntryAction::ShowDetail);

        s.status = MenuStatus(0);
        assert_eq!(resolve_action(&s, today()), EntryAction::Disabled);
    }

    #[test]
    fn past_date_always_disabled() {
        let mut s = slot(MenuStatus::ORDERABLE | MenuStatus::CANCELABLE);
        s.synced_reserved = 1;
        s.edit_reserved = Some(0);
        s.edit_offered = Some(0);
        let later = NaiveDate::from_ymd_opt(2026, 9, 2).unwrap();
        assert_eq!(resolve_action(&s, later), EntryAction::Disabled);
    }

    // Totality: every combination resolves to some action without panicking.
    #[test]
    fn resolver_is_total() {
        for status in 0..8u32 {
            for synced_reserved in 0..4 {
                for synced_offered in 0..3 {
                    for taken in 0..3 {
                        for layer in 0..5 {
                            let mut s = slot(status);
                            s.synced_reserved = synced_reserved;
                            s.synced_offered = synced_offered;
                            s.synced_taken = taken;
                            s.remaining_to_order = Some(1);
                            match layer {
                                1 => {
                                    s.local_reserved = Some(1);
                                    s.local_offered = Some(0);
                                }
                                2 => {
                                    s.edit_reserved = Some(0);
                                    s.edit_offered = Some(0);
                                }
                                3 => {
                                    s.edit_reserved = Some(2);
                                    s.edit_offered = Some(1);
                                }
                                4 => {
                                    s.date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
                                }
                                _ => {}
                            }
                            let _ = resolve_action(&s, today());
                        }
                    }
                }
            }
        }
    }
}
