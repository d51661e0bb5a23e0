use anyhow::Context;
use credit_allocation::{
    adjust::QuantityChange,
    config::{AllocationConfig, StoreConfig},
    criteria::{CriteriaFilter, CriteriaSnapshot},
    error::AllocationError,
    inventory::{InventoryUnit, ReservationStatus},
    optimizer::AllocationState,
    service::AllocationService,
    simulator::ClaimState,
    store::SledStore,
    trade::Direction,
};
use sled::open;
use std::sync::Arc;

use tempfile::tempdir; // Use for test db cleanup.

// Each test gets its own database under a temp dir; sled holds a file lock.
fn service(name: &str) -> anyhow::Result<(tempfile::TempDir, AllocationService)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    db.clear()?;
    Ok((temp_dir, AllocationService::new(SledStore::new(Arc::new(db)))))
}

fn seed_verra(service: &AllocationService, n: usize) -> anyhow::Result<Vec<String>> {
    let mut serials = vec![];
    for i in 0..n {
        let serial = format!("VCS-{i:03}");
        service.add_unit(
            &InventoryUnit::new(&serial)
                .set_market("Voluntary")
                .set_registry("Verra")
                .set_product("VCU")
                .set_project_id("VCS-1234")
                .set_vintage("2022"),
        )?;
        serials.push(serial);
    }
    Ok(serials)
}

fn verra() -> CriteriaFilter {
    CriteriaFilter::new().set_registry("Verra")
}

#[test]
fn older_criteria_wins_contested_inventory() -> anyhow::Result<()> {
    let (_dir, service) = service("fifo_conflict.db")?;
    seed_verra(&service, 10)?;

    let x = service.assign_criteria_only("trade_x", 6, verra(), "alice")?;
    let y = service.assign_criteria_only("trade_y", 6, verra(), "bob")?;
    assert!(x < y);

    let report = service.allocation_status()?;
    assert!(!report.allocation_possible);
    assert_eq!(report.total_available, 10);
    assert_eq!(report.total_required, 12);

    assert_eq!(report.criteria_status[&x].status, AllocationState::Sufficient);
    assert_eq!(report.criteria_status[&x].allocated, 6);
    let y_status = &report.criteria_status[&y];
    assert_eq!(y_status.status, AllocationState::Conflict);
    assert_eq!(y_status.available, 10);
    assert_eq!(y_status.allocated, 4);
    assert_eq!(y_status.shortfall, 2);

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].overlap_count, 10);
    assert_eq!(report.conflicts[0].combined_need, 12);
    assert_eq!(report.trade_status["trade_y"].conflicts_with, vec!["trade_x"]);
    Ok(())
}

#[test]
fn claims_leave_remaining_inventory_available() -> anyhow::Result<()> {
    let (_dir, service) = service("claims.db")?;
    seed_verra(&service, 10)?;
    service.assign_criteria_only("trade_x", 6, verra(), "alice")?;

    let summary = service.claims_for(&verra())?;
    assert_eq!(summary.total_matching, 10);
    assert_eq!(summary.claimed_by_criteria, 6);
    assert_eq!(summary.available, 4);
    assert_eq!(summary.criteria_claims.len(), 1);
    assert_eq!(summary.criteria_claims[0].trade_id, "trade_x");

    let claimed: Vec<_> = summary
        .inventory_items
        .iter()
        .filter(|item| item.status == ClaimState::Claimed)
        .collect();
    assert_eq!(claimed.len(), 6);
    assert!(claimed
        .iter()
        .all(|item| item.claimed_by_trade.as_deref() == Some("trade_x")));
    Ok(())
}

#[test]
fn claims_without_criteria_show_everything_available() -> anyhow::Result<()> {
    let (_dir, service) = service("claims_empty.db")?;
    seed_verra(&service, 5)?;

    let summary = service.claims_for(&verra())?;
    assert_eq!(summary.total_matching, 5);
    assert_eq!(summary.claimed_by_criteria, 0);
    assert_eq!(summary.available, 5);

    let nothing = service.claims_for(&CriteriaFilter::new().set_registry("Gold Standard"))?;
    assert_eq!(nothing.total_matching, 0);
    assert!(nothing.inventory_items.is_empty());
    Ok(())
}

#[test]
fn invalid_filters_are_rejected() -> anyhow::Result<()> {
    let (_dir, service) = service("invalid.db")?;

    let backwards = verra().set_vintage_range("2023", "2020");
    assert!(matches!(
        service.claims_for(&backwards),
        Err(AllocationError::InvalidFilter(_))
    ));
    assert!(matches!(
        service.assign_criteria_only("trade_x", 0, verra(), "alice"),
        Err(AllocationError::InvalidFilter(_))
    ));
    // a padded bound would compare below every real vintage
    let padded = verra().set_vintage_from(" 2021");
    assert!(matches!(
        service.assign_criteria_only("trade_x", 2, padded, "alice"),
        Err(AllocationError::InvalidFilter(_))
    ));
    assert!(service.list_criteria(None)?.is_empty());
    Ok(())
}

#[test]
fn assigning_through_criteria_consumes_it() -> anyhow::Result<()> {
    let (_dir, service) = service("assign_specific.db")?;
    let serials = seed_verra(&service, 5)?;
    let id = service.assign_criteria_only("trade_a", 3, verra(), "alice")?;

    let assigned = service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_a", Some(id))?;
    assert_eq!(assigned, 1);
    assert_eq!(service.get_criteria(id)?.quantity_required, 2);

    let unit = service
        .get_unit_by_serial(&serials[0])?
        .context("unit missing")?;
    assert!(unit.is_assigned);
    assert_eq!(unit.trade_id.as_deref(), Some("trade_a"));
    assert_eq!(unit.criteria_id, Some(id));
    assert_eq!(unit.snapshot().context("snapshot missing")?.filter, verra());

    let rest = [serials[1].as_str(), serials[2].as_str()];
    service.assign_inventory_to_trade(&rest, "trade_a", Some(id))?;
    assert!(matches!(
        service.get_criteria(id),
        Err(AllocationError::NotFound { .. })
    ));
    assert_eq!(service.inventory_by_trade("trade_a")?.len(), 3);
    Ok(())
}

#[test]
fn assigning_to_trade_spills_across_its_criteria() -> anyhow::Result<()> {
    let (_dir, service) = service("assign_fifo.db")?;
    let serials = seed_verra(&service, 6)?;
    let first = service.assign_criteria_only("trade_a", 2, verra(), "alice")?;
    let second = service.assign_criteria_only("trade_a", 4, verra(), "alice")?;
    let other = service.assign_criteria_only("trade_b", 4, verra(), "bob")?;

    let picked: Vec<&str> = serials.iter().take(3).map(String::as_str).collect();
    service.assign_inventory_to_trade(&picked, "trade_a", None)?;

    assert!(service.get_criteria(first).is_err());
    assert_eq!(service.get_criteria(second)?.quantity_required, 3);
    assert_eq!(service.get_criteria(other)?.quantity_required, 4);
    Ok(())
}

#[test]
fn unassign_restores_or_recreates_criteria() -> anyhow::Result<()> {
    let (_dir, service) = service("unassign.db")?;
    let serials = seed_verra(&service, 4)?;
    let filter = verra().set_vintage_range("2020", "2023");
    let id = service.assign_criteria_only("trade_a", 3, filter.clone(), "alice")?;

    // partial consumption, then give one back
    service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_a", Some(id))?;
    service.unassign_inventory_from_trade(&[serials[0].as_str()], Some("carol"), true)?;
    assert_eq!(service.get_criteria(id)?.quantity_required, 3);
    assert!(service.get_unit_by_serial(&serials[0])?.context("unit")?.is_free());

    // full consumption deletes; releasing recreates from the stored snapshot
    let all: Vec<&str> = serials.iter().take(3).map(String::as_str).collect();
    service.assign_inventory_to_trade(&all, "trade_a", Some(id))?;
    assert!(service.get_criteria(id).is_err());

    let released = service.unassign_inventory_from_trade(&all[..2], None, true)?;
    assert_eq!(released, 2);

    let recreated = service.list_criteria(Some("trade_a"))?;
    assert_eq!(recreated.len(), 1);
    assert_ne!(recreated[0].id, id);
    assert_eq!(recreated[0].quantity_required, 2);
    assert_eq!(recreated[0].filter, filter);
    assert_eq!(recreated[0].created_by, "system");
    Ok(())
}

#[test]
fn unassign_without_restore_leaves_criteria_alone() -> anyhow::Result<()> {
    let (_dir, service) = service("unassign_plain.db")?;
    let serials = seed_verra(&service, 2)?;
    let id = service.assign_criteria_only("trade_a", 2, verra(), "alice")?;

    service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_a", Some(id))?;
    service.unassign_inventory_from_trade(&[serials[0].as_str()], Some("carol"), false)?;
    assert_eq!(service.get_criteria(id)?.quantity_required, 1);
    Ok(())
}

#[test]
fn double_assignment_fails_without_side_effects() -> anyhow::Result<()> {
    let (_dir, service) = service("double_assign.db")?;
    let serials = seed_verra(&service, 3)?;
    let id = service.assign_criteria_only("trade_b", 3, verra(), "bob")?;
    service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_a", None)?;

    let err = service
        .assign_inventory_to_trade(
            &[serials[1].as_str(), serials[0].as_str()],
            "trade_b",
            Some(id),
        )
        .unwrap_err();
    assert!(matches!(err, AllocationError::Conflict { ref serial, .. } if serial == &serials[0]));

    // the whole call rolled back
    assert!(service.get_unit_by_serial(&serials[1])?.context("unit")?.is_free());
    assert_eq!(service.get_criteria(id)?.quantity_required, 3);
    Ok(())
}

#[test]
fn reservations_gate_assignment() -> anyhow::Result<()> {
    let (_dir, service) = service("reserve.db")?;
    let serials = seed_verra(&service, 3)?;

    let held = [serials[0].as_str(), serials[1].as_str()];
    let reserved = service.reserve_inventory(&held, "trade_r", "dave", None)?;
    assert_eq!(reserved, 2);
    // already reserved units are skipped
    assert_eq!(service.reserve_inventory(&[serials[0].as_str()], "trade_q", "dave", None)?, 0);
    assert_eq!(service.reserved_inventory(None)?.len(), 2);
    assert_eq!(service.reserved_inventory(Some("trade_q"))?.len(), 0);

    // reserved units are not claimable
    assert_eq!(service.claims_for(&verra())?.total_matching, 1);

    let err = service
        .assign_inventory_to_trade(&[serials[0].as_str()], "trade_q", None)
        .unwrap_err();
    assert!(matches!(err, AllocationError::Conflict { .. }));

    service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_r", None)?;
    let history = service.reservation_history(&serials[0])?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ReservationStatus::Delivered);

    let releasing = [serials[1].as_str(), serials[2].as_str()];
    assert_eq!(service.release_reservation(&releasing, "erin")?, 1);
    let history = service.reservation_history(&serials[1])?;
    assert_eq!(history[0].status, ReservationStatus::Released);
    assert_eq!(history[0].released_by.as_deref(), Some("erin"));
    assert!(service.reserved_inventory(None)?.is_empty());
    Ok(())
}

#[test]
fn criteria_maintenance() -> anyhow::Result<()> {
    let (_dir, service) = service("maintenance.db")?;
    let a1 = service.assign_criteria_only("trade_a", 2, verra(), "alice")?;
    let a2 = service.assign_criteria_only("trade_a", 5, CriteriaFilter::new(), "alice")?;
    let b1 = service.assign_criteria_only("trade_b", 1, verra(), "bob")?;

    let summary = service.trade_criteria_summary()?;
    assert_eq!(summary["trade_a"].iter().map(|c| c.id).collect::<Vec<_>>(), vec![a1, a2]);
    assert_eq!(summary["trade_b"].len(), 1);

    service.update_single_criteria(b1, 4, verra().set_product("VCU"))?;
    let updated = service.get_criteria(b1)?;
    assert_eq!(updated.quantity_required, 4);
    assert_eq!(updated.filter.product.as_deref(), Some("VCU"));

    service.remove_single_criteria(a1)?;
    assert!(matches!(
        service.remove_single_criteria(a1),
        Err(AllocationError::NotFound { .. })
    ));

    assert_eq!(service.remove_trade_criteria("trade_a")?, 1);
    assert!(matches!(
        service.remove_trade_criteria("trade_a"),
        Err(AllocationError::NotFound { .. })
    ));
    assert_eq!(service.list_criteria(None)?.len(), 1);
    Ok(())
}

#[test]
fn criteria_info_falls_back_to_snapshot() -> anyhow::Result<()> {
    let (_dir, service) = service("criteria_info.db")?;
    let serials = seed_verra(&service, 3)?;
    let id = service.assign_criteria_only("trade_a", 2, verra(), "alice")?;

    service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_a", Some(id))?;
    let info = service.inventory_criteria_info(&[serials[0].as_str(), serials[2].as_str()])?;
    assert_eq!(info.len(), 1);
    assert_eq!(info[&serials[0]].criteria_id, id);

    // consume the rest, the live record disappears
    service.assign_inventory_to_trade(&[serials[1].as_str()], "trade_a", Some(id))?;
    assert!(service.get_criteria(id).is_err());
    let info = service.inventory_criteria_info(&[serials[0].as_str()])?;
    assert_eq!(info[&serials[0]].snapshot.trade_id, "trade_a");
    assert_eq!(info[&serials[0]].snapshot.filter, verra());
    Ok(())
}

#[test]
fn unknown_serials_are_skipped() -> anyhow::Result<()> {
    let (_dir, service) = service("unknown.db")?;
    let serials = seed_verra(&service, 1)?;

    let assigned =
        service.assign_inventory_to_trade(&["NOPE", serials[0].as_str()], "trade_a", None)?;
    assert_eq!(assigned, 1);
    assert_eq!(service.unassign_inventory_from_trade(&["NOPE"], None, true)?, 0);
    assert_eq!(service.reserve_inventory(&["NOPE"], "trade_a", "dave", None)?, 0);
    Ok(())
}

#[test]
fn service_opens_from_config() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let config = AllocationConfig {
        store: StoreConfig {
            path: temp_dir.path().join("configured.db"),
            flush_on_write: true,
        },
        system_user: "batch".into(),
        ..Default::default()
    };
    let service = AllocationService::from_config(&config)?;
    let serials = seed_verra(&service, 1)?;
    let id = service.assign_criteria_only("trade_a", 1, verra(), "alice")?;

    service.assign_inventory_to_trade(&[serials[0].as_str()], "trade_a", Some(id))?;
    service.unassign_inventory_from_trade(&[serials[0].as_str()], None, true)?;
    assert_eq!(service.list_criteria(Some("trade_a"))?[0].created_by, "batch");
    Ok(())
}

#[test]
fn decrement_on_assign_by_id_and_by_trade() -> anyhow::Result<()> {
    let (_dir, service) = service("decrement.db")?;
    let a1 = service.assign_criteria_only("trade_a", 5, verra(), "alice")?;
    let a2 = service.assign_criteria_only("trade_a", 2, verra(), "alice")?;

    let changes = service.decrement_on_assign("trade_a", Some(a2), 1)?;
    assert_eq!(
        changes,
        vec![QuantityChange::Set {
            criteria_id: a2,
            quantity: 1
        }]
    );

    // more than is left deletes instead of going negative
    let changes = service.decrement_on_assign("trade_a", Some(a1), 9)?;
    assert_eq!(changes, vec![QuantityChange::Delete { criteria_id: a1 }]);
    assert!(service.get_criteria(a1).is_err());

    // an unknown id is a logged no-op
    assert!(service.decrement_on_assign("trade_a", Some(a1), 1)?.is_empty());
    assert_eq!(service.get_criteria(a2)?.quantity_required, 1);

    let changes = service.decrement_on_assign("trade_a", None, 3)?;
    assert_eq!(changes, vec![QuantityChange::Delete { criteria_id: a2 }]);
    assert!(service.list_criteria(Some("trade_a"))?.is_empty());
    assert!(service.decrement_on_assign("trade_a", None, 3)?.is_empty());
    Ok(())
}

#[test]
fn restore_on_unassign_increments_recreates_or_skips() -> anyhow::Result<()> {
    let (_dir, service) = service("restore.db")?;
    let id = service.assign_criteria_only("trade_a", 2, verra(), "alice")?;

    assert_eq!(service.restore_on_unassign(id, 3, "carol", None)?, Some(id));
    assert_eq!(service.get_criteria(id)?.quantity_required, 5);

    let snapshot = CriteriaSnapshot {
        trade_id: "trade_b".into(),
        direction: Direction::Sell,
        filter: verra().set_vintage_range("2020", "2022"),
    };
    let recreated = service
        .restore_on_unassign(999, 3, "carol", Some(&snapshot))?
        .context("criteria was not recreated")?;
    assert_ne!(recreated, 999);
    let criteria = service.get_criteria(recreated)?;
    assert_eq!(criteria.trade_id, "trade_b");
    assert_eq!(criteria.quantity_required, 3);
    assert_eq!(criteria.filter, snapshot.filter);
    assert_eq!(criteria.created_by, "carol");

    // no live record and no snapshot: nothing to restore against
    assert_eq!(service.restore_on_unassign(998, 3, "carol", None)?, None);
    assert_eq!(service.restore_on_unassign(id, 0, "carol", None)?, None);
    assert_eq!(service.list_criteria(None)?.len(), 2);
    Ok(())
}

#[test]
fn decrement_by_id_applies_across_trades() -> anyhow::Result<()> {
    let (_dir, service) = service("cross_trade.db")?;
    let owned = service.assign_criteria_only("trade_a", 4, verra(), "alice")?;

    // logged as a cross-trade adjustment, still applied to the named record
    let changes = service.decrement_on_assign("trade_b", Some(owned), 1)?;
    assert_eq!(changes.len(), 1);
    assert_eq!(service.get_criteria(owned)?.quantity_required, 3);
    Ok(())
}
