//! Service layer API for generic allocation operations
use super::adjust::{self, QuantityChange, Restoration};
use super::config::AllocationConfig;
use super::criteria::{Criteria, CriteriaDraft, CriteriaFilter, CriteriaSnapshot, CriteriaStatus};
use super::error::{AllocationError, AllocationResult};
use super::inventory::{InventoryUnit, ReservationRecord, ReservationStatus};
use super::matcher;
use super::optimizer::{self, AllocationReport};
use super::simulator::{self, ClaimSummary};
use super::store::{CriteriaRegistry, InventoryStore, SledStore, tx};
use super::trade::TimeStamp;
use super::utils;
use sled::transaction::TransactionalTree;
use std::collections::{BTreeMap, HashMap};

/// Criteria a released unit was assigned through, as seen right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaInfo {
    pub criteria_id: u64,
    pub snapshot: CriteriaSnapshot,
}

pub struct AllocationService {
    store: SledStore,
    system_user: String,
}

impl AllocationService {
    pub fn new(store: SledStore) -> Self {
        Self {
            store,
            system_user: "system".to_string(),
        }
    }

    pub fn from_config(config: &AllocationConfig) -> AllocationResult<Self> {
        config.validate()?;
        Ok(Self {
            store: SledStore::open(&config.store)?,
            system_user: config.system_user.clone(),
        })
    }

    pub fn store(&self) -> &SledStore {
        &self.store
    }

    pub fn check_match(&self, unit: &InventoryUnit, filter: &CriteriaFilter) -> bool {
        matcher::matches(unit, filter)
    }

    /// How much free inventory matching `filter` is left after existing claims.
    pub fn claims_for(&self, filter: &CriteriaFilter) -> AllocationResult<ClaimSummary> {
        filter.validate()?;
        let pool = self.store.find_units(filter, true, true)?;
        if pool.is_empty() {
            return Ok(ClaimSummary::default());
        }
        let criteria = self.store.list_active_sell_criteria()?;
        Ok(simulator::claims_for(&pool, &criteria, filter))
    }

    /// Allocation feasibility across every active criteria. Advisory only.
    pub fn allocation_status(&self) -> AllocationResult<AllocationReport> {
        let pool = self.store.find_units(&CriteriaFilter::default(), true, true)?;
        let criteria = self.store.list_active_sell_criteria()?;
        let report = optimizer::allocation_status(&pool, &criteria);
        tracing::debug!(
            criteria = criteria.len(),
            units = pool.len(),
            allocation_possible = report.allocation_possible,
            "computed allocation status"
        );
        Ok(report)
    }

    /// Registers a generic claim for `trade_id`. No inventory is touched.
    pub fn assign_criteria_only(
        &self,
        trade_id: &str,
        quantity: u64,
        filter: CriteriaFilter,
        username: &str,
    ) -> AllocationResult<u64> {
        let draft = CriteriaDraft::sell(trade_id, quantity, filter, username);
        draft.validate()?;
        let id = self.store.create_criteria(draft)?;

        let count = self
            .store
            .list_active_sell_criteria()?
            .iter()
            .filter(|c| c.trade_id == trade_id)
            .count();
        tracing::info!(
            criteria_id = id,
            trade_id,
            quantity,
            username,
            "added criteria #{count} to trade"
        );
        Ok(id)
    }

    /// Reduces criteria after `count` units were assigned to `trade_id`.
    ///
    /// With a criteria id only that record shrinks; otherwise the trade's oldest
    /// criteria are consumed first. Missing records are skipped.
    pub fn decrement_on_assign(
        &self,
        trade_id: &str,
        criteria_id: Option<u64>,
        count: u64,
    ) -> AllocationResult<Vec<QuantityChange>> {
        let trade_criteria = self.trade_criteria_ids(trade_id)?;
        let changes = self.store.transaction(|tree| {
            decrement_in_tx(tree, trade_id, criteria_id, &trade_criteria, count)
        })?;
        log_changes(trade_id, &changes);
        Ok(changes)
    }

    /// Gives `count` units back to `criteria_id`, recreating it from `snapshot`
    /// when it has been deleted. Returns the id that received the quantity.
    pub fn restore_on_unassign(
        &self,
        criteria_id: u64,
        count: u64,
        username: &str,
        snapshot: Option<&CriteriaSnapshot>,
    ) -> AllocationResult<Option<u64>> {
        let fresh_id = self.store.generate_id()?;
        self.store.transaction(|tree| {
            restore_in_tx(tree, criteria_id, count, snapshot, username, fresh_id)
        })
    }

    pub fn add_unit(&self, unit: &InventoryUnit) -> AllocationResult<()> {
        if unit.serial.trim().is_empty() {
            return Err(AllocationError::InvalidFilter("serial is empty".into()));
        }
        self.store.put_unit(unit)
    }

    pub fn get_unit_by_serial(&self, serial: &str) -> AllocationResult<Option<InventoryUnit>> {
        self.store.get_unit_by_serial(serial)
    }

    pub fn find_units(
        &self,
        filter: &CriteriaFilter,
        exclude_reserved: bool,
        exclude_assigned: bool,
    ) -> AllocationResult<Vec<InventoryUnit>> {
        filter.validate()?;
        self.store
            .find_units(filter, exclude_reserved, exclude_assigned)
    }

    /// Binds units to a trade and adjusts its criteria in one transaction.
    ///
    /// Fails without changing anything if any unit is already assigned or is
    /// reserved for a different trade. Unknown serials are skipped.
    pub fn assign_inventory_to_trade(
        &self,
        serials: &[&str],
        trade_id: &str,
        criteria_id: Option<u64>,
    ) -> AllocationResult<u64> {
        let trade_criteria = self.trade_criteria_ids(trade_id)?;
        let reservations = self.active_reservations(serials)?;

        let (assigned, changes) = self.store.transaction(|tree| {
            let snapshot = match criteria_id {
                Some(id) => match tx::get_criteria(tree, id)? {
                    Some(criteria) => Some(tx::encode_in_tx(&criteria.snapshot())?),
                    None => None,
                },
                None => None,
            };

            let mut assigned = 0u64;
            for serial in serials {
                let Some(mut unit) = tx::get_unit(tree, serial)? else {
                    tracing::warn!(serial, trade_id, "skipping unknown serial");
                    continue;
                };
                if unit.is_assigned {
                    return tx::abort(AllocationError::Conflict {
                        serial: serial.to_string(),
                        reason: format!(
                            "assigned to trade {}",
                            unit.trade_id.as_deref().unwrap_or("?")
                        ),
                    });
                }
                if unit.is_reserved {
                    let holder = unit.reserved_for_trade_id.as_deref().unwrap_or_default();
                    if holder != trade_id {
                        return tx::abort(AllocationError::Conflict {
                            serial: serial.to_string(),
                            reason: format!("reserved for trade {holder}"),
                        });
                    }
                    // delivering against its own reservation
                    unit.release();
                    for record in reservations.get(*serial).into_iter().flatten() {
                        let mut record = record.clone();
                        record.status = ReservationStatus::Delivered;
                        record.released_at = Some(TimeStamp::new());
                        tx::put_reservation(tree, &record)?;
                    }
                }
                unit.assign(trade_id, criteria_id, snapshot.clone());
                tx::put_unit(tree, &unit)?;
                assigned += 1;
            }

            let changes = decrement_in_tx(tree, trade_id, criteria_id, &trade_criteria, assigned)?;
            Ok((assigned, changes))
        })?;

        tracing::info!(trade_id, assigned, criteria_id, "assigned inventory to trade");
        log_changes(trade_id, &changes);
        Ok(assigned)
    }

    /// Releases units from their trades. With `restore_criteria` the quantity goes
    /// back to the criteria each unit was assigned through, recreating deleted
    /// criteria from the snapshot stored on the unit.
    pub fn unassign_inventory_from_trade(
        &self,
        serials: &[&str],
        username: Option<&str>,
        restore_criteria: bool,
    ) -> AllocationResult<u64> {
        let username = username.unwrap_or(&self.system_user);

        // a fresh id per criteria that might need recreating
        let mut fresh_ids: HashMap<u64, u64> = HashMap::new();
        if restore_criteria {
            for serial in serials {
                if let Some(id) = self
                    .store
                    .get_unit_by_serial(serial)?
                    .and_then(|unit| unit.criteria_id)
                {
                    if !fresh_ids.contains_key(&id) {
                        fresh_ids.insert(id, self.store.generate_id()?);
                    }
                }
            }
        }

        let (released, restored) = self.store.transaction(|tree| {
            // criteria id -> (units released, snapshot stored on the first of them)
            let mut groups: BTreeMap<u64, (u64, Option<CriteriaSnapshot>)> = BTreeMap::new();
            let mut released = 0u64;

            for serial in serials {
                let Some(mut unit) = tx::get_unit(tree, serial)? else {
                    continue;
                };
                if !unit.is_assigned {
                    continue;
                }
                if restore_criteria {
                    if let Some(id) = unit.criteria_id {
                        let group = groups.entry(id).or_insert((0, None));
                        group.0 += 1;
                        if group.1.is_none() {
                            group.1 = unit.snapshot();
                        }
                    }
                }
                unit.unassign();
                tx::put_unit(tree, &unit)?;
                released += 1;
            }

            let mut restored = vec![];
            for (criteria_id, (count, snapshot)) in &groups {
                let Some(fresh_id) = fresh_ids.get(criteria_id) else {
                    tracing::warn!(
                        criteria_id,
                        "criteria link appeared during unassign; not restoring"
                    );
                    continue;
                };
                let target = restore_in_tx(
                    tree,
                    *criteria_id,
                    *count,
                    snapshot.as_ref(),
                    username,
                    *fresh_id,
                )?;
                restored.push((*criteria_id, *count, target));
            }
            Ok((released, restored))
        })?;

        tracing::info!(released, username, "unassigned inventory");
        for (criteria_id, count, target) in restored {
            match target {
                Some(id) if id == criteria_id => {
                    tracing::info!(criteria_id, count, "restored quantity to existing criteria")
                }
                Some(id) => {
                    tracing::info!(criteria_id, new_id = id, count, "recreated deleted criteria")
                }
                None => tracing::warn!(
                    criteria_id,
                    count,
                    "criteria not found and no snapshot to recreate"
                ),
            }
        }
        Ok(released)
    }

    /// Earmarks free units for a trade. Already reserved or unknown serials are skipped.
    pub fn reserve_inventory(
        &self,
        serials: &[&str],
        trade_id: &str,
        username: &str,
        criteria_id: Option<u64>,
    ) -> AllocationResult<u64> {
        let mut records = HashMap::new();
        for serial in serials {
            records.insert(*serial, utils::new_record_id("res")?);
        }

        let reserved = self.store.transaction(|tree| {
            let mut reserved = 0u64;
            for serial in serials {
                let Some(mut unit) = tx::get_unit(tree, serial)? else {
                    continue;
                };
                if unit.is_reserved {
                    continue;
                }
                unit.reserve(trade_id);
                tx::put_unit(tree, &unit)?;

                let record = ReservationRecord {
                    id: records[*serial].clone(),
                    serial: serial.to_string(),
                    trade_id: trade_id.to_string(),
                    criteria_id,
                    reserved_by: username.to_string(),
                    reserved_at: TimeStamp::new(),
                    status: ReservationStatus::Active,
                    released_by: None,
                    released_at: None,
                };
                tx::put_reservation(tree, &record)?;
                reserved += 1;
            }
            Ok(reserved)
        })?;

        let skipped = serials.len() as u64 - reserved;
        tracing::info!(trade_id, reserved, skipped, username, "reserved inventory");
        Ok(reserved)
    }

    pub fn release_reservation(&self, serials: &[&str], username: &str) -> AllocationResult<u64> {
        let reservations = self.active_reservations(serials)?;

        let released = self.store.transaction(|tree| {
            let mut released = 0u64;
            for serial in serials {
                let Some(mut unit) = tx::get_unit(tree, serial)? else {
                    continue;
                };
                if !unit.is_reserved {
                    continue;
                }
                unit.release();
                tx::put_unit(tree, &unit)?;
                for record in reservations.get(*serial).into_iter().flatten() {
                    let mut record = record.clone();
                    record.status = ReservationStatus::Released;
                    record.released_by = Some(username.to_string());
                    record.released_at = Some(TimeStamp::new());
                    tx::put_reservation(tree, &record)?;
                }
                released += 1;
            }
            Ok(released)
        })?;

        tracing::info!(released, username, "released reservations");
        Ok(released)
    }

    pub fn reservation_history(&self, serial: &str) -> AllocationResult<Vec<ReservationRecord>> {
        self.store.reservations_for(serial)
    }

    /// Reserved units ordered by serial, optionally only those held for `trade_id`.
    pub fn reserved_inventory(
        &self,
        trade_id: Option<&str>,
    ) -> AllocationResult<Vec<InventoryUnit>> {
        Ok(self
            .store
            .all_units()?
            .into_iter()
            .filter(|unit| unit.is_reserved)
            .filter(|unit| match trade_id {
                Some(trade_id) => unit.reserved_for_trade_id.as_deref() == Some(trade_id),
                None => true,
            })
            .collect())
    }

    pub fn inventory_by_trade(&self, trade_id: &str) -> AllocationResult<Vec<InventoryUnit>> {
        Ok(self
            .store
            .all_units()?
            .into_iter()
            .filter(|unit| unit.is_assigned && unit.trade_id.as_deref() == Some(trade_id))
            .collect())
    }

    /// Criteria records oldest first, optionally for one trade.
    pub fn list_criteria(&self, trade_id: Option<&str>) -> AllocationResult<Vec<Criteria>> {
        Ok(self
            .store
            .list_criteria()?
            .into_iter()
            .filter(|c| trade_id.is_none_or(|t| c.trade_id == t))
            .collect())
    }

    pub fn get_criteria(&self, id: u64) -> AllocationResult<Criteria> {
        self.store
            .get_criteria(id)?
            .ok_or_else(|| AllocationError::criteria_not_found(id))
    }

    /// Replaces quantity and filter of an active criteria-only record.
    pub fn update_single_criteria(
        &self,
        id: u64,
        quantity: u64,
        filter: CriteriaFilter,
    ) -> AllocationResult<()> {
        let mut criteria = self.active_criteria(id)?;
        let draft = CriteriaDraft::sell(&criteria.trade_id, quantity, filter, &criteria.created_by);
        draft.validate()?;

        criteria.quantity_required = draft.quantity;
        criteria.filter = draft.filter;
        criteria.updated_at = TimeStamp::new();
        self.store.save_criteria(&criteria)?;
        tracing::info!(criteria_id = id, quantity, "updated criteria");
        Ok(())
    }

    pub fn remove_single_criteria(&self, id: u64) -> AllocationResult<()> {
        self.active_criteria(id)?;
        self.store.delete_criteria(id)?;
        tracing::info!(criteria_id = id, "removed criteria");
        Ok(())
    }

    /// Deletes every criteria-only record of a trade. Returns how many went.
    pub fn remove_trade_criteria(&self, trade_id: &str) -> AllocationResult<usize> {
        let ids: Vec<u64> = self
            .store
            .list_criteria()?
            .into_iter()
            .filter(|c| c.trade_id == trade_id && c.status == CriteriaStatus::CriteriaOnly)
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return Err(AllocationError::trade_not_found(trade_id));
        }

        let mut removed = 0;
        for id in ids {
            if self.store.delete_criteria(id)? {
                removed += 1;
            }
        }
        tracing::info!(trade_id, removed, "removed criteria from trade");
        Ok(removed)
    }

    /// Active criteria grouped by trade, each group oldest first.
    pub fn trade_criteria_summary(&self) -> AllocationResult<BTreeMap<String, Vec<Criteria>>> {
        let mut summary: BTreeMap<String, Vec<Criteria>> = BTreeMap::new();
        for criteria in self.store.list_active_sell_criteria()? {
            summary
                .entry(criteria.trade_id.clone())
                .or_default()
                .push(criteria);
        }
        Ok(summary)
    }

    /// For each serial assigned through a criteria: the live criteria if it still
    /// exists, else the snapshot stored on the unit. Unreadable snapshots are dropped.
    pub fn inventory_criteria_info(
        &self,
        serials: &[&str],
    ) -> AllocationResult<BTreeMap<String, CriteriaInfo>> {
        let mut info = BTreeMap::new();
        for serial in serials {
            let Some(unit) = self.store.get_unit_by_serial(serial)? else {
                continue;
            };
            let Some(criteria_id) = unit.criteria_id else {
                continue;
            };
            let snapshot = match self.store.get_criteria(criteria_id)? {
                Some(live) => Some(live.snapshot()),
                None => unit.snapshot(),
            };
            if let Some(snapshot) = snapshot {
                info.insert(
                    serial.to_string(),
                    CriteriaInfo {
                        criteria_id,
                        snapshot,
                    },
                );
            }
        }
        Ok(info)
    }

    fn active_criteria(&self, id: u64) -> AllocationResult<Criteria> {
        match self.store.get_criteria(id)? {
            Some(criteria) if criteria.is_active() => Ok(criteria),
            _ => Err(AllocationError::criteria_not_found(id)),
        }
    }

    fn trade_criteria_ids(&self, trade_id: &str) -> AllocationResult<Vec<u64>> {
        Ok(self
            .store
            .list_active_sell_criteria()?
            .into_iter()
            .filter(|c| c.trade_id == trade_id)
            .map(|c| c.id)
            .collect())
    }

    fn active_reservations(
        &self,
        serials: &[&str],
    ) -> AllocationResult<HashMap<String, Vec<ReservationRecord>>> {
        let mut map = HashMap::new();
        for serial in serials {
            map.insert(serial.to_string(), self.store.active_reservations(serial)?);
        }
        Ok(map)
    }
}

/// Plans and applies a criteria decrement against the records read inside `tree`.
fn decrement_in_tx(
    tree: &TransactionalTree,
    trade_id: &str,
    criteria_id: Option<u64>,
    trade_criteria: &[u64],
    count: u64,
) -> tx::TxResult<Vec<QuantityChange>> {
    if count == 0 {
        return Ok(vec![]);
    }
    let changes = match criteria_id {
        Some(id) => match tx::get_criteria(tree, id)? {
            Some(criteria) if criteria.is_active() => {
                if criteria.trade_id != trade_id {
                    tracing::warn!(
                        criteria_id = id,
                        trade_id,
                        owner = %criteria.trade_id,
                        "decrementing criteria that belongs to another trade"
                    );
                }
                vec![adjust::plan_specific_decrement(&criteria, count)]
            }
            _ => {
                tracing::warn!(
                    criteria_id = id,
                    trade_id,
                    "criteria not found or not active; nothing to decrement"
                );
                vec![]
            }
        },
        None => {
            let mut current = Vec::with_capacity(trade_criteria.len());
            for id in trade_criteria {
                if let Some(criteria) = tx::get_criteria(tree, *id)? {
                    current.push(criteria);
                }
            }
            adjust::plan_trade_decrement(&current, trade_id, count)
        }
    };
    for change in &changes {
        tx::apply_change(tree, change)?;
    }
    Ok(changes)
}

/// Returns the id of the criteria that received the quantity, if any.
fn restore_in_tx(
    tree: &TransactionalTree,
    criteria_id: u64,
    count: u64,
    snapshot: Option<&CriteriaSnapshot>,
    username: &str,
    fresh_id: u64,
) -> tx::TxResult<Option<u64>> {
    let existing = tx::get_criteria(tree, criteria_id)?;
    match adjust::plan_restore(existing.as_ref(), count, snapshot, username) {
        Restoration::Increment {
            criteria_id,
            quantity,
        } => {
            tx::apply_change(
                tree,
                &QuantityChange::Set {
                    criteria_id,
                    quantity,
                },
            )?;
            Ok(Some(criteria_id))
        }
        Restoration::Recreate(draft) => {
            // goes to the back of the FIFO queue
            tx::put_criteria(tree, &draft.clone().into_criteria(fresh_id))?;
            Ok(Some(fresh_id))
        }
        Restoration::Skip => Ok(None),
    }
}

fn log_changes(trade_id: &str, changes: &[QuantityChange]) {
    for change in changes {
        match change {
            QuantityChange::Set {
                criteria_id,
                quantity,
            } => tracing::info!(trade_id, criteria_id, quantity, "reduced criteria quantity"),
            QuantityChange::Delete { criteria_id } => {
                tracing::info!(trade_id, criteria_id, "criteria fully consumed; deleted")
            }
        }
    }
}
