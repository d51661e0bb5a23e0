//! Single-filter view of how much free inventory existing criteria already claim.
use super::criteria::{Criteria, CriteriaFilter, active_fifo};
use super::inventory::InventoryUnit;
use super::matcher::matches;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Claimed,
    Available,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaClaim {
    pub criteria_id: u64,
    pub trade_id: String,
    pub quantity_claimed: u64,
    pub filter: CriteriaFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitClaim {
    pub serial: String,
    pub registry: String,
    pub product: String,
    pub project_id: String,
    pub vintage: String,
    pub status: ClaimState,
    pub claimed_by_trade: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSummary {
    pub total_matching: u64,
    pub claimed_by_criteria: u64,
    pub available: u64,
    pub criteria_claims: Vec<CriteriaClaim>,
    pub inventory_items: Vec<UnitClaim>,
}

/// Replays every active criteria, oldest first, against the free units matching
/// `search` and reports what is left for a new claim.
///
/// `pool` may be pre-filtered by the store; reserved or assigned units and
/// units failing `search` are dropped here regardless. Each criteria takes the
/// first unclaimed units it matches, in pool order.
pub fn claims_for(
    pool: &[InventoryUnit],
    criteria: &[Criteria],
    search: &CriteriaFilter,
) -> ClaimSummary {
    let matching: Vec<&InventoryUnit> = pool
        .iter()
        .filter(|unit| unit.is_free() && matches(unit, search))
        .collect();
    let total_matching = matching.len() as u64;

    if matching.is_empty() {
        return ClaimSummary::default();
    }

    // index into `matching` -> trade that claimed it
    let mut claimed: HashMap<usize, &str> = HashMap::new();
    let mut criteria_claims = Vec::new();

    for crit in active_fifo(criteria) {
        let candidates = matching
            .iter()
            .enumerate()
            .filter(|(idx, unit)| !claimed.contains_key(idx) && matches(unit, &crit.filter))
            .map(|(idx, _)| idx)
            .take(crit.quantity_required as usize)
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            continue;
        }
        for idx in &candidates {
            claimed.insert(*idx, crit.trade_id.as_str());
        }
        tracing::debug!(
            criteria_id = crit.id,
            trade_id = %crit.trade_id,
            claimed = candidates.len(),
            "criteria claims matching inventory"
        );
        criteria_claims.push(CriteriaClaim {
            criteria_id: crit.id,
            trade_id: crit.trade_id.clone(),
            quantity_claimed: candidates.len() as u64,
            filter: crit.filter.clone(),
        });
    }

    let claimed_by_criteria = claimed.len() as u64;
    let inventory_items = matching
        .iter()
        .enumerate()
        .map(|(idx, unit)| {
            let claimed_by = claimed.get(&idx).map(|trade| trade.to_string());
            UnitClaim {
                serial: unit.serial.clone(),
                registry: unit.registry.clone(),
                product: unit.product.clone(),
                project_id: unit.project_id.clone(),
                vintage: unit.vintage.clone(),
                status: if claimed_by.is_some() {
                    ClaimState::Claimed
                } else {
                    ClaimState::Available
                },
                claimed_by_trade: claimed_by,
            }
        })
        .collect();

    ClaimSummary {
        total_matching,
        claimed_by_criteria,
        available: total_matching - claimed_by_criteria,
        criteria_claims,
        inventory_items,
    }
}
