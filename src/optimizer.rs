//! Global allocation of free inventory across every active criteria.
//!
//! The report is derived state: it is recomputed from the current inventory and
//! criteria on every call and never written back to the store.
use super::criteria::{Criteria, CriteriaFilter, active_fifo};
use super::inventory::InventoryUnit;
use super::matcher::matches;
use std::collections::{BTreeMap, HashSet};

/// Ordered from best to worst, so a trade's status is the `max` of its criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocationState {
    Sufficient,
    Insufficient,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaAllocation {
    pub trade_id: String,
    pub status: AllocationState,
    pub available: u64, // matching units, ignoring competing criteria
    pub required: u64,
    pub shortfall: u64,
    pub allocated: u64, // units granted by the FIFO pass
    pub filter: CriteriaFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeAllocation {
    pub status: AllocationState,
    pub available: u64,
    pub required: u64,
    pub shortfall: u64,
    pub criteria_ids: Vec<u64>,
    pub conflicts_with: Vec<String>,
}

/// Two criteria whose shared inventory cannot cover both requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairConflict {
    pub trade1: String,
    pub trade2: String,
    pub criteria1: u64,
    pub criteria2: u64,
    pub overlap_count: u64,
    pub combined_need: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReport {
    pub trade_status: BTreeMap<String, TradeAllocation>,
    pub criteria_status: BTreeMap<u64, CriteriaAllocation>,
    pub total_available: u64,
    pub total_required: u64,
    pub conflicts: Vec<PairConflict>,
    /// False as soon as any criteria ends the FIFO pass in conflict.
    /// Pairwise conflicts never affect it.
    pub allocation_possible: bool,
    pub allocated_serials: Vec<String>,
}

impl TradeAllocation {
    fn empty() -> Self {
        Self {
            status: AllocationState::Sufficient,
            available: 0,
            required: 0,
            shortfall: 0,
            criteria_ids: vec![],
            conflicts_with: vec![],
        }
    }
    fn add_conflict(&mut self, trade_id: &str) {
        if !self.conflicts_with.iter().any(|t| t == trade_id) {
            self.conflicts_with.push(trade_id.to_string());
        }
    }
}

/// Computes per-criteria and per-trade allocation status.
///
/// `inventory` is the unit pool in store order; only free units take part.
/// Criteria are processed oldest first, and an older criteria is always fully
/// served before a newer one receives any contested unit.
pub fn allocation_status(inventory: &[InventoryUnit], criteria: &[Criteria]) -> AllocationReport {
    let free: Vec<&InventoryUnit> = inventory.iter().filter(|u| u.is_free()).collect();
    let ordered = active_fifo(criteria);

    if ordered.is_empty() {
        return AllocationReport {
            trade_status: BTreeMap::new(),
            criteria_status: BTreeMap::new(),
            total_available: free.len() as u64,
            total_required: 0,
            conflicts: vec![],
            allocation_possible: true,
            allocated_serials: vec![],
        };
    }

    // position in `ordered` -> indices into `free` that satisfy the filter
    let candidates: Vec<Vec<usize>> = ordered
        .iter()
        .map(|crit| {
            free.iter()
                .enumerate()
                .filter(|(_, unit)| matches(unit, &crit.filter))
                .map(|(idx, _)| idx)
                .collect()
        })
        .collect();

    let mut criteria_status = BTreeMap::new();
    let mut trade_status: BTreeMap<String, TradeAllocation> = BTreeMap::new();

    // independent availability, ignoring competition
    for (crit, matched) in ordered.iter().zip(&candidates) {
        let available = matched.len() as u64;
        let required = crit.quantity_required;
        let shortfall = required.saturating_sub(available);
        let status = if available >= required {
            AllocationState::Sufficient
        } else {
            AllocationState::Insufficient
        };

        criteria_status.insert(
            crit.id,
            CriteriaAllocation {
                trade_id: crit.trade_id.clone(),
                status,
                available,
                required,
                shortfall,
                allocated: 0,
                filter: crit.filter.clone(),
            },
        );

        let trade = trade_status
            .entry(crit.trade_id.clone())
            .or_insert_with(TradeAllocation::empty);
        trade.available += available;
        trade.required += required;
        trade.shortfall += shortfall;
        trade.criteria_ids.push(crit.id);
        trade.status = trade.status.max(status);
    }

    // FIFO simulation decides the actual outcome
    let mut taken = vec![false; free.len()];
    let mut allocated_serials = Vec::new();
    let mut allocation_possible = true;

    for (crit, matched) in ordered.iter().zip(&candidates) {
        let open: Vec<usize> = matched.iter().copied().filter(|idx| !taken[*idx]).collect();
        let required = crit.quantity_required as usize;
        let grant = open.len().min(required);

        for idx in &open[..grant] {
            taken[*idx] = true;
            allocated_serials.push(free[*idx].serial.clone());
        }

        let Some(entry) = criteria_status.get_mut(&crit.id) else {
            continue;
        };
        entry.allocated = grant as u64;

        if open.len() < required {
            allocation_possible = false;
            entry.status = AllocationState::Conflict;
            entry.shortfall = (required - open.len()) as u64;
            if let Some(trade) = trade_status.get_mut(&crit.trade_id) {
                trade.status = AllocationState::Conflict;
            }
            tracing::debug!(
                criteria_id = crit.id,
                trade_id = %crit.trade_id,
                required,
                granted = grant,
                "criteria cannot be filled after older claims"
            );
        }
    }

    let conflicts = pairwise_conflicts(&ordered, &candidates, &mut trade_status);
    let total_required = ordered.iter().map(|c| c.quantity_required).sum();

    AllocationReport {
        trade_status,
        criteria_status,
        total_available: free.len() as u64,
        total_required,
        conflicts,
        allocation_possible,
        allocated_serials,
    }
}

/// Flags every pair of criteria sharing inventory that cannot cover both.
///
/// Purely diagnostic: it may flag pairs the FIFO pass resolves cleanly.
fn pairwise_conflicts(
    ordered: &[&Criteria],
    candidates: &[Vec<usize>],
    trade_status: &mut BTreeMap<String, TradeAllocation>,
) -> Vec<PairConflict> {
    let sets: Vec<HashSet<usize>> = candidates
        .iter()
        .map(|m| m.iter().copied().collect())
        .collect();
    let mut conflicts = vec![];

    for i in 0..ordered.len() {
        for j in (i + 1)..ordered.len() {
            let overlap = sets[i].intersection(&sets[j]).count() as u64;
            if overlap == 0 {
                continue;
            }
            let (a, b) = (ordered[i], ordered[j]);
            let combined_need = a.quantity_required + b.quantity_required;
            if combined_need <= overlap {
                continue;
            }

            conflicts.push(PairConflict {
                trade1: a.trade_id.clone(),
                trade2: b.trade_id.clone(),
                criteria1: a.id,
                criteria2: b.id,
                overlap_count: overlap,
                combined_need,
            });
            if let Some(trade) = trade_status.get_mut(&a.trade_id) {
                trade.add_conflict(&b.trade_id);
            }
            if let Some(trade) = trade_status.get_mut(&b.trade_id) {
                trade.add_conflict(&a.trade_id);
            }
        }
    }
    conflicts
}
