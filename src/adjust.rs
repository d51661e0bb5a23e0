//! Criteria quantity bookkeeping when inventory is assigned or released.
//!
//! These functions only plan the changes; the store applies them in the same
//! transaction as the inventory mutation they accompany.
use super::criteria::{Criteria, CriteriaDraft, CriteriaSnapshot, active_fifo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantityChange {
    Set { criteria_id: u64, quantity: u64 },
    Delete { criteria_id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restoration {
    /// The criteria still exists; its quantity grows back to `quantity`.
    Increment { criteria_id: u64, quantity: u64 },
    /// The criteria is gone; a fresh record is created from the unit's snapshot.
    Recreate(CriteriaDraft),
    /// Nothing to restore against.
    Skip,
}

impl QuantityChange {
    pub fn criteria_id(&self) -> u64 {
        match self {
            QuantityChange::Set { criteria_id, .. } | QuantityChange::Delete { criteria_id } => {
                *criteria_id
            }
        }
    }
}

/// Reduce one criteria by `count`. Reaching zero deletes it.
pub fn plan_specific_decrement(criteria: &Criteria, count: u64) -> QuantityChange {
    let remaining = criteria.quantity_required.saturating_sub(count);
    if remaining == 0 {
        QuantityChange::Delete {
            criteria_id: criteria.id,
        }
    } else {
        QuantityChange::Set {
            criteria_id: criteria.id,
            quantity: remaining,
        }
    }
}

/// Consume `count` from a trade's criteria, oldest first, spilling into the next
/// one when the current criteria runs out.
///
/// Criteria of other trades or inactive records in `criteria` are ignored.
pub fn plan_trade_decrement(
    criteria: &[Criteria],
    trade_id: &str,
    count: u64,
) -> Vec<QuantityChange> {
    let mut outstanding = count;
    let mut changes = vec![];

    for crit in active_fifo(criteria) {
        if outstanding == 0 {
            break;
        }
        if crit.trade_id != trade_id || crit.quantity_required == 0 {
            continue;
        }
        let reduce_by = crit.quantity_required.min(outstanding);
        outstanding -= reduce_by;
        changes.push(plan_specific_decrement(crit, reduce_by));
    }
    changes
}

/// Decide how to give `count` units back to the criteria they were assigned through.
pub fn plan_restore(
    existing: Option<&Criteria>,
    count: u64,
    snapshot: Option<&CriteriaSnapshot>,
    username: &str,
) -> Restoration {
    if count == 0 {
        return Restoration::Skip;
    }
    match (existing, snapshot) {
        (Some(crit), _) => Restoration::Increment {
            criteria_id: crit.id,
            quantity: crit.quantity_required.saturating_add(count),
        },
        (None, Some(snapshot)) => {
            Restoration::Recreate(CriteriaDraft::from_snapshot(snapshot, count, username))
        }
        (None, None) => Restoration::Skip,
    }
}
