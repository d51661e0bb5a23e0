//! Predicate deciding whether one inventory unit satisfies one criteria filter.
use super::criteria::CriteriaFilter;
use super::inventory::InventoryUnit;

/// Exact string equality on every set attribute, plus a lexical vintage range.
///
/// A unit with an empty vintage skips the range check entirely, so it matches
/// any range. Vintages compare as strings: `"9" >= "10"`.
pub fn matches(unit: &InventoryUnit, filter: &CriteriaFilter) -> bool {
    let attributes_match = filter
        .exact_fields()
        .all(|(name, wanted)| unit.attribute(name) == Some(wanted));
    if !attributes_match {
        return false;
    }

    let vintage = unit.vintage.as_str();
    if vintage.is_empty() {
        return true;
    }
    if let Some(from) = filter.vintage_from() {
        if vintage < from {
            return false;
        }
    }
    if let Some(to) = filter.vintage_to() {
        if vintage > to {
            return false;
        }
    }
    true
}
