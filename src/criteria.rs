//! Criteria records: a trade's claim on inventory by description rather than by serial.
use super::error::{AllocationError, AllocationResult};
use super::trade::{Direction, TimeStamp};
use chrono::{DateTime, Utc};

/// Attribute filter shared by criteria records and inventory searches.
///
/// Every field is optional. An unset (or empty) field places no constraint on
/// the unit being matched. Vintage bounds are compared as strings.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct CriteriaFilter {
    #[n(0)]
    pub market: Option<String>,
    #[n(1)]
    pub registry: Option<String>,
    #[n(2)]
    pub product: Option<String>,
    #[n(3)]
    pub project_type: Option<String>,
    #[n(4)]
    pub protocol: Option<String>,
    #[n(5)]
    pub project_id: Option<String>,
    #[n(6)]
    pub vintage_from: Option<String>,
    #[n(7)]
    pub vintage_to: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum CriteriaStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    CriteriaOnly,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct Criteria {
    #[n(0)]
    pub id: u64,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub direction: Direction,
    #[n(3)]
    pub quantity_required: u64,
    #[n(4)]
    pub filter: CriteriaFilter,
    #[n(5)]
    pub status: CriteriaStatus,
    #[n(6)]
    pub created_by: String,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub updated_at: TimeStamp<Utc>,
}

/// Fields needed to insert a new criteria record. The registry assigns the id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CriteriaDraft {
    pub trade_id: String,
    pub direction: Direction,
    pub quantity: u64,
    pub filter: CriteriaFilter,
    pub created_by: String,
}

/// Frozen copy of a criteria's trade and filter, stored on an inventory unit
/// when it is assigned through that criteria.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct CriteriaSnapshot {
    #[n(0)]
    pub trade_id: String,
    #[n(1)]
    pub direction: Direction,
    #[n(2)]
    pub filter: CriteriaFilter,
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

impl CriteriaFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_market(mut self, market: &str) -> Self {
        self.market = Some(market.to_string());
        self
    }
    pub fn set_registry(mut self, registry: &str) -> Self {
        self.registry = Some(registry.to_string());
        self
    }
    pub fn set_product(mut self, product: &str) -> Self {
        self.product = Some(product.to_string());
        self
    }
    pub fn set_project_type(mut self, project_type: &str) -> Self {
        self.project_type = Some(project_type.to_string());
        self
    }
    pub fn set_protocol(mut self, protocol: &str) -> Self {
        self.protocol = Some(protocol.to_string());
        self
    }
    pub fn set_project_id(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }
    pub fn set_vintage_from(mut self, vintage: &str) -> Self {
        self.vintage_from = Some(vintage.to_string());
        self
    }
    pub fn set_vintage_to(mut self, vintage: &str) -> Self {
        self.vintage_to = Some(vintage.to_string());
        self
    }
    pub fn set_vintage_range(self, from: &str, to: &str) -> Self {
        self.set_vintage_from(from).set_vintage_to(to)
    }

    /// Exact-match attribute pairs as `(field name, wanted value)`, skipping unset fields.
    pub fn exact_fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("market", non_empty(&self.market)),
            ("registry", non_empty(&self.registry)),
            ("product", non_empty(&self.product)),
            ("project_type", non_empty(&self.project_type)),
            ("protocol", non_empty(&self.protocol)),
            ("project_id", non_empty(&self.project_id)),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
    pub fn vintage_from(&self) -> Option<&str> {
        non_empty(&self.vintage_from)
    }
    pub fn vintage_to(&self) -> Option<&str> {
        non_empty(&self.vintage_to)
    }

    /// Rejects vintage bounds that are not year-like digit strings, or a reversed range.
    pub fn validate(&self) -> AllocationResult<()> {
        for (name, bound) in [
            ("vintage_from", &self.vintage_from),
            ("vintage_to", &self.vintage_to),
        ] {
            if let Some(value) = bound {
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(AllocationError::InvalidFilter(format!(
                        "{name} is set but empty"
                    )));
                }
                if trimmed != value {
                    return Err(AllocationError::InvalidFilter(format!(
                        "{name} has surrounding whitespace: {value:?}"
                    )));
                }
                if !trimmed.chars().all(|c| c.is_ascii_digit()) {
                    return Err(AllocationError::InvalidFilter(format!(
                        "{name} must be numeric, got {value:?}"
                    )));
                }
            }
        }
        if let (Some(from), Some(to)) = (self.vintage_from(), self.vintage_to()) {
            if from > to {
                return Err(AllocationError::InvalidFilter(format!(
                    "vintage_from {from} is after vintage_to {to}"
                )));
            }
        }
        Ok(())
    }
}

impl Criteria {
    /// Only sell-side criteria-only records take part in allocation.
    pub fn is_active(&self) -> bool {
        self.status == CriteriaStatus::CriteriaOnly && self.direction == Direction::Sell
    }
    pub fn snapshot(&self) -> CriteriaSnapshot {
        CriteriaSnapshot {
            trade_id: self.trade_id.clone(),
            direction: self.direction,
            filter: self.filter.clone(),
        }
    }
    /// Ordering key for first-come-first-served priority.
    pub fn priority(&self) -> (DateTime<Utc>, u64) {
        (self.created_at.to_datetime_utc(), self.id)
    }
}

impl CriteriaDraft {
    pub fn sell(trade_id: &str, quantity: u64, filter: CriteriaFilter, created_by: &str) -> Self {
        Self {
            trade_id: trade_id.to_string(),
            direction: Direction::Sell,
            quantity,
            filter,
            created_by: created_by.to_string(),
        }
    }
    pub fn from_snapshot(snapshot: &CriteriaSnapshot, quantity: u64, created_by: &str) -> Self {
        Self {
            trade_id: snapshot.trade_id.clone(),
            direction: snapshot.direction,
            quantity,
            filter: snapshot.filter.clone(),
            created_by: created_by.to_string(),
        }
    }
    pub fn validate(&self) -> AllocationResult<()> {
        if self.quantity == 0 {
            return Err(AllocationError::InvalidFilter(
                "quantity must be greater than zero".into(),
            ));
        }
        if self.trade_id.trim().is_empty() {
            return Err(AllocationError::InvalidFilter("trade id is empty".into()));
        }
        self.filter.validate()
    }
    pub fn into_criteria(self, id: u64) -> Criteria {
        let now = TimeStamp::new();
        Criteria {
            id,
            trade_id: self.trade_id,
            direction: self.direction,
            quantity_required: self.quantity,
            filter: self.filter,
            status: CriteriaStatus::CriteriaOnly,
            created_by: self.created_by,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

impl CriteriaSnapshot {
    pub fn encode(&self) -> AllocationResult<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }
    /// A snapshot that no longer decodes is reported as absent.
    pub fn decode_lossy(raw: &[u8]) -> Option<Self> {
        match minicbor::decode(raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(error = %err, "discarding criteria snapshot that failed to decode");
                None
            }
        }
    }
}

/// Active criteria in first-come-first-served order: creation time, then id.
pub fn active_fifo(criteria: &[Criteria]) -> Vec<&Criteria> {
    let mut active: Vec<&Criteria> = criteria.iter().filter(|c| c.is_active()).collect();
    active.sort_by(|a, b| a.priority().cmp(&b.priority()));
    active
}
