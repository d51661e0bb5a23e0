//! Serialized inventory units and their reservation/assignment state
use super::criteria::CriteriaSnapshot;
use super::trade::TimeStamp;
use chrono::Utc;
use minicbor::bytes::ByteVec;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq)]
pub struct InventoryUnit {
    #[n(0)]
    pub serial: String, // stable identity, also the store key
    #[n(1)]
    pub market: String,
    #[n(2)]
    pub registry: String,
    #[n(3)]
    pub product: String,
    #[n(4)]
    pub project_type: String,
    #[n(5)]
    pub protocol: String,
    #[n(6)]
    pub project_id: String,
    #[n(7)]
    pub project_name: String,
    #[n(8)]
    pub vintage: String,
    #[n(9)]
    pub is_assigned: bool,
    #[n(10)]
    pub trade_id: Option<String>,
    #[n(11)]
    pub is_reserved: bool,
    #[n(12)]
    pub reserved_for_trade_id: Option<String>,
    #[n(13)]
    pub criteria_id: Option<u64>, // weak back-reference, may dangle
    // kept as raw bytes so a snapshot that no longer decodes doesn't poison the unit
    #[n(14)]
    pub criteria_snapshot: Option<ByteVec>,
    #[n(15)]
    pub updated_at: Option<TimeStamp<Utc>>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReservationStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Released,
    /// The unit was assigned to the trade it was reserved for.
    #[n(2)]
    Delivered,
}

/// History entry written each time a unit is reserved.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Eq, PartialEq)]
pub struct ReservationRecord {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub serial: String,
    #[n(2)]
    pub trade_id: String,
    #[n(3)]
    pub criteria_id: Option<u64>,
    #[n(4)]
    pub reserved_by: String,
    #[n(5)]
    pub reserved_at: TimeStamp<Utc>,
    #[n(6)]
    pub status: ReservationStatus,
    #[n(7)]
    pub released_by: Option<String>,
    #[n(8)]
    pub released_at: Option<TimeStamp<Utc>>,
}

impl InventoryUnit {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            ..Self::default()
        }
    }
    pub fn set_market(mut self, market: &str) -> Self {
        self.market = market.to_string();
        self
    }
    pub fn set_registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }
    pub fn set_product(mut self, product: &str) -> Self {
        self.product = product.to_string();
        self
    }
    pub fn set_project_type(mut self, project_type: &str) -> Self {
        self.project_type = project_type.to_string();
        self
    }
    pub fn set_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }
    pub fn set_project_id(mut self, project_id: &str) -> Self {
        self.project_id = project_id.to_string();
        self
    }
    pub fn set_project_name(mut self, project_name: &str) -> Self {
        self.project_name = project_name.to_string();
        self
    }
    pub fn set_vintage(mut self, vintage: &str) -> Self {
        self.vintage = vintage.to_string();
        self
    }

    /// Neither reserved nor assigned, so it can be claimed by criteria.
    pub fn is_free(&self) -> bool {
        !self.is_assigned && !self.is_reserved
    }

    /// Descriptive value of a filterable attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        let value = match name {
            "market" => &self.market,
            "registry" => &self.registry,
            "product" => &self.product,
            "project_type" => &self.project_type,
            "protocol" => &self.protocol,
            "project_id" => &self.project_id,
            "vintage" => &self.vintage,
            _ => return None,
        };
        Some(value.as_str())
    }

    pub fn assign(&mut self, trade_id: &str, criteria_id: Option<u64>, snapshot: Option<Vec<u8>>) {
        self.is_assigned = true;
        self.trade_id = Some(trade_id.to_string());
        self.criteria_id = criteria_id;
        self.criteria_snapshot = snapshot.map(ByteVec::from);
        self.updated_at = Some(TimeStamp::new());
    }
    pub fn unassign(&mut self) {
        self.is_assigned = false;
        self.trade_id = None;
        self.criteria_id = None;
        self.criteria_snapshot = None;
        self.updated_at = Some(TimeStamp::new());
    }
    pub fn reserve(&mut self, trade_id: &str) {
        self.is_reserved = true;
        self.reserved_for_trade_id = Some(trade_id.to_string());
        self.updated_at = Some(TimeStamp::new());
    }
    pub fn release(&mut self) {
        self.is_reserved = false;
        self.reserved_for_trade_id = None;
        self.updated_at = Some(TimeStamp::new());
    }

    /// The snapshot stored at assignment time, if present and still readable.
    pub fn snapshot(&self) -> Option<CriteriaSnapshot> {
        self.criteria_snapshot
            .as_ref()
            .and_then(|raw| CriteriaSnapshot::decode_lossy(raw))
    }
}

/// Store ordering for inventory listings.
pub fn sort_units(units: &mut [InventoryUnit]) {
    units.sort_by(|a, b| (&a.vintage, &a.serial).cmp(&(&b.vintage, &b.serial)));
}
