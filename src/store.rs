//! Persistence for inventory units and criteria records.
//!
//! Everything lives in one sled tree, keyed by prefix, so that an inventory
//! mutation and the criteria adjustment that goes with it can share a
//! transaction.
use super::config::StoreConfig;
use super::criteria::{Criteria, CriteriaDraft, CriteriaFilter, active_fifo};
use super::error::{AllocationError, AllocationResult};
use super::inventory::{InventoryUnit, ReservationRecord, ReservationStatus, sort_units};
use super::matcher::matches;
use std::sync::Arc;

const UNIT_PREFIX: &[u8] = b"inv/";
const CRITERIA_PREFIX: &[u8] = b"crit/";
const RESERVATION_PREFIX: &[u8] = b"res/";

pub fn unit_key(serial: &str) -> Vec<u8> {
    [UNIT_PREFIX, serial.as_bytes()].concat()
}

// big endian so key order is id order
pub fn criteria_key(id: u64) -> Vec<u8> {
    [CRITERIA_PREFIX, &id.to_be_bytes()[..]].concat()
}

pub fn reservation_key(serial: &str, record_id: &str) -> Vec<u8> {
    [RESERVATION_PREFIX, serial.as_bytes(), &b"/"[..], record_id.as_bytes()].concat()
}

fn encode_record<T: minicbor::Encode<()>>(record: &T) -> AllocationResult<Vec<u8>> {
    Ok(minicbor::to_vec(record)?)
}

fn decode_record<T>(raw: &[u8]) -> AllocationResult<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(raw)?)
}

/// Read and flag-mutation access to serialized inventory.
pub trait InventoryStore {
    fn all_units(&self) -> AllocationResult<Vec<InventoryUnit>>;
    fn get_unit_by_serial(&self, serial: &str) -> AllocationResult<Option<InventoryUnit>>;
    fn put_unit(&self, unit: &InventoryUnit) -> AllocationResult<()>;

    /// Units matching `filter`, ordered by vintage then serial.
    fn find_units(
        &self,
        filter: &CriteriaFilter,
        exclude_reserved: bool,
        exclude_assigned: bool,
    ) -> AllocationResult<Vec<InventoryUnit>> {
        let mut units: Vec<InventoryUnit> = self
            .all_units()?
            .into_iter()
            .filter(|unit| !(exclude_reserved && unit.is_reserved))
            .filter(|unit| !(exclude_assigned && unit.is_assigned))
            .filter(|unit| matches(unit, filter))
            .collect();
        sort_units(&mut units);
        Ok(units)
    }
}

/// Storage of criteria records. Ids are unique and increase with creation.
pub trait CriteriaRegistry {
    /// Every record, oldest first.
    fn list_criteria(&self) -> AllocationResult<Vec<Criteria>>;
    fn get_criteria(&self, id: u64) -> AllocationResult<Option<Criteria>>;
    fn create_criteria(&self, draft: CriteriaDraft) -> AllocationResult<u64>;
    fn save_criteria(&self, criteria: &Criteria) -> AllocationResult<()>;
    /// Returns whether a record was removed.
    fn delete_criteria(&self, id: u64) -> AllocationResult<bool>;

    /// Sell-side criteria-only records in FIFO priority order.
    fn list_active_sell_criteria(&self) -> AllocationResult<Vec<Criteria>> {
        let all = self.list_criteria()?;
        Ok(active_fifo(&all).into_iter().cloned().collect())
    }

    /// Sets the required quantity; zero deletes the record.
    fn update_quantity(&self, id: u64, quantity: u64) -> AllocationResult<()> {
        if quantity == 0 {
            return match self.delete_criteria(id)? {
                true => Ok(()),
                false => Err(AllocationError::criteria_not_found(id)),
            };
        }
        let mut criteria = self
            .get_criteria(id)?
            .ok_or_else(|| AllocationError::criteria_not_found(id))?;
        criteria.quantity_required = quantity;
        criteria.updated_at = crate::trade::TimeStamp::new();
        self.save_criteria(&criteria)
    }
}

pub struct SledStore {
    instance: Arc<sled::Db>,
    flush_on_write: bool,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self {
            instance,
            flush_on_write: false,
        }
    }

    pub fn open(config: &StoreConfig) -> AllocationResult<Self> {
        let db = sled::open(&config.path)?;
        tracing::info!(path = %config.path.display(), "opened allocation store");
        Ok(Self {
            instance: Arc::new(db),
            flush_on_write: config.flush_on_write,
        })
    }

    pub fn generate_id(&self) -> AllocationResult<u64> {
        Ok(self.instance.generate_id()?)
    }

    /// Runs `f` as one serializable sled transaction over every record kind.
    pub fn transaction<A, F>(&self, f: F) -> AllocationResult<A>
    where
        F: Fn(&sled::transaction::TransactionalTree) -> tx::TxResult<A>,
    {
        let result = self.instance.transaction(f)?;
        self.committed()?;
        Ok(result)
    }

    pub fn reservations_for(&self, serial: &str) -> AllocationResult<Vec<ReservationRecord>> {
        let prefix = [RESERVATION_PREFIX, serial.as_bytes(), &b"/"[..]].concat();
        self.scan(&prefix)
    }

    pub fn active_reservations(&self, serial: &str) -> AllocationResult<Vec<ReservationRecord>> {
        Ok(self
            .reservations_for(serial)?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::Active)
            .collect())
    }

    fn scan<T>(&self, prefix: &[u8]) -> AllocationResult<Vec<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        self.instance
            .scan_prefix(prefix)
            .map(|entry| {
                let (_, raw) = entry?;
                decode_record(&raw)
            })
            .collect()
    }

    fn committed(&self) -> AllocationResult<()> {
        if self.flush_on_write {
            self.instance.flush()?;
        }
        Ok(())
    }
}

impl InventoryStore for SledStore {
    fn all_units(&self) -> AllocationResult<Vec<InventoryUnit>> {
        self.scan(UNIT_PREFIX)
    }
    fn get_unit_by_serial(&self, serial: &str) -> AllocationResult<Option<InventoryUnit>> {
        self.instance
            .get(unit_key(serial))?
            .map(|raw| decode_record(&raw))
            .transpose()
    }
    fn put_unit(&self, unit: &InventoryUnit) -> AllocationResult<()> {
        self.instance
            .insert(unit_key(&unit.serial), encode_record(unit)?)?;
        self.committed()
    }
}

impl CriteriaRegistry for SledStore {
    fn list_criteria(&self) -> AllocationResult<Vec<Criteria>> {
        let mut all: Vec<Criteria> = self.scan(CRITERIA_PREFIX)?;
        all.sort_by(|a, b| a.priority().cmp(&b.priority()));
        Ok(all)
    }
    fn get_criteria(&self, id: u64) -> AllocationResult<Option<Criteria>> {
        self.instance
            .get(criteria_key(id))?
            .map(|raw| decode_record(&raw))
            .transpose()
    }
    fn create_criteria(&self, draft: CriteriaDraft) -> AllocationResult<u64> {
        let id = self.generate_id()?;
        let criteria = draft.into_criteria(id);
        self.save_criteria(&criteria)?;
        Ok(id)
    }
    fn save_criteria(&self, criteria: &Criteria) -> AllocationResult<()> {
        self.instance
            .insert(criteria_key(criteria.id), encode_record(criteria)?)?;
        self.committed()
    }
    fn delete_criteria(&self, id: u64) -> AllocationResult<bool> {
        let removed = self.instance.remove(criteria_key(id))?.is_some();
        self.committed()?;
        Ok(removed)
    }
}

/// Typed record access inside a sled transaction.
pub mod tx {
    use super::*;
    use crate::adjust::QuantityChange;
    use crate::trade::TimeStamp;
    use sled::transaction::{
        ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
    };

    pub type TxResult<T> = ConflictableTransactionResult<T, AllocationError>;

    pub fn abort<T>(err: AllocationError) -> TxResult<T> {
        Err(ConflictableTransactionError::Abort(err))
    }

    fn decode_in_tx<T>(raw: Option<sled::IVec>) -> TxResult<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match raw {
            Some(raw) => decode_record(&raw)
                .map(Some)
                .map_err(ConflictableTransactionError::Abort),
            None => Ok(None),
        }
    }

    pub fn encode_in_tx<T: minicbor::Encode<()>>(record: &T) -> TxResult<Vec<u8>> {
        encode_record(record).map_err(ConflictableTransactionError::Abort)
    }

    pub fn get_unit(tx: &TransactionalTree, serial: &str) -> TxResult<Option<InventoryUnit>> {
        decode_in_tx(tx.get(unit_key(serial))?)
    }

    pub fn put_unit(tx: &TransactionalTree, unit: &InventoryUnit) -> TxResult<()> {
        tx.insert(unit_key(&unit.serial), encode_in_tx(unit)?)?;
        Ok(())
    }

    pub fn get_criteria(tx: &TransactionalTree, id: u64) -> TxResult<Option<Criteria>> {
        decode_in_tx(tx.get(criteria_key(id))?)
    }

    pub fn put_criteria(tx: &TransactionalTree, criteria: &Criteria) -> TxResult<()> {
        tx.insert(criteria_key(criteria.id), encode_in_tx(criteria)?)?;
        Ok(())
    }

    pub fn put_reservation(tx: &TransactionalTree, record: &ReservationRecord) -> TxResult<()> {
        tx.insert(
            reservation_key(&record.serial, &record.id),
            encode_in_tx(record)?,
        )?;
        Ok(())
    }

    /// Applies a planned quantity change; a record deleted meanwhile is left alone.
    pub fn apply_change(tx: &TransactionalTree, change: &QuantityChange) -> TxResult<()> {
        match change {
            QuantityChange::Delete { criteria_id } => {
                tx.remove(criteria_key(*criteria_id))?;
            }
            QuantityChange::Set {
                criteria_id,
                quantity,
            } => {
                if let Some(mut criteria) = get_criteria(tx, *criteria_id)? {
                    criteria.quantity_required = *quantity;
                    criteria.updated_at = TimeStamp::new();
                    put_criteria(tx, &criteria)?;
                }
            }
        }
        Ok(())
    }
}
