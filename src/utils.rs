//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique, time-ordered record id then encode using bech32
pub fn new_record_id(hrp: &str) -> Result<String, crate::error::AllocationError> {
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|err| crate::error::AllocationError::Encoding(err.to_string()))?;
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|err| crate::error::AllocationError::Encoding(err.to_string()))
}
