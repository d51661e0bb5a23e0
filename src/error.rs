use sled::transaction::TransactionError;

#[derive(thiserror::Error, Debug)]
pub enum AllocationError {
    #[error("{kind} {id} was not found")]
    NotFound { kind: &'static str, id: String },
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Inventory {serial} is already taken: {reason}")]
    Conflict { serial: String, reason: String },
    #[error("Store is unavailable: {0}")]
    StoreUnavailable(#[from] sled::Error),
    #[error("Failed to encode record: {0}")]
    Encoding(String),
    #[error("Failed to decode record: {0}")]
    Decoding(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type AllocationResult<T> = Result<T, AllocationError>;

impl AllocationError {
    pub fn criteria_not_found(id: u64) -> Self {
        AllocationError::NotFound {
            kind: "Criteria",
            id: id.to_string(),
        }
    }
    pub fn trade_not_found(trade_id: &str) -> Self {
        AllocationError::NotFound {
            kind: "Trade",
            id: trade_id.to_string(),
        }
    }
}

impl From<TransactionError<AllocationError>> for AllocationError {
    fn from(value: TransactionError<AllocationError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => AllocationError::StoreUnavailable(err),
        }
    }
}

impl From<minicbor::decode::Error> for AllocationError {
    fn from(value: minicbor::decode::Error) -> Self {
        AllocationError::Decoding(value.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for AllocationError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        AllocationError::Encoding(value.to_string())
    }
}
