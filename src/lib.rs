pub mod adjust;
pub mod config;
pub mod criteria;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod matcher;
pub mod optimizer;
pub mod service;
pub mod simulator;
pub mod store;
pub mod trade;
pub mod utils;
