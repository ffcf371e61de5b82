pub mod config;
pub mod engine;
pub mod exchange;
pub mod ledger;
pub mod metrics;
pub mod models;
pub mod signal;
