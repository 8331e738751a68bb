pub mod aggregate;
pub mod blob_store;
pub mod config;
pub mod csv_export;
pub mod error;
pub mod extract;
pub mod fleet;
pub mod monitor;
pub mod multiplexer;
pub mod operator;
pub mod queue;
pub mod retry;
pub mod stat_writer;
pub mod supervisor;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

#[cfg(feature = "distributed")]
pub mod aws;

pub use error::*;
