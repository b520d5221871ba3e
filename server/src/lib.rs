//! INDI server management
//!
//! Discovers installed INDI drivers and supervises an `indiserver`
//! process, starting and stopping drivers through its control FIFO.
//!
//! ## Features
//!
//! - Driver catalog from XML descriptor files, plus custom and remote drivers
//! - Per-driver lifecycle rules (delays and scripts around start and stop)
//! - Process-group supervision with captured server output
//! - Process table detection of servers started elsewhere
//! - Ordered profile launch planning

pub mod config;
pub mod driver;
pub mod error;
pub mod fifo;
pub mod launch;
pub mod procscan;
pub mod runner;
mod supervisor;

pub use config::ServerConfig;
pub use driver::{CustomDriver, DriverDescriptor, DriverRegistry, LifecycleRule};
pub use error::{ServerError, ServerResult};
pub use fifo::{CommandSink, FifoChannel};
pub use launch::{parse_rules, plan_profile_launch};
pub use procscan::{ProcFsTable, ProcessTable};
pub use runner::ProcessRunner;
pub use supervisor::{IndiServer, ServerState};
