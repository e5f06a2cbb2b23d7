pub mod config;
pub mod connection;
pub mod device;
pub mod energy;
pub mod error;
pub mod link;
pub mod mqtt;
pub mod power;
pub mod reading;
pub mod sensor;
pub mod time_sync;

// Re-export commonly used items
pub use config::Config;
pub use connection::{ConnectOutcome, ConnectionManager, ConnectionState};
pub use device::{CycleReport, Device};
pub use error::{AppError, Result};
pub use reading::{Reading, TelemetryMessage};
