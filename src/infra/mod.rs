//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod output;
pub mod store;
pub mod telemetry;
pub mod watch;
