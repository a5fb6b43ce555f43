pub mod config;
pub mod revocation;
pub mod server;
pub mod setup;
pub mod telemetry;
