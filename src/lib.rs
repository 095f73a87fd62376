pub mod config;
pub mod domain;
pub mod outbound;
pub mod server;
pub mod telemetry;
pub mod trigger;
pub mod worker;
