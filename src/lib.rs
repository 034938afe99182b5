//! Feeder Library
//!
//! Multi-source price feeder oracle: aggregates venue prices into one USD
//! rate per asset and publishes commit-reveal votes to a ledger topic.

pub mod config;
pub mod history;
pub mod oracle;
pub mod publisher;
pub mod server;
pub mod telemetry;
pub mod types;
