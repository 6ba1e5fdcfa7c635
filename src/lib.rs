//! airmon - CO2/humidity/temperature monitor host
//!
//! a sampler feeds sensor ticks into a bounded dispatch queue; a single
//! broadcast writer keeps the 24h telemetry ring and the readings log, and
//! pushes server-sent event frames to every connected dashboard.

pub mod config;
pub mod domain;
pub mod error;
pub mod export;
pub mod hal;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sampler;
pub mod server;
pub mod settings;
pub mod store;
pub mod writer;
