//! Flux daemon: HTTP surface for the stored-procedure engine.

pub mod auth;
pub mod server;
pub mod telemetry;
