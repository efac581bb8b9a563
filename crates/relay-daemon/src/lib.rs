//! HTTP front door for the relay control plane.

pub mod auth;
pub mod middleware;
pub mod server;
pub mod telemetry;
