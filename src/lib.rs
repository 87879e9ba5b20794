// ABOUTME: Library root for hopssh - SSH through jump-host chains plus local port forwarding.
// ABOUTME: Exposes alias configuration, connection building, and the forwarding engine.

pub mod config;
pub mod error;
pub mod ssh;
