//! HTTP and WebSocket transport layer
//!
//! Provides the provider and caller socket endpoints, health and discovery.

pub mod handlers;
pub mod socket;
