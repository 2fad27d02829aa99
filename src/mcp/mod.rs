//! Model Context Protocol (MCP) message handling
//!
//! JSON-RPC 2.0 envelope codec, the initialize handshake, and audit redaction
//! of forwarded parameters.

pub mod audit;
pub mod handshake;
pub mod rpc;
