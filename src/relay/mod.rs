//! Provider/caller message relay
//!
//! Bridges provider connections (which expose operations) and caller
//! connections (which invoke them). Registry and correlator state lives behind
//! a single lock owned by the [`dispatcher::Dispatcher`]; socket tasks only
//! ever hold connection ids.

pub mod correlator;
pub mod dispatcher;
pub mod registry;
pub mod timeout;

pub use dispatcher::{Dispatcher, RelayConfig, RelayStats};
pub use registry::{ConnectionId, ConnectionState, Outbound, Role};
