//! Pending-request bookkeeping and id rewriting
//!
//! A provider serves many callers over a single socket, so caller-chosen ids
//! are rewritten before they cross into the provider's namespace. The
//! rewritten id is composed from the caller's connection id and its original
//! id, which makes it unique across callers and lets a response be resolved
//! with a single map lookup.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::errors::RelayError;
use crate::mcp::rpc::RequestId;
use crate::relay::registry::{ConnectionId, ConnectionRegistry};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub rewritten_id: String,
    pub origin: ConnectionId,
    pub original_id: RequestId,
    pub target: ConnectionId,
    pub operation: String,
    pub deadline: Instant,
}

/// `<connection>:<n|s>:<original>`; the type tag keeps `1` and `"1"` apart.
pub fn rewrite_id(origin: &ConnectionId, original_id: &RequestId) -> String {
    match original_id {
        RequestId::Number(value) => format!("{origin}:n:{value}"),
        RequestId::Unsigned(value) => format!("{origin}:n:{value}"),
        RequestId::String(value) => format!("{origin}:s:{value}"),
    }
}

#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, PendingRequest>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the provider for `operation` and records the pending entry.
    /// Nothing is stored when resolution fails.
    pub fn forward(
        &mut self,
        registry: &ConnectionRegistry,
        origin: &ConnectionId,
        original_id: RequestId,
        operation: &str,
        deadline: Instant,
    ) -> Result<(String, ConnectionId), RelayError> {
        let target = registry.resolve_provider(operation)?;
        let rewritten_id = rewrite_id(origin, &original_id);

        if self.pending.contains_key(&rewritten_id) {
            return Err(RelayError::DuplicateRequest(original_id.to_string()));
        }

        self.pending.insert(
            rewritten_id.clone(),
            PendingRequest {
                rewritten_id: rewritten_id.clone(),
                origin: origin.clone(),
                original_id,
                target: target.clone(),
                operation: operation.to_string(),
                deadline,
            },
        );

        Ok((rewritten_id, target))
    }

    /// Removes the entry for a provider response. Only the provider the request
    /// was forwarded to can resolve it; a second resolution fails.
    pub fn resolve(
        &mut self,
        rewritten_id: &str,
        responder: &ConnectionId,
    ) -> Result<PendingRequest, RelayError> {
        match self.pending.get(rewritten_id) {
            Some(entry) if entry.target == *responder => {}
            _ => return Err(RelayError::UnknownRequest(rewritten_id.to_string())),
        }

        self.pending
            .remove(rewritten_id)
            .ok_or_else(|| RelayError::UnknownRequest(rewritten_id.to_string()))
    }

    /// Removes the entry if it is still live, regardless of its deadline.
    pub fn expire(&mut self, rewritten_id: &str) -> Option<PendingRequest> {
        self.pending.remove(rewritten_id)
    }

    /// Timeout path: removes the entry only once its own deadline has passed.
    /// A timer left over from an earlier request under the same rewritten id
    /// finds a later deadline and leaves the entry alone.
    pub fn expire_due(&mut self, rewritten_id: &str, now: Instant) -> Option<PendingRequest> {
        if self
            .pending
            .get(rewritten_id)
            .is_some_and(|entry| entry.deadline <= now)
        {
            self.pending.remove(rewritten_id)
        } else {
            None
        }
    }

    /// Removes every entry whose origin or target is `connection_id`.
    pub fn cancel_all_for(&mut self, connection_id: &ConnectionId) -> Vec<PendingRequest> {
        let keys: Vec<String> = self
            .pending
            .values()
            .filter(|entry| entry.origin == *connection_id || entry.target == *connection_id)
            .map(|entry| entry.rewritten_id.clone())
            .collect();

        let mut cancelled: Vec<PendingRequest> = keys
            .iter()
            .filter_map(|key| self.pending.remove(key))
            .collect();
        cancelled.sort_by_key(|entry| entry.deadline);
        cancelled
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
