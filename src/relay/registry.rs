//! Table of live connections and provider operation bindings
//!
//! Every cross-reference in the relay goes through a [`ConnectionId`]; nothing
//! outside this module holds a connection's outbound channel for longer than a
//! single send.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::errors::RelayError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Simple-format UUIDs never contain `:`, the rewritten id separator.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Provider,
    Caller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    AwaitingInitialized,
    Ready,
    Closing,
    Closed,
}

impl ConnectionState {
    fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Connecting, AwaitingInitialized) | (AwaitingInitialized, Ready) => true,
            (Closing, Closed) => true,
            (Closing | Closed, Closing) => false,
            (_, Closing) => true,
            _ => false,
        }
    }
}

/// A frame queued for a connection's socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close { code: u16, reason: String },
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub identity: String,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    outbound: UnboundedSender<Outbound>,
}

#[derive(Debug, Clone)]
struct Binding {
    connection_id: ConnectionId,
    descriptor: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub connection_id: ConnectionId,
    pub role: Role,
    pub identity: String,
    pub state: ConnectionState,
    pub connected_at_utc: String,
    pub last_activity_utc: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub providers: usize,
    pub callers: usize,
    pub operations: Vec<String>,
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    bindings: HashMap<String, Binding>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        role: Role,
        identity: impl Into<String>,
        outbound: UnboundedSender<Outbound>,
    ) -> ConnectionId {
        let id = ConnectionId::generate();
        let now = Utc::now();
        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                role,
                identity: identity.into(),
                state: ConnectionState::Connecting,
                connected_at: now,
                last_activity: now,
                outbound,
            },
        );
        id
    }

    pub fn get(&self, id: &ConnectionId) -> Result<&Connection, RelayError> {
        self.connections
            .get(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))
    }

    /// Returns the previous state.
    pub fn transition(
        &mut self,
        id: &ConnectionId,
        next: ConnectionState,
    ) -> Result<ConnectionState, RelayError> {
        let connection = self
            .connections
            .get_mut(id)
            .ok_or_else(|| RelayError::UnknownConnection(id.clone()))?;

        let previous = connection.state;
        if !previous.can_transition_to(next) {
            return Err(RelayError::InvalidTransition {
                from: previous,
                to: next,
            });
        }

        connection.state = next;
        Ok(previous)
    }

    pub fn touch(&mut self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get_mut(id) {
            connection.last_activity = Utc::now();
        }
    }

    /// Binds `operation` to a ready provider. Returns the provider it superseded, if any.
    pub fn bind(
        &mut self,
        id: &ConnectionId,
        operation: &str,
        descriptor: Value,
    ) -> Result<Option<ConnectionId>, RelayError> {
        let connection = self.get(id)?;
        if connection.role != Role::Provider || connection.state != ConnectionState::Ready {
            return Err(RelayError::NotProvider(id.clone()));
        }

        let previous = self.bindings.insert(
            operation.to_string(),
            Binding {
                connection_id: id.clone(),
                descriptor,
            },
        );

        Ok(previous
            .map(|binding| binding.connection_id)
            .filter(|previous| previous != id))
    }

    pub fn resolve_provider(&self, operation: &str) -> Result<ConnectionId, RelayError> {
        self.bindings
            .get(operation)
            .map(|binding| &binding.connection_id)
            .filter(|id| {
                self.connections
                    .get(*id)
                    .is_some_and(|connection| connection.state == ConnectionState::Ready)
            })
            .cloned()
            .ok_or_else(|| RelayError::ToolNotConnected(operation.to_string()))
    }

    /// Removes the connection and every binding still pointing at it.
    /// Returns the removed connection and the operations it no longer serves.
    pub fn unregister(&mut self, id: &ConnectionId) -> Option<(Connection, Vec<String>)> {
        let connection = self.connections.remove(id)?;

        let mut released: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, binding)| binding.connection_id == *id)
            .map(|(operation, _)| operation.clone())
            .collect();
        for operation in &released {
            self.bindings.remove(operation);
        }
        released.sort();

        Some((connection, released))
    }

    pub fn outbound(&self, id: &ConnectionId) -> Option<UnboundedSender<Outbound>> {
        self.connections
            .get(id)
            .map(|connection| connection.outbound.clone())
    }

    pub fn ready_callers(&self) -> Vec<UnboundedSender<Outbound>> {
        self.connections
            .values()
            .filter(|connection| {
                connection.role == Role::Caller && connection.state == ConnectionState::Ready
            })
            .map(|connection| connection.outbound.clone())
            .collect()
    }

    /// Descriptors of every live binding, sorted by operation name.
    pub fn tool_descriptors(&self) -> Vec<Value> {
        let mut operations: Vec<&String> = self
            .bindings
            .keys()
            .filter(|operation| self.resolve_provider(operation).is_ok())
            .collect();
        operations.sort();

        operations
            .into_iter()
            .filter_map(|operation| self.bindings.get(operation))
            .map(|binding| binding.descriptor.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let count = |role: Role| {
            self.connections
                .values()
                .filter(|connection| connection.role == role)
                .count()
        };

        let mut operations: Vec<String> = self.bindings.keys().cloned().collect();
        operations.sort();

        let mut connections: Vec<ConnectionSnapshot> = self
            .connections
            .values()
            .map(|connection| ConnectionSnapshot {
                connection_id: connection.id.clone(),
                role: connection.role,
                identity: connection.identity.clone(),
                state: connection.state,
                connected_at_utc: connection
                    .connected_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
                last_activity_utc: connection
                    .last_activity
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect();
        connections.sort_by(|left, right| left.connection_id.cmp(&right.connection_id));

        RegistryStats {
            providers: count(Role::Provider),
            callers: count(Role::Caller),
            operations,
            connections,
        }
    }
}

/// Minimal descriptor for a provider that registered a bare operation name.
pub fn name_only_descriptor(operation: &str) -> Value {
    json!({ "name": operation })
}
