//! Inbound message orchestration
//!
//! Every decoded frame is classified as handshake, provider response, business
//! request or notification and driven through the registry, the correlator and
//! the timeout supervisor. The relay lock is never held while a frame is handed
//! to a socket writer. Timers are armed and disarmed inside the same critical
//! section that adds or removes their pending entry; lock order is relay state,
//! then timers.

use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
    time::Duration,
};

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::{sync::mpsc::UnboundedSender, time::Instant};
use tracing::{debug, info, warn};

use crate::errors::RelayError;
use crate::mcp::{
    audit::redact_audit_params,
    handshake::{self, INITIALIZE, PING},
    rpc::{
        self, error_response, notification, result_response, DecodeError, Envelope, ErrorCode,
        ErrorObject, Notification, Request, RequestId, Response,
    },
};
use crate::relay::{
    correlator::RequestCorrelator,
    registry::{
        name_only_descriptor, ConnectionId, ConnectionRegistry, ConnectionState, Outbound,
        RegistryStats, Role,
    },
    timeout::TimeoutSupervisor,
};

pub const TOOLS_CALL: &str = "tools/call";
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_REGISTER: &str = "tools/register";
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// Close code sent to every peer when the relay shuts down.
const GOING_AWAY: u16 = 1001;

const OPERATION_NAME_PATTERN: &str = r"^[A-Za-z0-9_][A-Za-z0-9_./-]{0,127}$";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    #[serde(flatten)]
    pub registry: RegistryStats,
    pub pending_requests: usize,
    pub armed_timeouts: usize,
}

#[derive(Debug, Default)]
struct RelayState {
    registry: ConnectionRegistry,
    correlator: RequestCorrelator,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<RelayState>,
    timeouts: TimeoutSupervisor,
    config: RelayConfig,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RelayState::default()),
                timeouts: TimeoutSupervisor::new(),
                config,
            }),
        }
    }

    /// Registers an authenticated socket. Its frames go out through `outbound`.
    pub fn connect(
        &self,
        role: Role,
        identity: &str,
        outbound: UnboundedSender<Outbound>,
    ) -> ConnectionId {
        let connection_id = self.lock().registry.register(role, identity, outbound);
        info!(
            connection_id = %connection_id,
            role = ?role,
            identity = %identity,
            "connection registered"
        );
        connection_id
    }

    pub fn handle_frame(&self, connection_id: &ConnectionId, frame: &str) {
        let (role, state) = {
            let mut relay = self.lock();
            relay.registry.touch(connection_id);
            match relay.registry.get(connection_id) {
                Ok(connection) => (connection.role, connection.state),
                Err(err) => {
                    warn!(error = %err, "frame from unregistered connection dropped");
                    return;
                }
            }
        };

        let envelope = match rpc::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "undecodable frame");
                self.send_to(connection_id, &err.to_response());
                return;
            }
        };

        match envelope {
            Envelope::Request(request) => self.handle_request(connection_id, role, state, request),
            Envelope::Notification(notification) => {
                self.handle_notification(connection_id, role, state, notification)
            }
            Envelope::Response(response) => self.handle_response(connection_id, role, response),
        }
    }

    /// Binary frames that are not UTF-8 never reach the codec.
    pub fn reject_binary_frame(&self, connection_id: &ConnectionId) {
        warn!(connection_id = %connection_id, "binary frame is not valid UTF-8");
        self.send_to(connection_id, &DecodeError::Parse.to_response());
    }

    /// Cancels everything the connection is party to, then forgets it.
    pub fn disconnect(&self, connection_id: &ConnectionId) {
        let (role, cancelled, notices, released, callers) = {
            let mut guard = self.lock();
            let RelayState {
                registry,
                correlator,
            } = &mut *guard;

            let Ok(role) = registry.get(connection_id).map(|connection| connection.role) else {
                return;
            };
            if let Err(err) = registry.transition(connection_id, ConnectionState::Closing) {
                debug!(connection_id = %connection_id, error = %err, "already closing");
            }

            let cancelled = correlator.cancel_all_for(connection_id);
            for entry in &cancelled {
                self.inner.timeouts.disarm(&entry.rewritten_id);
            }
            let notices: Vec<_> = cancelled
                .iter()
                .filter(|entry| entry.target == *connection_id && entry.origin != *connection_id)
                .filter_map(|entry| {
                    registry
                        .outbound(&entry.origin)
                        .map(|outbound| (entry.clone(), outbound))
                })
                .collect();

            if let Err(err) = registry.transition(connection_id, ConnectionState::Closed) {
                debug!(connection_id = %connection_id, error = %err, "close transition skipped");
            }
            let released = registry
                .unregister(connection_id)
                .map(|(_, released)| released)
                .unwrap_or_default();
            let callers = if released.is_empty() {
                Vec::new()
            } else {
                registry.ready_callers()
            };

            (role, cancelled, notices, released, callers)
        };

        for (entry, outbound) in notices {
            let reply = error_response(
                Some(entry.original_id),
                ErrorObject::with_data(
                    ErrorCode::ConnectionError,
                    json!({
                        "detail": "provider disconnected",
                        "operation": entry.operation,
                    }),
                ),
            );
            deliver(Some(outbound), &reply);
        }

        if !released.is_empty() {
            info!(
                connection_id = %connection_id,
                operations = ?released,
                "provider bindings released"
            );
            broadcast(callers, &notification(TOOLS_LIST_CHANGED, None));
        }

        info!(
            connection_id = %connection_id,
            role = ?role,
            cancelled_requests = cancelled.len(),
            "connection closed"
        );
    }

    /// Disarms every deadline and asks every socket to close.
    pub fn shutdown(&self) {
        self.inner.timeouts.disarm_all();

        let outbounds: Vec<_> = {
            let relay = self.lock();
            relay
                .registry
                .connection_ids()
                .iter()
                .filter_map(|id| relay.registry.outbound(id))
                .collect()
        };

        for outbound in outbounds {
            let _ = outbound.send(Outbound::Close {
                code: GOING_AWAY,
                reason: "relay shutting down".to_string(),
            });
        }
        info!("relay shut down");
    }

    pub fn stats(&self) -> RelayStats {
        let relay = self.lock();
        RelayStats {
            registry: relay.registry.stats(),
            pending_requests: relay.correlator.len(),
            armed_timeouts: self.inner.timeouts.armed_count(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().correlator.len()
    }

    pub fn connection_state(&self, connection_id: &ConnectionId) -> Option<ConnectionState> {
        self.lock()
            .registry
            .get(connection_id)
            .ok()
            .map(|connection| connection.state)
    }

    fn handle_request(
        &self,
        connection_id: &ConnectionId,
        role: Role,
        state: ConnectionState,
        request: Request,
    ) {
        match request.method.as_str() {
            INITIALIZE => {
                let reply = {
                    let mut relay = self.lock();
                    handshake::on_initialize(&mut relay.registry, connection_id, &request)
                };
                self.send_to(connection_id, &reply);
                return;
            }
            PING => {
                self.send_to(connection_id, &result_response(request.id, json!({})));
                return;
            }
            _ => {}
        }

        if state != ConnectionState::Ready {
            warn!(
                connection_id = %connection_id,
                method = %request.method,
                state = ?state,
                "request before handshake completed"
            );
            let reply = error_response(
                Some(request.id),
                ErrorObject::with_data(
                    ErrorCode::InvalidRequest,
                    json!({ "detail": "connection is not initialized" }),
                ),
            );
            self.send_to(connection_id, &reply);
            return;
        }

        match (role, request.method.as_str()) {
            (Role::Provider, TOOLS_REGISTER) => self.register_tools(connection_id, request),
            (Role::Provider, _) => {
                let reply = error_response(
                    Some(request.id),
                    ErrorObject::with_data(
                        ErrorCode::MethodNotFound,
                        json!({ "method": request.method }),
                    ),
                );
                self.send_to(connection_id, &reply);
            }
            (Role::Caller, TOOLS_LIST) => {
                let tools = self.lock().registry.tool_descriptors();
                self.send_to(
                    connection_id,
                    &result_response(request.id, json!({ "tools": tools })),
                );
            }
            (Role::Caller, _) => self.forward_request(connection_id, request),
        }
    }

    fn forward_request(&self, origin: &ConnectionId, request: Request) {
        let operation = match operation_name(&request) {
            Ok(operation) => operation,
            Err(reply) => {
                self.send_to(origin, &reply);
                return;
            }
        };

        let deadline = Instant::now() + self.inner.config.request_timeout;
        let forwarded = {
            let mut guard = self.lock();
            let RelayState {
                registry,
                correlator,
            } = &mut *guard;
            correlator
                .forward(registry, origin, request.id.clone(), &operation, deadline)
                .map(|(rewritten_id, target)| {
                    self.arm_timeout(rewritten_id.clone(), deadline);
                    let outbound = registry.outbound(&target);
                    (rewritten_id, target, outbound)
                })
        };

        let (rewritten_id, target, outbound) = match forwarded {
            Ok(forwarded) => forwarded,
            Err(RelayError::DuplicateRequest(id)) => {
                warn!(connection_id = %origin, request_id = %id, "duplicate in-flight request id");
                let reply = error_response(
                    Some(request.id),
                    ErrorObject::with_data(
                        ErrorCode::InvalidRequest,
                        json!({ "detail": "request id is already pending" }),
                    ),
                );
                self.send_to(origin, &reply);
                return;
            }
            Err(err) => {
                info!(connection_id = %origin, operation = %operation, error = %err, "request not forwarded");
                let reply = error_response(
                    Some(request.id),
                    ErrorObject::new(ErrorCode::ToolNotConnected),
                );
                self.send_to(origin, &reply);
                return;
            }
        };

        info!(
            connection_id = %origin,
            target = %target,
            operation = %operation,
            params = %redact_audit_params(request.params.as_ref()),
            "request forwarded"
        );

        let forwarded = Envelope::Request(Request {
            id: RequestId::String(rewritten_id.clone()),
            method: request.method,
            params: request.params,
        });
        if !deliver(outbound, &forwarded) {
            self.fail_forward(&rewritten_id);
        }
    }

    /// Answers -32002 unless a disconnect or the deadline already claimed the
    /// entry and answered it.
    fn fail_forward(&self, rewritten_id: &str) {
        let failed = {
            let mut guard = self.lock();
            let RelayState {
                registry,
                correlator,
            } = &mut *guard;
            correlator.expire(rewritten_id).map(|entry| {
                self.inner.timeouts.disarm(rewritten_id);
                let outbound = registry.outbound(&entry.origin);
                (entry, outbound)
            })
        };

        let Some((entry, outbound)) = failed else {
            debug!(rewritten_id = %rewritten_id, "failed forward already answered");
            return;
        };

        warn!(
            connection_id = %entry.origin,
            target = %entry.target,
            operation = %entry.operation,
            "forward failed"
        );
        let reply = error_response(
            Some(entry.original_id),
            ErrorObject::with_data(
                ErrorCode::ForwardFailed,
                json!({ "operation": entry.operation }),
            ),
        );
        deliver(outbound, &reply);
    }

    fn handle_response(&self, connection_id: &ConnectionId, role: Role, response: Response) {
        if role != Role::Provider {
            warn!(connection_id = %connection_id, "response from caller connection dropped");
            return;
        }

        let Some(RequestId::String(rewritten_id)) = response.id else {
            warn!(
                connection_id = %connection_id,
                id = ?response.id,
                "provider response without a relay id dropped"
            );
            return;
        };

        let resolved = {
            let mut guard = self.lock();
            let RelayState {
                registry,
                correlator,
            } = &mut *guard;
            correlator
                .resolve(&rewritten_id, connection_id)
                .map(|entry| {
                    self.inner.timeouts.disarm(&rewritten_id);
                    let outbound = registry.outbound(&entry.origin);
                    (entry, outbound)
                })
        };

        let (entry, outbound) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "unmatched provider response dropped");
                return;
            }
        };

        debug!(
            origin = %entry.origin,
            operation = %entry.operation,
            "provider response routed"
        );

        let restored = Envelope::Response(Response {
            id: Some(entry.original_id),
            outcome: response.outcome,
        });
        if !deliver(outbound, &restored) {
            debug!(origin = %entry.origin, "caller left before its response arrived");
        }
    }

    fn handle_notification(
        &self,
        connection_id: &ConnectionId,
        role: Role,
        state: ConnectionState,
        notification: Notification,
    ) {
        if handshake::is_initialized_notification(&notification.method) {
            let mut relay = self.lock();
            if let Err(err) = handshake::on_initialized(&mut relay.registry, connection_id) {
                warn!(connection_id = %connection_id, error = %err, "initialized notification ignored");
            }
            return;
        }

        if state != ConnectionState::Ready {
            warn!(
                connection_id = %connection_id,
                method = %notification.method,
                "notification before handshake completed dropped"
            );
            return;
        }

        let envelope = Envelope::Notification(notification);
        match role {
            Role::Provider => {
                let callers = self.lock().registry.ready_callers();
                broadcast(callers, &envelope);
            }
            Role::Caller => {
                let method = envelope.method().unwrap_or_default();
                let outbound = {
                    let relay = self.lock();
                    relay
                        .registry
                        .resolve_provider(method)
                        .ok()
                        .and_then(|provider| relay.registry.outbound(&provider))
                };
                if !deliver(outbound, &envelope) {
                    debug!(connection_id = %connection_id, method = %method, "notification had no provider");
                }
            }
        }
    }

    fn register_tools(&self, provider: &ConnectionId, request: Request) {
        let registrations = match parse_tool_registrations(request.params.as_ref()) {
            Ok(registrations) => registrations,
            Err(detail) => {
                let reply = error_response(
                    Some(request.id),
                    ErrorObject::with_data(ErrorCode::InvalidParams, json!({ "detail": detail })),
                );
                self.send_to(provider, &reply);
                return;
            }
        };

        let outcome = {
            let mut relay = self.lock();
            let mut bound = Vec::with_capacity(registrations.len());
            let mut failure = None;
            for (operation, descriptor) in registrations {
                match relay.registry.bind(provider, &operation, descriptor) {
                    Ok(superseded) => {
                        if let Some(previous) = superseded {
                            info!(
                                operation = %operation,
                                previous = %previous,
                                provider = %provider,
                                "binding superseded"
                            );
                        }
                        bound.push(operation);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            failure
                .map(Err)
                .unwrap_or(Ok(bound))
                .map(|bound| (bound, relay.registry.ready_callers()))
        };

        match outcome {
            Ok((bound, callers)) => {
                info!(provider = %provider, operations = ?bound, "operations bound");
                self.send_to(provider, &result_response(request.id, json!({ "bound": bound })));
                broadcast(callers, &notification(TOOLS_LIST_CHANGED, None));
            }
            Err(err) => {
                warn!(provider = %provider, error = %err, "binding rejected");
                let reply = error_response(
                    Some(request.id),
                    ErrorObject::with_data(
                        ErrorCode::InvalidRequest,
                        json!({ "detail": err.to_string() }),
                    ),
                );
                self.send_to(provider, &reply);
            }
        }
    }

    fn arm_timeout(&self, rewritten_id: String, deadline: Instant) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = rewritten_id.clone();
        self.inner.timeouts.arm(rewritten_id, deadline, move || {
            if let Some(inner) = inner.upgrade() {
                Dispatcher { inner }.expire(&key);
            }
        });
    }

    fn expire(&self, rewritten_id: &str) {
        let expired = {
            let mut guard = self.lock();
            let RelayState {
                registry,
                correlator,
            } = &mut *guard;
            correlator.expire_due(rewritten_id, Instant::now()).map(|entry| {
                let outbound = registry.outbound(&entry.origin);
                (entry, outbound)
            })
        };

        let Some((entry, outbound)) = expired else {
            debug!(rewritten_id = %rewritten_id, "stale deadline ignored");
            return;
        };

        let seconds = self.inner.config.request_timeout.as_secs();
        warn!(
            origin = %entry.origin,
            target = %entry.target,
            operation = %entry.operation,
            timeout_secs = seconds,
            "request timed out"
        );
        let reply = error_response(
            Some(entry.original_id),
            ErrorObject::with_data(
                ErrorCode::InternalError,
                json!({ "detail": format!("Request timeout after {seconds} seconds") }),
            ),
        );
        deliver(outbound, &reply);
    }

    fn send_to(&self, connection_id: &ConnectionId, envelope: &Envelope) -> bool {
        let outbound = self.lock().registry.outbound(connection_id);
        deliver(outbound, envelope)
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(outbound: Option<UnboundedSender<Outbound>>, envelope: &Envelope) -> bool {
    outbound.is_some_and(|outbound| outbound.send(Outbound::Frame(envelope.encode())).is_ok())
}

fn broadcast(outbounds: Vec<UnboundedSender<Outbound>>, envelope: &Envelope) {
    if outbounds.is_empty() {
        return;
    }
    let frame = envelope.encode();
    for outbound in outbounds {
        let _ = outbound.send(Outbound::Frame(frame.clone()));
    }
}

/// `tools/call` targets `params.name`; any other method is its own operation.
fn operation_name(request: &Request) -> Result<String, Envelope> {
    if request.method != TOOLS_CALL {
        return Ok(request.method.clone());
    }

    request
        .params
        .as_ref()
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            error_response(
                Some(request.id.clone()),
                ErrorObject::with_data(
                    ErrorCode::InvalidParams,
                    json!({ "detail": "tools/call requires params.name" }),
                ),
            )
        })
}

fn is_valid_operation_name(name: &str) -> bool {
    static OPERATION_NAME: OnceLock<Option<Regex>> = OnceLock::new();
    OPERATION_NAME
        .get_or_init(|| Regex::new(OPERATION_NAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name))
}

fn parse_tool_registrations(params: Option<&Value>) -> Result<Vec<(String, Value)>, &'static str> {
    let tools = params
        .and_then(|params| params.get("tools"))
        .and_then(Value::as_array)
        .ok_or("params.tools must be an array")?;
    if tools.is_empty() {
        return Err("params.tools must not be empty");
    }

    tools
        .iter()
        .map(|tool| {
            let (name, descriptor) = match tool {
                Value::String(name) => (name.clone(), name_only_descriptor(name)),
                Value::Object(object) => {
                    let name = object
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or("every tool needs a name")?;
                    (name.to_string(), tool.clone())
                }
                _ => return Err("tools entries must be names or tool objects"),
            };

            if !is_valid_operation_name(&name) {
                return Err("invalid operation name");
            }
            Ok((name, descriptor))
        })
        .collect()
}
