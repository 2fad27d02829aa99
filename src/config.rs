use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const DEFAULT_PROVIDER_PATH: &str = "/mcp_endpoint/mcp/";
pub const DEFAULT_CALLER_PATH: &str = "/mcp_endpoint/call/";

#[derive(Debug, Clone)]
pub struct Config {
    pub server_key: String,
    pub agent_id: String,
    pub bind_addr: String,
    pub bind_port: u16,
    pub provider_path: String,
    pub caller_path: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("RELAY_SERVER_KEY is required and must not be empty")]
    MissingServerKey,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be an absolute path starting with '/'")]
    InvalidPath(&'static str),
    #[error("RELAY_PROVIDER_PATH and RELAY_CALLER_PATH must differ")]
    DuplicatePath,
    #[error("RELAY_REQUEST_TIMEOUT_SECS must be a positive integer")]
    InvalidTimeout,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let server_key = non_empty("RELAY_SERVER_KEY").ok_or(ConfigError::MissingServerKey)?;
        let agent_id = non_empty("RELAY_AGENT_ID").unwrap_or_else(|| "default_agent".to_string());

        let bind_addr = non_empty("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_port = non_empty("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(7100);

        let provider_path = endpoint_path(
            non_empty("RELAY_PROVIDER_PATH"),
            "RELAY_PROVIDER_PATH",
            DEFAULT_PROVIDER_PATH,
        )?;
        let caller_path = endpoint_path(
            non_empty("RELAY_CALLER_PATH"),
            "RELAY_CALLER_PATH",
            DEFAULT_CALLER_PATH,
        )?;
        if provider_path == caller_path {
            return Err(ConfigError::DuplicatePath);
        }

        let request_timeout = non_empty("RELAY_REQUEST_TIMEOUT_SECS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|seconds| *seconds > 0)
                    .ok_or(ConfigError::InvalidTimeout)
            })
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let config = Self {
            server_key,
            agent_id,
            bind_addr,
            bind_port,
            provider_path,
            caller_path,
            request_timeout,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

fn endpoint_path(
    value: Option<String>,
    variable: &'static str,
    default: &str,
) -> Result<String, ConfigError> {
    match value {
        None => Ok(default.to_string()),
        Some(path) if path.starts_with('/') && path.len() > 1 => Ok(path),
        Some(_) => Err(ConfigError::InvalidPath(variable)),
    }
}
