use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, builder::DefaultState};
use serde::{Deserialize, Serialize};

use crate::outbound::servicebus::ConnectionString;

/// Malformed or missing configuration. Always fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Connection string is missing required key {0}")]
    MissingKey(&'static str),

    #[error("Connection string contains unknown key {0}")]
    UnknownKey(String),

    #[error("Connection string contains duplicate key {0}")]
    DuplicateKey(String),

    #[error("Connection string key {0} has an empty value")]
    EmptyValue(String),

    #[error("Malformed connection string segment: {0}")]
    MalformedSegment(String),

    #[error("Invalid queue endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("No queue name: set EntityPath in the connection string or queue.name")]
    MissingQueueName,

    #[error("No downstream credentials: set downstream.bearer_token or token_url, client_id and client_secret")]
    MissingCredentials,

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub downstream: DownstreamConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Deserialize)]
pub struct QueueConfig {
    pub connection_string: String,
    pub name: Option<String>,
    pub api_version: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Deserialize)]
pub struct DownstreamConfig {
    pub instance_url: String,
    pub api_version: String,
    pub entity_set: String,
    pub completion_field: String,
    pub result_field: String,
    pub result_payload: String,
    pub request_timeout_secs: u64,
    pub bearer_token: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub simulated_delay_ms: u64,
    pub max_in_flight: usize,
    pub abandon_on_failure: bool,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

/// Resolved queue connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub connection: ConnectionString,
    pub queue_name: String,
    pub api_version: String,
    pub timeout: Duration,
}

/// How bearer tokens for the record store are obtained
#[derive(Clone, PartialEq, Eq)]
pub enum TokenProviderKind {
    Static {
        token: String,
    },
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: String,
    },
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_QUEUE__CONNECTION_STRING or APP_WORKER__MAX_IN_FLIGHT
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Set default values for the configuration.
    /// Connection string and instance URL have no defaults and must be provided.
    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("queue.api_version", "2013-08")?
            .set_default("queue.timeout_secs", 60)?
            .set_default("downstream.api_version", "9.2")?
            .set_default("downstream.entity_set", "dkdt_asyncrequestresponsesamples")?
            .set_default("downstream.completion_field", "dkdt_updatefromazurecodecomplete")?
            .set_default("downstream.result_field", "dkdt_responsefromazurecode")?
            .set_default(
                "downstream.result_payload",
                "WHATEVER DATA YOU WANT TO SEND BACK",
            )?
            .set_default("downstream.request_timeout_secs", 30)?
            .set_default("worker.simulated_delay_ms", 2000)?
            .set_default("worker.max_in_flight", 1)?
            .set_default("worker.abandon_on_failure", false)?
            .set_default("worker.backoff_base_ms", 500)?
            .set_default("worker.backoff_max_ms", 30_000)
    }

    pub fn queue_settings(&self) -> Result<QueueSettings, ConfigurationError> {
        let connection = ConnectionString::parse(&self.queue.connection_string)?;

        let queue_name = self
            .queue
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or(connection.entity_path())
            .map(str::to_string)
            .ok_or(ConfigurationError::MissingQueueName)?;

        if self.queue.api_version.trim().is_empty() {
            return Err(ConfigurationError::InvalidSetting {
                name: "queue.api_version",
                reason: "must not be empty".to_string(),
            });
        }
        if self.queue.timeout_secs == 0 {
            return Err(ConfigurationError::InvalidSetting {
                name: "queue.timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(QueueSettings {
            connection,
            queue_name,
            api_version: self.queue.api_version.trim().to_string(),
            timeout: Duration::from_secs(self.queue.timeout_secs),
        })
    }

    pub fn token_provider_kind(&self) -> Result<TokenProviderKind, ConfigurationError> {
        let d = &self.downstream;
        fn non_empty(v: &Option<String>) -> Option<&str> {
            v.as_deref().filter(|s| !s.trim().is_empty())
        }

        if let (Some(token_url), Some(client_id), Some(client_secret)) = (
            non_empty(&d.token_url),
            non_empty(&d.client_id),
            non_empty(&d.client_secret),
        ) {
            let scope = non_empty(&d.scope)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}/.default", d.instance_url.trim_end_matches('/')));

            return Ok(TokenProviderKind::ClientCredentials {
                token_url: token_url.to_string(),
                client_id: client_id.to_string(),
                client_secret: client_secret.to_string(),
                scope,
            });
        }

        non_empty(&d.bearer_token)
            .map(|token| TokenProviderKind::Static {
                token: token.to_string(),
            })
            .ok_or(ConfigurationError::MissingCredentials)
    }

    pub fn validate_worker(&self) -> Result<(), ConfigurationError> {
        if self.worker.max_in_flight == 0 {
            return Err(ConfigurationError::InvalidSetting {
                name: "worker.max_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.worker.backoff_base_ms > self.worker.backoff_max_ms {
            return Err(ConfigurationError::InvalidSetting {
                name: "worker.backoff_base_ms",
                reason: "must not exceed worker.backoff_max_ms".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("connection_string", &"<redacted>")
            .field("name", &self.name)
            .field("api_version", &self.api_version)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl std::fmt::Debug for DownstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamConfig")
            .field("instance_url", &self.instance_url)
            .field("api_version", &self.api_version)
            .field("entity_set", &self.entity_set)
            .field("completion_field", &self.completion_field)
            .field("result_field", &self.result_field)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for TokenProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenProviderKind::Static { .. } => f.write_str("Static"),
            TokenProviderKind::ClientCredentials {
                token_url,
                client_id,
                scope,
                ..
            } => f
                .debug_struct("ClientCredentials")
                .field("token_url", token_url)
                .field("client_id", client_id)
                .field("scope", scope)
                .finish_non_exhaustive(),
        }
    }
}
