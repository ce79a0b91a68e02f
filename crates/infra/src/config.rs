//! Configuration loading and representation.
//!
//! Everything is read from environment variables with documented defaults.
//! [`BridgeConfig::from_lookup`] takes the lookup as a function so tests never
//! touch the process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::RestEngineConfig;
use crate::jobs::JobWorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Rest,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mode: EngineMode,
    pub gateway_address: String,
    pub use_tls: bool,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
}

impl EngineSettings {
    pub fn rest_config(&self) -> RestEngineConfig {
        RestEngineConfig {
            gateway_address: self.gateway_address.clone(),
            use_tls: self.use_tls,
            auth_token: self.auth_token.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub mode: BrokerMode,
    pub redis_url: String,
    /// Extra produce attempts on transport failure.
    pub publish_retries: u32,
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub request_topic: String,
    pub response_topic: String,
    pub response_group: String,
    pub request_group: String,
    pub message_name: String,
    pub target_field: String,
    pub job_type: String,
    pub responder_enabled: bool,
    /// How long a request may wait for its response before the inbound bridge forgets it.
    pub pending_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub max_active: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub engine: EngineSettings,
    pub broker: BrokerSettings,
    pub bridge: BridgeSettings,
    pub worker: WorkerSettings,
    pub http_addr: SocketAddr,
    pub shutdown_grace: Duration,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let engine = EngineSettings {
            mode: match env.string("ENGINE_MODE", "rest").to_ascii_lowercase().as_str() {
                "rest" => EngineMode::Rest,
                "memory" => EngineMode::Memory,
                other => return Err(ConfigError::invalid("ENGINE_MODE", other, "expected rest or memory")),
            },
            gateway_address: env.string("ENGINE_GATEWAY_ADDRESS", "localhost:8080"),
            use_tls: env.flag("ENGINE_USE_TLS", false)?,
            auth_token: env.optional("ENGINE_AUTH_TOKEN"),
            request_timeout: env.millis("ENGINE_REQUEST_TIMEOUT_MS", 30_000)?,
        };

        let broker = BrokerSettings {
            mode: match env.string("BROKER_MODE", "redis").to_ascii_lowercase().as_str() {
                "redis" => BrokerMode::Redis,
                "memory" => BrokerMode::Memory,
                other => return Err(ConfigError::invalid("BROKER_MODE", other, "expected redis or memory")),
            },
            redis_url: env.string("REDIS_URL", "redis://localhost:6379"),
            publish_retries: env.parse("BROKER_PUBLISH_RETRIES", 3)?,
        };

        let mut bridge = BridgeSettings {
            request_topic: env.string("BRIDGE_REQUEST_TOPIC", "bridge.requests"),
            response_topic: env.string("BRIDGE_RESPONSE_TOPIC", "bridge.responses"),
            response_group: env.string("BRIDGE_RESPONSE_GROUP", "bridge.inbound"),
            request_group: env.string("BRIDGE_REQUEST_GROUP", "bridge.responder"),
            message_name: env.string("BRIDGE_MESSAGE_NAME", "ResponseMessage"),
            target_field: env.string("BRIDGE_TARGET_FIELD", "target"),
            job_type: env.string("BRIDGE_JOB_TYPE", "bridge"),
            responder_enabled: env.flag("BRIDGE_RESPONDER_ENABLED", false)?,
            pending_ttl: env.millis("BRIDGE_PENDING_TTL_MS", 86_400_000)?,
        };

        let default_name = env.optional("HOSTNAME").unwrap_or_else(|| "flowbridge".to_string());
        let worker = WorkerSettings {
            name: env.string("WORKER_NAME", &default_name),
            max_active: env.parse("WORKER_MAX_ACTIVE", 5)?,
            poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", 1_000)?,
            job_timeout: env.millis("WORKER_JOB_TIMEOUT_MS", 10_000)?,
        };
        if worker.max_active == 0 {
            return Err(ConfigError::invalid("WORKER_MAX_ACTIVE", "0", "must be at least 1"));
        }
        if worker.job_timeout.is_zero() {
            return Err(ConfigError::invalid("WORKER_JOB_TIMEOUT_MS", "0", "must be positive"));
        }
        bridge.pending_ttl = bridge.pending_ttl.max(worker.job_timeout);

        Ok(Self {
            engine,
            broker,
            bridge,
            worker,
            http_addr: env.parse("HTTP_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            shutdown_grace: env.millis("SHUTDOWN_GRACE_MS", 10_000)?,
        })
    }

    /// Worker registration for `job_type` using the shared worker settings.
    pub fn worker_config(&self, job_type: &str) -> JobWorkerConfig {
        JobWorkerConfig::new(job_type)
            .with_worker_name(self.worker.name.clone())
            .with_max_active(self.worker.max_active)
            .with_poll_interval(self.worker.poll_interval)
            .with_job_timeout(self.worker.job_timeout)
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::invalid(key, raw, e.to_string())),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, raw, "expected a boolean")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<BridgeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.engine.mode, EngineMode::Rest);
        assert_eq!(config.broker.mode, BrokerMode::Redis);
        assert_eq!(config.broker.redis_url, "redis://localhost:6379");
        assert_eq!(config.bridge.message_name, "ResponseMessage");
        assert_eq!(config.bridge.job_type, "bridge");
        assert_eq!(config.worker.max_active, 5);
        assert_eq!(config.worker.poll_interval, Duration::from_secs(1));
        assert_eq!(config.worker.job_timeout, Duration::from_secs(10));
        assert_eq!(config.http_addr.port(), 8080);
        assert!(!config.bridge.responder_enabled);
    }

    #[test]
    fn overrides_are_read() {
        let config = load(&[
            ("ENGINE_MODE", "memory"),
            ("BROKER_MODE", "MEMORY"),
            ("ENGINE_USE_TLS", "true"),
            ("WORKER_MAX_ACTIVE", "12"),
            ("WORKER_NAME", "bridge-1"),
            ("BRIDGE_RESPONSE_TOPIC", "email-responses"),
            ("HTTP_ADDR", "127.0.0.1:9000"),
        ])
        .unwrap();

        assert_eq!(config.engine.mode, EngineMode::Memory);
        assert_eq!(config.broker.mode, BrokerMode::Memory);
        assert!(config.engine.use_tls);
        assert_eq!(config.engine.rest_config().base_url(), "https://localhost:8080");
        assert_eq!(config.bridge.response_topic, "email-responses");

        let worker = config.worker_config("bridge");
        assert_eq!(worker.max_active, 12);
        assert_eq!(worker.worker_name, "bridge-1");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load(&[("WORKER_MAX_ACTIVE", "0")]).is_err());
        assert!(load(&[("WORKER_MAX_ACTIVE", "many")]).is_err());
        assert!(load(&[("ENGINE_MODE", "grpc")]).is_err());
        assert!(load(&[("ENGINE_USE_TLS", "maybe")]).is_err());
        assert!(load(&[("HTTP_ADDR", "nowhere")]).is_err());
    }

    #[test]
    fn pending_ttl_never_drops_below_the_job_timeout() {
        assert_eq!(load(&[]).unwrap().bridge.pending_ttl, Duration::from_secs(24 * 3600));

        let config = load(&[("BRIDGE_PENDING_TTL_MS", "500"), ("WORKER_JOB_TIMEOUT_MS", "2000")]).unwrap();
        assert_eq!(config.bridge.pending_ttl, Duration::from_secs(2));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("BRIDGE_REQUEST_TOPIC", "  ")]).unwrap();
        assert_eq!(config.bridge.request_topic, "bridge.requests");
    }
}
