//! Client configuration loaded from TOML.
//!
//! ```toml
//! [defaults]
//! failover_cluster = 3
//! execution_timeout_ms = 1000
//!
//! [commands.Echo]
//! strategy = "FallBack"
//! fallback_name = "echo-cache"
//!
//! [health]
//! failure_threshold = 3
//! base_cooldown_ms = 10000
//!
//! [transport]
//! connect_timeout_ms = 5000
//!
//! [[routes]]
//! service_id = "Echo"
//! routing_path = "api/echo"
//! addresses = ["127.0.0.1:9001", "127.0.0.1:9002"]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_common::transport::TcpChannelConfig;
use meshrpc_common::{AddressModel, ServiceDescriptor, ServiceMetadata, ServiceRoute};
use meshrpc_routing::{HealthCheckConfig, HealthConfig};
use serde::{Deserialize, Serialize};

use crate::command::{ServiceCommand, ServiceCommandProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub failure_threshold: u32,
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub backoff_multiplier: f64,
    /// Run the periodic prober when a probe is supplied.
    pub check_enabled: bool,
    pub check_interval_ms: u64,
    pub check_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_ms: 10_000,
            max_cooldown_ms: 300_000,
            backoff_multiplier: 2.0,
            check_enabled: true,
            check_interval_ms: 5_000,
            check_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let channel = TcpChannelConfig::default();
        Self {
            connect_timeout_ms: channel.connect_timeout.as_millis() as u64,
            max_frame_size: channel.max_frame_size,
        }
    }
}

/// A statically configured route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSettings {
    pub service_id: String,
    #[serde(default)]
    pub routing_path: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub metadata: ServiceMetadata,
}

impl RouteSettings {
    pub fn to_route(&self) -> Result<ServiceRoute> {
        let addresses = self
            .addresses
            .iter()
            .map(|a| a.parse::<AddressModel>())
            .collect::<Result<Vec<_>>>()?;
        let routing_path = if self.routing_path.is_empty() {
            self.service_id.clone()
        } else {
            self.routing_path.clone()
        };
        let descriptor =
            ServiceDescriptor::new(&self.service_id, routing_path).with_metadata(self.metadata.clone());
        Ok(ServiceRoute::new(descriptor, addresses))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Command used by every service without an entry in `commands`.
    pub defaults: ServiceCommand,
    /// Per-service overrides; unset keys inherit from `defaults`.
    pub commands: BTreeMap<String, toml::Table>,
    pub health: HealthSettings,
    pub transport: TransportSettings,
    pub routes: Vec<RouteSettings>,
}

impl ClientConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(content).map_err(|e| RpcError::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for service_id in self.commands.keys() {
            self.command_for(service_id)?;
        }
        for route in &self.routes {
            if route.service_id.is_empty() {
                return Err(RpcError::Config("route without service_id".into()));
            }
            route.to_route()?;
        }
        if self.health.failure_threshold == 0 {
            return Err(RpcError::Config("health.failure_threshold must be at least 1".into()));
        }
        if self.health.backoff_multiplier < 1.0 {
            return Err(RpcError::Config("health.backoff_multiplier must be at least 1.0".into()));
        }
        if self.transport.max_frame_size == 0 {
            return Err(RpcError::Config("transport.max_frame_size must be positive".into()));
        }
        Ok(())
    }

    /// Effective command for `service_id`: its overrides merged over the
    /// defaults.
    pub fn command_for(&self, service_id: &str) -> Result<ServiceCommand> {
        let Some(overrides) = self.commands.get(service_id) else {
            return Ok(self.defaults.clone());
        };

        let toml::Value::Table(mut merged) = toml::Value::try_from(&self.defaults)
            .map_err(|e| RpcError::Config(format!("Failed to encode defaults: {}", e)))?
        else {
            return Err(RpcError::Config("defaults did not encode as a table".into()));
        };
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let command: ServiceCommand = toml::Value::Table(merged)
            .try_into()
            .map_err(|e| RpcError::Config(format!("Invalid command for '{}': {}", service_id, e)))?;
        command
            .validate()
            .map_err(|e| RpcError::Config(format!("Command for '{}': {}", service_id, e)))?;
        Ok(command)
    }

    pub fn commands(&self) -> Result<HashMap<String, ServiceCommand>> {
        self.commands
            .keys()
            .map(|id| Ok((id.clone(), self.command_for(id)?)))
            .collect()
    }

    pub fn command_provider(&self) -> Result<ServiceCommandProvider> {
        let provider = ServiceCommandProvider::new(self.defaults.clone());
        provider.replace_all(self.commands()?);
        Ok(provider)
    }

    pub fn routes(&self) -> Result<Vec<ServiceRoute>> {
        self.routes.iter().map(RouteSettings::to_route).collect()
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.health.failure_threshold,
            base_cooldown: Duration::from_millis(self.health.base_cooldown_ms),
            max_cooldown: Duration::from_millis(self.health.max_cooldown_ms),
            backoff_multiplier: self.health.backoff_multiplier,
        }
    }

    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_millis(self.health.check_interval_ms),
            timeout: Duration::from_millis(self.health.check_timeout_ms),
        }
    }

    pub fn channel_config(&self) -> TcpChannelConfig {
        TcpChannelConfig {
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            max_frame_size: self.transport.max_frame_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StrategyType;
    use meshrpc_routing::SelectorMode;

    const SAMPLE: &str = r#"
[defaults]
failover_cluster = 2
execution_timeout_ms = 250

[commands.Echo]
strategy = "FallBack"
fallback_name = "echo-cache"
shunt_strategy = "HashAlgorithm"

[health]
failure_threshold = 5

[transport]
connect_timeout_ms = 100

[[routes]]
service_id = "Echo"
routing_path = "api/echo"
addresses = ["127.0.0.1:9002", "127.0.0.1:9001"]

[[routes]]
service_id = "Secure"
addresses = ["127.0.0.1:9003"]
metadata = { enable_authorization = true, token = "s3cr3t" }
"#;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClientConfig::default());
        assert!(config.routes().unwrap().is_empty());
        assert_eq!(config.command_for("Anything").unwrap(), ServiceCommand::default());
    }

    #[test]
    fn test_overrides_merge_over_defaults() {
        let config = ClientConfig::from_toml_str(SAMPLE).unwrap();

        let echo = config.command_for("Echo").unwrap();
        assert_eq!(echo.strategy, StrategyType::FallBack);
        assert_eq!(echo.fallback_name.as_deref(), Some("echo-cache"));
        assert_eq!(echo.shunt_strategy, SelectorMode::HashAlgorithm);
        // inherited
        assert_eq!(echo.failover_cluster, 2);
        assert_eq!(echo.execution_timeout_ms, 250);

        let other = config.command_for("Other").unwrap();
        assert_eq!(other.strategy, StrategyType::Failover);
        assert_eq!(other.execution_timeout_ms, 250);
    }

    #[test]
    fn test_command_provider() {
        let provider = ClientConfig::from_toml_str(SAMPLE)
            .unwrap()
            .command_provider()
            .unwrap();
        assert_eq!(provider.get("Echo").strategy, StrategyType::FallBack);
        assert_eq!(provider.get("Other").failover_cluster, 2);
    }

    #[test]
    fn test_routes() {
        let config = ClientConfig::from_toml_str(SAMPLE).unwrap();
        let routes = config.routes().unwrap();
        assert_eq!(routes.len(), 2);

        let echo = &routes[0];
        assert_eq!(echo.descriptor.routing_path, "api/echo");
        assert_eq!(
            echo.addresses(),
            &[AddressModel::new("127.0.0.1", 9001), AddressModel::new("127.0.0.1", 9002)]
        );

        let secure = &routes[1];
        assert_eq!(secure.descriptor.routing_path, "Secure");
        assert_eq!(secure.descriptor.authorization_token(), Some("s3cr3t"));
    }

    #[test]
    fn test_settings_conversion() {
        let config = ClientConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.health_config().failure_threshold, 5);
        assert_eq!(config.health_config().base_cooldown, Duration::from_secs(10));
        assert_eq!(config.channel_config().connect_timeout, Duration::from_millis(100));
        assert_eq!(config.health_check_config().interval, Duration::from_secs(5));
    }

    #[test]
    fn test_validation_errors() {
        let err = ClientConfig::from_toml_str("[defaults]\nfailover_cluster = 0\n").unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));

        let err = ClientConfig::from_toml_str(
            "[commands.Echo]\ncircuit_breaker_error_threshold_percentage = 150\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Echo"));

        let err = ClientConfig::from_toml_str("[commands.Echo]\nstrategy = \"FallBack\"\n").unwrap_err();
        assert!(err.to_string().contains("fallback_name"));

        let err = ClientConfig::from_toml_str(
            "[[routes]]\nservice_id = \"Echo\"\naddresses = [\"nope\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope"));

        assert!(ClientConfig::from_toml_str("not toml at all [").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = ClientConfig::load(&path).unwrap();
        assert_eq!(config.routes.len(), 2);

        let missing = ClientConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(missing.to_string().contains("missing.toml"));
    }
}
