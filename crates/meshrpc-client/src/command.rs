//! Per-service resilience settings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_resilience::CircuitBreakerConfig;
use meshrpc_routing::SelectorMode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Recovery applied once a call has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StrategyType {
    /// Retry communication failures against other addresses.
    #[default]
    Failover,
    /// Answer with the value of the configured recovery expression.
    Injection,
    /// Call the registered fallback handler.
    FallBack,
}

/// Resilience settings for one service.
///
/// Commands are immutable once published; the provider swaps whole values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCommand {
    /// Attempts made by the Failover strategy, the first one included.
    pub failover_cluster: u32,
    /// Consecutive failures that open the circuit; also the minimum number
    /// of sampled calls before the error percentage is considered.
    pub circuit_breaker_request_volume_threshold: u32,
    /// Error percentage that opens the circuit. Zero disables rate tripping.
    pub circuit_breaker_error_threshold_percentage: u8,
    pub circuit_breaker_sleep_window_ms: u64,
    pub circuit_breaker_sampling_window_ms: u64,
    pub circuit_breaker_force_open: bool,
    pub breaker_force_closed: bool,
    /// Per-attempt timeout.
    pub execution_timeout_ms: u64,
    /// In-flight calls allowed for the service. Zero means unlimited.
    pub max_concurrent_requests: usize,
    pub strategy: StrategyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection: Option<String>,
    pub shunt_strategy: SelectorMode,
}

impl Default for ServiceCommand {
    fn default() -> Self {
        Self {
            failover_cluster: 3,
            circuit_breaker_request_volume_threshold: 20,
            circuit_breaker_error_threshold_percentage: 50,
            circuit_breaker_sleep_window_ms: 5_000,
            circuit_breaker_sampling_window_ms: 10_000,
            circuit_breaker_force_open: false,
            breaker_force_closed: false,
            execution_timeout_ms: 1_000,
            max_concurrent_requests: 200,
            strategy: StrategyType::Failover,
            fallback_name: None,
            injection: None,
            shunt_strategy: SelectorMode::Polling,
        }
    }
}

impl ServiceCommand {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    /// Attempts made for one call under this command's strategy.
    pub fn attempts(&self) -> u32 {
        match self.strategy {
            StrategyType::Failover => self.failover_cluster.max(1),
            StrategyType::Injection | StrategyType::FallBack => 1,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        let percentage = self.circuit_breaker_error_threshold_percentage;
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_request_volume_threshold,
            break_duration: Duration::from_millis(self.circuit_breaker_sleep_window_ms),
            error_threshold_percentage: (percentage > 0).then_some(percentage),
            sampling_window: Duration::from_millis(self.circuit_breaker_sampling_window_ms),
            minimum_throughput: self.circuit_breaker_request_volume_threshold,
            force_open: self.circuit_breaker_force_open,
            force_closed: self.breaker_force_closed,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.failover_cluster == 0 {
            return Err(RpcError::Config("failover_cluster must be at least 1".into()));
        }
        if self.execution_timeout_ms == 0 {
            return Err(RpcError::Config("execution_timeout_ms must be positive".into()));
        }
        if self.circuit_breaker_request_volume_threshold == 0 {
            return Err(RpcError::Config(
                "circuit_breaker_request_volume_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker_error_threshold_percentage > 100 {
            return Err(RpcError::Config(format!(
                "circuit_breaker_error_threshold_percentage {} is above 100",
                self.circuit_breaker_error_threshold_percentage
            )));
        }
        if self.circuit_breaker_force_open && self.breaker_force_closed {
            return Err(RpcError::Config(
                "circuit breaker cannot be forced open and closed at once".into(),
            ));
        }
        if self.strategy == StrategyType::FallBack && self.fallback_name.is_none() {
            return Err(RpcError::Config("FallBack strategy requires fallback_name".into()));
        }
        if self.strategy == StrategyType::Injection && self.injection.is_none() {
            return Err(RpcError::Config("Injection strategy requires an injection expression".into()));
        }
        Ok(())
    }
}

type CommandMap = HashMap<String, Arc<ServiceCommand>>;

/// Source of the [`ServiceCommand`] in force for each service.
///
/// Lookups are lock-free snapshot reads. Services without their own command
/// get the global defaults.
#[derive(Debug)]
pub struct ServiceCommandProvider {
    defaults: ArcSwap<ServiceCommand>,
    commands: ArcSwap<CommandMap>,
}

impl Default for ServiceCommandProvider {
    fn default() -> Self {
        Self::new(ServiceCommand::default())
    }
}

impl ServiceCommandProvider {
    pub fn new(defaults: ServiceCommand) -> Self {
        Self {
            defaults: ArcSwap::from_pointee(defaults),
            commands: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, service_id: &str) -> Arc<ServiceCommand> {
        self.commands
            .load()
            .get(service_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.load_full())
    }

    pub fn defaults(&self) -> Arc<ServiceCommand> {
        self.defaults.load_full()
    }

    pub fn set_defaults(&self, defaults: ServiceCommand) {
        self.defaults.store(Arc::new(defaults));
    }

    /// Publishes a new command for `service_id`, replacing any previous one.
    pub fn set(&self, service_id: &str, command: ServiceCommand) {
        let command = Arc::new(command);
        self.commands.rcu(|current| {
            let mut next = CommandMap::clone(current);
            next.insert(service_id.to_string(), Arc::clone(&command));
            next
        });
        debug!(service_id, "service command replaced");
    }

    /// Drops the service-specific command; the defaults apply again.
    pub fn remove(&self, service_id: &str) {
        self.commands.rcu(|current| {
            let mut next = CommandMap::clone(current);
            next.remove(service_id);
            next
        });
    }

    /// Replaces every service-specific command at once.
    pub fn replace_all(&self, commands: HashMap<String, ServiceCommand>) {
        let next: CommandMap = commands
            .into_iter()
            .map(|(id, command)| (id, Arc::new(command)))
            .collect();
        self.commands.store(Arc::new(next));
    }
}
