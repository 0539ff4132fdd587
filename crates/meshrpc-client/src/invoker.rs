//! The full client call path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meshrpc_common::protocol::error::{Result, RpcError};
use meshrpc_common::{AddressModel, InvokeRequest, ServiceRoute};
use meshrpc_resilience::{CircuitBreakers, Policy};
use meshrpc_routing::AddressResolver;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{ServiceCommand, ServiceCommandProvider, StrategyType};
use crate::connection::ConnectionFactory;
use crate::fallback::FallbackRegistry;
use crate::injection::{InjectionContext, InjectionEvaluator, ScriptEvaluator};

/// Everything one call needs once its command and route are known.
struct CallContext<'a> {
    service_id: &'a str,
    routing_key: Option<&'a str>,
    parameters: &'a Value,
    command: &'a ServiceCommand,
    route: &'a ServiceRoute,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

/// Resolves, invokes and recovers calls to remote services.
///
/// A call goes through these steps:
///
/// 1. The service's [`ServiceCommand`] is read and a concurrency slot taken
///    (`Overloaded` when none is free).
/// 2. The route is resolved; `disable_network` services are refused.
/// 3. Under the per-service circuit breaker, attempts are made against
///    addresses picked by the resolver. Communication failures move on to a
///    different address until the command's attempts are used up.
/// 4. If the call still failed, the command's strategy may recover it
///    (injection expression or fallback handler).
pub struct ClusterInvoker {
    resolver: Arc<AddressResolver>,
    connections: Arc<ConnectionFactory>,
    commands: Arc<ServiceCommandProvider>,
    fallbacks: Arc<FallbackRegistry>,
    injector: Arc<dyn InjectionEvaluator>,
    breakers: CircuitBreakers,
    limits: DashMap<String, (usize, Arc<Semaphore>)>,
}

impl ClusterInvoker {
    pub fn new(
        resolver: Arc<AddressResolver>,
        connections: Arc<ConnectionFactory>,
        commands: Arc<ServiceCommandProvider>,
    ) -> Self {
        Self {
            resolver,
            connections,
            commands,
            fallbacks: Arc::new(FallbackRegistry::new()),
            injector: Arc::new(ScriptEvaluator),
            breakers: CircuitBreakers::new(),
            limits: DashMap::new(),
        }
    }

    pub fn with_fallbacks(mut self, fallbacks: Arc<FallbackRegistry>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn with_injector(mut self, injector: Arc<dyn InjectionEvaluator>) -> Self {
        self.injector = injector;
        self
    }

    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.resolver
    }

    pub fn commands(&self) -> &Arc<ServiceCommandProvider> {
        &self.commands
    }

    pub fn fallbacks(&self) -> &Arc<FallbackRegistry> {
        &self.fallbacks
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Calls `service_id` without a routing key, deadline or cancellation.
    pub async fn call(&self, service_id: &str, parameters: Value) -> Result<Value> {
        self.invoke(service_id, None, parameters, None, &CancellationToken::new())
            .await
    }

    /// Invokes `service_id` with `parameters`.
    ///
    /// `timeout` bounds the whole call including failover; each attempt is
    /// further bounded by the command's execution timeout. Cancelling
    /// `cancellation` abandons the call with [`RpcError::Cancelled`] and no
    /// recovery.
    pub async fn invoke(
        &self,
        service_id: &str,
        routing_key: Option<&str>,
        parameters: Value,
        timeout: Option<Duration>,
        cancellation: &CancellationToken,
    ) -> Result<Value> {
        let command = self.commands.get(service_id);
        let deadline = timeout.map(|t| Instant::now() + t);

        let outcome = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(RpcError::Cancelled),
            outcome = self.invoke_guarded(service_id, routing_key, &parameters, &command, deadline, timeout) => outcome,
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(error) => {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => Err(RpcError::Cancelled),
                    recovered = self.recover(service_id, &parameters, &command, error) => recovered,
                }
            }
        }
    }

    async fn invoke_guarded(
        &self,
        service_id: &str,
        routing_key: Option<&str>,
        parameters: &Value,
        command: &ServiceCommand,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let _slot = self.acquire_slot(service_id, command)?;

        debug!(service_id, "resolving");
        // A route miss waits on discovery; it counts against the deadline.
        let route = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.resolver.route(service_id))
                .await
                .map_err(|_| RpcError::Timeout(timeout.unwrap_or_default().as_millis() as u64))??,
            None => self.resolver.route(service_id).await?,
        };
        if route.descriptor.metadata.disable_network {
            return Err(RpcError::resolution(service_id, "service does not accept remote calls"));
        }

        let ctx = CallContext {
            service_id,
            routing_key,
            parameters,
            command,
            route: &route,
            deadline,
            timeout,
        };
        let ctx = &ctx;

        let breaker = self.breakers.get_or_create(service_id, &command.breaker_config());
        breaker.execute(move || self.failover(ctx)).await
    }

    /// Tries addresses until one answers or the attempts run out.
    async fn failover(&self, ctx: &CallContext<'_>) -> Result<Value> {
        let health = self.resolver.health();
        let attempts = ctx.command.attempts();
        let mut tried: Vec<AddressModel> = Vec::new();
        let mut last_error = None;

        for attempt in 1..=attempts {
            let attempt_timeout = self.attempt_timeout(ctx)?;
            // Addresses may be added or withdrawn while failing over.
            let current = self.resolver.table().get_route(ctx.service_id);
            let route = current.as_deref().unwrap_or(ctx.route);
            let address = self.resolver.select_from(
                route,
                ctx.routing_key,
                ctx.command.shunt_strategy,
                &tried,
            )?;

            debug!(service_id = ctx.service_id, address = %address, attempt, "invoking");
            match self.attempt(ctx, &address, attempt_timeout).await {
                Ok(value) => {
                    health.mark_success(&address);
                    return Ok(value);
                }
                Err(error) if error.is_communication() => {
                    health.mark_failure(&address);
                    warn!(
                        service_id = ctx.service_id,
                        address = %address,
                        attempt,
                        attempts,
                        error = %error,
                        "attempt failed"
                    );
                    tried.push(address);
                    last_error = Some(error);
                }
                Err(error) => {
                    // The peer answered; it is reachable even though the call failed.
                    if error.is_remote() {
                        health.mark_success(&address);
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::resolution(ctx.service_id, "no attempt was made")))
    }

    async fn attempt(&self, ctx: &CallContext<'_>, address: &AddressModel, timeout: Duration) -> Result<Value> {
        let mut request = InvokeRequest::new(ctx.service_id, ctx.parameters.clone())
            .with_timeout(timeout.as_millis() as u64);
        if let Some(key) = ctx.routing_key {
            request = request.with_routing_key(key);
        }
        if let Some(token) = ctx.route.descriptor.authorization_token() {
            request = request.with_token(token);
        }

        // Connecting is part of the attempt and shares its timeout.
        let exchange = async {
            let client = self.connections.client(address).await?;
            client.send(request, timeout).await
        };
        let response = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout(timeout.as_millis() as u64))??;
        response.into_result()
    }

    /// Per-attempt timeout: the execution timeout, shortened to what is left
    /// of the caller's deadline.
    fn attempt_timeout(&self, ctx: &CallContext<'_>) -> Result<Duration> {
        let execution = ctx.command.execution_timeout();
        let Some(deadline) = ctx.deadline else {
            return Ok(execution);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let total = ctx.timeout.unwrap_or(execution);
            return Err(RpcError::Timeout(total.as_millis() as u64));
        }
        Ok(execution.min(remaining))
    }

    async fn recover(
        &self,
        service_id: &str,
        parameters: &Value,
        command: &ServiceCommand,
        error: RpcError,
    ) -> Result<Value> {
        match command.strategy {
            StrategyType::Failover => Err(error),
            StrategyType::Injection => {
                let Some(expression) = command.injection.as_deref() else {
                    return Err(error);
                };
                info!(service_id, error = %error, "recovering with injection");
                self.injector.evaluate(
                    expression,
                    &InjectionContext {
                        service_id,
                        parameters,
                        error: &error,
                    },
                )
            }
            StrategyType::FallBack => {
                let handler = command
                    .fallback_name
                    .as_deref()
                    .and_then(|name| self.fallbacks.get(name));
                let Some(handler) = handler else {
                    debug!(service_id, "no fallback handler registered");
                    return Err(error);
                };
                info!(service_id, error = %error, "recovering with fallback");
                handler.invoke(service_id, parameters).await
            }
        }
    }

    fn acquire_slot(&self, service_id: &str, command: &ServiceCommand) -> Result<Option<OwnedSemaphorePermit>> {
        let limit = command.max_concurrent_requests;
        if limit == 0 {
            return Ok(None);
        }

        let semaphore = {
            let mut entry = self
                .limits
                .entry(service_id.to_string())
                .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit))));
            if entry.0 != limit {
                *entry = (limit, Arc::new(Semaphore::new(limit)));
            }
            Arc::clone(&entry.1)
        };

        semaphore.try_acquire_owned().map(Some).map_err(|_| {
            warn!(service_id, limit, "service overloaded, rejecting call");
            RpcError::Overloaded {
                service_id: service_id.to_string(),
                limit,
            }
        })
    }
}

impl std::fmt::Debug for ClusterInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInvoker")
            .field("routes", &self.resolver.table().len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
