//! End-to-end tests of the cluster invoker against loopback servers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{dead_address, harness, route, spawn_server, Behavior};
use meshrpc_client::{
    ClusterInvoker, ConnectionFactory, Connector, Diagnostics, FallbackHandler, ServiceCommand, StaticFallback,
    StrategyType, TransportClient,
};
use meshrpc_common::protocol::error::Result;
use meshrpc_common::{AddressModel, RpcError, ServiceMetadata, ServiceRoute};
use meshrpc_resilience::CircuitBreakerState;
use meshrpc_routing::{AddressResolver, DiscoveryRefresher, HealthTracker, RouteTable, SelectorMode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn port_of(value: &Value) -> u64 {
    value["port"].as_u64().unwrap()
}

#[tokio::test]
async fn test_echo_round_robin_over_two_addresses() {
    let a = spawn_server(Behavior::Echo).await;
    let b = spawn_server(Behavior::Echo).await;
    let h = harness(
        vec![route("Echo", [a.address.clone(), b.address.clone()])],
        ServiceCommand::default(),
    );

    let mut ports = Vec::new();
    for i in 0..4 {
        let value = h.invoker.call("Echo", json!({"text": i})).await.unwrap();
        assert_eq!(value["params"], json!({"text": i}));
        ports.push(port_of(&value));
    }

    assert_ne!(ports[0], ports[1]);
    assert_eq!(ports[0], ports[2]);
    assert_eq!(ports[1], ports[3]);
    assert_eq!(a.requests(), 2);
    assert_eq!(b.requests(), 2);
    assert_eq!(h.connections.len(), 2);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let server = spawn_server(Behavior::Echo).await;
    let h = harness(
        vec![route("Echo", [server.address.clone()])],
        ServiceCommand::default(),
    );

    let invoker = &h.invoker;
    let calls = (0..20usize).map(|n| async move { invoker.call("Echo", json!({"n": n})).await });
    let results = futures::future::join_all(calls).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap()["params"], json!({"n": n}));
    }
    assert_eq!(h.connections.len(), 1);
    assert_eq!(server.requests(), 20);
}

#[tokio::test]
async fn test_hash_selection_is_sticky_per_routing_key() {
    let servers = [
        spawn_server(Behavior::Echo).await,
        spawn_server(Behavior::Echo).await,
        spawn_server(Behavior::Echo).await,
    ];
    let command = ServiceCommand {
        shunt_strategy: SelectorMode::HashAlgorithm,
        ..Default::default()
    };
    let h = harness(
        vec![route("Echo", servers.iter().map(|s| s.address.clone()))],
        command,
    );

    let cancel = CancellationToken::new();
    let mut ports = Vec::new();
    for _ in 0..5 {
        let value = h
            .invoker
            .invoke("Echo", Some("user-42"), json!({}), None, &cancel)
            .await
            .unwrap();
        assert_eq!(value["routing_key"], "user-42");
        ports.push(port_of(&value));
    }
    assert!(ports.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn test_failover_skips_dead_addresses() {
    let live = spawn_server(Behavior::Echo).await;
    let dead1 = dead_address().await;
    let dead2 = dead_address().await;
    let h = harness(
        vec![route("Echo", [dead1.clone(), dead2.clone(), live.address.clone()])],
        ServiceCommand::default(),
    );

    let value = h.invoker.call("Echo", json!({})).await.unwrap();
    assert_eq!(port_of(&value), u64::from(live.address.port));
    assert!(h.health.is_healthy(&live.address));
}

#[tokio::test]
async fn test_failover_exhaustion_marks_every_address() {
    let dead = [dead_address().await, dead_address().await, dead_address().await];
    let h = harness(vec![route("Echo", dead.clone())], ServiceCommand::default());

    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert!(err.is_communication(), "unexpected error: {err}");

    for address in &dead {
        let record = h.health.record(address).unwrap();
        assert_eq!(record.consecutive_failures, 1, "{address} attempted once");
    }
}

#[tokio::test]
async fn test_remote_error_is_not_failed_over() {
    let failing = spawn_server(Behavior::Fail(500)).await;
    let h = harness(
        vec![route("Echo", [failing.address.clone()])],
        ServiceCommand::default(),
    );

    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert_eq!(err, RpcError::remote(500, "service failed"));
    assert_eq!(failing.requests(), 1);
    assert!(h.health.is_healthy(&failing.address));
}

#[tokio::test]
async fn test_fallback_takes_precedence_over_remote_error() {
    let failing = spawn_server(Behavior::Fail(503)).await;
    let command = ServiceCommand {
        strategy: StrategyType::FallBack,
        fallback_name: Some("cached-echo".into()),
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [failing.address.clone()])], command);

    // No handler registered yet: the original error surfaces.
    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert_eq!(err, RpcError::remote(503, "service failed"));

    h.invoker
        .fallbacks()
        .register("cached-echo", Arc::new(StaticFallback(json!({"cached": true}))));
    let value = h.invoker.call("Echo", json!({})).await.unwrap();
    assert_eq!(value, json!({"cached": true}));
}

struct EchoParameters;

#[async_trait]
impl FallbackHandler for EchoParameters {
    async fn invoke(&self, service_id: &str, parameters: &Value) -> Result<Value> {
        Ok(json!({"service": service_id, "params": parameters}))
    }
}

#[tokio::test]
async fn test_fallback_receives_original_parameters() {
    let command = ServiceCommand {
        strategy: StrategyType::FallBack,
        fallback_name: Some("echo-params".into()),
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [dead_address().await])], command);
    h.invoker.fallbacks().register("echo-params", Arc::new(EchoParameters));

    let value = h.invoker.call("Echo", json!({"text": "hi"})).await.unwrap();
    assert_eq!(value, json!({"service": "Echo", "params": {"text": "hi"}}));
}

#[tokio::test]
async fn test_injection_answers_with_expression() {
    let command = ServiceCommand {
        strategy: StrategyType::Injection,
        injection: Some("{ text: params.text, degraded: true, reason: error.kind }".into()),
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [dead_address().await])], command);

    let value = h.invoker.call("Echo", json!({"text": "hi"})).await.unwrap();
    assert_eq!(
        value,
        json!({"text": "hi", "degraded": true, "reason": "communication"})
    );
}

#[tokio::test]
async fn test_injection_errors_propagate() {
    let command = ServiceCommand {
        strategy: StrategyType::Injection,
        injection: Some("nope.text".into()),
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [dead_address().await])], command);

    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::Injection(_)));
}

#[tokio::test]
async fn test_breaker_opens_after_three_failures() {
    let dead = dead_address().await;
    let command = ServiceCommand {
        failover_cluster: 1,
        circuit_breaker_request_volume_threshold: 3,
        circuit_breaker_error_threshold_percentage: 0,
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [dead.clone()])], command);

    let mut last = None;
    for _ in 0..3 {
        last = Some(h.invoker.call("Echo", json!({})).await.unwrap_err());
    }
    let breaker = h.invoker.breakers().get("Echo").unwrap();
    assert_eq!(breaker.state(), CircuitBreakerState::Open);

    // Short-circuited: same error, no new attempt.
    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert_eq!(Some(err), last);
    assert_eq!(h.health.record(&dead).unwrap().consecutive_failures, 3);
}

#[tokio::test]
async fn test_forced_open_breaker_rejects_without_calling() {
    let server = spawn_server(Behavior::Echo).await;
    let command = ServiceCommand {
        circuit_breaker_force_open: true,
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [server.address.clone()])], command);

    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert_eq!(err, RpcError::CircuitOpen("Echo".into()));
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn test_execution_timeout_bounds_each_attempt() {
    let slow = spawn_server(Behavior::Delay(Duration::from_millis(500))).await;
    let command = ServiceCommand {
        failover_cluster: 1,
        execution_timeout_ms: 100,
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [slow.address.clone()])], command);

    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout(100));
    assert_eq!(h.health.record(&slow.address).unwrap().consecutive_failures, 1);
}

#[tokio::test]
async fn test_caller_deadline_bounds_the_whole_call() {
    let slow = spawn_server(Behavior::Delay(Duration::from_millis(500))).await;
    let h = harness(
        vec![route("Echo", [slow.address.clone()])],
        ServiceCommand::default(),
    );

    let started = Instant::now();
    let err = h
        .invoker
        .invoke(
            "Echo",
            None,
            json!({}),
            Some(Duration::from_millis(150)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[tokio::test]
async fn test_cancellation_abandons_the_call() {
    let slow = spawn_server(Behavior::Delay(Duration::from_millis(500))).await;
    let command = ServiceCommand {
        strategy: StrategyType::FallBack,
        fallback_name: Some("never".into()),
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [slow.address.clone()])], command);
    h.invoker
        .fallbacks()
        .register("never", Arc::new(StaticFallback(json!("fallback"))));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = h
        .invoker
        .invoke("Echo", None, json!({}), None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(450));
}

#[tokio::test]
async fn test_concurrency_limit_rejects_with_overloaded() {
    let slow = spawn_server(Behavior::Delay(Duration::from_millis(300))).await;
    let command = ServiceCommand {
        max_concurrent_requests: 1,
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [slow.address.clone()])], command);

    let invoker = Arc::clone(&h.invoker);
    let first = tokio::spawn(async move { invoker.call("Echo", json!({})).await });
    while slow.requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = h.invoker.call("Echo", json!({})).await.unwrap_err();
    assert_eq!(
        err,
        RpcError::Overloaded {
            service_id: "Echo".into(),
            limit: 1
        }
    );

    first.await.unwrap().unwrap();
    // The slot is free again.
    h.invoker.call("Echo", json!({})).await.unwrap();
}

#[tokio::test]
async fn test_authorization_token_is_attached() {
    let server = spawn_server(Behavior::Echo).await;
    let mut secure = route("Secure", [server.address.clone()]);
    secure.descriptor.metadata = ServiceMetadata {
        enable_authorization: true,
        token: Some("s3cr3t".into()),
        ..Default::default()
    };
    let h = harness(
        vec![secure, route("Open", [server.address.clone()])],
        ServiceCommand::default(),
    );

    let value = h.invoker.call("Secure", json!({})).await.unwrap();
    assert_eq!(value["token"], "s3cr3t");

    let value = h.invoker.call("Open", json!({})).await.unwrap();
    assert_eq!(value["token"], Value::Null);
}

#[tokio::test]
async fn test_local_only_service_is_rejected() {
    let server = spawn_server(Behavior::Echo).await;
    let mut local = route("Local", [server.address.clone()]);
    local.descriptor.metadata.disable_network = true;
    let h = harness(vec![local], ServiceCommand::default());

    let err = h.invoker.call("Local", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::Resolution { .. }));
    assert_eq!(server.requests(), 0);
}

#[tokio::test]
async fn test_unknown_service_is_a_resolution_error() {
    let h = harness(vec![], ServiceCommand::default());
    let err = h.invoker.call("Missing", json!({})).await.unwrap_err();
    assert_eq!(err, RpcError::resolution("Missing", "no route registered"));
}

/// Publishes a route into the table when asked to refresh.
struct PublishOnRefresh {
    table: Arc<RouteTable>,
    route: ServiceRoute,
    refreshes: AtomicUsize,
}

#[async_trait]
impl DiscoveryRefresher for PublishOnRefresh {
    async fn refresh(&self, _service_id: &str) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.table.set_routes([self.route.clone()]);
    }
}

#[tokio::test]
async fn test_route_miss_triggers_discovery_refresh() {
    let server = spawn_server(Behavior::Echo).await;
    let h = harness(vec![], ServiceCommand::default());

    let refresher = Arc::new(PublishOnRefresh {
        table: Arc::clone(&h.table),
        route: route("Echo", [server.address.clone()]),
        refreshes: AtomicUsize::new(0),
    });
    let resolver = Arc::new(AddressResolver::new(
        Arc::clone(&h.table),
        Arc::new(HealthTracker::default()),
        refresher.clone(),
    ));
    let invoker = ClusterInvoker::new(
        resolver,
        Arc::clone(&h.connections),
        Arc::clone(h.invoker.commands()),
    );

    invoker.call("Echo", json!({})).await.unwrap();
    invoker.call("Echo", json!({})).await.unwrap();
    assert_eq!(refresher.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failover_sees_addresses_added_mid_call() {
    let slow = spawn_server(Behavior::Delay(Duration::from_millis(500))).await;
    let fresh = spawn_server(Behavior::Echo).await;
    let command = ServiceCommand {
        failover_cluster: 2,
        execution_timeout_ms: 200,
        ..Default::default()
    };
    let h = harness(vec![route("Echo", [slow.address.clone()])], command);

    let call = tokio::spawn({
        let invoker = Arc::clone(&h.invoker);
        async move { invoker.call("Echo", json!({})).await }
    });
    while slow.requests() == 0 {
        tokio::task::yield_now().await;
    }
    h.table
        .set_routes([route("Echo", [slow.address.clone(), fresh.address.clone()])]);

    let value = call.await.unwrap().unwrap();
    assert_eq!(port_of(&value), u64::from(fresh.address.port));
    assert_eq!(fresh.requests(), 1);
}

/// Connector that takes far longer than any caller here is willing to wait.
struct SlowConnector;

#[async_trait]
impl Connector for SlowConnector {
    async fn connect(&self, address: &AddressModel, _diagnostics: Arc<Diagnostics>) -> Result<Arc<TransportClient>> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Err(RpcError::communication(address.to_string(), "connect timed out"))
    }
}

#[tokio::test]
async fn test_caller_deadline_bounds_a_slow_connect() {
    let h = harness(
        vec![route("Echo", [AddressModel::new("10.0.0.1", 9001)])],
        ServiceCommand::default(),
    );
    let connections = Arc::new(ConnectionFactory::new(Arc::new(SlowConnector), Arc::new(Diagnostics::new())));
    let invoker = ClusterInvoker::new(
        Arc::clone(h.invoker.resolver()),
        connections,
        Arc::clone(h.invoker.commands()),
    );

    let started = Instant::now();
    let err = invoker
        .invoke(
            "Echo",
            None,
            json!({}),
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)), "unexpected error: {err}");
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Discovery that never answers in time.
struct StalledRefresher;

#[async_trait]
impl DiscoveryRefresher for StalledRefresher {
    async fn refresh(&self, _service_id: &str) {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

#[tokio::test]
async fn test_caller_deadline_bounds_discovery_refresh() {
    let h = harness(vec![], ServiceCommand::default());
    let resolver = Arc::new(AddressResolver::new(
        Arc::clone(&h.table),
        Arc::new(HealthTracker::default()),
        Arc::new(StalledRefresher),
    ));
    let invoker = ClusterInvoker::new(resolver, Arc::clone(&h.connections), Arc::clone(h.invoker.commands()));

    let started = Instant::now();
    let err = invoker
        .invoke(
            "Echo",
            None,
            json!({}),
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout(100));
    assert!(started.elapsed() < Duration::from_secs(1));
}
