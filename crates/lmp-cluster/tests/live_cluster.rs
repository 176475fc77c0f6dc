//! ---
//! lmp_section: "05-networking-external-interfaces"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Cluster adapters backing the chaos engine capability set."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use indexmap::IndexMap;
use lmp_chaos::{ClusterControl, ClusterError, Effect, HealthStatus, ScenarioCategory, Severity};
use lmp_cluster::{CommandControl, ElasticsearchHealth, LiveCluster};
use lmp_common::config::CommandTemplate;
use serde_json::json;
use tokio::net::TcpListener;

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn fake_elasticsearch(status: &'static str, nodes: &'static [&'static str]) -> Router {
    Router::new()
        .route(
            "/_cluster/health",
            get(move || async move {
                Json(json!({
                    "cluster_name": "logs",
                    "status": status,
                    "number_of_nodes": nodes.len(),
                    "timed_out": false
                }))
            }),
        )
        .route(
            "/_cat/nodes",
            get(move || async move {
                Json(
                    nodes
                        .iter()
                        .map(|name| json!({ "name": name }))
                        .collect::<Vec<_>>(),
                )
            }),
        )
}

fn expected_nodes() -> Vec<String> {
    vec!["es1".into(), "es2".into(), "es3".into()]
}

fn effect(category: ScenarioCategory) -> Effect {
    Effect {
        scenario_id: "node-down-es2".into(),
        category,
        severity: Severity::Medium,
        duration: None,
        settings: IndexMap::new(),
    }
}

#[tokio::test]
async fn missing_nodes_are_reported_unhealthy() {
    let addr = serve(fake_elasticsearch("yellow", &["es1", "es3"])).await;
    let probe = ElasticsearchHealth::new(
        &format!("http://{addr}"),
        expected_nodes(),
        Duration::from_secs(2),
    )
    .unwrap();

    let snapshot = probe.snapshot().await.unwrap();
    assert_eq!(snapshot.status, HealthStatus::Yellow);
    assert!(!snapshot.target_healthy("es2"));
    assert!(snapshot.target_healthy("es1"));
    assert_eq!(snapshot.unhealthy_targets.len(), 1);
}

#[tokio::test]
async fn error_status_is_an_http_error() {
    let router = Router::new().route(
        "/_cluster/health",
        get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "master not discovered") }),
    );
    let addr = serve(router).await;
    let probe =
        ElasticsearchHealth::new(&format!("http://{addr}"), Vec::new(), Duration::from_secs(2)).unwrap();

    let err = probe.snapshot().await.unwrap_err();
    assert!(matches!(err, ClusterError::Http(_)), "{err:?}");
}

#[tokio::test]
async fn unreachable_cluster_is_unavailable() {
    // Bind then drop so the port is closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let probe =
        ElasticsearchHealth::new(&format!("http://{addr}"), Vec::new(), Duration::from_secs(2)).unwrap();
    let err = probe.snapshot().await.unwrap_err();
    assert!(matches!(err, ClusterError::Unavailable(_)), "{err:?}");
}

#[tokio::test]
async fn commands_apply_and_revert_through_the_shell() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("down");
    let mut commands = IndexMap::new();
    commands.insert(
        "node-failure".to_string(),
        CommandTemplate {
            apply: format!("echo {{target}} > {}", marker.display()),
            revert: format!("rm {}", marker.display()),
        },
    );

    let addr = serve(fake_elasticsearch("green", &["es1", "es2", "es3"])).await;
    let health = ElasticsearchHealth::new(
        &format!("http://{addr}"),
        expected_nodes(),
        Duration::from_secs(2),
    )
    .unwrap();
    let cluster = LiveCluster::new(health, CommandControl::new("sh", commands, Duration::from_secs(5)));

    cluster
        .apply_effect("es2", &effect(ScenarioCategory::NodeFailure))
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "es2");

    cluster.revert_effect("es2").await.unwrap();
    assert!(!marker.exists());
    // Second revert has nothing left to undo.
    cluster.revert_effect("es2").await.unwrap();

    let overview = cluster.overview().await.unwrap();
    assert_eq!(overview.status, HealthStatus::Green);
    assert!(overview.unhealthy_targets.is_empty());
}

#[tokio::test]
async fn failing_command_is_reported_and_not_remembered() {
    let mut commands = IndexMap::new();
    commands.insert(
        "network-partition".to_string(),
        CommandTemplate {
            apply: "echo blocked >&2; false".into(),
            revert: "true".into(),
        },
    );
    let control = CommandControl::new("sh", commands, Duration::from_secs(5));

    let err = control
        .apply("es1", &effect(ScenarioCategory::NetworkPartition))
        .await
        .unwrap_err();
    match err {
        ClusterError::Command(message) => assert!(message.contains("blocked")),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(control.active_targets().is_empty());
}

#[tokio::test]
async fn slow_command_times_out() {
    let mut commands = IndexMap::new();
    commands.insert(
        "resource-exhaustion".to_string(),
        CommandTemplate {
            apply: "sleep 5".into(),
            revert: "true".into(),
        },
    );
    let control = CommandControl::new("sh", commands, Duration::from_millis(200));

    let err = control
        .apply("es1", &effect(ScenarioCategory::ResourceExhaustion))
        .await
        .unwrap_err();
    assert_eq!(err, ClusterError::Timeout(Duration::from_millis(200)));
}
