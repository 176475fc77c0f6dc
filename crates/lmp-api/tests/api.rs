//! ---
//! lmp_section: "05-networking-external-interfaces"
//! lmp_subsection: "module"
//! lmp_type: "source"
//! lmp_scope: "code"
//! lmp_description: "Operator API for the chaos engine."
//! lmp_version: "v0.0.0-prealpha"
//! lmp_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use lmp_api::{spawn_api_server, ApiServer, ApiState};
use lmp_chaos::{ChaosEngine, ClusterError};
use lmp_testharness::{engine_with, scenario, HealthStep, ScriptedCluster};
use reqwest::StatusCode;
use serde_json::Value;

fn start(engine: Arc<ChaosEngine>) -> ApiServer {
    let state = Arc::new(ApiState::new(engine, "Chaos Engine API", "0.1.0-test"));
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    spawn_api_server(state, addr, &["*".to_string()]).unwrap()
}

fn url(server: &ApiServer, path: &str) -> String {
    format!("http://{}{}", server.addr(), path)
}

#[tokio::test]
async fn root_lists_endpoints_and_scenarios_report_busy_targets() {
    let cluster = ScriptedCluster::new();
    cluster.fallback(HealthStep::unhealthy("es1"));
    let engine = engine_with(
        &cluster,
        &[scenario("node-down-es1", "es1"), scenario("node-down-es2", "es2")],
    );
    let server = start(engine.clone());
    let client = reqwest::Client::new();

    let root: Value = client.get(url(&server, "/")).send().await.unwrap().json().await.unwrap();
    assert_eq!(root["name"], "Chaos Engine API");
    assert_eq!(root["version"], "0.1.0-test");
    assert_eq!(root["endpoints"]["incidents"], "/api/incidents");

    let id = engine.trigger_now("node-down-es1").await.unwrap();
    let scenarios: Vec<Value> = client
        .get(url(&server, "/api/scenarios"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(scenarios.len(), 2);
    assert_eq!(scenarios[0]["id"], "node-down-es1");
    assert_eq!(scenarios[0]["busy"], true);
    assert_eq!(scenarios[1]["busy"], false);

    engine.abort(id).unwrap();
    engine.await_resolution(id).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn trigger_then_read_the_incident() {
    let cluster = ScriptedCluster::new();
    cluster.unhealthy_for("es1", 5);
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);
    let server = start(engine.clone());
    let client = reqwest::Client::new();

    let response = client
        .post(url(&server, "/api/scenarios/node-down-es1/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["target"], "es1");
    let incident = accepted["incident_id"].as_str().unwrap().to_string();

    let busy = client
        .post(url(&server, "/api/scenarios/node-down-es1/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(busy.status(), StatusCode::CONFLICT);

    let missing = client
        .post(url(&server, "/api/scenarios/no-such-scenario/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    engine
        .await_resolution(incident.parse().unwrap())
        .await
        .unwrap();

    let record: Value = client
        .get(url(&server, &format!("/api/incidents/{incident}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["outcome"], "success");
    assert_eq!(record["trigger"], "on-demand");

    let listed: Vec<Value> = client
        .get(url(&server, "/api/incidents?outcome=success&scenario=node-down-es1&limit=10"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let none: Vec<Value> = client
        .get(url(&server, "/api/incidents?category=security-incident"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(none.is_empty());

    let finalized = client
        .post(url(&server, &format!("/api/incidents/{incident}/abort")))
        .send()
        .await
        .unwrap();
    assert_eq!(finalized.status(), StatusCode::CONFLICT);

    let malformed = client
        .get(url(&server, "/api/incidents/not-a-uuid"))
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn abort_over_http_finalizes_as_aborted() {
    let cluster = ScriptedCluster::new();
    cluster.fallback(HealthStep::unhealthy("es1"));
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);
    let server = start(engine.clone());
    let client = reqwest::Client::new();

    let id = engine.trigger_now("node-down-es1").await.unwrap();
    let response = client
        .post(url(&server, &format!("/api/incidents/{id}/abort")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let record = engine.await_resolution(id).await.unwrap();
    assert_eq!(record.outcome.map(|o| o.as_str()), Some("aborted"));
    assert_eq!(cluster.revert_calls(), 1);

    let unknown = client
        .post(url(&server, &format!("/api/incidents/{}/abort", lmp_chaos::InjectionId::new())))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_apply_is_a_bad_gateway() {
    let cluster = ScriptedCluster::new();
    cluster.fail_applies(10);
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);
    let server = start(engine);

    let response = reqwest::Client::new()
        .post(url(&server, "/api/scenarios/node-down-es1/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn health_reports_cluster_or_503() {
    let cluster = ScriptedCluster::new();
    let engine = engine_with(&cluster, &[scenario("node-down-es1", "es1")]);
    let server = start(engine);
    let client = reqwest::Client::new();

    let healthy = client.get(url(&server, "/api/health")).send().await.unwrap();
    assert_eq!(healthy.status(), StatusCode::OK);
    let body: Value = healthy.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["cluster"]["status"], "green");

    cluster.overview_step(HealthStep::Fail(ClusterError::Unavailable("es down".into())));
    let down = client.get(url(&server, "/api/health")).send().await.unwrap();
    assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = down.json().await.unwrap();
    assert_eq!(body["status"], "unhealthy");

    server.shutdown().await.unwrap();
}
