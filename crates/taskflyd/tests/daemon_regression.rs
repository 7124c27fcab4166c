//! Controller regression suite.
//!
//! Drives the full stack — router, orchestrator, state store, local
//! backend — through the operator and node APIs: submission, fan-out
//! provisioning, registration, completion, partial failure, token
//! abuse, termination, and log tailing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tower::ServiceExt;

use taskfly_api::{build_router, ApiState};
use taskfly_orchestrator::{
    BackendError, ComputeBackend, InstanceInfo, InstanceRequest, LocalBackend, Orchestrator,
};
use taskfly_state::{DeploymentStatus, Node, NodeStatus, Store};

const HAPPY_DESCRIPTOR: &str = "\
cloud_provider: local
remote_script_to_run: run.sh
nodes:
  count: 3
  global_metadata:
    ENV: prod
  distributed_lists:
    WORKER_ID: [1, 2, 3]
";

fn single_node_descriptor() -> String {
    HAPPY_DESCRIPTOR.replace("count: 3", "count: 1")
}

// ── Harness ────────────────────────────────────────────────────────

fn write_bundle(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
    let path = dir.join("upload.tar.gz");
    let file = std::fs::File::create(&path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

fn setup(dir: &Path, backend: Arc<dyn ComputeBackend>) -> (Store, Arc<Orchestrator>, Router) {
    let store = Store::in_memory();
    let orchestrator = Arc::new(
        Orchestrator::new(
            store.clone(),
            dir.to_path_buf(),
            "http://localhost:8080".to_string(),
        )
        .with_backend(backend),
    );
    let router = build_router(ApiState::new(orchestrator.clone()));
    (store, orchestrator, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn json_request(
    method: &str,
    uri: &str,
    bearer: Option<&str>,
    body: serde_json::Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn submit_bundle(router: &Router, bundle_path: &Path) -> (StatusCode, serde_json::Value) {
    let bytes = std::fs::read(bundle_path).unwrap();
    let boundary = "taskfly-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\ncontent-disposition: form-data; name=\"bundle\"; \
             filename=\"job.tar.gz\"\r\ncontent-type: application/gzip\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/deployments")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();
    send(router, request).await
}

async fn wait_for_nodes(
    store: &Store,
    deployment_id: &str,
    done: impl Fn(&[Node]) -> bool,
) -> Vec<Node> {
    for _ in 0..200 {
        let nodes = store.get_nodes_by_deployment(deployment_id).unwrap();
        if done(&nodes) {
            return nodes;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nodes never reached the expected state");
}

async fn register(router: &Router, provision_token: &str) -> (StatusCode, serde_json::Value) {
    send(
        router,
        json_request(
            "POST",
            "/api/v1/nodes/register",
            None,
            json!({ "provision_token": provision_token, "ip": "10.9.9.9" }),
        ),
    )
    .await
}

/// Backend that injects a provisioning failure for chosen node indices.
struct FlakyBackend {
    fail_indices: Vec<u32>,
}

#[async_trait]
impl ComputeBackend for FlakyBackend {
    async fn provision(&self, request: InstanceRequest) -> Result<InstanceInfo, BackendError> {
        if self.fail_indices.contains(&request.node_index) {
            return Err(BackendError::Provision(format!(
                "injected failure for node {}",
                request.node_index
            )));
        }
        Ok(InstanceInfo {
            instance_id: format!("flaky-{}", request.node_index),
            ip_address: format!("10.1.0.{}", request.node_index + 1),
            status: "running".to_string(),
        })
    }

    async fn status(&self, _instance_id: &str) -> Result<String, BackendError> {
        Ok("running".to_string())
    }

    async fn terminate(&self, _instance_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }

    fn starts_agent_inline(&self) -> bool {
        true
    }
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_three_nodes_complete() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_bundle(
        dir.path(),
        &[("taskfly.yml", HAPPY_DESCRIPTOR), ("run.sh", "#!/bin/sh\n")],
    );
    let (store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (status, body) = submit_bundle(&router, &bundle).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let deployment_id = body["deployment_id"].as_str().unwrap().to_string();
    assert_eq!(body["nodes"], 3);
    assert_eq!(
        body["status_url"],
        format!("/api/v1/deployments/{deployment_id}")
    );

    let nodes = wait_for_nodes(&store, &deployment_id, |nodes| {
        nodes.iter().all(|n| n.status == NodeStatus::Registering)
    })
    .await;
    assert_eq!(
        store.get_deployment(&deployment_id).unwrap().status,
        DeploymentStatus::Running
    );

    // Register in reverse order; order must not matter.
    let mut tokens: HashMap<String, String> = HashMap::new();
    for node in nodes.iter().rev() {
        let (status, body) = register(&router, &node.provision_token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], node.node_id.as_str());
        assert_eq!(body["config"]["ENV"], "prod");
        assert_eq!(body["config"]["WORKER_ID"], json!([node.node_index + 1]));
        assert_eq!(body["entry_script"], "run.sh");
        tokens.insert(
            node.node_id.clone(),
            body["auth_token"].as_str().unwrap().to_string(),
        );
    }

    for token in tokens.values() {
        let (status, _) = send(
            &router,
            json_request(
                "POST",
                "/api/v1/nodes/status",
                Some(token),
                json!({ "status": "completed" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let deployment = store.get_deployment(&deployment_id).unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Completed);
    assert_eq!(deployment.nodes_completed, 3);
    assert_eq!(deployment.nodes_failed, 0);
    assert!(deployment.completed_at.is_some());

    // Operator view shows all nodes.
    let (status, body) = send(
        &router,
        Request::builder()
            .uri(format!("/api/v1/deployments/{deployment_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn partial_failure_marks_deployment_failed() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_bundle(
        dir.path(),
        &[("taskfly.yml", HAPPY_DESCRIPTOR), ("run.sh", "#!/bin/sh\n")],
    );
    let (store, _orch, router) = setup(
        dir.path(),
        Arc::new(FlakyBackend {
            fail_indices: vec![1],
        }),
    );

    let (status, body) = submit_bundle(&router, &bundle).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let deployment_id = body["deployment_id"].as_str().unwrap().to_string();

    let nodes = wait_for_nodes(&store, &deployment_id, |nodes| {
        nodes
            .iter()
            .all(|n| n.status == NodeStatus::Registering || n.status == NodeStatus::Failed)
    })
    .await;
    assert_eq!(nodes[1].status, NodeStatus::Failed);
    assert!(nodes[1]
        .error_message
        .as_deref()
        .unwrap()
        .contains("injected failure for node 1"));

    // The surviving peers run to completion.
    for node in [&nodes[0], &nodes[2]] {
        let (_, body) = register(&router, &node.provision_token).await;
        let token = body["auth_token"].as_str().unwrap();
        let (status, _) = send(
            &router,
            json_request(
                "POST",
                "/api/v1/nodes/status",
                Some(token),
                json!({ "status": "completed" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let deployment = store.get_deployment(&deployment_id).unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.nodes_completed, 2);
    assert_eq!(deployment.nodes_failed, 1);
}

#[tokio::test]
async fn submission_without_descriptor_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_bundle(dir.path(), &[("run.sh", "#!/bin/sh\n")]);
    let (store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (status, body) = submit_bundle(&router, &bundle).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("taskfly.yml"));
    assert!(store.get_all_deployments().is_empty());

    // The working directory was cleaned up.
    let leftover_dirs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    assert!(leftover_dirs.is_empty());
}

#[tokio::test]
async fn token_abuse_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = single_node_descriptor();
    let bundle = write_bundle(
        dir.path(),
        &[("taskfly.yml", descriptor.as_str()), ("run.sh", "x")],
    );
    let (store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (_, body) = submit_bundle(&router, &bundle).await;
    let deployment_id = body["deployment_id"].as_str().unwrap().to_string();
    let nodes = wait_for_nodes(&store, &deployment_id, |nodes| {
        nodes.iter().all(|n| n.status == NodeStatus::Registering)
    })
    .await;
    let provision_token = nodes[0].provision_token.clone();

    let (status, _) = register(&router, &provision_token).await;
    assert_eq!(status, StatusCode::OK);

    // Replayed registration with the consumed token.
    let (status, body) = register(&router, &provision_token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("provision token"));

    // Heartbeat with a token that matches no node.
    let (status, _) = send(
        &router,
        json_request(
            "POST",
            "/api/v1/nodes/heartbeat",
            Some("at_0000000000000000"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn graceful_termination_flows_to_heartbeat() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = single_node_descriptor();
    let bundle = write_bundle(
        dir.path(),
        &[("taskfly.yml", descriptor.as_str()), ("run.sh", "x")],
    );
    let (store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (_, body) = submit_bundle(&router, &bundle).await;
    let deployment_id = body["deployment_id"].as_str().unwrap().to_string();
    let nodes = wait_for_nodes(&store, &deployment_id, |nodes| {
        nodes.iter().all(|n| n.status == NodeStatus::Registering)
    })
    .await;

    let (_, body) = register(&router, &nodes[0].provision_token).await;
    let token = body["auth_token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        json_request("POST", "/api/v1/nodes/heartbeat", Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shutdown"], false);
    assert_eq!(
        store.get_node(&nodes[0].node_id).unwrap().status,
        NodeStatus::Running
    );

    let work_dir = dir.path().join(&deployment_id);
    assert!(work_dir.exists());

    let (status, _) = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/deployments/{deployment_id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let deployment = store.get_deployment(&deployment_id).unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Terminated);
    assert_eq!(
        store.get_node(&nodes[0].node_id).unwrap().status,
        NodeStatus::Terminated
    );

    // The next heartbeat carries the shutdown order.
    let (status, body) = send(
        &router,
        json_request("POST", "/api/v1/nodes/heartbeat", Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shutdown"], true);

    // Files disappear once the grace period passes.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!work_dir.exists());
}

#[tokio::test]
async fn log_tailing_returns_newest_entries() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = single_node_descriptor();
    let bundle = write_bundle(
        dir.path(),
        &[("taskfly.yml", descriptor.as_str()), ("run.sh", "x")],
    );
    let (store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (_, body) = submit_bundle(&router, &bundle).await;
    let deployment_id = body["deployment_id"].as_str().unwrap().to_string();
    let nodes = wait_for_nodes(&store, &deployment_id, |nodes| {
        nodes.iter().all(|n| n.status == NodeStatus::Registering)
    })
    .await;
    let (_, body) = register(&router, &nodes[0].provision_token).await;
    let token = body["auth_token"].as_str().unwrap().to_string();

    // 12 000 entries against a 10 000-entry ring.
    const BASE: i64 = 1_700_000_000;
    for batch in 0..12 {
        let entries: Vec<serde_json::Value> = (0..1000)
            .map(|i| {
                let seq = batch * 1000 + i;
                json!({
                    "timestamp": Utc.timestamp_opt(BASE + seq, 0).unwrap().to_rfc3339(),
                    "stream": "stdout",
                    "message": format!("line {seq}"),
                })
            })
            .collect();
        let (status, _) = send(
            &router,
            json_request(
                "POST",
                "/api/v1/nodes/logs",
                Some(&token),
                json!({ "logs": entries }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(
        &router,
        Request::builder()
            .uri(format!("/api/v1/deployments/{deployment_id}/logs?limit=500"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 500);

    let logs = body["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 500);
    let floor = Utc.timestamp_opt(BASE + 11_500, 0).unwrap();
    for entry in logs {
        let ts = chrono::DateTime::parse_from_rfc3339(entry["timestamp"].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc);
        assert!(ts >= floor);
    }
    assert_eq!(logs[0]["message"], "line 11500");
    assert_eq!(logs[499]["message"], "line 11999");
}

#[tokio::test]
async fn health_and_stats_respond() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (status, body) = send(
        &router,
        Request::builder()
            .uri("/api/v1/health")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(
        &router,
        Request::builder()
            .uri("/api/v1/stats")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_deployments"], 0);
}

#[tokio::test]
async fn cleanup_endpoints_enforce_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = single_node_descriptor();
    let bundle = write_bundle(
        dir.path(),
        &[("taskfly.yml", descriptor.as_str()), ("run.sh", "x")],
    );
    let (store, _orch, router) = setup(dir.path(), Arc::new(LocalBackend::new()));

    let (_, body) = submit_bundle(&router, &bundle).await;
    let deployment_id = body["deployment_id"].as_str().unwrap().to_string();
    wait_for_nodes(&store, &deployment_id, |nodes| {
        nodes.iter().all(|n| n.status == NodeStatus::Registering)
    })
    .await;

    let (status, _) = send(
        &router,
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/deployments/{deployment_id}/cleanup"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    store
        .update_node_status(
            &deployment_id,
            &format!("{deployment_id}_node_0"),
            NodeStatus::Completed,
            None,
        )
        .unwrap();

    let (status, body) = send(
        &router,
        Request::builder()
            .method("POST")
            .uri("/api/v1/cleanup/all")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleaned"], 1);
    assert_eq!(body["failed"], 0);
    assert!(store.get_deployment(&deployment_id).is_err());
}
