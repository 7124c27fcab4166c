//! End-to-end agent test: a real controller on a loopback port, a real
//! bundle, and the agent driving a node from registration through
//! script completion and controller-ordered shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;

use taskfly_agent::{Agent, AgentConfig};
use taskfly_api::{build_router, ApiState};
use taskfly_orchestrator::{LocalBackend, Orchestrator};
use taskfly_state::{DeploymentStatus, NodeStatus, Store};

const DESCRIPTOR: &str = "\
cloud_provider: local
remote_script_to_run: run.sh
nodes:
  count: 1
  global_metadata:
    ENV: prod
  distributed_lists:
    WORKER_ID: [7]
";

const SCRIPT: &str = "\
#!/bin/sh
echo \"env is $ENV\"
echo \"workers $WORKER_ID\"
echo \"something odd\" 1>&2
";

fn write_bundle(dir: &Path) -> PathBuf {
    let path = dir.join("upload.tar.gz");
    let file = std::fs::File::create(&path).unwrap();
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in [("taskfly.yml", DESCRIPTOR), ("run.sh", SCRIPT)] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    path
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_completes_node_and_obeys_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = write_bundle(dir.path());

    // Controller on an ephemeral loopback port.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let store = Store::in_memory();
    let orchestrator = Arc::new(
        Orchestrator::new(store.clone(), dir.path().join("deployments"), base.clone())
            .with_backend(Arc::new(LocalBackend::new())),
    );
    std::fs::create_dir_all(dir.path().join("deployments")).unwrap();
    let router = build_router(ApiState::new(orchestrator.clone()));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let deployment = orchestrator.submit(&bundle).await.unwrap();
    let deployment_id = deployment.id.clone();

    // The local backend registers no real host; grab the provision
    // token once provisioning settles.
    {
        let store = store.clone();
        let deployment_id = deployment_id.clone();
        wait_until("node provisioned", move || {
            store
                .get_nodes_by_deployment(&deployment_id)
                .map(|nodes| nodes.iter().all(|n| n.status == NodeStatus::Registering))
                .unwrap_or(false)
        })
        .await;
    }
    let provision_token = store.get_nodes_by_deployment(&deployment_id).unwrap()[0]
        .provision_token
        .clone();

    // Run the agent against the live controller.
    let mut config = AgentConfig::new(provision_token, base, dir.path().join("agent-work"));
    config.heartbeat_interval = Duration::from_millis(50);
    config.log_push_interval = Duration::from_millis(50);
    let agent = Agent::new(config).unwrap();
    let agent_task = tokio::spawn(async move { agent.run().await });

    // The node works through its lifecycle and completes.
    {
        let store = store.clone();
        let deployment_id = deployment_id.clone();
        wait_until("node completed", move || {
            store
                .get_nodes_by_deployment(&deployment_id)
                .map(|nodes| nodes[0].status == NodeStatus::Completed)
                .unwrap_or(false)
        })
        .await;
    }

    let dep = store.get_deployment(&deployment_id).unwrap();
    assert_eq!(dep.status, DeploymentStatus::Completed);
    assert_eq!(dep.nodes_completed, 1);

    // Script output arrived through the log push loop.
    {
        let store = store.clone();
        let deployment_id = deployment_id.clone();
        wait_until("logs pushed", move || {
            store
                .get_logs(&deployment_id, None, None, 0)
                .map(|logs| {
                    logs.iter().any(|l| l.message == "env is prod")
                        && logs.iter().any(|l| l.message == "workers [7]")
                        && logs.iter().any(|l| l.message == "something odd")
                })
                .unwrap_or(false)
        })
        .await;
    }

    // Heartbeats carried metrics.
    {
        let store = store.clone();
        let deployment_id = deployment_id.clone();
        wait_until("metrics attached", move || {
            store
                .get_nodes_by_deployment(&deployment_id)
                .map(|nodes| nodes[0].metrics.is_some())
                .unwrap_or(false)
        })
        .await;
    }

    // The extraction was confined to the agent's working directory and
    // the descriptor never reached it.
    assert!(dir.path().join("agent-work/run.sh").exists());
    assert!(!dir.path().join("agent-work/taskfly.yml").exists());

    // Termination reaches the agent through its next heartbeat.
    orchestrator.terminate_deployment(&deployment_id).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), agent_task)
        .await
        .expect("agent did not shut down after termination")
        .unwrap();
    assert!(result.is_ok());
}
