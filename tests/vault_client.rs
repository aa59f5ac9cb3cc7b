//! Leader discovery against in-process vault stubs.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use vault_raft_snapshot_agent::config::Secret;
use vault_raft_snapshot_agent::vault::auth::AuthMethod;
use vault_raft_snapshot_agent::vault::VaultClient;

#[derive(Clone)]
struct NodeState {
    name: &'static str,
    is_leader: bool,
    leader_address: String,
    snapshot: Vec<u8>,
    log: Arc<Mutex<Vec<String>>>,
}

impl NodeState {
    fn record(&self, operation: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, operation));
    }
}

async fn leader_handler(State(state): State<NodeState>) -> Json<serde_json::Value> {
    state.record("leader");
    Json(serde_json::json!({
        "is_self": state.is_leader,
        "leader_address": state.leader_address,
    }))
}

async fn lookup_self_handler(State(state): State<NodeState>) -> Json<serde_json::Value> {
    state.record("auth");
    Json(serde_json::json!({ "data": { "ttl": 3600 } }))
}

async fn snapshot_handler(State(state): State<NodeState>) -> Vec<u8> {
    state.record("snapshot");
    state.snapshot.clone()
}

/// Spawn a vault-node stub and return its url.
async fn spawn_node(state: NodeState) -> String {
    let router = Router::new()
        .route("/v1/sys/leader", get(leader_handler))
        .route("/v1/auth/token/lookup-self", get(lookup_self_handler))
        .route("/v1/sys/storage/raft/snapshot", get(snapshot_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{}", address)
}

fn client(nodes: Vec<String>, auto_detect_leader: bool) -> VaultClient {
    VaultClient::new(
        reqwest::Client::new(),
        nodes,
        auto_detect_leader,
        AuthMethod::Token(Secret::from_literal("s.test")),
    )
}

fn probes(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.ends_with(":leader"))
        .cloned()
        .collect()
}

fn auths(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.ends_with(":auth"))
        .cloned()
        .collect()
}

#[tokio::test]
async fn probes_nodes_in_configured_order() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let n3 = spawn_node(NodeState {
        name: "n3",
        is_leader: true,
        leader_address: String::new(),
        snapshot: b"raft-bytes".to_vec(),
        log: log.clone(),
    })
    .await;
    let n1 = spawn_node(NodeState {
        name: "n1",
        is_leader: false,
        leader_address: n3.clone(),
        snapshot: Vec::new(),
        log: log.clone(),
    })
    .await;
    let n2 = spawn_node(NodeState {
        name: "n2",
        is_leader: false,
        leader_address: n3.clone(),
        snapshot: Vec::new(),
        log: log.clone(),
    })
    .await;

    let mut client = client(vec![n1, n2, n3], false);

    let mut buffer = Vec::new();
    client.take_snapshot(&mut buffer).await.unwrap();

    assert_eq!(buffer, b"raft-bytes");
    // with auto-detection disabled, every node up to the leader is probed
    // in insertion order and each candidate is authenticated
    assert_eq!(probes(&log), vec!["n1:leader", "n2:leader", "n3:leader"]);
    assert_eq!(auths(&log), vec!["n1:auth", "n2:auth", "n3:auth"]);
}

#[tokio::test]
async fn follows_leader_hint_without_probing_other_nodes() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let n3 = spawn_node(NodeState {
        name: "n3",
        is_leader: true,
        leader_address: String::new(),
        snapshot: b"raft-bytes".to_vec(),
        log: log.clone(),
    })
    .await;
    let n1 = spawn_node(NodeState {
        name: "n1",
        is_leader: false,
        leader_address: n3.clone(),
        snapshot: Vec::new(),
        log: log.clone(),
    })
    .await;
    let n2 = spawn_node(NodeState {
        name: "n2",
        is_leader: false,
        leader_address: n3.clone(),
        snapshot: Vec::new(),
        log: log.clone(),
    })
    .await;

    let mut client = client(vec![n1, n2, n3], true);

    let mut buffer = Vec::new();
    client.take_snapshot(&mut buffer).await.unwrap();

    assert_eq!(buffer, b"raft-bytes");
    // n1 reports the leader's address, so n2 is skipped
    assert_eq!(probes(&log), vec!["n1:leader", "n3:leader"]);
}

#[tokio::test]
async fn reuses_leader_connection_across_snapshots() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let n1 = spawn_node(NodeState {
        name: "n1",
        is_leader: true,
        leader_address: String::new(),
        snapshot: b"raft-bytes".to_vec(),
        log: log.clone(),
    })
    .await;

    let mut client = client(vec![n1], false);

    for _ in 0..2 {
        let mut buffer = Vec::new();
        client.take_snapshot(&mut buffer).await.unwrap();
        assert_eq!(buffer, b"raft-bytes");
    }

    // the second snapshot reuses the connection: the leader is re-probed
    // but the token is still within its half-life, so no new login happens
    assert_eq!(auths(&log), vec!["n1:auth"]);
    assert_eq!(probes(&log), vec!["n1:leader", "n1:leader"]);
}

#[tokio::test]
async fn fails_when_no_node_is_leader() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let n1 = spawn_node(NodeState {
        name: "n1",
        is_leader: false,
        leader_address: String::new(),
        snapshot: Vec::new(),
        log: log.clone(),
    })
    .await;

    let mut client = client(vec![n1], false);

    let mut buffer = Vec::new();
    let result = client.take_snapshot(&mut buffer).await;
    assert!(result.is_err());
    assert!(buffer.is_empty());
}

#[tokio::test]
async fn terminates_when_hints_point_at_failed_nodes() {
    // n1 and n2 each claim the other is the leader; the client must probe
    // every node exactly once and give up instead of looping.
    let log = Arc::new(Mutex::new(Vec::new()));

    let listener1 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let n1_url = format!("http://{}", listener1.local_addr().unwrap());
    let listener2 = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let n2_url = format!("http://{}", listener2.local_addr().unwrap());

    let n1_state = NodeState {
        name: "n1",
        is_leader: false,
        leader_address: n2_url.clone(),
        snapshot: Vec::new(),
        log: log.clone(),
    };
    let n2_state = NodeState {
        name: "n2",
        is_leader: false,
        leader_address: n1_url.clone(),
        snapshot: Vec::new(),
        log: log.clone(),
    };

    for (listener, state) in [(listener1, n1_state), (listener2, n2_state)] {
        let router = Router::new()
            .route("/v1/sys/leader", get(leader_handler))
            .route("/v1/auth/token/lookup-self", get(lookup_self_handler))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
    }

    let mut client = client(vec![n1_url, n2_url], true);

    let mut buffer = Vec::new();
    let result = client.take_snapshot(&mut buffer).await;

    assert!(result.is_err());
    assert_eq!(probes(&log), vec!["n1:leader", "n2:leader"]);
}
