//! Agent-side control flow against an in-process mock control plane:
//! registration, heartbeat staleness signalling, schedule application and
//! gzip result shipping.

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use flate2::read::GzDecoder;
use icmpmon_core::client::ControlPlaneClient;
use icmpmon_model::{
    AssignmentView, AssignmentsResponse, PingStats, ProbePayload, ProbeResult, ResultBatch,
    SelectionPolicy, Tier,
};
use icmpmon_registry::{Heartbeat, HeartbeatResponse, RegistrationResponse};
use icmpmon_shipper::{ResultShipper, ShipperConfig};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    agent_id: Mutex<Option<Uuid>>,
    heartbeats: AtomicUsize,
    ingested: Mutex<Vec<ResultBatch>>,
}

fn tier(name: &str) -> Tier {
    Tier {
        name: name.to_string(),
        probe_interval_secs: 30,
        probe_timeout_ms: 2_000,
        retries: 2,
        policy: SelectionPolicy::default(),
        expected: None,
        thresholds: None,
    }
}

async fn mock_control_plane(state: Arc<MockState>) -> SocketAddr {
    async fn register(
        State(state): State<Arc<MockState>>,
        Json(_body): Json<serde_json::Value>,
    ) -> Json<RegistrationResponse> {
        let agent_id = Uuid::new_v4();
        *state.agent_id.lock().await = Some(agent_id);
        Json(RegistrationResponse { agent_id })
    }

    async fn heartbeat(
        State(state): State<Arc<MockState>>,
        Json(hb): Json<Heartbeat>,
    ) -> Json<HeartbeatResponse> {
        state.heartbeats.fetch_add(1, Ordering::SeqCst);
        Json(HeartbeatResponse {
            acknowledged: true,
            assignment_stale: hb.assignment_version_seen < 7,
            assignment_version: 7,
            commands: Vec::new(),
        })
    }

    async fn assignments(State(state): State<Arc<MockState>>) -> Json<AssignmentsResponse> {
        let agent_id = state.agent_id.lock().await.unwrap_or_else(Uuid::new_v4);
        let view = AssignmentView {
            target_id: Uuid::new_v4(),
            agent_id,
            ip: "192.0.2.10".to_string(),
            tier: "core".to_string(),
            executor: None,
        };
        Json(AssignmentsResponse {
            version: 7,
            generated_at: Utc::now(),
            assignments: vec![view],
            tiers: HashMap::from([("core".to_string(), tier("core"))]),
        })
    }

    async fn results(
        State(state): State<Arc<MockState>>,
        body: axum::body::Bytes,
    ) -> StatusCode {
        let mut decoder = GzDecoder::new(body.as_ref());
        let mut json = Vec::new();
        if decoder.read_to_end(&mut json).is_err() {
            return StatusCode::BAD_REQUEST;
        }
        match serde_json::from_slice::<ResultBatch>(&json) {
            Ok(batch) => {
                state.ingested.lock().await.push(batch);
                StatusCode::ACCEPTED
            }
            Err(_) => StatusCode::BAD_REQUEST,
        }
    }

    let app = Router::new()
        .route("/api/v1/agents/register", post(register))
        .route("/api/v1/agents/:id/heartbeat", post(heartbeat))
        .route("/api/v1/agents/:id/assignments", get(assignments))
        .route("/api/v1/results", post(results))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn probe_result(agent_id: Uuid) -> ProbeResult {
    ProbeResult {
        time: Utc::now(),
        target_id: Uuid::new_v4(),
        agent_id,
        success: true,
        error: None,
        payload: ProbePayload::IcmpPing(PingStats {
            packets_sent: 3,
            packets_recvd: 3,
            packet_loss_pct: 0.0,
            min_rtt_ms: Some(11.8),
            max_rtt_ms: Some(13.22),
            avg_rtt_ms: Some(12.49),
            stddev_rtt_ms: Some(0.72),
            latency_ms: Some(11.8),
            rtts_ms: vec![Some(12.45), Some(13.22), Some(11.8)],
        }),
    }
}

#[tokio::test]
async fn register_heartbeat_and_schedule_flow() {
    let state = Arc::new(MockState::default());
    let addr = mock_control_plane(Arc::clone(&state)).await;
    let client = ControlPlaneClient::new(&format!("http://{addr}"), None).unwrap();

    let registration = icmpmon_registry::AgentRegistration {
        name: "probe-1".to_string(),
        region: "us-east".to_string(),
        location: "nyc".to_string(),
        provider: "aws".to_string(),
        tags: HashMap::new(),
        public_ip: None,
        version: Some("0.1.0".to_string()),
        executors: vec!["icmp_ping".to_string()],
        max_targets: 10_000,
    };
    let agent_id = client.register(&registration).await.unwrap();
    assert_eq!(*state.agent_id.lock().await, Some(agent_id));

    // A heartbeat behind the authoritative version is told to refresh.
    let hb = Heartbeat {
        queue_depth: 0,
        shipped_total: 0,
        failed_total: 0,
        memory_bytes: None,
        task_count: None,
        assignment_version_seen: 0,
        public_ip: None,
    };
    let response = client.heartbeat(agent_id, &hb).await.unwrap();
    assert!(response.acknowledged);
    assert!(response.assignment_stale);
    assert_eq!(response.assignment_version, 7);

    let schedule = client.assignments(agent_id, None).await.unwrap();
    assert_eq!(schedule.version, 7);
    assert_eq!(schedule.assignments.len(), 1);
    assert!(schedule.tiers.contains_key("core"));

    // Once caught up, the staleness flag clears.
    let hb = Heartbeat {
        assignment_version_seen: schedule.version,
        ..hb
    };
    let response = client.heartbeat(agent_id, &hb).await.unwrap();
    assert!(!response.assignment_stale);
    assert_eq!(state.heartbeats.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shipper_delivers_gzip_batches_end_to_end() {
    let state = Arc::new(MockState::default());
    let addr = mock_control_plane(Arc::clone(&state)).await;

    let agent_id = Uuid::new_v4();
    let shipper = ResultShipper::new(
        agent_id,
        ShipperConfig {
            endpoint: format!("http://{addr}/api/v1/results"),
            batch_size: 10,
            ..ShipperConfig::default()
        },
    )
    .unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    for _ in 0..3 {
        tx.send(probe_result(agent_id)).await.unwrap();
    }
    drop(tx);

    // With all producers gone the run loop drains, flushes and exits.
    let token = tokio_util::sync::CancellationToken::new();
    shipper.run(rx, token).await;

    let ingested = state.ingested.lock().await;
    assert_eq!(ingested.len(), 1);
    let batch = &ingested[0];
    assert_eq!(batch.agent_id, agent_id);
    assert_eq!(batch.results.len(), 3);
    assert!(batch.results.iter().all(|r| r.success));

    let stats = shipper.stats().snapshot();
    assert_eq!(stats.shipped, 3);
    assert_eq!(stats.failed, 0);
}
