//! ControlAPI — the agent's HTTP surface.
//!
//! Handlers are short: parse, delegate to the owning component, shape the
//! response. Role changes, keepalive, reelection, policy distribution and
//! the light-discovery endpoints all live here; no business logic does.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::discovery::protocol::DeviceInformation;
use crate::discovery::LightDiscovery;
use crate::error::AgentError;
use crate::policies::PolicyBundle;
use crate::resilience::{AreaResilience, KeepaliveReply, Role, PRIORITY_ON_FAILURE};
use crate::startup::AgentStart;
use crate::topology::TopologyProvider;

// ────────────────────────────────────────────────────────────────────────────
// State and router
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub policies: Arc<PolicyBundle>,
    pub resilience: Arc<AreaResilience>,
    pub startflow: Arc<AgentStart>,
    pub discovery: Arc<LightDiscovery>,
    pub topology: Arc<dyn TopologyProvider>,
    pub leader_flag: Arc<AtomicBool>,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rm/components", get(components))
        .route("/api/v2/resource-management/policies/startAgent", get(start_agent))
        .route(
            "/api/v2/resource-management/policies/startAreaResilience",
            get(start_area_resilience),
        )
        .route("/api/v2/resource-management/policies/roleChange/:role", get(role_change))
        .route("/api/v2/resource-management/policies/reelection", post(reelection))
        .route("/api/v2/resource-management/policies/keepalive", post(keepalive))
        .route("/api/v2/resource-management/policies/leaderinfo", get(leader_info))
        .route("/api/v2/resource-management/policies/receiveNewPolicies", post(receive_policies))
        .route(
            "/api/v2/resource-management/policies/PoliciesDistributionTrigger",
            get(distribution_trigger),
        )
        .route("/ld/beaconReply", post(beacon_reply))
        .route("/ld/control/:mode/:operation", get(ld_control))
        .route("/ld/topology", get(ld_topology))
        .with_state(state)
}

/// Peer address of a request, honouring `X-Real-IP` (set by a fronting
/// proxy) before the socket address.
fn peer_ip(headers: &HeaderMap, connect: Option<&ConnectInfo<SocketAddr>>) -> String {
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| connect.map(|c| c.0.ip().to_string()))
        .unwrap_or_default()
}

// ────────────────────────────────────────────────────────────────────────────
// Resource manager
// ────────────────────────────────────────────────────────────────────────────

async fn components(State(s): State<AppState>) -> Json<Value> {
    let st = s.startflow.status();
    let discovery_ok = st.discovery_failed.map(|f| !f).unwrap_or(false);
    let identification_ok = st.identification_failed.map(|f| !f).unwrap_or(false);
    let cau_client_ok = st.cauclient_failed.map(|f| !f).unwrap_or(false);
    let categorization_ok = st.categorization_failed.map(|f| !f).unwrap_or(false);
    let policies_ok = st.policies_failed.map(|f| !f).unwrap_or(false);

    Json(json!({
        "started": s.startflow.is_started(),
        "running": s.startflow.is_running(),
        "modules": ["discovery", "identification", "cau_client", "categorization", "policies"],
        "discovery": discovery_ok,
        "identification": identification_ok,
        "cau_client": cau_client_ok,
        "categorization": categorization_ok,
        "policies": policies_ok,
        "discovery_description": if discovery_ok {
            format!(
                "detectedLeaderID: \"{}\", MACaddr: \"{}\"",
                st.detected_leader_id.as_deref().unwrap_or(""),
                st.mac_addr.as_deref().unwrap_or("")
            )
        } else {
            "Discovery not started or error on trigger.".to_string()
        },
        "identification_description": if identification_ok {
            format!(
                "IDKey: \"{}\", deviceID: \"{}\"",
                st.id_key.as_deref().unwrap_or(""),
                st.device_id
            )
        } else {
            "Identification not started or error on trigger.".to_string()
        },
        "categorization_description": if categorization_ok {
            format!("Started: {}", st.categorization_started)
        } else {
            "Categorization not started or error on trigger.".to_string()
        },
        "policies_description": if policies_ok {
            format!("LPP: {}", st.arearesilience_started)
        } else {
            "Policies (LPP) not started or error on trigger.".to_string()
        },
        "cau_client_description": if cau_client_ok {
            format!(
                "authenticated: {}, secureConnection: {}",
                st.is_authenticated.map(|b| b.to_string()).unwrap_or_default(),
                st.secure_connection.map(|b| b.to_string()).unwrap_or_default()
            )
        } else {
            "CAU_client not started or error on trigger.".to_string()
        },
    }))
}

// ────────────────────────────────────────────────────────────────────────────
// Policies module
// ────────────────────────────────────────────────────────────────────────────

async fn start_agent(State(s): State<AppState>) -> impl IntoResponse {
    let started = s.startflow.start(s.leader_flag.load(Ordering::SeqCst));
    let status = if started { StatusCode::OK } else { StatusCode::FORBIDDEN };
    (status, Json(json!({ "started": true })))
}

async fn start_area_resilience(State(s): State<AppState>) -> impl IntoResponse {
    let started = s.resilience.start(&s.startflow.device_id());
    let status = if started { StatusCode::OK } else { StatusCode::FORBIDDEN };
    (status, Json(json!({ "started": true })))
}

async fn role_change(
    State(s): State<AppState>,
    Path(role): Path<String>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> impl IntoResponse {
    let im_leader = s.resilience.im_leader();
    let im_backup = s.resilience.im_backup();
    let current = json!({ "imLeader": im_leader, "imBackup": im_backup });

    match role.to_lowercase().as_str() {
        "leader" => {
            if im_leader {
                log::debug!("Role change: Leader -> Leader");
                return (StatusCode::FORBIDDEN, Json(current));
            }
            if !im_backup {
                // For a takeover you must be a backup first.
                log::debug!("Role change: Agent -> Leader");
                return (StatusCode::FORBIDDEN, Json(current));
            }
            log::debug!("Role change: Backup -> Leader");
            let _ = s.discovery.stop_scanning().await;
            if s.discovery.start_beaconning().await {
                log::info!("Successful promotion to Leader");
            } else {
                log::warn!("Unsuccessful promotion from Backup to Leader");
            }
            if !s.startflow.im_leader() {
                let _ = s.startflow.switch(true).await;
            }
            (StatusCode::OK, Json(json!({ "imLeader": true, "imBackup": false })))
        }

        "backup" => {
            if im_leader || im_backup {
                log::debug!("Role change: Leader/Backup -> Backup rejected");
                return (StatusCode::FORBIDDEN, Json(current));
            }
            log::debug!("Role change: Agent -> Backup");
            let leader_ip = peer_ip(&headers, connect.as_ref());
            log::debug!("Leader at {} is selecting me as Backup", leader_ip);
            if s.resilience.promoted_to_backup(leader_ip) {
                log::info!("Successful promotion to Backup");
                (StatusCode::OK, Json(json!({ "imLeader": im_leader, "imBackup": true })))
            } else {
                log::warn!("Unsuccessful promotion from Agent to Backup");
                let current = json!({
                    "imLeader": s.resilience.im_leader(),
                    "imBackup": s.resilience.im_backup(),
                });
                (StatusCode::FORBIDDEN, Json(current))
            }
        }

        "agent" => {
            if im_leader {
                log::debug!("Role change: Leader -> Agent");
                s.resilience.stop().await;
                let _ = s.discovery.stop_beaconning().await;
                let _ = s.discovery.start_scanning().await;
                s.leader_flag.store(false, Ordering::SeqCst);
                if s.startflow.im_leader() {
                    let _ = s.startflow.switch(false).await;
                }
                s.resilience.restart_as_agent(&s.startflow.device_id()).await;
                (StatusCode::OK, Json(json!({ "imLeader": false, "imBackup": false })))
            } else if im_backup {
                log::debug!("Role change: Backup -> Agent");
                s.resilience.restart_as_agent(&s.startflow.device_id()).await;
                (StatusCode::OK, Json(json!({ "imLeader": false, "imBackup": false })))
            } else {
                log::debug!("Role change: Agent -> Agent");
                (StatusCode::FORBIDDEN, Json(json!({ "imLeader": false, "imBackup": false })))
            }
        }

        _ => (StatusCode::NOT_FOUND, Json(current)),
    }
}

async fn reelection(State(s): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let Some(device_id) = body.get("deviceID").and_then(|v| v.as_str()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "deviceID": null, "deviceIP": "" })));
    };

    let device_ip = s
        .topology
        .topology()
        .into_iter()
        .find(|e| e.device_id == device_id)
        .map(|e| e.device_ip);
    let reply = json!({ "deviceID": device_id, "deviceIP": device_ip.clone().unwrap_or_default() });

    let Some(device_ip) = device_ip else {
        log::error!("{}", AgentError::NotFound(device_id.to_string()));
        return (StatusCode::NOT_FOUND, Json(reply));
    };
    if !s.resilience.im_leader() {
        log::error!("Device is not a Leader, cannot perform a reelection in a non-leader device.");
        return (StatusCode::UNAUTHORIZED, Json(reply));
    }
    if !s.policies.flag(
        crate::policies::PolicyGroup::Lrp,
        crate::policies::lrp::REELECTION_ALLOWED,
        true,
    ) {
        log::warn!("Reelection is disabled by policy");
        return (StatusCode::FORBIDDEN, Json(reply));
    }

    if s.resilience.reelection(device_id, &device_ip).await {
        (StatusCode::OK, Json(reply))
    } else {
        (StatusCode::FORBIDDEN, Json(reply))
    }
}

async fn keepalive(State(s): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let own_id = s.startflow.device_id();
    let Some(device_id) = body.get("deviceID").and_then(|v| v.as_str()) else {
        let reply = KeepaliveReply { device_id: own_id, backup_priority: PRIORITY_ON_FAILURE };
        return (StatusCode::BAD_REQUEST, Json(reply));
    };

    if !s.resilience.im_leader() {
        let reply = KeepaliveReply { device_id: own_id, backup_priority: PRIORITY_ON_FAILURE };
        return (StatusCode::METHOD_NOT_ALLOWED, Json(reply));
    }

    let (correct, priority) = s.resilience.receive_keepalive(device_id);
    log::debug!(
        "Device {} has sent a keepalive. Result correct: {}, Priority: {}",
        device_id,
        correct,
        priority
    );
    let status = if correct { StatusCode::OK } else { StatusCode::FORBIDDEN };
    (status, Json(KeepaliveReply { device_id: own_id, backup_priority: priority }))
}

async fn leader_info(State(s): State<AppState>) -> Json<Value> {
    let role = s.resilience.role();
    Json(json!({
        "imLeader": role == Role::Leader,
        "imBackup": role == Role::Backup,
    }))
}

async fn receive_policies(State(s): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let Some(payload) = body.as_object() else {
        log::error!("{}", AgentError::Policy("bundle payload is not an object".to_string()));
        return (StatusCode::BAD_REQUEST, Json(json!({ "result": false })));
    };
    let correct = s.policies.receive(payload);
    let status = if correct { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (status, Json(json!({ "result": correct })))
}

async fn distribution_trigger(State(s): State<AppState>) -> StatusCode {
    let ips: Vec<String> = s.topology.topology().into_iter().map(|e| e.device_ip).collect();
    s.policies.distribute(&s.http, &ips).await;
    StatusCode::OK
}

// ────────────────────────────────────────────────────────────────────────────
// Light discovery
// ────────────────────────────────────────────────────────────────────────────

async fn beacon_reply(
    State(s): State<AppState>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    Json(body): Json<Value>,
) -> StatusCode {
    let info: DeviceInformation = match serde_json::from_value(body) {
        Ok(info) => info,
        Err(e) => {
            log::error!("Malformed beacon reply: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    let device_ip = peer_ip(&headers, connect.as_ref());
    if s.discovery.recv_reply(info, &device_ip) {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    }
}

async fn ld_control(
    State(s): State<AppState>,
    Path((mode, operation)): Path<(String, String)>,
) -> StatusCode {
    let ok_or_400 = |correct: bool| if correct { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    match (mode.to_lowercase().as_str(), operation.to_lowercase().as_str()) {
        ("beacon", "start") => ok_or_400(s.discovery.start_beaconning().await),
        ("beacon", "stop") => ok_or_400(s.discovery.stop_beaconning().await),
        ("scan", "start") => ok_or_400(s.discovery.start_scanning().await),
        ("scan", "stop") => ok_or_400(s.discovery.stop_scanning().await),
        _ => StatusCode::NOT_FOUND,
    }
}

async fn ld_topology(State(s): State<AppState>) -> Json<Value> {
    Json(json!({ "topology": s.discovery.topology_pairs() }))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::triggers::{Collaborators, ExternalTriggers};
    use crate::topology::EnvTopology;
    use axum::body::Body;
    use axum::http::Request;
    use tower::{Layer, ServiceExt};
    use tower_http::normalize_path::NormalizePathLayer;

    fn test_state() -> AppState {
        let http = reqwest::Client::new();
        let policies = Arc::new(PolicyBundle::new());
        let discovery = Arc::new(LightDiscovery::new(
            "255.255.255.255".to_string(),
            "agent/L".to_string(),
            http.clone(),
        ));
        let topology: Arc<dyn TopologyProvider> = Arc::new(EnvTopology::new(&[(
            "agent/A".to_string(),
            "10.0.0.2".to_string(),
        )]));
        let leader_flag = Arc::new(AtomicBool::new(false));
        let resilience = Arc::new(AreaResilience::new(
            policies.clone(),
            topology.clone(),
            leader_flag.clone(),
            http.clone(),
        ));
        let triggers = ExternalTriggers::new(http.clone(), Collaborators::default(), String::new());
        let startflow = Arc::new(AgentStart::new(
            triggers,
            discovery.clone(),
            "agent/L".to_string(),
            None,
            true,
        ));
        AppState { policies, resilience, startflow, discovery, topology, leader_flag, http }
    }

    async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        read(response).await
    }

    async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        read(response).await
    }

    async fn read(response: axum::response::Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn leaderinfo_reports_the_role_flags() {
        let state = test_state();
        let app = router(state.clone());
        let (status, body) =
            get_json(&app, "/api/v2/resource-management/policies/leaderinfo").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "imLeader": false, "imBackup": false }));
    }

    #[tokio::test]
    async fn trailing_slashes_are_tolerated() {
        let state = test_state();
        let app = NormalizePathLayer::trim_trailing_slash().layer(router(state));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v2/resource-management/policies/leaderinfo/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn keepalive_to_a_non_leader_is_405_with_failure_sentinel() {
        let state = test_state();
        let app = router(state);
        let (status, body) = post_json(
            &app,
            "/api/v2/resource-management/policies/keepalive",
            json!({ "deviceID": "agent/A" }),
        )
        .await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, json!({ "deviceID": "agent/L", "backupPriority": -3 }));
    }

    #[tokio::test]
    async fn keepalive_refresh_and_unknown_rejection() {
        let state = test_state();
        state.resilience.test_set_roles(true, false);
        state.resilience.test_enroll_backup("agent/A", "10.0.0.2", 30);
        let app = router(state);

        // Known backup: 200 with its priority.
        let (status, body) = post_json(
            &app,
            "/api/v2/resource-management/policies/keepalive",
            json!({ "deviceID": "agent/A" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "deviceID": "agent/L", "backupPriority": 1 }));

        // Unknown sender: 403 with the demotion sentinel.
        let (status, body) = post_json(
            &app,
            "/api/v2/resource-management/policies/keepalive",
            json!({ "deviceID": "agent/X" }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({ "deviceID": "agent/L", "backupPriority": -2 }));
    }

    #[tokio::test]
    async fn keepalive_without_device_id_is_rejected() {
        let state = test_state();
        let app = router(state);
        let (status, _) =
            post_json(&app, "/api/v2/resource-management/policies/keepalive", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn role_change_rejects_unknown_roles_and_bad_transitions() {
        let state = test_state();
        let app = router(state);

        let (status, _) =
            get_json(&app, "/api/v2/resource-management/policies/roleChange/overlord").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // A plain agent cannot jump straight to leader.
        let (status, body) =
            get_json(&app, "/api/v2/resource-management/policies/roleChange/leader").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({ "imLeader": false, "imBackup": false }));

        // Agent -> Agent is a rejected no-op.
        let (status, _) =
            get_json(&app, "/api/v2/resource-management/policies/roleChange/agent").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn role_change_backup_rejects_an_existing_backup() {
        let state = test_state();
        state.resilience.test_set_roles(false, true);
        let app = router(state);
        let (status, body) =
            get_json(&app, "/api/v2/resource-management/policies/roleChange/backup").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({ "imLeader": false, "imBackup": true }));
    }

    #[tokio::test]
    async fn role_case_is_insensitive() {
        let state = test_state();
        let app = router(state);
        let (status, _) =
            get_json(&app, "/api/v2/resource-management/policies/roleChange/LEADER").await;
        // Recognized role, rejected transition: 403 rather than 404.
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reelection_requires_topology_and_leadership() {
        let state = test_state();
        let app = router(state.clone());

        // Unknown device: 404.
        let (status, _) = post_json(
            &app,
            "/api/v2/resource-management/policies/reelection",
            json!({ "deviceID": "agent/Z" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Known device, but this node is not a leader: 401.
        let (status, _) = post_json(
            &app,
            "/api/v2/resource-management/policies/reelection",
            json!({ "deviceID": "agent/A" }),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reelection_honours_the_policy_switch() {
        let state = test_state();
        state.resilience.test_set_roles(true, false);
        state
            .policies
            .set_group_json(crate::policies::PolicyGroup::Lrp, r#"{"REELECTION_ALLOWED": false}"#);
        let app = router(state);
        let (status, _) = post_json(
            &app,
            "/api/v2/resource-management/policies/reelection",
            json!({ "deviceID": "agent/A" }),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn policy_bundle_reception() {
        let state = test_state();
        let app = router(state.clone());
        let (status, body) = post_json(
            &app,
            "/api/v2/resource-management/policies/receiveNewPolicies",
            json!({ "LPP": "{\"BACKUP_MINIMUM\":2}", "LMR": "{}" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "result": true }));
        assert_eq!(
            state.policies.integer(
                crate::policies::PolicyGroup::Lpp,
                crate::policies::lpp::BACKUP_MINIMUM,
                0
            ),
            2
        );

        let (status, _) = post_json(
            &app,
            "/api/v2/resource-management/policies/receiveNewPolicies",
            json!([1, 2, 3]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn beacon_reply_builds_the_topology() {
        let state = test_state();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ld/beaconReply")
                    .header("content-type", "application/json")
                    .header("x-real-ip", "10.0.0.7")
                    .body(Body::from(
                        json!({
                            "deviceID": "agent/A",
                            "deviceIP": "1.2.3.4",
                            "cpu_cores": 4,
                            "mem_avail": 7.5,
                            "stg_avail": 120.0,
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The payload's IP claim is ignored in favour of the peer address.
        let (status, body) = get_json(&app, "/ld/topology").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "topology": [["agent/A", "10.0.0.7"]] }));
    }

    #[tokio::test]
    async fn malformed_beacon_reply_is_400() {
        let state = test_state();
        let app = router(state);
        let (status, _) = post_json(&app, "/ld/beaconReply", json!({ "deviceIP": "1.2.3.4" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ld_control_unknown_modes_are_404() {
        let state = test_state();
        let app = router(state);
        let (status, _) = get_json(&app, "/ld/control/quantum/start").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(&app, "/ld/control/beacon/sideways").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_area_resilience_is_idempotent() {
        let state = test_state();
        let app = router(state);
        let (status, body) =
            get_json(&app, "/api/v2/resource-management/policies/startAreaResilience").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "started": true }));
        let (status, body) =
            get_json(&app, "/api/v2/resource-management/policies/startAreaResilience").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({ "started": true }));
    }

    #[tokio::test]
    async fn components_reports_the_startup_record() {
        let state = test_state();
        let app = router(state);
        let (status, body) = get_json(&app, "/rm/components").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["started"], json!(false));
        assert_eq!(body["modules"].as_array().unwrap().len(), 5);
        assert_eq!(body["discovery"], json!(false));
    }

    #[tokio::test]
    async fn components_describes_a_successful_cau_exchange() {
        let state = test_state();
        state.startflow.test_with_status(|st| {
            st.cauclient_failed = Some(false);
            st.is_authenticated = Some(true);
            st.secure_connection = Some(true);
        });
        let app = router(state);
        let (status, body) = get_json(&app, "/rm/components").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cau_client"], json!(true));
        assert_eq!(
            body["cau_client_description"],
            json!("authenticated: true, secureConnection: true")
        );
    }
}
