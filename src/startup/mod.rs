//! Agent start — brings one node's subsystems online in order.
//!
//! A single worker runs the startup pipeline: wait for CIMI, identify the
//! device, scan for a leader, authenticate through the CAU client, start
//! categorization and area resilience, then watch the leader. A node booted
//! with the leader flag (or switched into leadership later) runs the leader
//! flavour instead: discovery broadcast, categorization switch, area
//! resilience.
//!
//! Every step records its success on the shared [`StartStatus`] record,
//! which ControlAPI projects at `/rm/components/`. In non-debug mode a
//! failed step aborts the pipeline; the node stays partially initialised
//! and reports it.

pub mod triggers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::TIME_WAIT_ALIVE;
use crate::discovery::LightDiscovery;
use crate::worker::{self, Worker};
use triggers::{AgentResource, ExternalTriggers, ALE_ENABLED, MAX_MISSING_SCANS, WAIT_TIME_CIMI};

// ────────────────────────────────────────────────────────────────────────────
// Status record
// ────────────────────────────────────────────────────────────────────────────

/// Everything the pipeline has learned or decided so far. `None` failure
/// flags mean "step not attempted yet".
#[derive(Debug, Clone, Default)]
pub struct StartStatus {
    pub mac_addr: Option<String>,
    pub detected_leader_id: Option<String>,
    pub device_id: String,
    pub id_key: Option<String>,
    pub is_authenticated: Option<bool>,
    pub secure_connection: Option<bool>,
    pub leader_ip: Option<String>,

    pub categorization_started: bool,
    pub arearesilience_started: bool,
    pub categorization_switched: Option<bool>,
    pub discovery_switched: Option<String>,

    pub discovery_failed: Option<bool>,
    pub discovery_leader_failed: Option<bool>,
    pub categorization_failed: Option<bool>,
    pub categorization_leader_failed: Option<bool>,
    pub identification_failed: Option<bool>,
    pub cauclient_failed: Option<bool>,
    pub policies_failed: Option<bool>,

    pub cimi_resource_id: Option<String>,
}

struct StartShared {
    triggers: ExternalTriggers,
    discovery: Arc<LightDiscovery>,
    status: RwLock<StartStatus>,
    im_leader: AtomicBool,
    started: AtomicBool,
    connected: AtomicBool,
    debug: bool,
    worker: Mutex<Option<Worker>>,
}

// ────────────────────────────────────────────────────────────────────────────
// Component
// ────────────────────────────────────────────────────────────────────────────

pub struct AgentStart {
    shared: Arc<StartShared>,
}

impl AgentStart {
    pub fn new(
        triggers: ExternalTriggers,
        discovery: Arc<LightDiscovery>,
        device_id: String,
        leader_ip: Option<String>,
        debug: bool,
    ) -> Self {
        let status = StartStatus { device_id, leader_ip, ..StartStatus::default() };
        AgentStart {
            shared: Arc::new(StartShared {
                triggers,
                discovery,
                status: RwLock::new(status),
                im_leader: AtomicBool::new(false),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                debug,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn im_leader(&self) -> bool {
        self.shared.im_leader.load(Ordering::SeqCst)
    }

    pub fn device_id(&self) -> String {
        self.shared.status.read().device_id.clone()
    }

    pub fn status(&self) -> StartStatus {
        self.shared.status.read().clone()
    }

    /// Launch the startup worker. Idempotent: false when already started.
    pub fn start(&self, im_leader: bool) -> bool {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            log::warn!("Start procedure is already started");
            return false;
        }
        self.shared.im_leader.store(im_leader, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { agent_startup_flow(shared, token).await });
        *self.shared.worker.lock() = Some(Worker { cancel, handle });
        true
    }

    /// Switch the live worker to the other flavour: a leader node falls back
    /// to the agent pipeline, an agent node runs the leader switch. The
    /// current worker is cancelled and joined first, so at most one pipeline
    /// runs at any time.
    pub async fn switch(&self, im_leader: bool) -> bool {
        if !self.is_started() {
            log::error!("Agent is not started!");
            return false;
        }
        worker::stop_slot(&self.shared.worker).await;
        self.shared.connected.store(true, Ordering::SeqCst);

        if self.shared.im_leader.load(Ordering::SeqCst) != im_leader {
            log::warn!("imLeader state is not consequent!");
        }

        let shared = self.shared.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = if self.shared.im_leader.load(Ordering::SeqCst) {
            log::info!("Switch to Agent");
            self.shared.im_leader.store(false, Ordering::SeqCst);
            tokio::spawn(async move { agent_startup_flow(shared, token).await })
        } else {
            log::info!("Switch to Leader");
            self.shared.im_leader.store(true, Ordering::SeqCst);
            tokio::spawn(async move { leader_switch_flow(shared, token).await })
        };
        *self.shared.worker.lock() = Some(Worker { cancel, handle });
        true
    }

    /// Cancel the pipeline worker and wait for it.
    pub async fn stop(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        worker::stop_slot(&self.shared.worker).await;
    }

    /// Node summary, as logged after a completed pipeline.
    pub fn summary(&self) -> serde_json::Value {
        summary_value(&self.shared)
    }

    #[cfg(test)]
    pub(crate) fn test_with_status(&self, f: impl FnOnce(&mut StartStatus)) {
        f(&mut self.shared.status.write());
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Agent pipeline
// ────────────────────────────────────────────────────────────────────────────

async fn agent_startup_flow(shared: Arc<StartShared>, cancel: CancellationToken) {
    'pipeline: loop {
        if cancel.is_cancelled() {
            return;
        }
        {
            let mut st = shared.status.write();
            st.detected_leader_id = None;
            st.mac_addr = None;
        }

        // 0. CIMI must be up before anything else.
        loop {
            if shared.triggers.check_cimi_started().await {
                break;
            }
            log::debug!("CIMI is not ready... Retry in {:?}", WAIT_TIME_CIMI);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(WAIT_TIME_CIMI) => {}
            }
        }
        log::info!("CIMI is ready!");

        // 1. Identification.
        let ident_failed = if shared.triggers.collaborators.identification.is_some() {
            log::debug!("Sending trigger to Identification...");
            match shared.triggers.request_identification().await {
                Ok(reply) => {
                    let mut st = shared.status.write();
                    st.device_id = reply.device_id;
                    st.id_key = Some(reply.id_key);
                    false
                }
                Err(e) => {
                    log::error!("Identification trigger failed: {}", e);
                    true
                }
            }
        } else {
            // Standalone: the env-provided identity stands in.
            false
        };
        shared.status.write().identification_failed = Some(ident_failed);
        log::info!("Identification trigger done");
        if !shared.debug && ident_failed {
            log::error!("Identification failed, interrupting agent start.");
            return;
        }

        // 2. Leader flag short-circuit.
        if shared.im_leader.load(Ordering::SeqCst) {
            leader_switch_flow(shared.clone(), cancel.clone()).await;
            return;
        }

        // Agent side: engage the internal beacon listener.
        let _ = shared.discovery.start_scanning().await;

        // 3. Scan for leaders.
        let mut found: Option<(String, String)> = None;
        let mut discovery_failed = false;
        if shared.triggers.collaborators.discovery.is_some() {
            discovery_failed = true;
            let mut count = 0;
            while !cancel.is_cancelled() && count < MAX_MISSING_SCANS && found.is_none() {
                log::debug!("Sending scan trigger to Discovery...");
                match shared.triggers.start_scan().await {
                    Ok(result) => {
                        discovery_failed = false;
                        found = result;
                    }
                    Err(e) => {
                        log::debug!("Discovery failed on attempt {}: {}", count, e);
                        discovery_failed = true;
                    }
                }
                count += 1;
            }
            log::info!(
                "Discovery trigger finished in #{} attempts and ok={}",
                count,
                found.is_some()
            );
        }
        {
            let mut st = shared.status.write();
            st.discovery_failed = Some(discovery_failed);
            if let Some((leader, mac)) = &found {
                st.detected_leader_id = Some(leader.clone());
                st.mac_addr = Some(mac.clone());
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        if !shared.debug && discovery_failed {
            log::error!("Discovery failed, interrupting agent start.");
            return;
        }

        // 4. Agentless fallback: no leader in a healthy scan. Guarded off.
        if ALE_ENABLED && !discovery_failed && found.is_none() {
            leader_switch_flow(shared.clone(), cancel.clone()).await;
            return;
        }

        // 5. CAU client. The endpoint is fixed, so this exchange runs in
        //    every deployment mode.
        log::debug!("Sending trigger to CAU client...");
        let (detected, mac, id_key, device_id) = {
            let st = shared.status.read();
            (
                st.detected_leader_id.clone().unwrap_or_default(),
                st.mac_addr.clone().unwrap_or_default(),
                st.id_key.clone().unwrap_or_default(),
                st.device_id.clone(),
            )
        };
        let cau_failed =
            match shared.triggers.trigger_cau_client(&detected, &mac, &id_key, &device_id).await {
                Ok(true) => {
                    let mut st = shared.status.write();
                    st.is_authenticated = Some(true);
                    st.secure_connection = Some(true);
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    log::error!("CAU client failed: {}", e);
                    true
                }
            };
        shared.status.write().cauclient_failed = Some(cau_failed);
        log::info!("CAU client trigger done");
        if !shared.debug && cau_failed {
            log::error!("CAU client failed, interrupting agent start.");
            return;
        }

        // 6. Categorization.
        if !shared.status.read().categorization_started {
            let cat_failed = if shared.triggers.collaborators.categorization.is_some() {
                log::debug!("Sending start trigger to Categorization...");
                let (detected, device_id) = {
                    let st = shared.status.read();
                    (st.detected_leader_id.clone(), st.device_id.clone())
                };
                match shared
                    .triggers
                    .start_categorization(detected.as_deref(), &device_id, false)
                    .await
                {
                    Ok(started) => {
                        shared.status.write().categorization_started = started;
                        !started
                    }
                    Err(e) => {
                        log::error!("Categorization failed: {}", e);
                        true
                    }
                }
            } else {
                false
            };
            shared.status.write().categorization_failed = Some(cat_failed);
            log::info!("Categorization start trigger done");
            if !shared.debug && cat_failed {
                log::error!("Categorization failed, interrupting agent start.");
                return;
            }
        }

        // 7. Area resilience, through the node's own policies service.
        if !shared.status.read().arearesilience_started {
            log::debug!("Sending start trigger to Policies...");
            let policies_failed = match shared.triggers.start_area_resilience().await {
                Ok(started) => {
                    shared.status.write().arearesilience_started = started;
                    !started
                }
                Err(e) => {
                    log::error!("Policies area resilience failed: {}", e);
                    true
                }
            };
            shared.status.write().policies_failed = Some(policies_failed);
            log::info!("Policies area resilience start trigger done");
            if !shared.debug && policies_failed {
                log::error!("Policies area resilience failed, interrupting agent start.");
                return;
            }
        }

        log_summary(&shared);
        upsert_agent_resource(&shared).await;

        // 8. Watch the leader through discovery; rescan when it goes away.
        if shared.triggers.collaborators.discovery.is_some() && !discovery_failed {
            log::debug!("Starting discovery leader watch...");
            if let Err(e) = shared.triggers.start_discovery_watch().await {
                log::error!("Watch discovery start failed: {}", e);
            }
            let mut alive = true;
            while !cancel.is_cancelled() && alive {
                match shared.triggers.alive_discovery().await {
                    Ok(disconnected) => alive = !disconnected,
                    Err(e) => {
                        log::error!("Discovery alive poll failed: {}", e);
                        alive = false;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(TIME_WAIT_ALIVE) => {}
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            log::warn!("Leader lost according to discovery; rescanning.");
            continue 'pipeline;
        }

        // Nothing to watch: hold position until switched or stopped.
        cancel.cancelled().await;
        return;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Leader pipeline
// ────────────────────────────────────────────────────────────────────────────

async fn leader_switch_flow(shared: Arc<StartShared>, cancel: CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }

    // 1. Beacons: internal light discovery first, then the external
    //    discovery service (when deployed).
    let _ = shared.discovery.stop_scanning().await;
    let _ = shared.discovery.start_beaconning().await;

    let leader_discovery_failed = if shared.triggers.collaborators.discovery.is_some() {
        log::debug!("Sending broadcast trigger to discovery...");
        match shared.triggers.switch_discovery_broadcast().await {
            Ok(message) => {
                shared.status.write().discovery_switched = Some(message);
                false
            }
            Err(e) => {
                log::error!("Discovery broadcast trigger failed: {}", e);
                true
            }
        }
    } else {
        false
    };
    {
        let mut st = shared.status.write();
        st.discovery_leader_failed = Some(leader_discovery_failed);
        if !leader_discovery_failed {
            st.detected_leader_id = Some(st.device_id.clone());
        }
    }
    log::info!("Discovery broadcast trigger done");
    if !shared.debug && leader_discovery_failed {
        log::error!("Discovery broadcast failed, interrupting leader switch.");
        return;
    }

    // 2. Leader CAU — not part of this iteration.

    // 3. Categorization: switch when already started, start otherwise.
    let cat_failed = if shared.triggers.collaborators.categorization.is_some() {
        let (started, device_id, detected) = {
            let st = shared.status.read();
            (st.categorization_started, st.device_id.clone(), st.detected_leader_id.clone())
        };
        if started {
            log::debug!("Sending switch trigger to Categorization...");
            match shared.triggers.switch_categorization(&device_id).await {
                Ok(switched) => {
                    shared.status.write().categorization_switched = Some(switched);
                    false
                }
                Err(e) => {
                    log::error!("Categorization switch to leader failed: {}", e);
                    true
                }
            }
        } else {
            log::debug!("Sending start trigger to Categorization...");
            match shared.triggers.start_categorization(detected.as_deref(), &device_id, true).await
            {
                Ok(started) => {
                    shared.status.write().categorization_started = started;
                    !started
                }
                Err(e) => {
                    log::error!("Categorization failed: {}", e);
                    true
                }
            }
        }
    } else {
        false
    };
    shared.status.write().categorization_leader_failed = Some(cat_failed);
    log::info!("Categorization trigger done");
    if !shared.debug && cat_failed {
        log::error!("Categorization failed, interrupting leader switch.");
        return;
    }

    // 4. Area resilience, when not already running.
    if !shared.status.read().arearesilience_started {
        log::debug!("Sending start trigger to Policies...");
        let policies_failed = match shared.triggers.start_area_resilience().await {
            Ok(started) => {
                shared.status.write().arearesilience_started = started;
                !started
            }
            Err(e) => {
                log::error!("Policies area resilience failed: {}", e);
                true
            }
        };
        shared.status.write().policies_failed = Some(policies_failed);
        log::info!("Policies area resilience start trigger done");
        if !shared.debug && policies_failed {
            log::error!("Policies area resilience failed, interrupting leader switch.");
            return;
        }
    }

    log_summary(&shared);
    upsert_agent_resource(&shared).await;
}

// ────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ────────────────────────────────────────────────────────────────────────────

fn summary_value(shared: &StartShared) -> serde_json::Value {
    let st = shared.status.read();
    json!({
        "MACaddr": st.mac_addr,
        "detectedLeaderID": st.detected_leader_id,
        "deviceID": st.device_id,
        "IDkey": st.id_key,
        "authenticated": st.is_authenticated,
        "secureConnection": st.secure_connection,
        "categorization_started": st.categorization_started,
        "lpp_started": st.arearesilience_started,
        "categorization_switched": st.categorization_switched,
        "discovery_switched": st.discovery_switched,
        "isLeader": shared.im_leader.load(Ordering::SeqCst),
        "leaderIP": st.leader_ip,
    })
}

fn log_summary(shared: &Arc<StartShared>) {
    log::info!("Start summary: {}", summary_value(shared));
}

/// Mirror the node into CIMI (best effort, skipped without a CIMI endpoint).
async fn upsert_agent_resource(shared: &Arc<StartShared>) {
    let (resource, existing) = {
        let st = shared.status.read();
        (
            AgentResource {
                device_id: st.device_id.clone(),
                device_ip: String::new(),
                authenticated: st.is_authenticated,
                secure_connection: st.secure_connection,
                is_leader: shared.im_leader.load(Ordering::SeqCst),
                leader_ip: st.leader_ip.clone(),
            },
            st.cimi_resource_id.clone(),
        )
    };
    match shared.triggers.upsert_agent_resource(existing.as_deref(), &resource).await {
        Ok(Some(id)) => shared.status.write().cimi_resource_id = Some(id),
        Ok(None) => {}
        Err(e) => log::warn!("Agent resource upsert failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::triggers::Collaborators;

    fn component() -> AgentStart {
        let http = reqwest::Client::new();
        let discovery = Arc::new(LightDiscovery::new(
            "255.255.255.255".to_string(),
            "agent/1234".to_string(),
            http.clone(),
        ));
        let triggers = ExternalTriggers::new(http, Collaborators::default(), String::new());
        AgentStart::new(triggers, discovery, "agent/1234".to_string(), None, true)
    }

    #[test]
    fn status_starts_with_env_identity_and_nothing_attempted() {
        let agent = component();
        let st = agent.status();
        assert_eq!(st.device_id, "agent/1234");
        assert_eq!(st.identification_failed, None);
        assert_eq!(st.discovery_failed, None);
        assert!(!st.categorization_started);
        assert!(!agent.is_started());
        assert!(!agent.im_leader());
    }

    #[test]
    fn summary_has_the_reporting_shape() {
        let agent = component();
        let summary = agent.summary();
        assert_eq!(summary["deviceID"], "agent/1234");
        assert_eq!(summary["isLeader"], false);
        assert_eq!(summary["lpp_started"], false);
        assert!(summary.get("MACaddr").is_some());
        assert!(summary.get("IDkey").is_some());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let agent = component();
        assert!(agent.start(false));
        assert!(!agent.start(false));
        assert!(agent.is_started());
        agent.stop().await;
    }

    #[tokio::test]
    async fn switch_requires_a_started_agent() {
        let agent = component();
        assert!(!agent.switch(true).await);
    }

    #[tokio::test]
    async fn switch_toggles_the_leader_flavour() {
        let agent = component();
        assert!(agent.start(false));
        assert!(agent.switch(true).await);
        assert!(agent.im_leader());
        assert!(agent.switch(false).await);
        assert!(!agent.im_leader());
        agent.stop().await;
    }
}
