//! Thin adapters around the external collaborator services.
//!
//! Each trigger issues one HTTP call (or, for the CAU client, one TCP
//! line-protocol exchange) and classifies the result. Nothing here owns
//! state or retries; the startup pipeline decides what a failure means.
//!
//! Collaborator addresses are optional: a full mF2C deployment dials the
//! real services, a standalone node leaves them unset and the pipeline
//! records the corresponding steps as locally satisfied. The one exception
//! is the CAU client, which lives at a fixed address and is dialled in
//! every mode.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{self, Config};
use crate::error::AgentError;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Discovery scan attempts before the pipeline declares discovery failed.
pub const MAX_MISSING_SCANS: u32 = 10;

/// Poll interval while waiting for CIMI to come up.
pub const WAIT_TIME_CIMI: Duration = Duration::from_secs(2);

/// Agentless fallback: switch to Leader when a successful scan finds no
/// leader. Guarded off; the branch exists but is never taken.
pub const ALE_ENABLED: bool = false;

/// Wireless config file handed to the discovery broadcast switch.
const WIFI_CONFIG_FILE: &str = "/discovery/mF2C-VSIE.conf";

/// Timeout applied to collaborator HTTP triggers.
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest CAU reply read in one exchange.
const CAU_REPLY_LIMIT: usize = 4092;

// ────────────────────────────────────────────────────────────────────────────
// Collaborator endpoints
// ────────────────────────────────────────────────────────────────────────────

/// Where the collaborator services live, when they exist at all.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Discovery service, `host:port`.
    pub discovery: Option<String>,
    /// Identification service, `host:port`.
    pub identification: Option<String>,
    /// Categorization service, `host:port`.
    pub categorization: Option<String>,
    /// CAU client, TCP line protocol. Fixed address, dialled in every mode.
    pub cau_client: (String, u16),
    /// CIMI base URL.
    pub cimi: Option<String>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Collaborators {
            discovery: None,
            identification: None,
            categorization: None,
            cau_client: (config::CAU_CLIENT_HOST.to_string(), config::CAU_CLIENT_PORT),
            cimi: None,
        }
    }
}

impl Collaborators {
    pub fn from_config(cfg: &Config) -> Self {
        if cfg.mf2c {
            Collaborators {
                discovery: Some("discovery:46040".to_string()),
                identification: Some("identification:46060".to_string()),
                categorization: Some("resource-categorization:46070".to_string()),
                cau_client: cfg.cau_client.clone(),
                cimi: Some(cfg.cimi_url.clone()),
            }
        } else {
            // Standalone node: only the fixed CAU endpoint is dialled.
            Collaborators { cau_client: cfg.cau_client.clone(), ..Collaborators::default() }
        }
    }
}

/// Reply of the identification service.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityReply {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "IDKey")]
    pub id_key: String,
}

/// Agent resource mirrored into CIMI after a completed pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResource {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "deviceIP")]
    pub device_ip: String,
    pub authenticated: Option<bool>,
    #[serde(rename = "secureConnection")]
    pub secure_connection: Option<bool>,
    #[serde(rename = "isLeader")]
    pub is_leader: bool,
    #[serde(rename = "leaderIP")]
    pub leader_ip: Option<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Triggers
// ────────────────────────────────────────────────────────────────────────────

pub struct ExternalTriggers {
    http: reqwest::Client,
    pub collaborators: Collaborators,
    wifi_dev: String,
}

impl ExternalTriggers {
    pub fn new(http: reqwest::Client, collaborators: Collaborators, wifi_dev: String) -> Self {
        ExternalTriggers { http, collaborators, wifi_dev }
    }

    /// Whether CIMI answers at all. A node without a CIMI endpoint is
    /// always "ready".
    pub async fn check_cimi_started(&self) -> bool {
        let Some(base) = &self.collaborators.cimi else { return true };
        match self.http.get(base).timeout(TRIGGER_TIMEOUT).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }

    /// Ask Identification for this node's deviceID and key.
    pub async fn request_identification(&self) -> Result<IdentityReply, AgentError> {
        let addr = self.require(&self.collaborators.identification, "identification")?;
        let url = format!("http://{}/api/v1/resource-management/identification/requestID/", addr);
        let r = self.http.get(&url).timeout(TRIGGER_TIMEOUT).send().await?;
        r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))
    }

    /// One discovery scan. `Ok(Some((leaderID, mac)))` when a leader was
    /// found, `Ok(None)` when the scan ran but saw nothing.
    pub async fn start_scan(&self) -> Result<Option<(String, String)>, AgentError> {
        let addr = self.require(&self.collaborators.discovery, "discovery")?;
        let mut url = format!("http://{}/api/v1/resource-management/discovery/scan/", addr);
        if !self.wifi_dev.is_empty() {
            url.push_str(&self.wifi_dev);
        }
        let r = self.http.get(&url).timeout(TRIGGER_TIMEOUT).send().await?;
        let body: serde_json::Value =
            r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
        Ok(parse_scan_reply(&body))
    }

    /// Switch the discovery service to leader-side broadcasting.
    pub async fn switch_discovery_broadcast(&self) -> Result<String, AgentError> {
        let addr = self.require(&self.collaborators.discovery, "discovery")?;
        let url = format!("http://{}/api/v1/resource-management/discovery/broadcast/", addr);
        let payload = json!({
            "broadcast_frequency": 100,
            "interface_name": self.wifi_dev,
            "config_file": WIFI_CONFIG_FILE,
        });
        let r = self.http.post(&url).json(&payload).timeout(TRIGGER_TIMEOUT).send().await?;
        let body: serde_json::Value =
            r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
        Ok(body.get("message").and_then(|m| m.as_str()).unwrap_or_default().to_string())
    }

    /// Start the agent-side leader watch in the discovery service.
    pub async fn start_discovery_watch(&self) -> Result<(), AgentError> {
        let body = self.discovery_watch(json!({ "key": "start" })).await?;
        log::info!(
            "Discovery watch: {}",
            body.get("message").and_then(|m| m.as_str()).unwrap_or_default()
        );
        Ok(())
    }

    /// Poll the discovery watch. Returns true when the leader is reported
    /// disconnected.
    pub async fn alive_discovery(&self) -> Result<bool, AgentError> {
        let body = self.discovery_watch(json!({ "key": "get" })).await?;
        body.get("DISCONNECTED")
            .and_then(|d| d.as_bool())
            .ok_or_else(|| AgentError::Protocol("watch reply without DISCONNECTED".to_string()))
    }

    async fn discovery_watch(
        &self,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let addr = self.require(&self.collaborators.discovery, "discovery")?;
        let url = format!("http://{}/api/v1/resource-management/discovery/watch_agent_side/", addr);
        let r = self.http.get(&url).json(&payload).timeout(TRIGGER_TIMEOUT).send().await?;
        r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))
    }

    /// Authenticate the node through the CAU client: one line out, one
    /// reply back; success iff the reply contains `OK`.
    pub async fn trigger_cau_client(
        &self,
        detected_leader_id: &str,
        mac_addr: &str,
        id_key: &str,
        device_id: &str,
    ) -> Result<bool, AgentError> {
        let (host, port) = self.collaborators.cau_client.clone();
        let line = cau_handshake_line(detected_leader_id, mac_addr, id_key, device_id);
        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.write_all(line.as_bytes()).await?;
        let mut buf = vec![0u8; CAU_REPLY_LIMIT];
        let n = stream.read(&mut buf).await?;
        let reply = String::from_utf8_lossy(&buf[..n]).to_string();
        log::debug!("CAU client reply: {}", reply.trim_end());
        Ok(parse_cau_reply(&reply))
    }

    /// Start (agent or leader flavour of) categorization.
    pub async fn start_categorization(
        &self,
        detected_leader_id: Option<&str>,
        device_id: &str,
        is_leader: bool,
    ) -> Result<bool, AgentError> {
        let addr = self.require(&self.collaborators.categorization, "categorization")?;
        let url = format!("http://{}/api/v1/resource-management/categorization/start/", addr);
        let payload = json!({
            "detectedLeaderID": detected_leader_id,
            "deviceID": device_id,
            "isLeader": is_leader,
        });
        let r = self.http.post(&url).json(&payload).timeout(TRIGGER_TIMEOUT).send().await?;
        let body: serde_json::Value =
            r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
        if body.get("error").is_some() {
            return Ok(false);
        }
        Ok(body.get("started").and_then(|s| s.as_bool()).unwrap_or(false))
    }

    /// Switch categorization to its leader flavour.
    pub async fn switch_categorization(&self, device_id: &str) -> Result<bool, AgentError> {
        let addr = self.require(&self.collaborators.categorization, "categorization")?;
        let url =
            format!("http://{}/api/v1/resource-management/categorization/leader-switch/", addr);
        let payload = json!({ "deviceID": device_id });
        let r = self.http.get(&url).json(&payload).timeout(TRIGGER_TIMEOUT).send().await?;
        let body: serde_json::Value =
            r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
        Ok(body.get("started").and_then(|s| s.as_bool()).unwrap_or(false))
    }

    /// Kick the node's own policies service: start area resilience.
    pub async fn start_area_resilience(&self) -> Result<bool, AgentError> {
        let url = config::policies_url("127.0.0.1", "startAreaResilience/");
        let r = self.http.get(&url).timeout(TRIGGER_TIMEOUT).send().await?;
        if !r.status().is_success() {
            return Ok(false);
        }
        let body: serde_json::Value =
            r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
        Ok(body.get("started").and_then(|s| s.as_bool()).unwrap_or(false))
    }

    /// Create or update this node's agent resource in CIMI. Returns the
    /// resource id, when CIMI is configured and assigns one.
    pub async fn upsert_agent_resource(
        &self,
        existing_id: Option<&str>,
        resource: &AgentResource,
    ) -> Result<Option<String>, AgentError> {
        let Some(base) = &self.collaborators.cimi else { return Ok(None) };
        match existing_id {
            Some(id) => {
                let url = format!("{}/{}", base, id);
                self.http.put(&url).json(resource).timeout(TRIGGER_TIMEOUT).send().await?;
                Ok(Some(id.to_string()))
            }
            None => {
                let url = format!("{}/agent", base);
                let r = self.http.post(&url).json(resource).timeout(TRIGGER_TIMEOUT).send().await?;
                let body: serde_json::Value =
                    r.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
                Ok(body.get("resource-id").and_then(|v| v.as_str()).map(|s| s.to_string()))
            }
        }
    }

    fn require<'a>(
        &self,
        endpoint: &'a Option<String>,
        name: &str,
    ) -> Result<&'a String, AgentError> {
        endpoint
            .as_ref()
            .ok_or_else(|| AgentError::State(format!("{} service not configured", name)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pure helpers
// ────────────────────────────────────────────────────────────────────────────

/// The CAU handshake line. The identification key travels truncated to its
/// first 64 characters.
pub fn cau_handshake_line(
    detected_leader_id: &str,
    mac_addr: &str,
    id_key: &str,
    device_id: &str,
) -> String {
    let key: String = id_key.chars().take(64).collect();
    format!(
        "detectedLeaderID={},MACaddr={},IDkey={},deviceID={}\n",
        detected_leader_id, mac_addr, key, device_id
    )
}

/// The CAU client signals success by including `OK` in its reply.
pub fn parse_cau_reply(reply: &str) -> bool {
    reply.contains("OK")
}

/// Extract `(leaderID, mac)` from a discovery scan reply of the shape
/// `{"found_leaders": [{"Leader ID": …}, …], "used_mac": …}`.
pub fn parse_scan_reply(body: &serde_json::Value) -> Option<(String, String)> {
    let leaders = body.get("found_leaders")?.as_array()?;
    let mac = body.get("used_mac")?.as_str()?;
    let first = leaders.first()?.get("Leader ID")?.as_str()?;
    Some((first.to_string(), mac.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cau_line_has_the_wire_shape() {
        let line = cau_handshake_line("agent/L", "aa:bb:cc", "secret-key", "agent/A");
        assert_eq!(
            line,
            "detectedLeaderID=agent/L,MACaddr=aa:bb:cc,IDkey=secret-key,deviceID=agent/A\n"
        );
    }

    #[test]
    fn cau_line_truncates_the_key_to_64_chars() {
        let key = "k".repeat(200);
        let line = cau_handshake_line("l", "m", &key, "d");
        assert!(line.contains(&format!("IDkey={},", "k".repeat(64))));
        assert!(!line.contains(&"k".repeat(65)));
    }

    #[test]
    fn cau_reply_success_needs_ok() {
        assert!(parse_cau_reply("OK\n"));
        assert!(parse_cau_reply("auth OK, certificate stored"));
        assert!(!parse_cau_reply("ERR: no key"));
        assert!(!parse_cau_reply(""));
    }

    #[test]
    fn scan_reply_extracts_first_leader_and_mac() {
        let body = serde_json::json!({
            "found_leaders": [
                { "Leader ID": "agent/L" },
                { "Leader ID": "agent/M" },
            ],
            "used_mac": "aa:bb:cc:dd:ee:ff",
        });
        assert_eq!(
            parse_scan_reply(&body),
            Some(("agent/L".to_string(), "aa:bb:cc:dd:ee:ff".to_string()))
        );
    }

    #[test]
    fn scan_reply_without_leaders_is_none() {
        let body = serde_json::json!({ "found_leaders": [], "used_mac": "aa:bb" });
        assert_eq!(parse_scan_reply(&body), None);
        let body = serde_json::json!({ "something": "else" });
        assert_eq!(parse_scan_reply(&body), None);
    }

    #[test]
    fn standalone_config_still_dials_the_cau_client() {
        let cfg = test_config(false);
        let collab = Collaborators::from_config(&cfg);
        assert!(collab.discovery.is_none());
        assert!(collab.identification.is_none());
        assert!(collab.categorization.is_none());
        assert!(collab.cimi.is_none());
        // The CAU endpoint is fixed, not mF2C-gated.
        assert_eq!(collab.cau_client, ("cau-client".to_string(), 46065));
    }

    #[test]
    fn mf2c_config_dials_the_real_services() {
        let cfg = test_config(true);
        let collab = Collaborators::from_config(&cfg);
        assert_eq!(collab.discovery.as_deref(), Some("discovery:46040"));
        assert_eq!(collab.identification.as_deref(), Some("identification:46060"));
        assert_eq!(collab.categorization.as_deref(), Some("resource-categorization:46070"));
        assert_eq!(collab.cau_client, ("cau-client".to_string(), 46065));
    }

    fn test_config(mf2c: bool) -> Config {
        Config {
            leader: false,
            leader_ip: None,
            topology: Vec::new(),
            debug: false,
            mf2c,
            wifi_dev: String::new(),
            device_id: "agent/1234".to_string(),
            broadcast_addr: "255.255.255.255".to_string(),
            cimi_url: crate::config::CIMI_URL_DEFAULT.to_string(),
            cau_client: ("cau-client".to_string(), 46065),
        }
    }
}
