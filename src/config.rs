//! Runtime configuration.
//!
//! All knobs come from environment variables (the deployment contract of the
//! agent container), optionally overlaid on a TOML file named by
//! `CONFIG_FILE` (default `agent.toml`). When both are present the
//! environment wins, so an operator can always override a baked-in file.

use std::env;
use std::time::Duration;

use serde::Deserialize;

// ────────────────────────────────────────────────────────────────────────────
// Fixed ports and addresses
// ────────────────────────────────────────────────────────────────────────────

/// TCP port of the agent's own HTTP surface (ControlAPI).
pub const POLICIES_PORT: u16 = 46050;

/// UDP port used for light-discovery beacons.
pub const LDISCOVERY_PORT: u16 = 46051;

/// Base path of the policies API namespace.
pub const POLICIES_BASE: &str = "/api/v2/resource-management/policies";

/// Default CIMI endpoint (the persistent resource registry).
pub const CIMI_URL_DEFAULT: &str = "http://cimi:8201/api";

/// Default CAU client endpoint (TCP line protocol).
pub const CAU_CLIENT_HOST: &str = "cau-client";
pub const CAU_CLIENT_PORT: u16 = 46065;

/// Grace period before the boot sequence creates the submodules.
pub const TIME_WAIT_INIT: Duration = Duration::from_secs(2);

/// Interval of the discovery-watch alive poll.
pub const TIME_WAIT_ALIVE: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// URL builders
// ────────────────────────────────────────────────────────────────────────────

/// URL of a policies-API endpoint on `addr`, e.g.
/// `policies_url("10.0.0.2", "roleChange/backup")`.
pub fn policies_url(addr: &str, endpoint: &str) -> String {
    format!("http://{}:{}{}/{}", addr, POLICIES_PORT, POLICIES_BASE, endpoint)
}

/// URL of a light-discovery endpoint on `addr`, e.g. `ld_url(ip, "beaconReply/")`.
pub fn ld_url(addr: &str, endpoint: &str) -> String {
    format!("http://{}:{}/ld/{}", addr, POLICIES_PORT, endpoint)
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Optional file-based configuration; every field mirrors an environment
/// variable and is overridden by it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub is_leader: Option<bool>,
    pub leader_ip: Option<String>,
    pub topology: Option<Vec<(String, String)>>,
    pub debug: Option<bool>,
    pub mf2c: Option<bool>,
    pub wifi_dev: Option<String>,
    pub device_id: Option<String>,
    pub broadcast_addr: Option<String>,
    pub cimi_url: Option<String>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// This node boots as the area Leader.
    pub leader: bool,
    /// Known leader address, when handed in from outside.
    pub leader_ip: Option<String>,
    /// Static topology literal; when non-empty it replaces discovery as the
    /// topology source.
    pub topology: Vec<(String, String)>,
    /// Debug mode: verbose logging, pipeline failures do not abort.
    pub debug: bool,
    /// Full mF2C deployment: dial the real collaborator services.
    pub mf2c: bool,
    /// Wireless interface handed to the discovery service.
    pub wifi_dev: String,
    /// Identity used until Identification assigns one.
    pub device_id: String,
    /// Broadcast address for beacons.
    pub broadcast_addr: String,
    /// CIMI endpoint.
    pub cimi_url: String,
    /// CAU client endpoint.
    pub cau_client: (String, u16),
}

impl Config {
    /// Build the configuration from the process environment, overlaid on the
    /// optional TOML file.
    pub fn from_env() -> Self {
        let file = load_file_config();

        let leader = env::var("isLeader")
            .ok()
            .map(|v| parse_bool(&v))
            .or(file.is_leader)
            .unwrap_or(false);
        let leader_ip = env::var("leaderIP")
            .ok()
            .filter(|v| !v.is_empty())
            .or(file.leader_ip);
        let topology = env::var("TOPOLOGY")
            .ok()
            .map(|v| parse_topology(&v))
            .or(file.topology)
            .unwrap_or_default();
        let debug = env::var("DEBUG")
            .ok()
            .map(|v| parse_bool(&v))
            .or(file.debug)
            .unwrap_or(false);
        let mf2c = env::var("MF2C")
            .ok()
            .map(|v| parse_bool(&v))
            .or(file.mf2c)
            .unwrap_or(false);
        let wifi_dev = env::var("WIFI_DEV")
            .ok()
            .or(file.wifi_dev)
            .unwrap_or_default();
        let device_id = env::var("DEVICEID")
            .ok()
            .filter(|v| !v.is_empty())
            .or(file.device_id)
            .unwrap_or_else(|| "agent/1234".to_string());
        let broadcast_addr = env::var("BROADCASTADDR")
            .ok()
            .filter(|v| !v.is_empty())
            .or(file.broadcast_addr)
            .unwrap_or_else(|| "255.255.255.255".to_string());
        let cimi_url = env::var("CIMI_URL")
            .ok()
            .or(file.cimi_url)
            .unwrap_or_else(|| CIMI_URL_DEFAULT.to_string());

        Config {
            leader,
            leader_ip,
            topology,
            debug,
            mf2c,
            wifi_dev,
            device_id,
            broadcast_addr,
            cimi_url,
            cau_client: (CAU_CLIENT_HOST.to_string(), CAU_CLIENT_PORT),
        }
    }
}

fn load_file_config() -> FileConfig {
    let path = env::var("CONFIG_FILE").unwrap_or_else(|_| "agent.toml".to_string());
    match std::fs::read_to_string(&path) {
        Ok(raw) => match toml::from_str(&raw) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Config file {} is not valid TOML: {}", path, e);
                FileConfig::default()
            }
        },
        Err(_) => FileConfig::default(),
    }
}

/// Flag parsing follows the container contract: the literal `True` (and its
/// lowercase spelling) means set, anything else means unset.
pub fn parse_bool(value: &str) -> bool {
    matches!(value, "True" | "true" | "1")
}

/// `TOPOLOGY` is a list literal of `[deviceID, deviceIP]` pairs, e.g.
/// `[["agent/1", "10.0.0.1"], ["agent/2", "10.0.0.2"]]`. A malformed literal
/// yields an empty topology rather than a boot failure.
pub fn parse_topology(value: &str) -> Vec<(String, String)> {
    match serde_json::from_str::<Vec<(String, String)>>(value) {
        Ok(pairs) => pairs,
        Err(e) => {
            log::error!("TOPOLOGY literal is not a list of [deviceID, deviceIP] pairs: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_flags_follow_container_contract() {
        assert!(parse_bool("True"));
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("False"));
        assert!(!parse_bool("yes"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn topology_literal_parses_pairs() {
        let t = parse_topology(r#"[["agent/1", "10.0.0.1"], ["agent/2", "10.0.0.2"]]"#);
        assert_eq!(t.len(), 2);
        assert_eq!(t[0], ("agent/1".to_string(), "10.0.0.1".to_string()));
    }

    #[test]
    fn malformed_topology_literal_is_empty() {
        assert!(parse_topology("[('agent/1', '10.0.0.1')]").is_empty());
        assert!(parse_topology("").is_empty());
    }

    #[test]
    fn url_builders() {
        assert_eq!(
            policies_url("10.0.0.2", "roleChange/backup"),
            "http://10.0.0.2:46050/api/v2/resource-management/policies/roleChange/backup"
        );
        assert_eq!(ld_url("10.0.0.2", "beaconReply/"), "http://10.0.0.2:46050/ld/beaconReply/");
    }
}
