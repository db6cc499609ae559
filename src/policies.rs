//! Policy bundle — the seven named policy groups replicated from leader to
//! followers.
//!
//! Each group is an independent key→scalar map with typed defaults. Groups
//! are serialized one JSON object per group, and a bundle travels as a map
//! of group name → JSON string (see [`PolicyBundle::distribution_payload`]).
//! Updates are atomic per group; readers never observe a torn group.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::config;

// ────────────────────────────────────────────────────────────────────────────
// Groups and well-known keys
// ────────────────────────────────────────────────────────────────────────────

/// The seven policy groups of the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyGroup {
    /// Leader Mandatory Requirements.
    Lmr,
    /// Leader Discretionary Requirements.
    Ldr,
    /// Passive Leader Selection Policies (reserved, opaque).
    Plsp,
    /// Automatic Leader Selection Policies (reserved, opaque).
    Alsp,
    /// Leader Protection Policies.
    Lpp,
    /// Leader Reelection Policies.
    Lrp,
    /// Distribution Policies.
    Dp,
}

impl PolicyGroup {
    pub const ALL: [PolicyGroup; 7] = [
        PolicyGroup::Lmr,
        PolicyGroup::Ldr,
        PolicyGroup::Plsp,
        PolicyGroup::Alsp,
        PolicyGroup::Lpp,
        PolicyGroup::Lrp,
        PolicyGroup::Dp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PolicyGroup::Lmr => "LMR",
            PolicyGroup::Ldr => "LDR",
            PolicyGroup::Plsp => "PLSP",
            PolicyGroup::Alsp => "ALSP",
            PolicyGroup::Lpp => "LPP",
            PolicyGroup::Lrp => "LRP",
            PolicyGroup::Dp => "DP",
        }
    }

    pub fn from_name(name: &str) -> Option<PolicyGroup> {
        match name {
            "LMR" => Some(PolicyGroup::Lmr),
            "LDR" => Some(PolicyGroup::Ldr),
            "PLSP" => Some(PolicyGroup::Plsp),
            "ALSP" => Some(PolicyGroup::Alsp),
            "LPP" => Some(PolicyGroup::Lpp),
            "LRP" => Some(PolicyGroup::Lrp),
            "DP" => Some(PolicyGroup::Dp),
            _ => None,
        }
    }
}

/// Leader Protection Policy keys.
pub mod lpp {
    pub const BACKUP_MINIMUM: &str = "BACKUP_MINIMUM";
    pub const BACKUP_MAXIMUM: &str = "BACKUP_MAXIMUM";
    pub const MAX_TTL: &str = "MAX_TTL";
    pub const MAX_RETRY_ATTEMPTS: &str = "MAX_RETRY_ATTEMPTS";
    pub const TIME_TO_WAIT_BACKUP_SELECTION: &str = "TIME_TO_WAIT_BACKUP_SELECTION";
    pub const TIME_KEEPALIVE: &str = "TIME_KEEPALIVE";
    pub const TIME_KEEPER: &str = "TIME_KEEPER";
}

/// Leader Mandatory Requirement keys.
pub mod lmr {
    pub const RAM_MIN: &str = "RAM_MIN";
}

/// Leader Discretionary Requirement keys.
pub mod ldr {
    pub const DISK_MIN: &str = "DISK_MIN";
}

/// Leader Reelection Policy keys.
pub mod lrp {
    pub const REELECTION_ALLOWED: &str = "REELECTION_ALLOWED";
}

/// Distribution Policy keys.
pub mod dp {
    pub const SYNC_ENABLED: &str = "SYNC_ENABLED";
    pub const SYNC_PERIOD: &str = "SYNC_PERIOD";
}

/// Timeout for shipping the bundle to one follower.
const DISTRIBUTION_TIMEOUT: Duration = Duration::from_secs(2);

fn defaults(group: PolicyGroup) -> Map<String, Value> {
    let value = match group {
        PolicyGroup::Lmr => json!({ "RAM_MIN": 2000 }),
        PolicyGroup::Ldr => json!({ "DISK_MIN": 2000 }),
        // Reserved groups: no fixed keys, the map is carried opaquely.
        PolicyGroup::Plsp | PolicyGroup::Alsp => json!({}),
        PolicyGroup::Lpp => json!({
            "BACKUP_MINIMUM": 1,
            "BACKUP_MAXIMUM": null,
            "MAX_TTL": 30,
            "MAX_RETRY_ATTEMPTS": 5,
            "TIME_TO_WAIT_BACKUP_SELECTION": 3,
            "TIME_KEEPALIVE": 1,
            "TIME_KEEPER": 0.1,
        }),
        PolicyGroup::Lrp => json!({ "REELECTION_ALLOWED": true }),
        PolicyGroup::Dp => json!({ "SYNC_ENABLED": false, "SYNC_PERIOD": 60 }),
    };
    match value {
        Value::Object(map) => map,
        _ => unreachable!("group defaults are object literals"),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Bundle
// ────────────────────────────────────────────────────────────────────────────

struct GroupState {
    /// Whether the key set is fixed by the defaults table. Reserved groups
    /// carry arbitrary keys instead.
    fixed: bool,
    values: Map<String, Value>,
}

/// Concurrent-safe bundle of the seven policy groups.
pub struct PolicyBundle {
    groups: HashMap<PolicyGroup, Mutex<GroupState>>,
}

impl Default for PolicyBundle {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyBundle {
    pub fn new() -> Self {
        let mut groups = HashMap::new();
        for group in PolicyGroup::ALL {
            let values = defaults(group);
            groups.insert(
                group,
                Mutex::new(GroupState { fixed: !values.is_empty(), values }),
            );
        }
        PolicyBundle { groups }
    }

    fn state(&self, group: PolicyGroup) -> &Mutex<GroupState> {
        // Every variant is inserted in `new`.
        &self.groups[&group]
    }

    /// Raw value of `key` in `group`, if present.
    pub fn get(&self, group: PolicyGroup, key: &str) -> Option<Value> {
        self.state(group).lock().values.get(key).cloned()
    }

    /// Numeric policy, falling back to `default` for unknown keys or
    /// non-numeric values.
    pub fn number(&self, group: PolicyGroup, key: &str, default: f64) -> f64 {
        self.get(group, key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    /// Integer policy with fallback.
    pub fn integer(&self, group: PolicyGroup, key: &str, default: i64) -> i64 {
        self.get(group, key)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(default)
    }

    /// Boolean policy with fallback.
    pub fn flag(&self, group: PolicyGroup, key: &str, default: bool) -> bool {
        self.get(group, key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Duration policy (seconds) with fallback. Negative values clamp to zero.
    pub fn seconds(&self, group: PolicyGroup, key: &str, default: f64) -> Duration {
        let secs = self.number(group, key, default);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Serialize one group to its JSON object.
    pub fn get_group_json(&self, group: PolicyGroup) -> String {
        let state = self.state(group).lock();
        serde_json::to_string(&state.values).unwrap_or_else(|_| "{}".to_string())
    }

    /// Replace group values from a JSON object. For fixed groups only keys
    /// already present in the defaults are updated, everything else is
    /// silently dropped; reserved groups adopt the object verbatim. Malformed
    /// JSON fails the call without touching the group.
    pub fn set_group_json(&self, group: PolicyGroup, payload: &str) -> bool {
        let parsed: Map<String, Value> = match serde_json::from_str(payload) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                log::error!("Rejected malformed policy payload for group {}", group.name());
                return false;
            }
        };
        let mut state = self.state(group).lock();
        if state.fixed {
            for (key, value) in parsed {
                if state.values.contains_key(&key) {
                    state.values.insert(key, value);
                }
            }
        } else {
            state.values = parsed;
        }
        true
    }

    /// The bundle as shipped on the wire: group name → JSON string.
    pub fn distribution_payload(&self) -> Map<String, Value> {
        let mut payload = Map::new();
        for group in PolicyGroup::ALL {
            payload.insert(group.name().to_string(), Value::String(self.get_group_json(group)));
        }
        payload
    }

    /// Apply a received bundle. Unknown group names and non-string entries
    /// are ignored; per-group parse failures are logged by `set_group_json`.
    pub fn receive(&self, payload: &Map<String, Value>) -> bool {
        for (name, value) in payload {
            if let (Some(group), Some(raw)) = (PolicyGroup::from_name(name), value.as_str()) {
                self.set_group_json(group, raw);
            }
        }
        log::info!("Policies received from Leader");
        for group in PolicyGroup::ALL {
            log::debug!("[{}] - {}", group.name(), self.get_group_json(group));
        }
        true
    }

    /// Ship the current bundle to every follower in `ips`. Best effort: a
    /// follower that cannot be reached is logged and skipped.
    pub async fn distribute(&self, http: &reqwest::Client, ips: &[String]) {
        let payload = Value::Object(self.distribution_payload());
        log::debug!("Policy payload: {}", payload);
        for ip in ips {
            let url = config::policies_url(ip, "receiveNewPolicies/");
            match http
                .post(&url)
                .json(&payload)
                .timeout(DISTRIBUTION_TIMEOUT)
                .send()
                .await
            {
                Ok(r) if r.status().is_success() => {
                    log::debug!("Policies sent correctly to [{}]", ip);
                }
                Ok(r) => {
                    log::debug!("Policies NOT sent correctly to [{}]: status {}", ip, r.status());
                }
                Err(e) => {
                    log::warn!("Error sending policies to [{}]: {}", ip, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_loaded() {
        let bundle = PolicyBundle::new();
        assert_eq!(bundle.integer(PolicyGroup::Lpp, lpp::BACKUP_MINIMUM, 0), 1);
        assert_eq!(bundle.integer(PolicyGroup::Lpp, lpp::MAX_TTL, 0), 30);
        assert_eq!(bundle.integer(PolicyGroup::Lpp, lpp::MAX_RETRY_ATTEMPTS, 0), 5);
        assert_eq!(bundle.number(PolicyGroup::Lpp, lpp::TIME_KEEPER, 0.0), 0.1);
        assert_eq!(bundle.integer(PolicyGroup::Lmr, lmr::RAM_MIN, 0), 2000);
        assert!(bundle.flag(PolicyGroup::Lrp, lrp::REELECTION_ALLOWED, false));
        assert!(!bundle.flag(PolicyGroup::Dp, dp::SYNC_ENABLED, true));
    }

    #[test]
    fn backup_maximum_stays_null() {
        let bundle = PolicyBundle::new();
        assert_eq!(bundle.get(PolicyGroup::Lpp, lpp::BACKUP_MAXIMUM), Some(Value::Null));
        // And it survives a round-trip.
        let raw = bundle.get_group_json(PolicyGroup::Lpp);
        assert!(bundle.set_group_json(PolicyGroup::Lpp, &raw));
        assert_eq!(bundle.get(PolicyGroup::Lpp, lpp::BACKUP_MAXIMUM), Some(Value::Null));
    }

    #[test]
    fn unknown_keys_are_dropped_silently() {
        let bundle = PolicyBundle::new();
        assert!(bundle.set_group_json(PolicyGroup::Lpp, r#"{"BACKUP_MINIMUM": 2, "EVIL": 666}"#));
        assert_eq!(bundle.integer(PolicyGroup::Lpp, lpp::BACKUP_MINIMUM, 0), 2);
        assert_eq!(bundle.get(PolicyGroup::Lpp, "EVIL"), None);
        // The serializer never emits unknown keys either.
        assert!(!bundle.get_group_json(PolicyGroup::Lpp).contains("EVIL"));
    }

    #[test]
    fn malformed_json_fails_without_mutation() {
        let bundle = PolicyBundle::new();
        assert!(!bundle.set_group_json(PolicyGroup::Lpp, r#"{"BACKUP_MINIMUM": "#));
        assert!(!bundle.set_group_json(PolicyGroup::Lpp, r#"[1, 2, 3]"#));
        assert_eq!(bundle.integer(PolicyGroup::Lpp, lpp::BACKUP_MINIMUM, 0), 1);
    }

    #[test]
    fn get_unknown_key_has_no_side_effect() {
        let bundle = PolicyBundle::new();
        assert_eq!(bundle.integer(PolicyGroup::Lpp, "NO_SUCH_POLICY", 42), 42);
        assert_eq!(bundle.get(PolicyGroup::Lpp, "NO_SUCH_POLICY"), None);
    }

    #[test]
    fn round_trip_is_a_noop_for_every_group() {
        let bundle = PolicyBundle::new();
        for group in PolicyGroup::ALL {
            let before = bundle.get_group_json(group);
            assert!(bundle.set_group_json(group, &before));
            assert_eq!(bundle.get_group_json(group), before);
        }
    }

    #[test]
    fn reserved_groups_round_trip_opaquely() {
        let bundle = PolicyBundle::new();
        let raw = r#"{"SELECTION_WINDOW":12,"STRATEGY":"first-fit"}"#;
        assert!(bundle.set_group_json(PolicyGroup::Plsp, raw));
        assert_eq!(bundle.integer(PolicyGroup::Plsp, "SELECTION_WINDOW", 0), 12);
        let emitted = bundle.get_group_json(PolicyGroup::Plsp);
        let reparsed: Value = serde_json::from_str(&emitted).unwrap();
        assert_eq!(reparsed, serde_json::from_str::<Value>(raw).unwrap());
    }

    #[test]
    fn bundle_reception_updates_named_groups() {
        // Scenario: leader ships {"LPP": "{\"BACKUP_MINIMUM\":2}", "LMR": "{}", ...}.
        let bundle = PolicyBundle::new();
        let payload = serde_json::json!({
            "LPP": "{\"BACKUP_MINIMUM\":2}",
            "LMR": "{}",
            "UNKNOWN_GROUP": "{\"X\":1}",
        });
        let Value::Object(map) = payload else { unreachable!() };
        assert!(bundle.receive(&map));
        assert_eq!(bundle.integer(PolicyGroup::Lpp, lpp::BACKUP_MINIMUM, 0), 2);
        assert_eq!(bundle.integer(PolicyGroup::Lmr, lmr::RAM_MIN, 0), 2000);
    }

    #[test]
    fn distribution_payload_carries_all_groups_as_strings() {
        let bundle = PolicyBundle::new();
        let payload = bundle.distribution_payload();
        assert_eq!(payload.len(), 7);
        for group in PolicyGroup::ALL {
            let raw = payload[group.name()].as_str().expect("group payload is a JSON string");
            assert!(serde_json::from_str::<Map<String, Value>>(raw).is_ok());
        }
    }
}
