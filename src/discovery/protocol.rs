//! Light-discovery wire types.
//!
//! Everything exchanged over UDP (leader beacons) and in the HTTP beacon
//! reply is defined here so the broadcaster, the scanner and the ControlAPI
//! speak the same language.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Interval between leader beacons: 50 ticks of 0.1 s.
pub const BEACON_PERIOD_TICKS: u32 = 50;

/// Granularity of the beacon sleep; shutdown latency is bounded by it.
pub const BEACON_TICK: std::time::Duration = std::time::Duration::from_millis(100);

/// Largest accepted discovery datagram.
pub const MAX_DATAGRAM: usize = 4096;

/// Timeout for posting a beacon reply back to the leader.
pub const BEACON_REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

// ────────────────────────────────────────────────────────────────────────────
// UDP beacon
// ────────────────────────────────────────────────────────────────────────────

/// Broadcast beacon payload — one JSON object per datagram, no framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    /// DeviceID of the beaconning leader.
    #[serde(rename = "leaderID")]
    pub leader_id: String,
}

/// Encode a [`Beacon`] into a datagram.
pub fn encode_beacon(beacon: &Beacon) -> Vec<u8> {
    serde_json::to_vec(beacon).expect("beacon serialisation is infallible")
}

/// Try to decode a [`Beacon`] from a raw datagram. Returns `None` when the
/// payload is not the expected JSON object.
pub fn decode_beacon(data: &[u8]) -> Option<Beacon> {
    serde_json::from_slice(data).ok()
}

// ────────────────────────────────────────────────────────────────────────────
// Beacon reply / topology entry
// ────────────────────────────────────────────────────────────────────────────

/// A follower's description of itself, posted to the beaconning leader and
/// stored as one topology entry. `deviceIP` is authoritative only once the
/// leader has replaced it with the HTTP peer address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInformation {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "deviceIP", default)]
    pub device_ip: String,
    pub cpu_cores: i64,
    pub mem_avail: f64,
    pub stg_avail: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_round_trip() {
        let beacon = Beacon { leader_id: "agent/L".to_string() };
        let wire = encode_beacon(&beacon);
        assert_eq!(String::from_utf8_lossy(&wire), r#"{"leaderID":"agent/L"}"#);
        let back = decode_beacon(&wire).expect("decodes");
        assert_eq!(back.leader_id, "agent/L");
    }

    #[test]
    fn garbage_datagrams_are_rejected() {
        assert!(decode_beacon(b"").is_none());
        assert!(decode_beacon(b"not json at all").is_none());
        assert!(decode_beacon(br#"{"somethingElse": 1}"#).is_none());
    }

    #[test]
    fn beacon_reply_uses_wire_field_names() {
        let info = DeviceInformation {
            device_id: "agent/A".to_string(),
            device_ip: String::new(),
            cpu_cores: 4,
            mem_avail: 7.5,
            stg_avail: 120.0,
        };
        let raw = serde_json::to_string(&info).unwrap();
        assert!(raw.contains(r#""deviceID":"agent/A""#));
        assert!(raw.contains(r#""cpu_cores":4"#));
        let back: DeviceInformation = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.device_id, "agent/A");
        assert_eq!(back.mem_avail, 7.5);
    }

    #[test]
    fn beacon_reply_tolerates_missing_ip() {
        // The payload's deviceIP is advisory; the leader overwrites it from
        // the HTTP peer address, so a reply without it must still parse.
        let raw = r#"{"deviceID":"agent/A","cpu_cores":2,"mem_avail":1.0,"stg_avail":8.0}"#;
        let back: DeviceInformation = serde_json::from_str(raw).unwrap();
        assert_eq!(back.device_ip, "");
    }
}
