//! Light discovery — UDP beaconning (leader) and scan-listening (follower).
//!
//! The two modes are mutually exclusive and driven by the node's role:
//!
//! 1. **Beacon mode** — the leader broadcasts `{"leaderID": …}` datagrams on
//!    the discovery port so followers on the same segment can find it.
//!
//! 2. **Scan mode** — a follower binds the discovery port, and for every
//!    beacon it receives it categorizes the local device and posts a
//!    [`DeviceInformation`] reply to the beacon's origin over HTTP.
//!
//! Beacon replies land back here (via ControlAPI) and build the leader's
//! topology table. Both workers respect a `CancellationToken` for clean
//! shutdown; `stop_*` cancels and joins before returning.

pub mod protocol;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::{self, LDISCOVERY_PORT};
use crate::worker::Worker;
use protocol::{
    decode_beacon, encode_beacon, Beacon, DeviceInformation, BEACON_PERIOD_TICKS,
    BEACON_REPLY_TIMEOUT, BEACON_TICK, MAX_DATAGRAM,
};

// ────────────────────────────────────────────────────────────────────────────
// Component
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Beacon,
    Scan,
}

struct DiscoveryState {
    device_id: String,
    broadcast_addr: String,
    http: reqwest::Client,
    mode: Mutex<Mode>,
    worker: Mutex<Option<Worker>>,
    /// Topology table, insertion-ordered, keyed by deviceID (last writer
    /// wins on duplicates).
    db: Mutex<Vec<DeviceInformation>>,
    /// Last beacon seen while scanning: (leaderID, source IP).
    last_beacon: Mutex<Option<(String, String)>>,
}

pub struct LightDiscovery {
    inner: Arc<DiscoveryState>,
}

impl LightDiscovery {
    pub fn new(broadcast_addr: String, device_id: String, http: reqwest::Client) -> Self {
        LightDiscovery {
            inner: Arc::new(DiscoveryState {
                device_id,
                broadcast_addr,
                http,
                mode: Mutex::new(Mode::Idle),
                worker: Mutex::new(None),
                db: Mutex::new(Vec::new()),
                last_beacon: Mutex::new(None),
            }),
        }
    }

    pub fn is_beaconning(&self) -> bool {
        *self.inner.mode.lock() == Mode::Beacon
    }

    pub fn is_scanning(&self) -> bool {
        *self.inner.mode.lock() == Mode::Scan
    }

    // ── Mode control ─────────────────────────────────────────────────────

    /// Start broadcasting leader beacons. Returns false when any mode is
    /// already active or the socket cannot be opened.
    pub async fn start_beaconning(&self) -> bool {
        if !self.enter(Mode::Beacon) {
            return false;
        }
        // A fresh leader starts from an empty topology.
        self.inner.db.lock().clear();

        let socket = match bind_broadcast_udp().await {
            Ok(s) => s,
            Err(e) => {
                log::error!("LDiscovery beacon socket failed: {}", e);
                *self.inner.mode.lock() = Mode::Idle;
                return false;
            }
        };

        let state = self.inner.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { beacon_flow(state, socket, token).await });
        *self.inner.worker.lock() = Some(Worker { cancel, handle });
        log::info!("LDiscovery successfully started in Beacon Mode");
        true
    }

    /// Start listening for leader beacons. Returns false when any mode is
    /// already active or the discovery port cannot be bound.
    pub async fn start_scanning(&self) -> bool {
        if !self.enter(Mode::Scan) {
            return false;
        }

        // Pre-bind so a port clash surfaces here, not inside the worker.
        let socket = match bind_reusable_udp(LDISCOVERY_PORT) {
            Ok(s) => s,
            Err(e) => {
                log::error!("LDiscovery scan bind failed on port {}: {}", LDISCOVERY_PORT, e);
                *self.inner.mode.lock() = Mode::Idle;
                return false;
            }
        };

        let state = self.inner.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { scan_flow(state, socket, token).await });
        *self.inner.worker.lock() = Some(Worker { cancel, handle });
        log::info!("LDiscovery successfully started in Scan Mode");
        true
    }

    /// Stop beaconning: cancel the worker (which unblocks its sleep and
    /// releases the socket) and join it.
    pub async fn stop_beaconning(&self) -> bool {
        self.leave(Mode::Beacon).await
    }

    /// Stop scanning: cancel the worker (which unblocks the receive loop and
    /// releases the socket) and join it.
    pub async fn stop_scanning(&self) -> bool {
        self.leave(Mode::Scan).await
    }

    fn enter(&self, target: Mode) -> bool {
        let mut mode = self.inner.mode.lock();
        if *mode != Mode::Idle {
            log::warn!("LDiscovery is already started: mode={:?}", *mode);
            return false;
        }
        *mode = target;
        true
    }

    async fn leave(&self, expected: Mode) -> bool {
        {
            let mode = self.inner.mode.lock();
            if *mode != expected {
                log::warn!("LDiscovery is not in {:?} mode (mode={:?})", expected, *mode);
                return true;
            }
        }
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }
        *self.inner.mode.lock() = Mode::Idle;
        log::info!("LDiscovery {:?} stopped", expected);
        true
    }

    // ── Topology ─────────────────────────────────────────────────────────

    /// Ingest a beacon reply. `peer_ip` is the HTTP peer address and
    /// replaces whatever the payload claimed.
    pub fn recv_reply(&self, mut info: DeviceInformation, peer_ip: &str) -> bool {
        if info.device_id.is_empty() {
            log::error!("Beacon reply without deviceID rejected");
            return false;
        }
        info.device_ip = peer_ip.to_string();
        let mut db = self.inner.db.lock();
        if let Some(existing) = db.iter_mut().find(|d| d.device_id == info.device_id) {
            *existing = info;
        } else {
            db.push(info);
        }
        true
    }

    /// `(deviceID, deviceIP)` pairs in insertion order.
    pub fn topology_pairs(&self) -> Vec<(String, String)> {
        self.inner
            .db
            .lock()
            .iter()
            .map(|d| (d.device_id.clone(), d.device_ip.clone()))
            .collect()
    }

    /// Snapshot of the full topology entries.
    pub fn entries(&self) -> Vec<DeviceInformation> {
        self.inner.db.lock().clone()
    }

    /// Last leader observed on the segment while scanning, as
    /// `(leaderID, source IP)`.
    pub fn detected_leader(&self) -> Option<(String, String)> {
        self.inner.last_beacon.lock().clone()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Worker flows
// ────────────────────────────────────────────────────────────────────────────

/// Leader side: broadcast one beacon, sleep one period, repeat. Send errors
/// are logged and retried on the next tick.
async fn beacon_flow(state: Arc<DiscoveryState>, socket: UdpSocket, cancel: CancellationToken) {
    let beacon = encode_beacon(&Beacon { leader_id: state.device_id.clone() });
    let target = format!("{}:{}", state.broadcast_addr, LDISCOVERY_PORT);
    let period = BEACON_TICK * BEACON_PERIOD_TICKS;

    loop {
        log::debug!("Sending beacon at [{}]", target);
        if let Err(e) = socket.send_to(&beacon, target.as_str()).await {
            log::warn!("Error sending beacon to [{}]: {}", target, e);
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
    log::debug!("Beacon flow stopped");
}

/// Follower side: receive beacons, categorize this device, reply to the
/// beacon origin over HTTP.
async fn scan_flow(state: Arc<DiscoveryState>, socket: UdpSocket, cancel: CancellationToken) {
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let src_ip = src.ip().to_string();
                        log::debug!(
                            "Received beacon from [{}]: \"{}\"",
                            src_ip,
                            String::from_utf8_lossy(&buf[..len])
                        );
                        if let Some(beacon) = decode_beacon(&buf[..len]) {
                            *state.last_beacon.lock() = Some((beacon.leader_id, src_ip.clone()));
                        }
                        send_beacon_reply(&state, &src_ip).await;
                    }
                    Err(e) => {
                        log::warn!("LDiscovery scan recv error: {}", e);
                    }
                }
            }
        }
    }
    log::info!("Scan flow stopped");
}

async fn send_beacon_reply(state: &DiscoveryState, leader_ip: &str) {
    let (cpu, mem, stg) = categorize_device();
    log::debug!("CPU: {}, MEM: {}, STG: {}", cpu, mem, stg);
    let payload = DeviceInformation {
        device_id: state.device_id.clone(),
        device_ip: String::new(),
        cpu_cores: cpu,
        mem_avail: mem,
        stg_avail: stg,
    };
    let url = config::ld_url(leader_ip, "beaconReply/");
    match state
        .http
        .post(&url)
        .json(&payload)
        .timeout(BEACON_REPLY_TIMEOUT)
        .send()
        .await
    {
        Ok(r) if r.status().is_success() => {
            log::info!("Discovery message successfully sent to Leader");
        }
        Ok(r) => {
            log::warn!("Discovery message received error status code {}", r.status());
        }
        Err(e) => {
            log::warn!("Error sending beacon reply to [{}]: {}", leader_ip, e);
        }
    }
}

/// Logical core count, available memory (GiB) and total free disk space
/// across mount points (GiB). Anything unreadable counts as zero.
pub fn categorize_device() -> (i64, f64, f64) {
    const GIB: f64 = (1u64 << 30) as f64;
    let sys = sysinfo::System::new_all();

    let cpu_cores = sys.cpus().len() as i64;
    let mem_avail = sys.available_memory() as f64 / GIB;
    let stg_avail = sysinfo::Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|d| d.available_space())
        .sum::<u64>() as f64
        / GIB;
    (cpu_cores, mem_avail, stg_avail)
}

// ────────────────────────────────────────────────────────────────────────────
// Socket helpers
// ────────────────────────────────────────────────────────────────────────────

/// Ephemeral UDP socket with `SO_BROADCAST`, for the beacon sender.
async fn bind_broadcast_udp() -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// Bind the discovery port with `SO_REUSEADDR` (and `SO_REUSEPORT` where it
/// exists) via `socket2`, so agents restarted in place or co-located during
/// development can share the port.
fn bind_reusable_udp(port: u16) -> std::io::Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}
