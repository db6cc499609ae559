//! Area resilience — keep always a Leader in the area.
//!
//! Role-dependent protection protocol:
//!
//! * A **backup** runs the keepalive loop against the leader. When the
//!   leader stops answering (or answers that it is no longer a leader) the
//!   backup enters a priority-staggered takeover: priority 1 takes over
//!   after 1 s, priority n after `1 + 10·(n−1)` s, and late backups consult
//!   discovery first so an earlier takeover makes them stand down.
//!
//! * A **leader** runs the keeper (decrements every backup's TTL, demotes
//!   the expired) and the backup-selection loop (keeps at least
//!   `BACKUP_MINIMUM` live backups elected from the topology).
//!
//! Role state lives in one [`Shared`] record behind an `Arc`; demotion stops
//! the workers and restarts the flow on the same record rather than
//! rebuilding the component.

pub mod backups;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::AgentError;
use crate::policies::{lpp, PolicyBundle, PolicyGroup};
use crate::topology::TopologyProvider;
use crate::worker::{self, Worker};
use backups::BackupTable;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Keepalive reply sentinel: the sender is not recognised as a backup.
pub const PRIORITY_ON_DEMOTION: i64 = -2;

/// Keepalive reply sentinel reserved for the reelection handoff. Defined for
/// wire compatibility, never emitted.
pub const PRIORITY_ON_REELECTION: i64 = 0;

/// Keepalive reply sentinel: the target is not a Leader.
pub const PRIORITY_ON_FAILURE: i64 = -3;

const KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(500);
const ELECTION_TIMEOUT: Duration = Duration::from_millis(1500);
const ROLECHANGE_TIMEOUT: Duration = Duration::from_millis(500);

// ────────────────────────────────────────────────────────────────────────────
// Wire and state types
// ────────────────────────────────────────────────────────────────────────────

/// Observable role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Backup,
    Leader,
}

/// Body of a keepalive reply (also reused by ControlAPI when shaping one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveReply {
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "backupPriority")]
    pub backup_priority: i64,
}

struct Shared {
    policies: Arc<PolicyBundle>,
    topology: Arc<dyn TopologyProvider>,
    leader_flag: Arc<AtomicBool>,
    http: reqwest::Client,

    device_id: RwLock<String>,
    leader_ip: RwLock<String>,

    im_leader: AtomicBool,
    im_backup: AtomicBool,
    im_capable: AtomicBool,
    leader_failed: AtomicBool,
    startup_correct: AtomicBool,
    backup_priority: AtomicI64,

    backups: BackupTable,

    started: AtomicBool,
    worker: Mutex<Option<Worker>>,
    keeper: Mutex<Option<Worker>>,
}

impl Shared {
    fn max_ttl(&self) -> i64 {
        self.policies.integer(PolicyGroup::Lpp, lpp::MAX_TTL, 30)
    }

    fn max_retry_attempts(&self) -> i64 {
        self.policies.integer(PolicyGroup::Lpp, lpp::MAX_RETRY_ATTEMPTS, 5)
    }

    fn backup_minimum(&self) -> i64 {
        self.policies.integer(PolicyGroup::Lpp, lpp::BACKUP_MINIMUM, 1)
    }

    fn keepalive_period(&self) -> Duration {
        self.policies.seconds(PolicyGroup::Lpp, lpp::TIME_KEEPALIVE, 1.0)
    }

    fn keeper_period(&self) -> Duration {
        self.policies.seconds(PolicyGroup::Lpp, lpp::TIME_KEEPER, 0.1)
    }

    fn selection_period(&self) -> Duration {
        self.policies.seconds(PolicyGroup::Lpp, lpp::TIME_TO_WAIT_BACKUP_SELECTION, 3.0)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Component
// ────────────────────────────────────────────────────────────────────────────

pub struct AreaResilience {
    shared: Arc<Shared>,
}

impl AreaResilience {
    pub fn new(
        policies: Arc<PolicyBundle>,
        topology: Arc<dyn TopologyProvider>,
        leader_flag: Arc<AtomicBool>,
        http: reqwest::Client,
    ) -> Self {
        AreaResilience {
            shared: Arc::new(Shared {
                policies,
                topology,
                leader_flag,
                http,
                device_id: RwLock::new(String::new()),
                leader_ip: RwLock::new(String::new()),
                im_leader: AtomicBool::new(false),
                im_backup: AtomicBool::new(false),
                im_capable: AtomicBool::new(false),
                leader_failed: AtomicBool::new(false),
                startup_correct: AtomicBool::new(false),
                backup_priority: AtomicI64::new(-1),
                backups: BackupTable::new(),
                started: AtomicBool::new(false),
                worker: Mutex::new(None),
                keeper: Mutex::new(None),
            }),
        }
    }

    pub fn im_leader(&self) -> bool {
        self.shared.im_leader.load(Ordering::SeqCst)
    }

    pub fn im_backup(&self) -> bool {
        self.shared.im_backup.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> Role {
        if self.im_leader() {
            Role::Leader
        } else if self.im_backup() {
            Role::Backup
        } else {
            Role::Agent
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Start the resilience flow for this node. Returns false when already
    /// running.
    pub fn start(&self, device_id: &str) -> bool {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            log::warn!("Area resilience is already started");
            return false;
        }
        *self.shared.device_id.write() = device_id.to_string();
        let shared = self.shared.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { common_flow(shared, token).await });
        *self.shared.worker.lock() = Some(Worker { cancel, handle });
        log::info!("Area resilience module started");
        true
    }

    /// Stop all module activity: cancel the worker and the keeper, then wait
    /// for both to finish.
    pub async fn stop(&self) {
        if !self.shared.started.load(Ordering::SeqCst) {
            log::info!("Area resilience module is not started");
            return;
        }
        worker::stop_slot(&self.shared.worker).await;
        worker::stop_slot(&self.shared.keeper).await;
        self.shared.started.store(false, Ordering::SeqCst);
        log::info!("All workers stopped. Area resilience module is stopped");
    }

    /// Demotion path: stop whatever is running, reset the role state and
    /// start over as a plain agent. The backup-priority counter of the table
    /// keeps running.
    pub async fn restart_as_agent(&self, device_id: &str) {
        self.stop().await;
        self.shared.im_leader.store(false, Ordering::SeqCst);
        self.shared.im_backup.store(false, Ordering::SeqCst);
        self.shared.im_capable.store(false, Ordering::SeqCst);
        self.shared.leader_failed.store(false, Ordering::SeqCst);
        self.shared.startup_correct.store(false, Ordering::SeqCst);
        self.shared.backup_priority.store(-1, Ordering::SeqCst);
        self.shared.leader_ip.write().clear();
        self.shared.backups.truncate();
        self.start(device_id);
    }

    /// Promotion to backup, driven by the leader's election call. The remote
    /// peer address is the leader.
    pub fn promoted_to_backup(&self, leader_ip: String) -> bool {
        *self.shared.leader_ip.write() = leader_ip;
        if !self.shared.im_capable.load(Ordering::SeqCst) {
            if !self.shared.startup_correct.load(Ordering::SeqCst) {
                log::warn!("Area resilience still starting. Cannot promote on this state.");
            } else {
                log::error!("Agent not capable to be Backup/Leader");
            }
            return false;
        }
        if self.im_leader() || self.im_backup() {
            log::error!("Agent is already a Backup/Leader. Cannot become a Backup.");
            return false;
        }
        if worker::slot_alive(&self.shared.worker) {
            log::warn!("Area resilience worker still busy. Cannot promote on this state.");
            return false;
        }
        log::info!("Becoming backup due leader selection");
        let shared = self.shared.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { backup_leader_flow(shared, token).await });
        *self.shared.worker.lock() = Some(Worker { cancel, handle });
        self.shared.started.store(true, Ordering::SeqCst);
        true
    }

    /// Leader-side keepalive reception: refresh the sender's TTL and report
    /// its priority, or answer with the demotion sentinel.
    pub fn receive_keepalive(&self, device_id: &str) -> (bool, i64) {
        let max_ttl = self.shared.max_ttl();
        match self.shared.backups.refresh_ttl(device_id, max_ttl) {
            Some(priority) => {
                log::debug!("Keepalive from backup {} accepted, priority {}", device_id, priority);
                (true, priority as i64)
            }
            None => (false, PRIORITY_ON_DEMOTION),
        }
    }

    /// Hand leadership over to `device_id` at `device_ip`: make sure it is
    /// enrolled as a backup, promote it, then demote self through the local
    /// role-change path. Best effort; false on any failed step.
    pub async fn reelection(&self, device_id: &str, device_ip: &str) -> bool {
        if self.shared.backups.find(device_id).is_none() {
            if !send_election_message(&self.shared.http, device_ip).await {
                log::warn!("Reelection: could not elect {} as backup first", device_id);
                return false;
            }
            let ttl = self.shared.max_ttl();
            if let Some(priority) = self.shared.backups.insert(device_id, device_ip, ttl) {
                log::info!("Backup {}[{}] added with priority {}", device_id, device_ip, priority);
            }
        }

        let url = config::policies_url(device_ip, "roleChange/leader");
        let promoted = match self.shared.http.get(&url).timeout(ELECTION_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                log::warn!("Reelection: {} refused promotion with status {}", device_id, r.status());
                false
            }
            Err(e) => {
                log::warn!("Reelection: promotion call to {} failed: {}", device_id, e);
                false
            }
        };
        if !promoted {
            return false;
        }

        let url = config::policies_url("127.0.0.1", "roleChange/agent");
        match self.shared.http.get(&url).timeout(ELECTION_TIMEOUT).send().await {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                log::warn!("Reelection: self-demotion answered status {}", r.status());
                false
            }
            Err(e) => {
                log::warn!("Reelection: self-demotion call failed: {}", e);
                false
            }
        }
    }

    #[cfg(test)]
    fn test_shared(&self) -> &Shared {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn test_enroll_backup(
        &self,
        device_id: &str,
        device_ip: &str,
        ttl: i64,
    ) -> Option<u32> {
        self.shared.backups.insert(device_id, device_ip, ttl)
    }

    #[cfg(test)]
    pub(crate) fn test_set_roles(&self, leader: bool, backup: bool) {
        self.shared.im_leader.store(leader, Ordering::SeqCst);
        self.shared.im_backup.store(backup, Ordering::SeqCst);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Flows
// ────────────────────────────────────────────────────────────────────────────

async fn common_flow(shared: Arc<Shared>, cancel: CancellationToken) {
    let boot_leader = shared.leader_flag.load(Ordering::SeqCst);
    shared.im_leader.store(boot_leader, Ordering::SeqCst);
    if !boot_leader {
        log::info!("I'm not a Leader.");
        if is_capable() {
            log::info!("I'm capable to be Leader.");
            shared.im_capable.store(true, Ordering::SeqCst);
            log::info!("Waiting to be selected.");
        } else {
            log::info!("I'm NOT capable to be Leader.");
        }
    }
    shared.startup_correct.store(true, Ordering::SeqCst);
    if boot_leader {
        backup_leader_flow(shared, cancel).await;
    }
}

// TODO: evaluate the LMR/LDR requirements here once categorization reports
// local resources instead of treating every agent as electable.
fn is_capable() -> bool {
    true
}

/// Flow run by a node that is (or is about to be) more than a plain agent:
/// boot-leaders enter directly, promoted backups come in through
/// `promoted_to_backup`.
async fn backup_leader_flow(shared: Arc<Shared>, cancel: CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }

    if !shared.im_leader.load(Ordering::SeqCst) {
        log::info!("I'm selected to be a backup. Setting up.");
        match become_backup(&shared, &cancel).await {
            KeepaliveOutcome::Cancelled => {
                log::info!("Backup stopped.");
                return;
            }
            KeepaliveOutcome::Demoted => {
                shared.im_backup.store(false, Ordering::SeqCst);
                shared.backup_priority.store(-1, Ordering::SeqCst);
                log::warn!("No longer recognised as backup, reverting to Agent.");
                return;
            }
            KeepaliveOutcome::LeaderDown => {
                log::warn!("## LEADER IS DOWN! ##");
                shared.leader_failed.store(true, Ordering::SeqCst);
            }
        }
    }

    // Multiple-backup support: the takeover is staggered by priority so only
    // one backup claims the area at a time.
    let priority = shared.backup_priority.load(Ordering::SeqCst);
    if priority > 0 {
        let wait = takeover_delay(priority);
        log::info!("Waiting {:.1}s before leader takeover...", wait.as_secs_f64());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        log::debug!("Checking if new Leader is up...");
        let stored = shared.leader_ip.read().clone();
        let detected = shared.topology.disc_leader_ip().unwrap_or_default();
        log::debug!("Stored Leader = [{}], Detected Leader = [{}]", stored, detected);
        if detected.is_empty() || detected == stored {
            log::warn!("Leader not detected by Discovery");
        } else {
            // An earlier-priority backup already took over; stand down.
            log::info!("Correct Leader takeover by a backup with more preference.");
            let url = config::policies_url("127.0.0.1", "roleChange/agent");
            let _ = shared.http.get(&url).timeout(ROLECHANGE_TIMEOUT).send().await;
            return;
        }
    }

    if cancel.is_cancelled() {
        return;
    }

    if shared.im_leader.load(Ordering::SeqCst) || shared.leader_failed.load(Ordering::SeqCst) {
        log::info!("Leader setting up");
        become_leader(&shared, &cancel).await;
        backup_selection(&shared, &cancel).await;
    }
}

// ── Backup side ──────────────────────────────────────────────────────────

enum KeepaliveOutcome {
    Cancelled,
    /// The leader no longer recognises us as a backup.
    Demoted,
    /// The leader is unreachable or not a leader anymore.
    LeaderDown,
}

/// Classification of one keepalive exchange.
#[derive(Debug, PartialEq, Eq)]
enum ReplyClass {
    Alive,
    Demoted,
    NotALeader,
    Failure,
}

fn classify_reply(status: u16, backup_priority: i64) -> ReplyClass {
    match (status, backup_priority) {
        (200..=299, _) => ReplyClass::Alive,
        (403, PRIORITY_ON_DEMOTION) => ReplyClass::Demoted,
        (405, PRIORITY_ON_FAILURE) => ReplyClass::NotALeader,
        _ => ReplyClass::Failure,
    }
}

/// Consecutive failed keepalives tolerated before declaring the leader down.
/// A zero policy still sends one keepalive: its failure triggers takeover.
fn failure_budget(max_retry_attempts: i64) -> i64 {
    max_retry_attempts.max(1)
}

/// Takeover stagger: priority 1 waits 1 s, each later priority 10 s more.
fn takeover_delay(priority: i64) -> Duration {
    Duration::from_secs_f64(1.0 + 10.0 * ((priority - 1).max(0) as f64))
}

async fn become_backup(shared: &Arc<Shared>, cancel: &CancellationToken) -> KeepaliveOutcome {
    shared.im_backup.store(true, Ordering::SeqCst);
    let leader_ip = shared.leader_ip.read().clone();
    let url = config::policies_url(&leader_ip, "keepalive/");
    let payload = serde_json::json!({ "deviceID": shared.device_id.read().clone() });
    let budget = failure_budget(shared.max_retry_attempts());
    let mut attempt: i64 = 0;
    let mut counter: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return KeepaliveOutcome::Cancelled;
        }
        counter += 1;
        match send_keepalive(&shared.http, &url, &payload).await {
            Ok((status, reply)) => match classify_reply(status.as_u16(), reply.backup_priority) {
                ReplyClass::Alive => {
                    shared.backup_priority.store(reply.backup_priority, Ordering::SeqCst);
                    attempt = 0;
                    log::debug!(
                        "Keepalive #{} ok, Leader still alive: leaderID: {}",
                        counter,
                        reply.device_id
                    );
                }
                ReplyClass::Demoted => {
                    log::warn!(
                        "Backup has been removed from database or is not authorized to send keepalives"
                    );
                    return KeepaliveOutcome::Demoted;
                }
                ReplyClass::NotALeader => {
                    log::warn!("Sending keepalives to a device that is not a Leader!");
                    return KeepaliveOutcome::LeaderDown;
                }
                ReplyClass::Failure => {
                    attempt += 1;
                    log::error!(
                        "Keepalive status_code = {} (failed attempts: {}/{})",
                        status,
                        attempt,
                        budget
                    );
                }
            },
            Err(e) => {
                attempt += 1;
                log::debug!("Keepalive failed: {} (failed attempts: {}/{})", e, attempt, budget);
            }
        }
        if attempt >= budget {
            return KeepaliveOutcome::LeaderDown;
        }
        tokio::select! {
            _ = cancel.cancelled() => return KeepaliveOutcome::Cancelled,
            _ = tokio::time::sleep(shared.keepalive_period()) => {}
        }
    }
}

async fn send_keepalive(
    http: &reqwest::Client,
    url: &str,
    payload: &serde_json::Value,
) -> Result<(reqwest::StatusCode, KeepaliveReply), AgentError> {
    let resp = http.post(url).json(payload).timeout(KEEPALIVE_TIMEOUT).send().await?;
    let status = resp.status();
    let reply: KeepaliveReply =
        resp.json().await.map_err(|e| AgentError::Protocol(e.to_string()))?;
    Ok((status, reply))
}

// ── Leader side ──────────────────────────────────────────────────────────

async fn become_leader(shared: &Arc<Shared>, cancel: &CancellationToken) {
    if shared.leader_failed.load(Ordering::SeqCst) {
        // Takeover from a failed leader: switch the rest of the node before
        // running the keeper. A fresh boot-leader needs no trigger.
        let url = config::policies_url("127.0.0.1", "roleChange/leader");
        match shared.http.get(&url).timeout(ROLECHANGE_TIMEOUT).send().await {
            Ok(r) => log::info!("Trigger to start-flow switch done, status {}", r.status()),
            Err(e) => log::error!("Leader takeover trigger to start-flow failed: {}", e),
        }
        shared.im_leader.store(true, Ordering::SeqCst);
        shared.im_backup.store(false, Ordering::SeqCst);
    }
    let keeper_shared = shared.clone();
    let keeper_cancel = cancel.child_token();
    let token = keeper_cancel.clone();
    let handle = tokio::spawn(async move { keeper(keeper_shared, token).await });
    *shared.keeper.lock() = Some(Worker { cancel: keeper_cancel, handle });
}

/// Decrements the TTL of every backup each tick and demotes the expired.
async fn keeper(shared: Arc<Shared>, cancel: CancellationToken) {
    log::debug!("Keeper is running");
    shared.backups.truncate();
    loop {
        let expired = shared.backups.tick_all(1);
        for backup in expired {
            log::warn!(
                "Backup {}[{}] is DOWN with TTL: {}",
                backup.device_id,
                backup.device_ip,
                backup.ttl
            );
            send_demotion_message(&shared.http, &backup.device_ip).await;
            log::debug!("Backup removed from database");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.keeper_period()) => {}
        }
    }
    log::warn!("Keeper stopped");
}

/// Keeps the number of live backups at `BACKUP_MINIMUM` by electing
/// candidates from the topology in iteration order.
async fn backup_selection(shared: &Arc<Shared>, cancel: &CancellationToken) {
    while !cancel.is_cancelled() {
        let minimum = shared.backup_minimum();
        let mut correct = shared.backups.alive_count() as i64;
        if correct >= minimum {
            log::debug!("{} correct backups detected in Leader. Everything is OK.", correct);
        } else {
            log::warn!("{} backups detected are not enough. Electing new ones...", correct);
            let mut added = 0;
            for candidate in shared.topology.topology() {
                if cancel.is_cancelled() || correct >= minimum {
                    break;
                }
                if shared.backups.find(&candidate.device_id).is_some() {
                    continue;
                }
                if send_election_message(&shared.http, &candidate.device_ip).await {
                    let ttl = shared.max_ttl();
                    if let Some(priority) =
                        shared.backups.insert(&candidate.device_id, &candidate.device_ip, ttl)
                    {
                        log::info!(
                            "Backup {}[{}] added with priority {}",
                            candidate.device_id,
                            candidate.device_ip,
                            priority
                        );
                        correct += 1;
                        added += 1;
                    }
                }
            }
            if correct >= minimum {
                log::info!(
                    "{} correct backups detected in Leader. {} new backups added.",
                    correct,
                    added
                );
            } else {
                log::warn!("{} backups detected are not enough. Waiting for new election.", correct);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.selection_period()) => {}
        }
    }
    log::info!("Leader stopped...");
}

/// Ask `address` to become a backup of this leader.
async fn send_election_message(http: &reqwest::Client, address: &str) -> bool {
    let url = config::policies_url(address, "roleChange/backup");
    match http.get(&url).timeout(ELECTION_TIMEOUT).send().await {
        Ok(r) if r.status().is_success() => true,
        Ok(r) => {
            log::warn!(
                "Selected device [{}] returned status {} on electing a new backup",
                address,
                r.status()
            );
            false
        }
        Err(e) => {
            log::warn!("Selected device [{}] cannot become Backup: {}", address, e);
            false
        }
    }
}

/// Demote the backup at `address` to a normal agent.
async fn send_demotion_message(http: &reqwest::Client, address: &str) -> bool {
    let url = config::policies_url(address, "roleChange/agent");
    match http.get(&url).timeout(ELECTION_TIMEOUT).send().await {
        Ok(r) if r.status().is_success() => true,
        Ok(r) => {
            log::warn!(
                "Selected device [{}] returned status {} on removing a backup",
                address,
                r.status()
            );
            false
        }
        Err(e) => {
            log::warn!("Selected device [{}] cannot be demoted to Agent: {}", address, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::EnvTopology;

    fn component() -> AreaResilience {
        AreaResilience::new(
            Arc::new(PolicyBundle::new()),
            Arc::new(EnvTopology::new(&[])),
            Arc::new(AtomicBool::new(false)),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn takeover_delay_is_priority_staggered() {
        assert_eq!(takeover_delay(1), Duration::from_secs(1));
        assert_eq!(takeover_delay(2), Duration::from_secs(11));
        assert_eq!(takeover_delay(3), Duration::from_secs(21));
    }

    #[test]
    fn reply_classification_matches_protocol() {
        assert_eq!(classify_reply(200, 1), ReplyClass::Alive);
        assert_eq!(classify_reply(200, PRIORITY_ON_DEMOTION), ReplyClass::Alive);
        // The reserved reelection sentinel is not an error marker.
        assert_eq!(classify_reply(200, PRIORITY_ON_REELECTION), ReplyClass::Alive);
        assert_eq!(classify_reply(403, PRIORITY_ON_DEMOTION), ReplyClass::Demoted);
        assert_eq!(classify_reply(405, PRIORITY_ON_FAILURE), ReplyClass::NotALeader);
        // A 403/405 without the matching sentinel is just a failed exchange.
        assert_eq!(classify_reply(403, 5), ReplyClass::Failure);
        assert_eq!(classify_reply(405, PRIORITY_ON_DEMOTION), ReplyClass::Failure);
        assert_eq!(classify_reply(500, PRIORITY_ON_FAILURE), ReplyClass::Failure);
    }

    #[test]
    fn zero_retry_policy_still_sends_one_keepalive() {
        assert_eq!(failure_budget(0), 1);
        assert_eq!(failure_budget(5), 5);
        assert_eq!(failure_budget(-3), 1);
    }

    #[test]
    fn keepalive_reception_refreshes_known_backups() {
        let ar = component();
        ar.test_shared().backups.insert("agent/A", "10.0.0.2", 30);
        // Let the TTL decay a bit first.
        for _ in 0..10 {
            ar.test_shared().backups.tick_all(1);
        }
        let (ok, priority) = ar.receive_keepalive("agent/A");
        assert!(ok);
        assert_eq!(priority, 1);
        assert_eq!(ar.test_shared().backups.snapshot()[0].ttl, 30);
    }

    #[test]
    fn keepalive_reception_rejects_unknown_backups() {
        let ar = component();
        let (ok, priority) = ar.receive_keepalive("agent/X");
        assert!(!ok);
        assert_eq!(priority, PRIORITY_ON_DEMOTION);
    }

    #[test]
    fn role_is_derived_from_the_flags() {
        let ar = component();
        assert_eq!(ar.role(), Role::Agent);
        ar.test_shared().im_backup.store(true, Ordering::SeqCst);
        assert_eq!(ar.role(), Role::Backup);
        ar.test_shared().im_leader.store(true, Ordering::SeqCst);
        assert_eq!(ar.role(), Role::Leader);
    }

    #[test]
    fn keepalive_reply_wire_shape() {
        let reply = KeepaliveReply { device_id: "agent/L".to_string(), backup_priority: 1 };
        let raw = serde_json::to_string(&reply).unwrap();
        assert_eq!(raw, r#"{"deviceID":"agent/L","backupPriority":1}"#);
        // Sentinels must round-trip bit-exactly, never as null.
        let reply = KeepaliveReply { device_id: "agent/L".to_string(), backup_priority: -2 };
        assert!(serde_json::to_string(&reply).unwrap().contains("\"backupPriority\":-2"));
    }

    #[tokio::test]
    async fn promotion_is_rejected_before_startup_completes() {
        let ar = component();
        assert!(!ar.promoted_to_backup("10.0.0.1".to_string()));
    }

    #[tokio::test]
    async fn promotion_is_rejected_for_existing_backup_or_leader() {
        let ar = component();
        ar.test_shared().im_capable.store(true, Ordering::SeqCst);
        ar.test_shared().startup_correct.store(true, Ordering::SeqCst);
        ar.test_shared().im_backup.store(true, Ordering::SeqCst);
        assert!(!ar.promoted_to_backup("10.0.0.1".to_string()));
        ar.test_shared().im_backup.store(false, Ordering::SeqCst);
        ar.test_shared().im_leader.store(true, Ordering::SeqCst);
        assert!(!ar.promoted_to_backup("10.0.0.1".to_string()));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_allows_restart() {
        let ar = component();
        assert!(ar.start("agent/1"));
        assert!(!ar.start("agent/1"));
        ar.stop().await;
        assert!(!ar.is_started());
        assert!(ar.start("agent/1"));
        ar.stop().await;
    }
}
