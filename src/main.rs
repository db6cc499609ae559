//! Control-plane agent of a fog/edge area.
//!
//! One instance runs per node and cooperates with its peers to keep exactly
//! one Leader per broadcast segment: agents reply to discovery beacons,
//! leaders elect backups and keep them alive, backups take over when the
//! leader disappears. The node exposes its control surface over HTTP on
//! port 46050 and speaks the discovery protocol on UDP 46051.

mod api;
mod config;
mod discovery;
mod error;
mod policies;
mod resilience;
mod startup;
mod topology;
mod worker;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::ServiceExt;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;

use api::AppState;
use config::{Config, LDISCOVERY_PORT, POLICIES_PORT, TIME_WAIT_INIT};
use discovery::LightDiscovery;
use policies::PolicyBundle;
use resilience::AreaResilience;
use startup::triggers::{Collaborators, ExternalTriggers};
use startup::AgentStart;
use topology::{DiscoveryTopology, EnvTopology, TopologyProvider};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn setup_logger(debug: bool) {
    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let mut builder = ConfigBuilder::new();
    let _ = builder.set_time_offset_to_local();
    let _ = TermLogger::init(level, builder.build(), TerminalMode::Mixed, ColorChoice::Auto);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    setup_logger(cfg.debug);
    log::info!("Policies module. Version {}", VERSION);
    log::debug!("Configuration: {:?}", cfg);

    // Give the co-deployed services a moment before wiring everything up.
    log::info!("INIT: wait {:.2}s to start", TIME_WAIT_INIT.as_secs_f64());
    tokio::time::sleep(TIME_WAIT_INIT).await;

    let http = reqwest::Client::new();
    let policies = Arc::new(PolicyBundle::new());
    let discovery = Arc::new(LightDiscovery::new(
        cfg.broadcast_addr.clone(),
        cfg.device_id.clone(),
        http.clone(),
    ));
    // A configured topology literal replaces discovery as the topology
    // source; consumers only ever see the trait.
    let topology: Arc<dyn TopologyProvider> = if cfg.topology.is_empty() {
        Arc::new(DiscoveryTopology::new(discovery.clone()))
    } else {
        Arc::new(EnvTopology::new(&cfg.topology))
    };
    let leader_flag = Arc::new(AtomicBool::new(cfg.leader));
    let resilience = Arc::new(AreaResilience::new(
        policies.clone(),
        topology.clone(),
        leader_flag.clone(),
        http.clone(),
    ));
    let triggers =
        ExternalTriggers::new(http.clone(), Collaborators::from_config(&cfg), cfg.wifi_dev.clone());
    let startflow = Arc::new(AgentStart::new(
        triggers,
        discovery.clone(),
        cfg.device_id.clone(),
        cfg.leader_ip.clone(),
        cfg.debug,
    ));

    let state = AppState {
        policies,
        resilience,
        startflow,
        discovery,
        topology,
        leader_flag,
        http: http.clone(),
    };

    if cfg.debug || cfg.mf2c {
        tokio::spawn(debug_bootstrap(http, cfg.leader));
    }

    let app = NormalizePathLayer::trim_trailing_slash().layer(api::router(state));
    let addr = SocketAddr::from(([0, 0, 0, 0], POLICIES_PORT));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind control API on {}", addr))?;
    log::info!("Control API listening on {} (discovery on UDP {})", addr, LDISCOVERY_PORT);

    axum::serve(
        listener,
        ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutdown signal received");
    })
    .await
    .context("control API server failed")?;

    Ok(())
}

/// Self-bootstrap used in debug and full deployments: engage the discovery
/// mode matching the boot role and start area resilience, both through the
/// public API so the path is the same one peers use.
async fn debug_bootstrap(http: reqwest::Client, leader: bool) {
    // Give the webservice some time.
    tokio::time::sleep(Duration::from_secs(10)).await;

    log::info!("Starting LDiscovery...");
    let mode = if leader { "beacon" } else { "scan" };
    let url = config::ld_url("127.0.0.1", &format!("control/{}/start", mode));
    match http.get(&url).send().await {
        Ok(r) => log::info!("LDiscovery started with status_code = {}", r.status()),
        Err(e) => log::warn!("LDiscovery bootstrap failed: {}", e),
    }

    log::info!("Starting Area Resilience...");
    let url = config::policies_url("127.0.0.1", "startAreaResilience/");
    match http.get(&url).send().await {
        Ok(r) => log::debug!("Area Resilience request result: {}", r.status()),
        Err(e) => log::warn!("Area resilience bootstrap failed: {}", e),
    }
}
