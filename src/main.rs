// seam - per-node Kubernetes dataplane agent.
// Programs the kernel's filter table, IPVS and routing from projected
// cluster snapshots; the informer layer feeds snapshots and sync signals.

mod config;
mod firewall;
mod net;
mod proxy;
mod snapshot;
mod sync;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::Config;
use firewall::FirewallReconciler;
use net::ipvs::IpvsHandle;
use net::netlink::NetlinkHandle;
use proxy::dsr::DsrConfigurator;
use proxy::routes::RouteTableManager;
use proxy::{ProxyConfig, ProxyReconciler};
use snapshot::SnapshotCache;
use sync::{SyncEngine, SyncPeriods};

/// How long an in-flight sync may keep running after shutdown is signaled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "agent failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let families = config.families();
    tracing::info!(
        families = ?families,
        node_ips = ?config.node_ips,
        "starting dataplane agent"
    );

    let netlink = Arc::new(NetlinkHandle::new()?);
    let ipvs = IpvsHandle::new()?;

    let firewall = FirewallReconciler::new(families.clone(), config.node_ips.clone());
    let mut proxy = ProxyReconciler::new(
        Box::new(ipvs),
        ProxyConfig {
            families: families.clone(),
            node_ips: config.node_ips.clone(),
            nodeport_bindon_all_ip: config.nodeport_bindon_all_ip,
            graceful_termination: config.ipvs_graceful_termination,
            graceful_period: config.ipvs_graceful_period,
        },
    );
    let routes = RouteTableManager::new(config.enable_ipv4, config.enable_ipv6);
    let dsr = DsrConfigurator::new(&config.container_iface_name);
    let snapshots = SnapshotCache::new();

    if !config.runtime_endpoint.is_empty() {
        // The CRI client lives with the informer layer; it hands the
        // resolved pids to the DSR configurator through the engine.
        tracing::debug!(endpoint = %config.runtime_endpoint, "runtime endpoint configured");
    }

    if !config.cleanup_config {
        proxy
            .init_timeouts(
                config.service_tcp_timeout,
                config.service_tcpfin_timeout,
                config.service_udp_timeout,
            )
            .await?;
        tokio::task::block_in_place(|| firewall.ensure_base_hooks())?;
    }

    let mut engine = SyncEngine::new(
        snapshots.clone(),
        firewall,
        proxy,
        routes,
        netlink,
        dsr,
        None,
        SyncPeriods {
            iptables: config.iptables_sync_period,
            ipvs: config.ipvs_sync_period,
            routes: config.routes_sync_period,
        },
    );

    if config.cleanup_config {
        engine.cleanup().await;
        tracing::info!("cleanup finished");
        return Ok(());
    }

    if config.health_port != 0 {
        let health = engine.health();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = sync::health::serve_health(health, port).await {
                tracing::error!(error = %e, "health endpoint failed");
            }
        });
    }

    // The informer layer owns these in a full deployment: it replaces the
    // snapshot and pulls the trigger on every relevant watch event.
    let _trigger = engine.trigger();
    let _snapshots = snapshots;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(async move { engine.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, engine_task)
        .await
        .is_err()
    {
        tracing::warn!("in-flight sync exceeded the shutdown grace period");
    }
    Ok(())
}
