use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::interval;

use crate::firewall::FirewallReconciler;
use crate::net::netlink::NetlinkHandle;
use crate::proxy::dsr::{ContainerPidLookup, DsrConfigurator};
use crate::proxy::routes::RouteTableManager;
use crate::proxy::ProxyReconciler;
use crate::snapshot::SnapshotSource;
use crate::sync::error::EngineError;
use crate::sync::health::SyncHealth;

fn push_error(errors: &mut Vec<EngineError>, err: EngineError) {
    tracing::error!(error = %err, "sync phase failed");
    errors.push(err);
}

/// Periodic full-sync cadence, one timer per reconciler family of work.
#[derive(Debug, Clone)]
pub struct SyncPeriods {
    pub iptables: Duration,
    pub ipvs: Duration,
    pub routes: Duration,
}

/// Cheap, clonable handle the informer layer uses to request a sync.
/// Bursts collapse: the driver holds at most one pending request.
#[derive(Clone)]
pub struct SyncTrigger {
    notify: Arc<Notify>,
}

impl SyncTrigger {
    #[allow(dead_code)] // called by the informer layer, not from this crate
    pub fn request_full_sync(&self) {
        self.notify.notify_one();
    }
}

/// Serializes the firewall, IPVS and route reconcilers over a debounced
/// stream of sync requests. Never runs two reconcilers concurrently; the
/// per-family parallelism lives inside the reconcilers themselves.
pub struct SyncEngine {
    source: Arc<dyn SnapshotSource>,
    firewall: FirewallReconciler,
    proxy: ProxyReconciler,
    routes: RouteTableManager,
    netlink: Arc<NetlinkHandle>,
    dsr: DsrConfigurator,
    pid_lookup: Option<Arc<dyn ContainerPidLookup>>,
    notify: Arc<Notify>,
    debounce: Duration,
    periods: SyncPeriods,
    health: Arc<SyncHealth>,
}

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        firewall: FirewallReconciler,
        proxy: ProxyReconciler,
        routes: RouteTableManager,
        netlink: Arc<NetlinkHandle>,
        dsr: DsrConfigurator,
        pid_lookup: Option<Arc<dyn ContainerPidLookup>>,
        periods: SyncPeriods,
    ) -> Self {
        Self {
            source,
            firewall,
            proxy,
            routes,
            netlink,
            dsr,
            pid_lookup,
            notify: Arc::new(Notify::new()),
            debounce: DEFAULT_DEBOUNCE,
            periods,
            health: Arc::new(SyncHealth::default()),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        SyncTrigger {
            notify: self.notify.clone(),
        }
    }

    pub fn health(&self) -> Arc<SyncHealth> {
        self.health.clone()
    }

    /// Drive convergence until shutdown flips. The in-flight sync always
    /// completes; the caller enforces the grace deadline.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut iptables_tick = interval(self.periods.iptables);
        let mut ipvs_tick = interval(self.periods.ipvs);
        let mut routes_tick = interval(self.periods.routes);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = iptables_tick.tick() => {}
                _ = ipvs_tick.tick() => {}
                _ = routes_tick.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("sync engine shutting down");
                        return;
                    }
                    continue;
                }
            }

            // Let a burst of requests coalesce, then drain whatever
            // arrived while we slept so it doesn't fire a second sync.
            tokio::time::sleep(self.debounce).await;
            let _ = tokio::time::timeout(Duration::ZERO, self.notify.notified()).await;

            if *shutdown.borrow() {
                return;
            }
            self.run_sync().await;
        }
    }

    /// One full convergence pass: firewall, then IPVS, then routes, then
    /// DSR endpoint plumbing. Partial failure marks the sync unhealthy
    /// but never aborts the remaining reconcilers.
    pub async fn run_sync(&mut self) -> Vec<EngineError> {
        let snapshot = self.source.snapshot();
        let mut errors = Vec::new();

        let fw_result =
            tokio::task::block_in_place(|| self.firewall.sync(&snapshot));
        match fw_result {
            Ok(stats) => {
                tracing::debug!(
                    pods = stats.pod_chains,
                    policies = stats.policy_chains,
                    "firewall converged"
                );
            }
            Err(e) => push_error(&mut errors, EngineError::Firewall(e)),
        }

        if let Err(e) = self.proxy.sync_ipvs(&snapshot).await {
            push_error(&mut errors, EngineError::Proxy(e));
        }
        if let Err(e) = self.proxy.sync_vips(&snapshot, &self.netlink).await {
            push_error(&mut errors, EngineError::Vips(e));
        }

        let has_dsr = snapshot.services.iter().any(|s| s.direct_server_return);
        if has_dsr {
            let route_result = tokio::task::block_in_place(|| {
                self.routes.setup_dsr_policy_routing()?;
                self.routes.sync_external_ip_routes(&snapshot.services)
            });
            if let Err(e) = route_result {
                push_error(&mut errors, EngineError::Routes(e));
            }

            if let Some(lookup) = &self.pid_lookup {
                self.proxy
                    .sync_dsr_endpoints(&snapshot, &self.dsr, lookup)
                    .await;
            } else {
                tracing::warn!("DSR services present but no runtime endpoint configured");
            }
        }

        self.health.record(errors.is_empty());
        errors
    }

    /// --cleanup-config teardown: remove everything the agent owns.
    pub async fn cleanup(&mut self) {
        tracing::info!("running cleanup: removing chains, ipvs services and VIPs");
        if let Err(e) = tokio::task::block_in_place(|| self.firewall.cleanup()) {
            tracing::error!(error = %e, "firewall cleanup failed");
        }
        if let Err(e) = self.proxy.cleanup(&self.netlink).await {
            tracing::error!(error = %e, "ipvs cleanup failed");
        }
        if let Err(e) = tokio::task::block_in_place(|| self.routes.cleanup()) {
            tracing::error!(error = %e, "route cleanup failed");
        }
    }
}
