// IPVS reconciler - service + endpoints snapshot in, virtual services,
// real servers and dummy-interface VIP bindings out. All mutation is
// desired-vs-observed; nothing is programmed from event handlers.

pub mod dsr;
pub mod routes;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::firewall::encoder::service_fw_mark;
use crate::net::ipvs::{
    ForwardMethod, IpvsBackend, Protocol, RealServer, VirtualServer, VsKey, IP_VS_SVC_F_SCHED1,
    IP_VS_SVC_F_SCHED2, IP_VS_SVC_F_SCHED3, ROUND_ROBIN,
};
use crate::net::netlink::NetlinkHandle;
use crate::net::{is_link_local, IpFamily, KernelError, KernelResult};
use crate::snapshot::{ClusterSnapshot, SchedFlags, ServiceInfo, ServiceRef};
use crate::utils::constants::KUBE_DUMMY_IF;

use dsr::{ContainerPidLookup, DsrConfigurator};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub families: Vec<IpFamily>,
    pub node_ips: Vec<IpAddr>,
    pub nodeport_bindon_all_ip: bool,
    pub graceful_termination: bool,
    pub graceful_period: Duration,
}

impl ProxyConfig {
    fn node_ip_for_family(&self, family: IpFamily) -> Option<IpAddr> {
        self.node_ips
            .iter()
            .find(|ip| IpFamily::of(ip) == family)
            .copied()
    }

    fn node_ips_for_family(&self, family: IpFamily) -> Vec<IpAddr> {
        self.node_ips
            .iter()
            .filter(|ip| IpFamily::of(ip) == family)
            .copied()
            .collect()
    }
}

/// One desired virtual service with its real servers and owner, used for
/// collision tie-breaks and logging.
#[derive(Debug, Clone)]
pub struct DesiredVs {
    pub vs: VirtualServer,
    pub dests: Vec<RealServer>,
    pub owner: ServiceRef,
}

#[derive(Debug, Default)]
pub struct DesiredProxyState {
    pub services: BTreeMap<VsKey, DesiredVs>,
    /// Addresses that belong on the dummy interface for this family.
    pub vips: BTreeSet<IpAddr>,
}

fn sched_flag_bits(flags: SchedFlags) -> u32 {
    let mut bits = 0;
    if flags.flag1 {
        bits |= IP_VS_SVC_F_SCHED1;
    }
    if flags.flag2 {
        bits |= IP_VS_SVC_F_SCHED2;
    }
    if flags.flag3 {
        bits |= IP_VS_SVC_F_SCHED3;
    }
    bits
}

pub struct ProxyReconciler {
    backend: Box<dyn IpvsBackend>,
    config: ProxyConfig,
    /// Destinations draining toward removal, keyed by their parent VS.
    retiring_dests: HashMap<(VsKey, IpAddr, u16), Instant>,
    /// Virtual services awaiting graceful removal.
    retiring_services: HashMap<VsKey, Instant>,
}

impl ProxyReconciler {
    pub fn new(backend: Box<dyn IpvsBackend>, config: ProxyConfig) -> Self {
        Self {
            backend,
            config,
            retiring_dests: HashMap::new(),
            retiring_services: HashMap::new(),
        }
    }

    /// Push the configured IPVS timeouts into the kernel. Zero keeps the
    /// system default for that protocol.
    pub async fn init_timeouts(
        &mut self,
        tcp: Duration,
        tcp_fin: Duration,
        udp: Duration,
    ) -> KernelResult<()> {
        self.backend.set_timeouts(tcp, tcp_fin, udp).await
    }

    /// Project the snapshot into the desired IPVS state for one family.
    /// Pure; collisions are resolved here by lexicographic (ns, name).
    pub fn desired_state(&self, snapshot: &ClusterSnapshot, family: IpFamily) -> DesiredProxyState {
        let mut state = DesiredProxyState::default();

        // Iterate in owner order so the lexicographically smallest
        // (ns, name) claims a contested key first.
        let mut services: Vec<&ServiceInfo> = snapshot.services.iter().collect();
        services.sort_by_key(|svc| (svc.namespace.clone(), svc.name.clone()));

        for svc in services {
            let owner = svc.key();
            let endpoints = snapshot.endpoints.get(&owner).cloned().unwrap_or_default();

            for port in &svc.ports {
                let dests: Vec<RealServer> = endpoints
                    .iter()
                    .filter(|ep| IpFamily::of(&ep.ip) == family)
                    .map(|ep| RealServer::new(ep.ip, ep.port, 1, ForwardMethod::Masquerade))
                    .collect();

                let mut vips: Vec<IpAddr> = Vec::new();
                vips.extend(svc.cluster_ips.iter().filter(|ip| IpFamily::of(ip) == family));
                vips.extend(svc.external_ips.iter().filter(|ip| IpFamily::of(ip) == family));
                vips.extend(
                    svc.load_balancer_ips
                        .iter()
                        .filter(|ip| IpFamily::of(ip) == family),
                );

                for vip in &vips {
                    let vs = self.make_virtual_server(svc, *vip, port.protocol, port.port, family);
                    self.claim(&mut state, vs, dests.clone(), &owner);
                }

                // DSR external IPs are additionally reachable through a
                // fwmark service; endpoints answer over the tunnel.
                if svc.direct_server_return {
                    for vip in svc.external_ips.iter().filter(|ip| IpFamily::of(ip) == family) {
                        let mark = service_fw_mark(family, *vip, port.protocol, port.port);
                        let mut vs =
                            self.make_virtual_server(svc, *vip, port.protocol, port.port, family);
                        vs.address = None;
                        vs.protocol = None;
                        vs.port = 0;
                        vs.fwmark = mark;
                        let tunnel_dests: Vec<RealServer> = dests
                            .iter()
                            .map(|d| {
                                RealServer::new(d.address, d.port, 1, ForwardMethod::Tunnel)
                            })
                            .collect();
                        self.claim(&mut state, vs, tunnel_dests, &owner);
                    }
                }

                if let Some(node_port) = port.node_port {
                    let node_ips = if self.config.nodeport_bindon_all_ip {
                        self.config.node_ips_for_family(family)
                    } else {
                        self.config
                            .node_ip_for_family(family)
                            .into_iter()
                            .collect()
                    };
                    for node_ip in node_ips {
                        let vs = self.make_virtual_server(
                            svc,
                            node_ip,
                            port.protocol,
                            node_port,
                            family,
                        );
                        self.claim(&mut state, vs, dests.clone(), &owner);
                    }
                }
            }

            // VIPs live on the dummy interface, except DSR external IPs
            // (binding those would make endpoint replies martian) and
            // link-local addresses.
            for ip in svc
                .cluster_ips
                .iter()
                .chain(svc.load_balancer_ips.iter())
                .chain(
                    svc.external_ips
                        .iter()
                        .filter(|_| !svc.direct_server_return),
                )
            {
                if IpFamily::of(ip) == family && !is_link_local(ip) {
                    state.vips.insert(*ip);
                }
            }
        }

        state
    }

    fn make_virtual_server(
        &self,
        svc: &ServiceInfo,
        vip: IpAddr,
        protocol: Protocol,
        port: u16,
        family: IpFamily,
    ) -> VirtualServer {
        let scheduler = if svc.scheduler.is_empty() {
            ROUND_ROBIN.to_string()
        } else {
            svc.scheduler.clone()
        };
        let mut vs = VirtualServer {
            family,
            protocol: Some(protocol),
            address: Some(vip),
            port,
            fwmark: 0,
            scheduler,
            flags: 0,
            timeout: 0,
            netmask: family.full_prefix() as u32,
        };
        vs.set_sched_flags(sched_flag_bits(svc.sched_flags));
        vs.set_persistence(svc.persistent, svc.persistent_timeout);
        vs
    }

    fn claim(
        &self,
        state: &mut DesiredProxyState,
        vs: VirtualServer,
        dests: Vec<RealServer>,
        owner: &ServiceRef,
    ) {
        let Some(key) = vs.key() else { return };
        match state.services.get(&key) {
            Some(existing) => {
                tracing::warn!(
                    key = ?key,
                    winner = %existing.owner,
                    loser = %owner,
                    "virtual service key collision; lexicographically smallest owner wins"
                );
            }
            None => {
                state.services.insert(
                    key,
                    DesiredVs {
                        vs,
                        dests,
                        owner: owner.clone(),
                    },
                );
            }
        }
    }

    /// Reconcile IPVS services and destinations for every enabled family.
    pub async fn sync_ipvs(&mut self, snapshot: &ClusterSnapshot) -> KernelResult<()> {
        let mut current = self.backend.get_services().await?;
        let mut first_err: Option<KernelError> = None;

        for family in self.config.families.clone() {
            let desired = self.desired_state(snapshot, family);
            if let Err(e) = self
                .sync_family_services(family, &desired, &mut current)
                .await
            {
                tracing::error!(family = %family, error = %e, "ipvs sync failed for family");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn sync_family_services(
        &mut self,
        family: IpFamily,
        desired: &DesiredProxyState,
        current: &mut Vec<VirtualServer>,
    ) -> KernelResult<()> {
        // Creation before destination work, so every upsert below has a
        // parent VS to attach to.
        for d in desired.services.values() {
            match current.iter().position(|vs| vs.key() == d.vs.key()) {
                Some(i) => {
                    if needs_service_update(&current[i], &d.vs) {
                        tracing::info!(owner = %d.owner, key = ?d.vs.key(), "updating virtual service");
                        self.backend.update_service(&d.vs).await?;
                        current[i] = d.vs.clone();
                    }
                }
                None => {
                    tracing::info!(owner = %d.owner, key = ?d.vs.key(), "creating virtual service");
                    self.backend.new_service(&d.vs).await?;
                    // Track it so a second desired VS with the same key in
                    // this sync cannot create a duplicate.
                    current.push(d.vs.clone());
                }
            }

            if let Some(key) = d.vs.key() {
                self.retiring_services.remove(&key);
                self.sync_destinations(key, &d.vs, &d.dests).await?;
            }
        }

        // Services of this family that are no longer desired.
        let stale: Vec<VirtualServer> = current
            .iter()
            .filter(|vs| vs.family == family)
            .filter(|vs| vs.key().map_or(true, |k| !desired.services.contains_key(&k)))
            .cloned()
            .collect();
        for vs in stale {
            self.retire_service(&vs).await?;
        }
        Ok(())
    }

    async fn sync_destinations(
        &mut self,
        key: VsKey,
        vs: &VirtualServer,
        want: &[RealServer],
    ) -> KernelResult<()> {
        let have = self.backend.get_destinations(vs).await?;

        for dest in want {
            self.retiring_dests.remove(&(key, dest.address, dest.port));
            match have
                .iter()
                .find(|h| h.address == dest.address && h.port == dest.port)
            {
                Some(h) => {
                    if h.weight != dest.weight || h.forward_method != dest.forward_method {
                        self.backend.update_destination(vs, dest).await?;
                    }
                }
                None => match self.backend.new_destination(vs, dest).await {
                    Ok(()) => {}
                    // Benign: raced with an earlier sync's leftovers.
                    Err(KernelError::IpvsServerExists) => {
                        self.backend.update_destination(vs, dest).await?;
                    }
                    Err(e) => return Err(e),
                },
            }
        }

        for gone in have
            .iter()
            .filter(|h| !want.iter().any(|w| w.address == h.address && w.port == h.port))
        {
            self.retire_destination(key, vs, gone).await?;
        }
        Ok(())
    }

    /// Weight a leaving destination down to zero and delete it only once
    /// the graceful period has fully elapsed.
    async fn retire_destination(
        &mut self,
        key: VsKey,
        vs: &VirtualServer,
        dest: &RealServer,
    ) -> KernelResult<()> {
        if !self.config.graceful_termination {
            tracing::info!(dest = %dest.address, port = dest.port, "removing destination");
            self.backend.del_destination(vs, dest).await?;
            return Ok(());
        }

        let first_seen = *self
            .retiring_dests
            .entry((key, dest.address, dest.port))
            .or_insert_with(Instant::now);

        if dest.weight != 0 {
            let mut drained = dest.clone();
            drained.weight = 0;
            tracing::info!(dest = %dest.address, port = dest.port, "draining destination (weight 0)");
            self.backend.update_destination(vs, &drained).await?;
        }

        if first_seen.elapsed() >= self.config.graceful_period {
            tracing::info!(
                dest = %dest.address,
                port = dest.port,
                conns = dest.total_conns(),
                "graceful period elapsed, removing destination"
            );
            self.backend.del_destination(vs, dest).await?;
            self.retiring_dests.remove(&(key, dest.address, dest.port));
        }
        Ok(())
    }

    /// Soft-retire a whole virtual service: drain destinations, then
    /// delete once the period elapsed and the kernel shows no remaining
    /// connections.
    async fn retire_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
        let Some(key) = vs.key() else {
            return Ok(());
        };

        if !self.config.graceful_termination {
            tracing::info!(key = ?key, "removing virtual service");
            for dest in self.backend.get_destinations(vs).await? {
                self.backend.del_destination(vs, &dest).await?;
            }
            self.backend.del_service(vs).await?;
            return Ok(());
        }

        let first_seen = *self
            .retiring_services
            .entry(key)
            .or_insert_with(Instant::now);

        let dests = self.backend.get_destinations(vs).await?;
        let mut conns = 0;
        for dest in &dests {
            conns += dest.total_conns();
            if dest.weight != 0 {
                let mut drained = dest.clone();
                drained.weight = 0;
                self.backend.update_destination(vs, &drained).await?;
            }
        }

        if first_seen.elapsed() >= self.config.graceful_period {
            if conns > 0 {
                tracing::info!(key = ?key, conns, "stale virtual service still has connections, keeping");
                return Ok(());
            }
            tracing::info!(key = ?key, "graceful period elapsed, removing virtual service");
            for dest in &dests {
                self.backend.del_destination(vs, dest).await?;
            }
            self.backend.del_service(vs).await?;
            self.retiring_services.remove(&key);
        }
        Ok(())
    }

    /// Reconcile the dummy-interface address set and the local-table
    /// routes for every enabled family.
    pub async fn sync_vips(
        &self,
        snapshot: &ClusterSnapshot,
        netlink: &NetlinkHandle,
    ) -> KernelResult<()> {
        let link = netlink.ensure_dummy_interface().await?;

        for family in &self.config.families {
            let desired = self.desired_state(snapshot, *family);
            let Some(node_ip) = self.config.node_ip_for_family(*family) else {
                if !desired.vips.is_empty() {
                    tracing::error!(family = %family, "VIPs desired but node has no address in family");
                }
                continue;
            };

            let current: Vec<IpAddr> = netlink
                .list_addresses(link, *family)
                .await?
                .into_iter()
                .filter(|ip| !is_link_local(ip))
                .collect();

            let (to_add, to_del) = vip_delta(&desired.vips, &current);

            for vip in to_add {
                match netlink.addr_add(link, vip).await {
                    Ok(()) => {}
                    Err(KernelError::AddrExists) => {}
                    Err(e) => {
                        tracing::error!(vip = %vip, error = %e, "failed to bind VIP");
                        continue;
                    }
                }
                match netlink.ip_route_replace_local(vip, node_ip) {
                    Ok(()) => {}
                    Err(e @ KernelError::FamilyMismatch { .. }) => {
                        tracing::error!(vip = %vip, error = %e, "skipping local route");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                netlink.prune_stray_v6_routes(vip, node_ip).await?;
            }

            for vip in to_del {
                tracing::info!(vip = %vip, family = %family, "unbinding stale VIP");
                match netlink.addr_del(link, vip).await {
                    Ok(()) | Err(KernelError::AddrNotFound) => {}
                    Err(e) => {
                        tracing::error!(vip = %vip, error = %e, "failed to unbind VIP");
                        continue;
                    }
                }
                match netlink.ip_route_delete_local(vip, node_ip) {
                    Ok(()) | Err(KernelError::RouteNotFound) => {}
                    Err(e) => tracing::error!(vip = %vip, error = %e, "failed to delete local route"),
                }
            }
        }
        Ok(())
    }

    /// Configure DSR tunnels for local endpoints of DSR services.
    pub async fn sync_dsr_endpoints(
        &self,
        snapshot: &ClusterSnapshot,
        configurator: &DsrConfigurator,
        pid_lookup: &Arc<dyn ContainerPidLookup>,
    ) {
        for svc in snapshot.services.iter().filter(|s| s.direct_server_return) {
            let Some(endpoints) = snapshot.endpoints.get(&svc.key()) else {
                continue;
            };
            for vip in &svc.external_ips {
                for ep in endpoints.iter().filter(|ep| ep.is_local) {
                    if IpFamily::of(vip) != IpFamily::of(&ep.ip) {
                        continue;
                    }
                    let pid = match pid_lookup.pid_for_container(&ep.container_id) {
                        Ok(pid) => pid,
                        Err(e) => {
                            tracing::error!(
                                ns = %svc.namespace,
                                name = %svc.name,
                                container = %ep.container_id,
                                error = %e,
                                "cannot resolve endpoint pid for DSR"
                            );
                            continue;
                        }
                    };
                    if let Err(e) = configurator
                        .configure_endpoint(*vip, ep.ip, &ep.container_id, pid)
                        .await
                    {
                        tracing::error!(
                            ns = %svc.namespace,
                            name = %svc.name,
                            endpoint = %ep.ip,
                            error = %e,
                            "DSR endpoint configuration failed"
                        );
                    }
                }
            }
        }
    }

    /// Teardown for --cleanup-config: flush IPVS and remove the dummy
    /// interface with every VIP on it.
    pub async fn cleanup(&mut self, netlink: &NetlinkHandle) -> KernelResult<()> {
        self.backend.flush().await?;
        netlink.delete_link(KUBE_DUMMY_IF).await?;
        Ok(())
    }
}

/// Compare the fields a service update can change.
fn needs_service_update(current: &VirtualServer, desired: &VirtualServer) -> bool {
    current.persistent() != desired.persistent()
        || current.timeout != desired.timeout
        || current.sched_flags() != desired.sched_flags()
        || current.scheduler != desired.scheduler
        || current.family != desired.family
}

/// Pure set difference for the dummy-interface address reconcile.
pub fn vip_delta(desired: &BTreeSet<IpAddr>, current: &[IpAddr]) -> (Vec<IpAddr>, Vec<IpAddr>) {
    let to_add = desired
        .iter()
        .filter(|ip| !current.contains(ip))
        .copied()
        .collect();
    let to_del = current
        .iter()
        .filter(|ip| !desired.contains(ip))
        .copied()
        .collect();
    (to_add, to_del)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{EndpointInfo, ServicePort};
    use async_trait::async_trait;
    use std::sync::{Arc as StdArc, Mutex};

    /// In-memory IPVS that records every write, used to assert
    /// convergence and idempotence without a kernel.
    #[derive(Default, Clone)]
    struct FakeIpvs {
        inner: StdArc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    struct FakeState {
        services: Vec<VirtualServer>,
        dests: HashMap<VsKey, Vec<RealServer>>,
        writes: Vec<String>,
    }

    impl FakeIpvs {
        fn writes(&self) -> Vec<String> {
            self.inner.lock().unwrap().writes.clone()
        }

        fn clear_writes(&self) {
            self.inner.lock().unwrap().writes.clear();
        }

        fn services(&self) -> Vec<VirtualServer> {
            self.inner.lock().unwrap().services.clone()
        }

        fn dests_for(&self, key: &VsKey) -> Vec<RealServer> {
            self.inner
                .lock()
                .unwrap()
                .dests
                .get(key)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl IpvsBackend for FakeIpvs {
        async fn get_services(&mut self) -> KernelResult<Vec<VirtualServer>> {
            Ok(self.inner.lock().unwrap().services.clone())
        }

        async fn get_destinations(&mut self, vs: &VirtualServer) -> KernelResult<Vec<RealServer>> {
            Ok(self.dests_for(&vs.key().unwrap()))
        }

        async fn new_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            state.writes.push(format!("new_service {:?}", vs.key()));
            state.services.push(vs.clone());
            Ok(())
        }

        async fn update_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            state.writes.push(format!("update_service {:?}", vs.key()));
            if let Some(existing) = state
                .services
                .iter_mut()
                .find(|s| s.key() == vs.key())
            {
                *existing = vs.clone();
            }
            Ok(())
        }

        async fn del_service(&mut self, vs: &VirtualServer) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            state.writes.push(format!("del_service {:?}", vs.key()));
            let key = vs.key();
            state.services.retain(|s| s.key() != key);
            if let Some(k) = key {
                state.dests.remove(&k);
            }
            Ok(())
        }

        async fn new_destination(
            &mut self,
            vs: &VirtualServer,
            rs: &RealServer,
        ) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            let key = vs.key().unwrap();
            let dests = state.dests.entry(key).or_default();
            if dests
                .iter()
                .any(|d| d.address == rs.address && d.port == rs.port)
            {
                return Err(KernelError::IpvsServerExists);
            }
            state
                .writes
                .push(format!("new_destination {}:{}", rs.address, rs.port));
            state.dests.get_mut(&key).unwrap().push(rs.clone());
            Ok(())
        }

        async fn update_destination(
            &mut self,
            vs: &VirtualServer,
            rs: &RealServer,
        ) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            let key = vs.key().unwrap();
            state
                .writes
                .push(format!("update_destination {}:{} w={}", rs.address, rs.port, rs.weight));
            if let Some(dests) = state.dests.get_mut(&key) {
                if let Some(d) = dests
                    .iter_mut()
                    .find(|d| d.address == rs.address && d.port == rs.port)
                {
                    d.weight = rs.weight;
                    d.forward_method = rs.forward_method;
                }
            }
            Ok(())
        }

        async fn del_destination(
            &mut self,
            vs: &VirtualServer,
            rs: &RealServer,
        ) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            let key = vs.key().unwrap();
            state
                .writes
                .push(format!("del_destination {}:{}", rs.address, rs.port));
            if let Some(dests) = state.dests.get_mut(&key) {
                dests.retain(|d| !(d.address == rs.address && d.port == rs.port));
            }
            Ok(())
        }

        async fn set_timeouts(
            &mut self,
            _tcp: Duration,
            _tcp_fin: Duration,
            _udp: Duration,
        ) -> KernelResult<()> {
            Ok(())
        }

        async fn flush(&mut self) -> KernelResult<()> {
            let mut state = self.inner.lock().unwrap();
            state.services.clear();
            state.dests.clear();
            Ok(())
        }
    }

    fn config() -> ProxyConfig {
        ProxyConfig {
            families: vec![IpFamily::V4],
            node_ips: vec!["192.168.1.10".parse().unwrap()],
            nodeport_bindon_all_ip: false,
            graceful_termination: false,
            graceful_period: Duration::from_secs(30),
        }
    }

    fn service(name: &str, cluster_ip: &str, port: u16) -> ServiceInfo {
        ServiceInfo {
            namespace: "default".into(),
            name: name.into(),
            cluster_ips: vec![cluster_ip.parse().unwrap()],
            external_ips: vec![],
            load_balancer_ips: vec![],
            ports: vec![ServicePort {
                name: "http".into(),
                protocol: Protocol::Tcp,
                port,
                node_port: None,
            }],
            scheduler: String::new(),
            sched_flags: SchedFlags::default(),
            persistent: false,
            persistent_timeout: 0,
            direct_server_return: false,
            hairpin: false,
        }
    }

    fn endpoint(ip: &str, port: u16, local: bool) -> EndpointInfo {
        EndpointInfo {
            ip: ip.parse().unwrap(),
            port,
            node_name: if local { "this-node" } else { "other" }.to_string(),
            container_id: format!("cid-{}", ip),
            is_local: local,
        }
    }

    fn snapshot_with(svc: ServiceInfo, endpoints: Vec<EndpointInfo>) -> ClusterSnapshot {
        let mut map = BTreeMap::new();
        map.insert(svc.key(), endpoints);
        ClusterSnapshot {
            services: vec![svc],
            endpoints: map,
            ..Default::default()
        }
    }

    fn reconciler_with(fake: &FakeIpvs, cfg: ProxyConfig) -> ProxyReconciler {
        ProxyReconciler::new(Box::new(fake.clone()), cfg)
    }

    #[tokio::test]
    async fn cluster_ip_service_creates_vs_and_two_destinations() {
        let fake = FakeIpvs::default();
        let mut r = reconciler_with(&fake, config());
        let snapshot = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true), endpoint("10.244.1.6", 8080, false)],
        );

        r.sync_ipvs(&snapshot).await.unwrap();

        let services = fake.services();
        assert_eq!(services.len(), 1);
        let vs = &services[0];
        assert_eq!(vs.scheduler, ROUND_ROBIN);
        assert_eq!(
            vs.key(),
            Some(VsKey::Addr(
                IpFamily::V4,
                Protocol::Tcp,
                "10.96.1.1".parse().unwrap(),
                80
            ))
        );
        let dests = fake.dests_for(&vs.key().unwrap());
        assert_eq!(dests.len(), 2);
        assert!(dests.iter().all(|d| d.weight == 1));
    }

    #[tokio::test]
    async fn second_sync_of_same_snapshot_is_a_no_op() {
        let fake = FakeIpvs::default();
        let mut r = reconciler_with(&fake, config());
        let snapshot = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true)],
        );

        r.sync_ipvs(&snapshot).await.unwrap();
        fake.clear_writes();
        r.sync_ipvs(&snapshot).await.unwrap();
        assert!(
            fake.writes().is_empty(),
            "second sync issued writes: {:?}",
            fake.writes()
        );
    }

    #[tokio::test]
    async fn reconciling_final_snapshot_directly_matches_sequential_syncs() {
        // Convergence is a function of the final snapshot alone.
        let s1 = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true)],
        );
        let s2 = snapshot_with(
            service("svc", "10.96.1.1", 443),
            vec![endpoint("10.244.0.7", 8443, true)],
        );

        let sequential = FakeIpvs::default();
        let mut r1 = reconciler_with(&sequential, config());
        r1.sync_ipvs(&s1).await.unwrap();
        r1.sync_ipvs(&s2).await.unwrap();

        let direct = FakeIpvs::default();
        let mut r2 = reconciler_with(&direct, config());
        r2.sync_ipvs(&s2).await.unwrap();

        let seq_keys: BTreeSet<_> = sequential.services().iter().filter_map(|s| s.key()).collect();
        let dir_keys: BTreeSet<_> = direct.services().iter().filter_map(|s| s.key()).collect();
        assert_eq!(seq_keys, dir_keys);
        for key in seq_keys {
            let a: Vec<_> = sequential
                .dests_for(&key)
                .iter()
                .map(|d| (d.address, d.port))
                .collect();
            let b: Vec<_> = direct
                .dests_for(&key)
                .iter()
                .map(|d| (d.address, d.port))
                .collect();
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn removed_endpoint_drains_then_deletes_after_period() {
        let fake = FakeIpvs::default();
        let mut cfg = config();
        cfg.graceful_termination = true;
        cfg.graceful_period = Duration::from_secs(3600);
        let mut r = reconciler_with(&fake, cfg);

        let two = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true), endpoint("10.244.1.6", 8080, false)],
        );
        r.sync_ipvs(&two).await.unwrap();

        let one = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true)],
        );
        r.sync_ipvs(&one).await.unwrap();

        // Still present, weight zero.
        let key = VsKey::Addr(IpFamily::V4, Protocol::Tcp, "10.96.1.1".parse().unwrap(), 80);
        let dests = fake.dests_for(&key);
        assert_eq!(dests.len(), 2);
        let drained = dests
            .iter()
            .find(|d| d.address == "10.244.1.6".parse::<IpAddr>().unwrap())
            .unwrap();
        assert_eq!(drained.weight, 0);

        // With the period over, the next sync removes it.
        r.config.graceful_period = Duration::ZERO;
        r.sync_ipvs(&one).await.unwrap();
        let dests = fake.dests_for(&key);
        assert_eq!(dests.len(), 1);
        assert_eq!(dests[0].address, "10.244.0.5".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn immediate_removal_without_graceful_termination() {
        let fake = FakeIpvs::default();
        let mut r = reconciler_with(&fake, config());

        let two = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true), endpoint("10.244.1.6", 8080, false)],
        );
        r.sync_ipvs(&two).await.unwrap();
        let one = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true)],
        );
        r.sync_ipvs(&one).await.unwrap();

        let key = VsKey::Addr(IpFamily::V4, Protocol::Tcp, "10.96.1.1".parse().unwrap(), 80);
        assert_eq!(fake.dests_for(&key).len(), 1);
    }

    #[tokio::test]
    async fn stale_service_is_deleted() {
        let fake = FakeIpvs::default();
        let mut r = reconciler_with(&fake, config());
        let snapshot = snapshot_with(
            service("svc", "10.96.1.1", 80),
            vec![endpoint("10.244.0.5", 8080, true)],
        );
        r.sync_ipvs(&snapshot).await.unwrap();
        assert_eq!(fake.services().len(), 1);

        r.sync_ipvs(&ClusterSnapshot::default()).await.unwrap();
        assert!(fake.services().is_empty());
    }

    #[tokio::test]
    async fn dsr_service_gets_fwmark_vs_with_tunnel_destinations() {
        let fake = FakeIpvs::default();
        let mut r = reconciler_with(&fake, config());
        let mut svc = service("svc", "10.96.1.1", 80);
        svc.external_ips = vec!["198.51.100.7".parse().unwrap()];
        svc.direct_server_return = true;
        let snapshot = snapshot_with(svc, vec![endpoint("10.244.0.5", 8080, true)]);

        r.sync_ipvs(&snapshot).await.unwrap();

        let services = fake.services();
        let fwmark_vs = services.iter().find(|s| s.fwmark != 0).expect("fwmark VS");
        assert_eq!(fwmark_vs.netmask, 32);
        let expected_mark = service_fw_mark(
            IpFamily::V4,
            "198.51.100.7".parse().unwrap(),
            Protocol::Tcp,
            80,
        );
        assert_eq!(fwmark_vs.fwmark, expected_mark);

        let dests = fake.dests_for(&fwmark_vs.key().unwrap());
        assert_eq!(dests.len(), 1);
        assert_eq!(dests[0].forward_method, ForwardMethod::Tunnel);

        // The plain external-IP VS exists as well.
        assert!(services.iter().any(|s| s.address
            == Some("198.51.100.7".parse().unwrap())));
    }

    #[test]
    fn dsr_external_ips_stay_off_the_dummy_interface() {
        let fake = FakeIpvs::default();
        let r = reconciler_with(&fake, config());
        let mut svc = service("svc", "10.96.1.1", 80);
        svc.external_ips = vec!["198.51.100.7".parse().unwrap()];
        svc.direct_server_return = true;
        let snapshot = snapshot_with(svc, vec![]);

        let desired = r.desired_state(&snapshot, IpFamily::V4);
        assert!(desired.vips.contains(&"10.96.1.1".parse().unwrap()));
        assert!(!desired.vips.contains(&"198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn colliding_services_resolve_to_lexicographic_winner() {
        let fake = FakeIpvs::default();
        let r = reconciler_with(&fake, config());
        let mut a = service("zz-later", "10.96.1.1", 80);
        a.scheduler = "wrr".into();
        let b = service("aa-first", "10.96.1.1", 80);

        let mut endpoints = BTreeMap::new();
        endpoints.insert(a.key(), vec![]);
        endpoints.insert(b.key(), vec![]);
        let snapshot = ClusterSnapshot {
            services: vec![a, b],
            endpoints,
            ..Default::default()
        };

        let desired = r.desired_state(&snapshot, IpFamily::V4);
        assert_eq!(desired.services.len(), 1);
        let winner = desired.services.values().next().unwrap();
        assert_eq!(winner.owner.name, "aa-first");
        assert_eq!(winner.vs.scheduler, ROUND_ROBIN);
    }

    #[test]
    fn nodeport_binds_one_or_all_node_ips() {
        let fake = FakeIpvs::default();
        let mut svc = service("svc", "10.96.1.1", 80);
        svc.ports[0].node_port = Some(30080);
        let snapshot = snapshot_with(svc, vec![]);

        let r = reconciler_with(&fake, config());
        let desired = r.desired_state(&snapshot, IpFamily::V4);
        let nodeport_keys: Vec<_> = desired
            .services
            .keys()
            .filter(|k| matches!(k, VsKey::Addr(_, _, _, 30080)))
            .collect();
        assert_eq!(nodeport_keys.len(), 1);

        let mut cfg = config();
        cfg.nodeport_bindon_all_ip = true;
        cfg.node_ips = vec![
            "192.168.1.10".parse().unwrap(),
            "192.168.1.11".parse().unwrap(),
        ];
        let r = reconciler_with(&fake, cfg);
        let desired = r.desired_state(&snapshot, IpFamily::V4);
        let nodeport_keys: Vec<_> = desired
            .services
            .keys()
            .filter(|k| matches!(k, VsKey::Addr(_, _, _, 30080)))
            .collect();
        assert_eq!(nodeport_keys.len(), 2);
    }

    #[test]
    fn persistence_and_sched_flags_projected_into_vs() {
        let fake = FakeIpvs::default();
        let r = reconciler_with(&fake, config());
        let mut svc = service("svc", "10.96.1.1", 80);
        svc.persistent = true;
        svc.persistent_timeout = 10800;
        svc.sched_flags = SchedFlags {
            flag1: true,
            flag2: true,
            flag3: false,
        };
        let snapshot = snapshot_with(svc, vec![]);
        let desired = r.desired_state(&snapshot, IpFamily::V4);
        let vs = &desired.services.values().next().unwrap().vs;
        assert!(vs.persistent());
        assert_eq!(vs.timeout, 10800);
        assert_eq!(vs.sched_flags(), IP_VS_SVC_F_SCHED1 | IP_VS_SVC_F_SCHED2);
    }

    #[test]
    fn vip_delta_is_a_set_difference() {
        let desired: BTreeSet<IpAddr> = ["10.96.1.1", "10.96.1.2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let current: Vec<IpAddr> = vec!["10.96.1.2".parse().unwrap(), "10.96.9.9".parse().unwrap()];
        let (add, del) = vip_delta(&desired, &current);
        assert_eq!(add, vec!["10.96.1.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(del, vec!["10.96.9.9".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn link_local_vips_are_ignored() {
        let fake = FakeIpvs::default();
        let mut cfg = config();
        cfg.families = vec![IpFamily::V6];
        cfg.node_ips = vec!["fd00::10".parse().unwrap()];
        let r = reconciler_with(&fake, cfg);
        let mut svc = service("svc", "fd00::1", 80);
        svc.external_ips = vec!["fe80::7".parse().unwrap()];
        let snapshot = snapshot_with(svc, vec![]);
        let desired = r.desired_state(&snapshot, IpFamily::V6);
        assert!(desired.vips.contains(&"fd00::1".parse().unwrap()));
        assert!(!desired.vips.contains(&"fe80::7".parse().unwrap()));
    }
}
