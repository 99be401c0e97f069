//! Projected cluster state.
//!
//! The informer layer (external to this crate) watches the API server,
//! projects objects into the flat structs below, publishes them through a
//! [`SnapshotCache`] and signals the sync engine. Within one sync the
//! snapshot is immutable; reconcilers build whatever indices they need from
//! it instead of holding cross-references between objects.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;

use crate::net::ipvs::Protocol;
use crate::net::IpFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    /// Primary pod IP; `ips` carries the dual-stack set.
    pub ip: Option<IpAddr>,
    pub ips: Vec<IpAddr>,
    pub host_ip: Option<IpAddr>,
    pub phase: PodPhase,
    pub labels: BTreeMap<String, String>,
}

impl PodInfo {
    /// The pod's address in the given family, if it has one.
    pub fn ip_for_family(&self, family: IpFamily) -> Option<IpAddr> {
        self.ips
            .iter()
            .chain(self.ip.iter())
            .find(|ip| IpFamily::of(ip) == family)
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyType {
    Ingress,
    Egress,
    Both,
}

/// One allow tuple inside a policy: peers (as CIDR strings) × ports.
/// Either side may be empty, meaning "any".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyRule {
    pub peer_cidrs: Vec<String>,
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyPort {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPolicyInfo {
    pub namespace: String,
    pub name: String,
    pub policy_type: PolicyType,
    /// IPs of pods selected by this policy, cluster-wide.
    pub target_pods: std::collections::BTreeSet<IpAddr>,
    pub ingress_rules: Vec<PolicyRule>,
    pub egress_rules: Vec<PolicyRule>,
}

impl NetworkPolicyInfo {
    pub fn applies_to(&self, pod: &PodInfo) -> bool {
        pod.ip.map_or(false, |ip| self.target_pods.contains(&ip))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServicePort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
    pub node_port: Option<u16>,
}

/// Scheduler behavior flags projected from service annotations
/// (`flag-1`/`flag-2`/`flag-3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedFlags {
    pub flag1: bool,
    pub flag2: bool,
    pub flag3: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub namespace: String,
    pub name: String,
    pub cluster_ips: Vec<IpAddr>,
    pub external_ips: Vec<IpAddr>,
    pub load_balancer_ips: Vec<IpAddr>,
    pub ports: Vec<ServicePort>,
    pub scheduler: String,
    pub sched_flags: SchedFlags,
    pub persistent: bool,
    /// Session-affinity timeout in seconds.
    pub persistent_timeout: u32,
    pub direct_server_return: bool,
    pub hairpin: bool,
}

impl ServiceInfo {
    pub fn key(&self) -> ServiceRef {
        ServiceRef {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EndpointInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub node_name: String,
    pub container_id: String,
    pub is_local: bool,
}

/// One consistent view of the cluster, read atomically per sync.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub pods: Vec<PodInfo>,
    pub services: Vec<ServiceInfo>,
    pub endpoints: BTreeMap<ServiceRef, Vec<EndpointInfo>>,
    pub policies: Vec<NetworkPolicyInfo>,
}

/// Read-only list queries the sync engine consumes. The informer layer
/// implements this; tests hand in fixed snapshots.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> ClusterSnapshot;
}

/// Bridge between the informer layer and the reconcilers: the informer
/// replaces the snapshot and then calls the engine's request_full_sync.
#[derive(Default)]
pub struct SnapshotCache {
    inner: RwLock<ClusterSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[allow(dead_code)] // called by the informer layer, not from this crate
    pub fn replace(&self, snapshot: ClusterSnapshot) {
        *self.inner.write().expect("snapshot lock poisoned") = snapshot;
    }
}

impl SnapshotSource for SnapshotCache {
    fn snapshot(&self) -> ClusterSnapshot {
        self.inner.read().expect("snapshot lock poisoned").clone()
    }
}

// ── Predicates ────────────────────────────────────────────────────────

/// A pod is actionable when policy enforcement on this node can do
/// something with it: it has a pod IP and a host IP and is not finished.
pub fn is_netpol_actionable(pod: &PodInfo) -> bool {
    !matches!(pod.phase, PodPhase::Succeeded | PodPhase::Failed)
        && pod.ip.is_some()
        && pod.host_ip.is_some()
}

/// Whether a pod update can change netpol state at all. Everything else
/// (resource usage, conditions, restarts) is noise for the firewall.
/// The informer layer consults this before requesting a sync.
#[allow(dead_code)]
pub fn is_pod_update_netpol_relevant(old: &PodInfo, new: &PodInfo) -> bool {
    old.ip != new.ip
        || old.labels != new.labels
        || old.phase != new.phase
        || old.host_ip != new.host_ip
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ns: &str, name: &str, ip: &str, host: &str) -> PodInfo {
        PodInfo {
            namespace: ns.to_string(),
            name: name.to_string(),
            ip: Some(ip.parse().unwrap()),
            ips: vec![ip.parse().unwrap()],
            host_ip: Some(host.parse().unwrap()),
            phase: PodPhase::Running,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn actionable_requires_ip_host_and_live_phase() {
        let p = pod("default", "web", "10.244.0.5", "192.168.1.10");
        assert!(is_netpol_actionable(&p));

        let mut no_ip = p.clone();
        no_ip.ip = None;
        assert!(!is_netpol_actionable(&no_ip));

        let mut no_host = p.clone();
        no_host.host_ip = None;
        assert!(!is_netpol_actionable(&no_host));

        for phase in [PodPhase::Succeeded, PodPhase::Failed] {
            let mut done = p.clone();
            done.phase = phase;
            assert!(!is_netpol_actionable(&done));
        }

        let mut pending = p;
        pending.phase = PodPhase::Pending;
        assert!(is_netpol_actionable(&pending));
    }

    #[test]
    fn update_relevance_tracks_exactly_four_fields() {
        let base = pod("default", "web", "10.244.0.5", "192.168.1.10");
        assert!(!is_pod_update_netpol_relevant(&base, &base.clone()));

        let mut ip = base.clone();
        ip.ip = Some("10.244.0.6".parse().unwrap());
        assert!(is_pod_update_netpol_relevant(&base, &ip));

        let mut labels = base.clone();
        labels.labels.insert("role".into(), "client".into());
        assert!(is_pod_update_netpol_relevant(&base, &labels));

        let mut phase = base.clone();
        phase.phase = PodPhase::Failed;
        assert!(is_pod_update_netpol_relevant(&base, &phase));

        let mut host = base.clone();
        host.host_ip = Some("192.168.1.11".parse().unwrap());
        assert!(is_pod_update_netpol_relevant(&base, &host));

        // A name change alone is not relevant (names are immutable anyway).
        let mut name = base.clone();
        name.name = "web-2".into();
        assert!(!is_pod_update_netpol_relevant(&base, &name));
    }

    #[test]
    fn ip_for_family_picks_matching_address() {
        let mut p = pod("default", "web", "10.244.0.5", "192.168.1.10");
        p.ips.push("fd00::5".parse().unwrap());
        assert_eq!(
            p.ip_for_family(IpFamily::V4),
            Some("10.244.0.5".parse().unwrap())
        );
        assert_eq!(
            p.ip_for_family(IpFamily::V6),
            Some("fd00::5".parse().unwrap())
        );
    }

    #[test]
    fn snapshot_cache_replace_is_visible() {
        let cache = SnapshotCache::new();
        assert!(cache.snapshot().pods.is_empty());
        cache.replace(ClusterSnapshot {
            pods: vec![pod("default", "web", "10.244.0.5", "192.168.1.10")],
            ..Default::default()
        });
        assert_eq!(cache.snapshot().pods.len(), 1);
    }
}
