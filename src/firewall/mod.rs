// Firewall reconciler - translates the policy/pod snapshot into per-pod
// filter chains and applies them as one transactional restore per family.

pub mod encoder;

use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::net::iptables::{FilterBatch, IptablesBackend};
use crate::net::{IpFamily, KernelError, KernelResult};
use crate::snapshot::{is_netpol_actionable, ClusterSnapshot, PodInfo};
use crate::utils::constants::*;

/// Per-family outcome of one firewall sync, used for logging and health.
#[derive(Debug, Default)]
pub struct FirewallSyncStats {
    pub pod_chains: usize,
    pub policy_chains: usize,
    pub stale_chains_removed: usize,
}

pub struct FirewallReconciler {
    families: Vec<IpFamily>,
    node_ips: Vec<IpAddr>,
    version: String,
}

impl FirewallReconciler {
    pub fn new(families: Vec<IpFamily>, node_ips: Vec<IpAddr>) -> Self {
        Self {
            families,
            node_ips,
            version: CHAIN_NAME_VERSION.to_string(),
        }
    }

    /// Install the jumps from the kernel's FORWARD/OUTPUT into our hook
    /// chains. Run once at startup; the hook chains themselves are rebuilt
    /// by every sync.
    pub fn ensure_base_hooks(&self) -> KernelResult<()> {
        for family in &self.families {
            let backend = IptablesBackend::new(*family);
            // The hook chains must exist before the base jump can point at
            // them; an empty batch with just declarations takes care of it.
            let mut bootstrap = FilterBatch::new();
            encoder::encode_base_chains(&mut bootstrap);
            backend.restore(&bootstrap)?;
            backend.ensure_base_jump("FORWARD", FORWARD_CHAIN)?;
            backend.ensure_base_jump("OUTPUT", OUTPUT_CHAIN)?;
        }
        Ok(())
    }

    /// Pods scheduled on this node that the firewall can act on.
    fn local_pods<'a>(&self, snapshot: &'a ClusterSnapshot) -> Vec<&'a PodInfo> {
        snapshot
            .pods
            .iter()
            .filter(|pod| is_netpol_actionable(pod))
            .filter(|pod| {
                pod.host_ip
                    .map_or(false, |host| self.node_ips.contains(&host))
            })
            .collect()
    }

    /// Build the complete restore program for one family. Pure with
    /// respect to the kernel; exercised directly by tests.
    pub(crate) fn build_family_batch(
        &self,
        snapshot: &ClusterSnapshot,
        family: IpFamily,
    ) -> (FilterBatch, FirewallSyncStats) {
        let mut batch = FilterBatch::new();
        let mut stats = FirewallSyncStats::default();
        encoder::encode_base_chains(&mut batch);

        let local_pods = self.local_pods(snapshot);

        // Policy chains are declared for every policy with at least one
        // local target so pod-chain jumps always have a destination.
        let mut applicable = Vec::new();
        for policy in &snapshot.policies {
            if local_pods.iter().any(|pod| policy.applies_to(pod)) {
                encoder::encode_policy_chain(&mut batch, policy, &self.version, family);
                applicable.push(policy);
                stats.policy_chains += 1;
            }
        }

        for pod in &local_pods {
            let Some(ip) = pod.ip_for_family(family) else {
                // Normal for pods that are not dual-stack.
                tracing::debug!(
                    ns = %pod.namespace,
                    name = %pod.name,
                    family = %family,
                    "pod has no address in this family, skipping chain"
                );
                continue;
            };
            let chain = encoder::encode_pod_chain(
                &mut batch,
                pod,
                &applicable,
                &self.version,
                family,
                ip,
            );
            encoder::encode_pod_intercepts(&mut batch, pod, &chain, ip);
            stats.pod_chains += 1;
        }

        (batch, stats)
    }

    /// One full firewall sync. Each family commits transactionally; a
    /// failed family is logged and retried on the next convergence tick
    /// without blocking the other family.
    pub fn sync(&self, snapshot: &ClusterSnapshot) -> KernelResult<FirewallSyncStats> {
        let mut totals = FirewallSyncStats::default();
        let mut first_err: Option<KernelError> = None;

        for family in &self.families {
            match self.sync_family(snapshot, *family) {
                Ok(stats) => {
                    totals.pod_chains += stats.pod_chains;
                    totals.policy_chains += stats.policy_chains;
                    totals.stale_chains_removed += stats.stale_chains_removed;
                }
                Err(e) => {
                    tracing::error!(family = %family, error = %e, "firewall sync failed for family");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            None => Ok(totals),
            Some(e) => Err(e),
        }
    }

    fn sync_family(
        &self,
        snapshot: &ClusterSnapshot,
        family: IpFamily,
    ) -> KernelResult<FirewallSyncStats> {
        let backend = IptablesBackend::new(family);
        let (batch, mut stats) = self.build_family_batch(snapshot, family);

        backend.restore(&batch)?;

        let active: BTreeSet<&str> = batch.chains().collect();
        for prefix in [POD_FW_CHAIN_PREFIX, POLICY_CHAIN_PREFIX] {
            for chain in backend.list_chains(prefix)? {
                if !active.contains(chain.as_str()) {
                    tracing::info!(family = %family, chain = %chain, "removing stale chain");
                    backend.delete_chain(&chain)?;
                    stats.stale_chains_removed += 1;
                }
            }
        }

        tracing::debug!(
            family = %family,
            pods = stats.pod_chains,
            policies = stats.policy_chains,
            stale = stats.stale_chains_removed,
            "firewall family synced"
        );
        Ok(stats)
    }

    /// Teardown for --cleanup-config: drop the base jumps, then every
    /// chain of ours, references first.
    pub fn cleanup(&self) -> KernelResult<()> {
        for family in &self.families {
            let backend = IptablesBackend::new(*family);
            backend.remove_base_jump("FORWARD", FORWARD_CHAIN)?;
            backend.remove_base_jump("OUTPUT", OUTPUT_CHAIN)?;

            let owned = owned_chains(backend.list_chains("KUBE-")?);

            for chain in &owned {
                backend.flush_chain(chain)?;
            }
            for chain in &owned {
                backend.delete_chain(chain)?;
            }
        }
        Ok(())
    }
}

/// Of all KUBE- chains in the filter table, the ones this agent owns and
/// may delete. Other agents (kube-proxy and friends) use the same prefix
/// space and must be left alone.
fn owned_chains(chains: Vec<String>) -> Vec<String> {
    chains
        .into_iter()
        .filter(|c| {
            c.starts_with(POD_FW_CHAIN_PREFIX)
                || c.starts_with(POLICY_CHAIN_PREFIX)
                || c == FORWARD_CHAIN
                || c == OUTPUT_CHAIN
                || c == DEFAULT_NETPOL_CHAIN
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{NetworkPolicyInfo, PodPhase, PolicyType};
    use std::collections::{BTreeMap, BTreeSet};

    fn node_ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    fn reconciler() -> FirewallReconciler {
        FirewallReconciler::new(vec![IpFamily::V4], vec![node_ip()])
    }

    fn pod(name: &str, ip: &str, host: &str, phase: PodPhase) -> crate::snapshot::PodInfo {
        crate::snapshot::PodInfo {
            namespace: "default".into(),
            name: name.into(),
            ip: Some(ip.parse().unwrap()),
            ips: vec![ip.parse().unwrap()],
            host_ip: Some(host.parse().unwrap()),
            phase,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn empty_cluster_batch_has_only_base_chains() {
        let snapshot = ClusterSnapshot::default();
        let (batch, stats) = reconciler().build_family_batch(&snapshot, IpFamily::V4);
        let chains: Vec<&str> = batch.chains().collect();
        assert_eq!(
            chains,
            vec![DEFAULT_NETPOL_CHAIN, FORWARD_CHAIN, OUTPUT_CHAIN]
        );
        assert_eq!(stats.pod_chains, 0);
        assert_eq!(stats.policy_chains, 0);
        let text = batch.render();
        assert!(text.contains(MARK_ACCEPTED));
    }

    #[test]
    fn exactly_one_chain_per_actionable_local_pod() {
        let snapshot = ClusterSnapshot {
            pods: vec![
                pod("local-running", "10.244.0.5", "192.168.1.10", PodPhase::Running),
                pod("remote", "10.244.1.6", "192.168.1.99", PodPhase::Running),
                pod("finished", "10.244.0.7", "192.168.1.10", PodPhase::Succeeded),
            ],
            ..Default::default()
        };
        let (batch, stats) = reconciler().build_family_batch(&snapshot, IpFamily::V4);
        assert_eq!(stats.pod_chains, 1);

        let expected =
            encoder::pod_firewall_chain_name("default", "local-running", CHAIN_NAME_VERSION);
        assert!(batch.has_chain(&expected));

        let remote = encoder::pod_firewall_chain_name("default", "remote", CHAIN_NAME_VERSION);
        let finished = encoder::pod_firewall_chain_name("default", "finished", CHAIN_NAME_VERSION);
        assert!(!batch.has_chain(&remote));
        assert!(!batch.has_chain(&finished));
    }

    #[test]
    fn policy_chain_only_with_local_target() {
        let local = pod("web", "10.244.0.5", "192.168.1.10", PodPhase::Running);
        let mut policies = Vec::new();
        for (name, target) in [("selects-local", "10.244.0.5"), ("selects-remote", "10.9.9.9")] {
            policies.push(NetworkPolicyInfo {
                namespace: "default".into(),
                name: name.into(),
                policy_type: PolicyType::Ingress,
                target_pods: BTreeSet::from([target.parse().unwrap()]),
                ingress_rules: vec![],
                egress_rules: vec![],
            });
        }
        let snapshot = ClusterSnapshot {
            pods: vec![local],
            policies,
            ..Default::default()
        };
        let (batch, stats) = reconciler().build_family_batch(&snapshot, IpFamily::V4);
        assert_eq!(stats.policy_chains, 1);

        let kept = encoder::network_policy_chain_name(
            "default",
            "selects-local",
            CHAIN_NAME_VERSION,
            IpFamily::V4,
        );
        let dropped = encoder::network_policy_chain_name(
            "default",
            "selects-remote",
            CHAIN_NAME_VERSION,
            IpFamily::V4,
        );
        assert!(batch.has_chain(&kept));
        assert!(!batch.has_chain(&dropped));
    }

    #[test]
    fn single_family_pod_skipped_in_other_family() {
        let snapshot = ClusterSnapshot {
            pods: vec![pod("web", "10.244.0.5", "192.168.1.10", PodPhase::Running)],
            ..Default::default()
        };
        let v6 = FirewallReconciler::new(vec![IpFamily::V6], vec![node_ip()]);
        let (batch, stats) = v6.build_family_batch(&snapshot, IpFamily::V6);
        assert_eq!(stats.pod_chains, 0);
        // Base chains still present so the restore is well-formed.
        assert!(batch.has_chain(FORWARD_CHAIN));
    }

    #[test]
    fn cleanup_touches_only_our_chains() {
        let listed = vec![
            "KUBE-POD-FW-ABCDEF1234567890".to_string(),
            "KUBE-NWPLCY-ABCDEF1234567890".to_string(),
            FORWARD_CHAIN.to_string(),
            OUTPUT_CHAIN.to_string(),
            DEFAULT_NETPOL_CHAIN.to_string(),
            "KUBE-SERVICES".to_string(),
            "KUBE-PROXY-FIREWALL".to_string(),
        ];
        let owned = owned_chains(listed);
        assert_eq!(owned.len(), 5);
        assert!(!owned.iter().any(|c| c == "KUBE-SERVICES"));
        assert!(!owned.iter().any(|c| c == "KUBE-PROXY-FIREWALL"));
    }

    #[test]
    fn rebuilding_same_snapshot_is_identical() {
        // Convergence: the batch is a pure function of the snapshot.
        let snapshot = ClusterSnapshot {
            pods: vec![pod("web", "10.244.0.5", "192.168.1.10", PodPhase::Running)],
            ..Default::default()
        };
        let r = reconciler();
        let (a, _) = r.build_family_batch(&snapshot, IpFamily::V4);
        let (b, _) = r.build_family_batch(&snapshot, IpFamily::V4);
        assert_eq!(a.render(), b.render());
    }
}
