//! Pure rule encoding: chain names, fwmarks, and the filter-table rule
//! sequences for pods and policies. Nothing in here touches the kernel;
//! everything is a deterministic function of its inputs.

use data_encoding::BASE32;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

use crate::net::iptables::FilterBatch;
use crate::net::ipvs::Protocol;
use crate::net::IpFamily;
use crate::snapshot::{NetworkPolicyInfo, PodInfo, PolicyPort, PolicyRule, PolicyType};
use crate::utils::constants::*;

/// Length of the truncated base32 hash suffix in chain names.
const CHAIN_HASH_LEN: usize = 16;

/// Whether a CIDR string belongs to the given family. Unparseable CIDRs
/// match nothing.
fn cidr_in_family(cidr: &str, family: IpFamily) -> bool {
    cidr.split('/')
        .next()
        .and_then(|addr| addr.parse::<IpAddr>().ok())
        .map_or(false, |ip| IpFamily::of(&ip) == family)
}

fn hashed_chain_name(prefix: &str, input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let encoded = BASE32.encode(&digest);
    format!("{}{}", prefix, &encoded[..CHAIN_HASH_LEN])
}

/// `KUBE-POD-FW-` + truncated base32(sha256(ns‖name‖version)).
pub fn pod_firewall_chain_name(namespace: &str, pod_name: &str, version: &str) -> String {
    hashed_chain_name(
        POD_FW_CHAIN_PREFIX,
        &format!("{}{}{}", namespace, pod_name, version),
    )
}

/// `KUBE-NWPLCY-` + truncated base32(sha256(ns‖name‖version‖family)).
pub fn network_policy_chain_name(
    namespace: &str,
    policy_name: &str,
    version: &str,
    family: IpFamily,
) -> String {
    hashed_chain_name(
        POLICY_CHAIN_PREFIX,
        &format!("{}{}{}{}", namespace, policy_name, version, family),
    )
}

/// Deterministic fwmark for a DSR virtual service. First four bytes of
/// sha256 over the service identity, big-endian; zero is remapped so the
/// mark is always usable as an IPVS key.
pub fn service_fw_mark(family: IpFamily, vip: IpAddr, protocol: Protocol, port: u16) -> u32 {
    let input = format!("{}|{}|{}|{}", family, vip, protocol, port);
    let digest = Sha256::digest(input.as_bytes());
    let mark = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    if mark == 0 {
        1
    } else {
        mark
    }
}

/// Declare the hook and default chains and the accept rule for packets
/// that already carry the "policy passed" mark.
pub fn encode_base_chains(batch: &mut FilterBatch) {
    for chain in [FORWARD_CHAIN, OUTPUT_CHAIN] {
        batch.declare_chain(chain);
        batch.append_rule(
            chain,
            &[
                "-m", "comment", "--comment",
                "\"accept traffic that already passed network policy\"",
                "-m", "mark", "--mark", MARK_ACCEPTED, "-j", "ACCEPT",
            ],
        );
    }
    // Default-deny: an empty chain leaves the packet unmarked, so the pod
    // chain tail rejects it.
    batch.declare_chain(DEFAULT_NETPOL_CHAIN);
}

/// Emit the full chain for one pod in one family, in the order the chain
/// will evaluate: stateful accept, invalid drop, local-source accept,
/// policy jumps, default jumps, NFLOG, REJECT, mark bookkeeping.
pub fn encode_pod_chain(
    batch: &mut FilterBatch,
    pod: &PodInfo,
    policies: &[&NetworkPolicyInfo],
    version: &str,
    family: IpFamily,
    ip: IpAddr,
) -> String {
    let chain = pod_firewall_chain_name(&pod.namespace, &pod.name, version);
    let ip_s = ip.to_string();
    batch.declare_chain(&chain);

    batch.append_rule(
        &chain,
        &[
            "-m", "comment", "--comment", "\"rule for stateful firewall for pod\"",
            "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT",
        ],
    );
    // The NAT engine skips INVALID packets entirely, so letting them
    // through would leak around policy; drop them.
    batch.append_rule(
        &chain,
        &[
            "-m", "comment", "--comment", "\"rule to drop invalid state for pod\"",
            "-m", "conntrack", "--ctstate", "INVALID", "-j", "DROP",
        ],
    );
    batch.append_rule(
        &chain,
        &[
            "-m", "comment", "--comment",
            "\"rule to permit traffic to the pod when the source is its local node\"",
            "-m", "addrtype", "--src-type", "LOCAL", "-d", &ip_s, "-j", "ACCEPT",
        ],
    );

    let mut has_ingress = false;
    let mut has_egress = false;
    for policy in policies {
        if !policy.applies_to(pod) {
            continue;
        }
        let policy_chain =
            network_policy_chain_name(&policy.namespace, &policy.name, version, family);
        let comment = format!("\"run through nw policy {}\"", policy.name);
        match policy.policy_type {
            PolicyType::Both => {
                has_ingress = true;
                has_egress = true;
                batch.append_rule(
                    &chain,
                    &["-m", "comment", "--comment", &comment, "-j", &policy_chain],
                );
            }
            PolicyType::Ingress => {
                has_ingress = true;
                batch.append_rule(
                    &chain,
                    &[
                        "-d", &ip_s, "-m", "comment", "--comment", &comment, "-j", &policy_chain,
                    ],
                );
            }
            PolicyType::Egress => {
                has_egress = true;
                batch.append_rule(
                    &chain,
                    &[
                        "-s", &ip_s, "-m", "comment", "--comment", &comment, "-j", &policy_chain,
                    ],
                );
            }
        }
    }

    if !has_ingress {
        batch.append_rule(
            &chain,
            &[
                "-d", &ip_s, "-m", "comment", "--comment",
                "\"run through default ingress network policy chain\"",
                "-j", DEFAULT_NETPOL_CHAIN,
            ],
        );
    }
    if !has_egress {
        batch.append_rule(
            &chain,
            &[
                "-s", &ip_s, "-m", "comment", "--comment",
                "\"run through default egress network policy chain\"",
                "-j", DEFAULT_NETPOL_CHAIN,
            ],
        );
    }

    let log_comment = format!(
        "\"rule to log dropped traffic POD name:{} namespace:{}\"",
        pod.name, pod.namespace
    );
    batch.append_rule(
        &chain,
        &[
            "-m", "comment", "--comment", &log_comment,
            "-m", "mark", "!", "--mark", MARK_POLICY_PERMITTED,
            "-j", "NFLOG", "--nflog-group", NFLOG_GROUP,
            "-m", "limit", "--limit", NFLOG_RATE, "--limit-burst", NFLOG_BURST,
        ],
    );
    let reject_comment = format!(
        "\"rule to REJECT traffic destined for POD name:{} namespace:{}\"",
        pod.name, pod.namespace
    );
    batch.append_rule(
        &chain,
        &[
            "-m", "comment", "--comment", &reject_comment,
            "-m", "mark", "!", "--mark", MARK_POLICY_PERMITTED, "-j", "REJECT",
        ],
    );
    // Reset the permit bit so chains evaluated later never see stale state.
    batch.append_rule(&chain, &["-j", "MARK", "--set-mark", MARK_POLICY_CLEAR]);
    batch.append_rule(
        &chain,
        &[
            "-m", "comment", "--comment",
            "\"set mark to ACCEPT traffic that comply to network policies\"",
            "-j", "MARK", "--set-mark", MARK_ACCEPTED,
        ],
    );

    chain
}

/// Emit jumps from the hook chains into a pod chain: routed traffic both
/// ways, host-originated traffic to the pod, and same-node bridged
/// traffic in both directions.
pub fn encode_pod_intercepts(batch: &mut FilterBatch, pod: &PodInfo, chain: &str, ip: IpAddr) {
    let ip_s = ip.to_string();
    let inbound = format!(
        "\"rule to jump traffic destined to POD name:{} namespace:{} to chain {}\"",
        pod.name, pod.namespace, chain
    );
    let outbound = format!(
        "\"rule to jump traffic from POD name:{} namespace:{} to chain {}\"",
        pod.name, pod.namespace, chain
    );

    batch.append_rule(
        FORWARD_CHAIN,
        &["-m", "comment", "--comment", &inbound, "-d", &ip_s, "-j", chain],
    );
    batch.append_rule(
        OUTPUT_CHAIN,
        &["-m", "comment", "--comment", &inbound, "-d", &ip_s, "-j", chain],
    );
    batch.append_rule(
        FORWARD_CHAIN,
        &[
            "-m", "physdev", "--physdev-is-bridged",
            "-m", "comment", "--comment", &inbound,
            "-d", &ip_s, "-j", chain,
        ],
    );

    for hook in [FORWARD_CHAIN, OUTPUT_CHAIN] {
        batch.append_rule(
            hook,
            &["-m", "comment", "--comment", &outbound, "-s", &ip_s, "-j", chain],
        );
    }
    batch.append_rule(
        FORWARD_CHAIN,
        &[
            "-m", "physdev", "--physdev-is-bridged",
            "-m", "comment", "--comment", &outbound,
            "-s", &ip_s, "-j", chain,
        ],
    );
}

/// Emit a policy chain: each allow tuple sets the permit mark, and a
/// marked packet returns to the pod chain immediately.
pub fn encode_policy_chain(
    batch: &mut FilterBatch,
    policy: &NetworkPolicyInfo,
    version: &str,
    family: IpFamily,
) -> String {
    let chain = network_policy_chain_name(&policy.namespace, &policy.name, version, family);
    batch.declare_chain(&chain);

    let comment = format!(
        "\"rule to mark traffic matching nw policy {}/{}\"",
        policy.namespace, policy.name
    );

    let mut emit_rules = |rules: &[PolicyRule], peer_flag: &str| {
        for rule in rules {
            // An empty side of the tuple means "any". Peers of the other
            // address family cannot match in this batch; a tuple whose
            // peers all belong to the other family emits nothing (it must
            // not degrade into an allow-any rule).
            let family_cidrs: Vec<&str> = rule
                .peer_cidrs
                .iter()
                .filter(|c| cidr_in_family(c, family))
                .map(|c| c.as_str())
                .collect();
            if family_cidrs.is_empty() && !rule.peer_cidrs.is_empty() {
                continue;
            }
            let cidrs: Vec<Option<&str>> = if family_cidrs.is_empty() {
                vec![None]
            } else {
                family_cidrs.into_iter().map(Some).collect()
            };
            let ports: Vec<Option<&PolicyPort>> = if rule.ports.is_empty() {
                vec![None]
            } else {
                rule.ports.iter().map(Some).collect()
            };
            for cidr in &cidrs {
                for port in &ports {
                    let mut args: Vec<String> = vec![
                        "-m".into(),
                        "comment".into(),
                        "--comment".into(),
                        comment.clone(),
                    ];
                    if let Some(cidr) = cidr {
                        args.push(peer_flag.to_string());
                        args.push((*cidr).to_string());
                    }
                    if let Some(port) = port {
                        args.push("-p".into());
                        args.push(port.protocol.as_str().to_string());
                        args.push("--dport".into());
                        args.push(port.port.to_string());
                    }
                    args.extend([
                        "-j".into(),
                        "MARK".into(),
                        "--set-mark".into(),
                        MARK_POLICY_PERMITTED.into(),
                    ]);
                    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                    batch.append_rule(&chain, &arg_refs);
                }
            }
        }
    };

    match policy.policy_type {
        PolicyType::Ingress => emit_rules(&policy.ingress_rules, "-s"),
        PolicyType::Egress => emit_rules(&policy.egress_rules, "-d"),
        PolicyType::Both => {
            emit_rules(&policy.ingress_rules, "-s");
            emit_rules(&policy.egress_rules, "-d");
        }
    }

    batch.append_rule(
        &chain,
        &["-m", "mark", "--mark", MARK_POLICY_PERMITTED, "-j", "RETURN"],
    );

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PodPhase;
    use std::collections::{BTreeMap, BTreeSet};

    fn pod(ns: &str, name: &str, ip: &str) -> PodInfo {
        PodInfo {
            namespace: ns.to_string(),
            name: name.to_string(),
            ip: Some(ip.parse().unwrap()),
            ips: vec![ip.parse().unwrap()],
            host_ip: Some("192.168.1.10".parse().unwrap()),
            phase: PodPhase::Running,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn chain_names_are_short_deterministic_and_distinct() {
        let a = pod_firewall_chain_name("default", "web", "1");
        let b = pod_firewall_chain_name("default", "web", "1");
        let c = pod_firewall_chain_name("default", "web2", "1");
        let d = pod_firewall_chain_name("default", "web", "2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.len() <= 29, "chain name too long: {} ({})", a, a.len());
        assert!(a.starts_with(POD_FW_CHAIN_PREFIX));
        assert!(a[POD_FW_CHAIN_PREFIX.len()..]
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric()));
    }

    #[test]
    fn policy_chain_name_varies_by_family() {
        let v4 = network_policy_chain_name("default", "allow-web", "1", IpFamily::V4);
        let v6 = network_policy_chain_name("default", "allow-web", "1", IpFamily::V6);
        assert_ne!(v4, v6);
        assert!(v4.starts_with(POLICY_CHAIN_PREFIX));
    }

    #[test]
    fn fw_marks_are_stable_and_distinct() {
        let vip: IpAddr = "198.51.100.7".parse().unwrap();
        let a = service_fw_mark(IpFamily::V4, vip, Protocol::Tcp, 80);
        let b = service_fw_mark(IpFamily::V4, vip, Protocol::Tcp, 80);
        let c = service_fw_mark(IpFamily::V4, vip, Protocol::Tcp, 443);
        let d = service_fw_mark(IpFamily::V4, vip, Protocol::Udp, 80);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, 0);
    }

    #[test]
    fn default_deny_pod_chain_shape() {
        // Scenario: single pod, no policies. Expect both default-netpol
        // jumps, stateful accept, invalid drop, and the REJECT tail.
        let mut batch = FilterBatch::new();
        encode_base_chains(&mut batch);
        let p = pod("default", "web", "10.244.0.5");
        let chain = encode_pod_chain(&mut batch, &p, &[], "1", IpFamily::V4, p.ip.unwrap());
        encode_pod_intercepts(&mut batch, &p, &chain, p.ip.unwrap());

        let text = batch.render();
        assert!(text.contains(&format!(":{} - [0:0]", chain)));
        assert!(text.contains("--ctstate RELATED,ESTABLISHED -j ACCEPT"));
        assert!(text.contains("--ctstate INVALID -j DROP"));
        assert!(text.contains(&format!(
            "-d 10.244.0.5 -m comment --comment \"run through default ingress network policy chain\" -j {}",
            DEFAULT_NETPOL_CHAIN
        )));
        assert!(text.contains(&format!(
            "-s 10.244.0.5 -m comment --comment \"run through default egress network policy chain\" -j {}",
            DEFAULT_NETPOL_CHAIN
        )));
        assert!(text.contains("-j REJECT"));
        assert!(text.contains("--physdev-is-bridged"));

        // The reject precedes the mark bookkeeping at the chain tail.
        let reject = text.find("-j REJECT").unwrap();
        let clear = text.find(&format!("--set-mark {}", MARK_POLICY_CLEAR)).unwrap();
        let accept_mark = text.rfind(&format!("--set-mark {}", MARK_ACCEPTED)).unwrap();
        assert!(reject < clear && clear < accept_mark);
    }

    #[test]
    fn policy_jump_is_gated_on_pod_address() {
        // Scenario: ingress policy on TCP/80 selecting the pod.
        let p = pod("default", "web", "10.244.0.5");
        let policy = NetworkPolicyInfo {
            namespace: "default".into(),
            name: "allow-web".into(),
            policy_type: PolicyType::Ingress,
            target_pods: BTreeSet::from([p.ip.unwrap()]),
            ingress_rules: vec![PolicyRule {
                peer_cidrs: vec!["10.244.0.0/16".into()],
                ports: vec![PolicyPort {
                    protocol: Protocol::Tcp,
                    port: 80,
                }],
            }],
            egress_rules: vec![],
        };

        let mut batch = FilterBatch::new();
        encode_base_chains(&mut batch);
        let policy_chain = encode_policy_chain(&mut batch, &policy, "1", IpFamily::V4);
        let pod_chain =
            encode_pod_chain(&mut batch, &p, &[&policy], "1", IpFamily::V4, p.ip.unwrap());

        let text = batch.render();
        assert!(text.contains(&format!("-A {} -d 10.244.0.5", pod_chain)));
        assert!(text.contains(&format!("-j {}", policy_chain)));
        assert!(text.contains("-s 10.244.0.0/16 -p tcp --dport 80 -j MARK"));
        // With an ingress policy present, only the egress default jump remains.
        assert!(!text.contains("default ingress network policy chain"));
        assert!(text.contains("default egress network policy chain"));
    }

    #[test]
    fn policy_peers_of_the_other_family_emit_nothing() {
        let policy = NetworkPolicyInfo {
            namespace: "default".into(),
            name: "v6-only".into(),
            policy_type: PolicyType::Ingress,
            target_pods: BTreeSet::new(),
            ingress_rules: vec![PolicyRule {
                peer_cidrs: vec!["fd00::/64".into()],
                ports: vec![],
            }],
            egress_rules: vec![],
        };
        let mut batch = FilterBatch::new();
        let chain = encode_policy_chain(&mut batch, &policy, "1", IpFamily::V4);
        let text = batch.render();
        // No v6 peer leaks into the v4 batch, and the tuple does not
        // degrade into an allow-any mark rule.
        assert!(!text.contains("fd00::/64"));
        let mark_rules = text
            .lines()
            .filter(|l| l.starts_with(&format!("-A {}", chain)) && l.contains("--set-mark"))
            .count();
        assert_eq!(mark_rules, 0);
    }

    #[test]
    fn policy_chain_returns_on_mark() {
        let policy = NetworkPolicyInfo {
            namespace: "default".into(),
            name: "open".into(),
            policy_type: PolicyType::Ingress,
            target_pods: BTreeSet::new(),
            ingress_rules: vec![PolicyRule::default()],
            egress_rules: vec![],
        };
        let mut batch = FilterBatch::new();
        let chain = encode_policy_chain(&mut batch, &policy, "1", IpFamily::V4);
        let text = batch.render();
        assert!(text.contains(&format!(
            "-A {} -m mark --mark {} -j RETURN",
            chain, MARK_POLICY_PERMITTED
        )));
        // An empty tuple means "allow anything": a bare mark rule.
        assert!(text
            .lines()
            .any(|l| l.starts_with(&format!("-A {}", chain)) && !l.contains("-s ") && l.contains("MARK")));
    }
}
