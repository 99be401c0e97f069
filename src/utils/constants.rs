//! Unified constants module for the dataplane agent.
//!
//! Everything here is kernel-visible surface: chain names, interface names,
//! mark bits and routing-table ids. Changing any of these is a breaking
//! change for clusters that already have state programmed by an older agent.

use std::time::Duration;

// ============================================================================
// Filter-table chain names
// ============================================================================

/// Prefix for per-pod firewall chains; the suffix is a truncated hash.
pub const POD_FW_CHAIN_PREFIX: &str = "KUBE-POD-FW-";

/// Prefix for per-policy chains; the suffix is a truncated hash.
pub const POLICY_CHAIN_PREFIX: &str = "KUBE-NWPLCY-";

/// Chain consulted when a pod has no ingress (or egress) policy of its own.
pub const DEFAULT_NETPOL_CHAIN: &str = "KUBE-DEFAULT-NETPOL";

/// Our hook chain for routed traffic, jumped to from the kernel's FORWARD.
pub const FORWARD_CHAIN: &str = "KUBE-FORWARD";

/// Our hook chain for host-originated traffic, jumped to from OUTPUT.
pub const OUTPUT_CHAIN: &str = "KUBE-OUTPUT";

/// Token baked into chain-name hashes. Bump to force a global rename (and
/// GC of the old generation) when the rule schema changes incompatibly.
pub const CHAIN_NAME_VERSION: &str = "1";

// ============================================================================
// Packet marks
// ============================================================================

/// Set by a policy chain when a packet matches an allow rule.
pub const MARK_POLICY_PERMITTED: &str = "0x10000/0x10000";

/// Cleared at the end of every pod chain so later chains start clean.
pub const MARK_POLICY_CLEAR: &str = "0/0x10000";

/// Set once a packet has fully passed policy; checked for final ACCEPT.
pub const MARK_ACCEPTED: &str = "0x20000/0x20000";

/// NFLOG group receiving copies of traffic about to be rejected.
pub const NFLOG_GROUP: &str = "100";
pub const NFLOG_RATE: &str = "10/minute";
pub const NFLOG_BURST: &str = "10";

// ============================================================================
// Interfaces
// ============================================================================

/// Dummy link holding every service VIP that should resolve locally.
pub const KUBE_DUMMY_IF: &str = "kube-dummy-if";

/// Tunnel device created inside endpoint pods for DSR return traffic.
pub const KUBE_TUNNEL_IF: &str = "kube-tunnel-if";

/// Pod bridge; DSR external-IP routes point at it.
pub const KUBE_BRIDGE: &str = "kube-bridge";

// ============================================================================
// Policy routing
// ============================================================================

pub const RT_TABLES_PATH: &str = "/etc/iproute2/rt_tables";

/// Table holding `local default dev lo` so fwmarked packets deliver locally.
pub const DSR_ROUTE_TABLE_ID: u32 = 78;
pub const DSR_ROUTE_TABLE_NAME: &str = "kube_router_dsr";

/// Table with one route per active DSR external IP (via kube-bridge).
pub const EXTERNAL_IP_ROUTE_TABLE_ID: u32 = 79;
pub const EXTERNAL_IP_ROUTE_TABLE_NAME: &str = "kube_router_external_ip";

/// Priority of the `from all lookup kube_router_external_ip` rule.
pub const EXTERNAL_IP_RULE_PRIORITY: u32 = 32765;

// ============================================================================
// Address masks and timing
// ============================================================================

pub const IPV4_NETMASK_BITS: u8 = 32;
pub const IPV6_NETMASK_BITS: u8 = 128;

/// One wait quantum for a freshly created tunnel link to become queryable.
pub const INTERFACE_WAIT_SLEEP: Duration = Duration::from_millis(100);

/// Number of wait quanta before giving up on the tunnel link.
pub const INTERFACE_WAIT_RETRIES: u32 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_prefixes_are_distinct() {
        assert_ne!(POD_FW_CHAIN_PREFIX, POLICY_CHAIN_PREFIX);
        assert!(!DEFAULT_NETPOL_CHAIN.starts_with(POD_FW_CHAIN_PREFIX));
        assert!(!FORWARD_CHAIN.starts_with(POLICY_CHAIN_PREFIX));
    }

    #[test]
    fn route_tables_do_not_collide_with_reserved_ids() {
        // 253/254/255 are default/main/local.
        for id in [DSR_ROUTE_TABLE_ID, EXTERNAL_IP_ROUTE_TABLE_ID] {
            assert!(id < 253);
            assert!(id > 0);
        }
    }
}
