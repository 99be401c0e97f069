use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

use crate::net::IpFamily;

/// Per-node dataplane agent: NetworkPolicy firewall, IPVS service proxy
/// and DSR plumbing.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Config {
    /// Enables IPv4 support
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_ipv4: bool,

    /// Enables IPv6 support
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub enable_ipv6: bool,

    /// IP addresses of this node, one per enabled family
    #[clap(long = "node-ip", required = true)]
    pub node_ips: Vec<IpAddr>,

    /// CIDR values from which service cluster IPs are assigned (at most 2)
    #[clap(long = "service-cluster-ip-range", default_value = "10.96.0.0/12")]
    pub cluster_ip_cidrs: Vec<String>,

    /// External IP CIDRs used for inter-cluster communication
    #[clap(long = "service-external-ip-range")]
    pub external_ip_cidrs: Vec<String>,

    /// CIDRs from which loadbalancer service addresses are assigned
    #[clap(long = "loadbalancer-ip-range")]
    pub loadbalancer_cidrs: Vec<String>,

    /// NodePort range, specified with either a hyphen or a colon
    #[clap(long = "service-node-port-range", default_value = "30000-32767")]
    pub node_port_range: String,

    /// The delay between iptables rule synchronizations
    #[clap(long, value_parser = parse_duration, default_value = "5m")]
    pub iptables_sync_period: Duration,

    /// The delay between ipvs config synchronizations
    #[clap(long, value_parser = parse_duration, default_value = "5m")]
    pub ipvs_sync_period: Duration,

    /// The delay between route synchronizations
    #[clap(long, value_parser = parse_duration, default_value = "5m")]
    pub routes_sync_period: Duration,

    /// The delay between checking for missed loadbalancer services
    #[clap(long, value_parser = parse_duration, default_value = "1m")]
    pub loadbalancer_sync_period: Duration,

    /// The graceful period before removing destinations from IPVS services
    #[clap(long, value_parser = parse_duration, default_value = "30s")]
    pub ipvs_graceful_period: Duration,

    /// Enables the IPVS graceful termination capability
    #[clap(long, default_value_t = false)]
    pub ipvs_graceful_termination: bool,

    /// For NodePort services, create IPVS services listening on all of the
    /// node's addresses instead of only the primary one
    #[clap(long = "nodeport-bindon-all-ip", default_value_t = false)]
    pub nodeport_bindon_all_ip: bool,

    /// SNAT all traffic to cluster IP / node port
    #[clap(long, default_value_t = false)]
    pub masquerade_all: bool,

    /// Add iptables rules for every service endpoint to support hairpin traffic
    #[clap(long = "hairpin-mode", default_value_t = false)]
    pub hairpin_mode: bool,

    /// Cleanup iptables rules, ipvs and interface configuration and exit
    #[clap(long, default_value_t = false)]
    pub cleanup_config: bool,

    /// Path to a CRI-compatible container runtime socket (used for DSR)
    #[clap(long, default_value = "")]
    pub runtime_endpoint: String,

    /// TCP timeout for IPVS services (0s preserves the system default)
    #[clap(long, value_parser = parse_duration, default_value = "0s")]
    pub service_tcp_timeout: Duration,

    /// TCP FIN timeout for IPVS services (0s preserves the system default)
    #[clap(long, value_parser = parse_duration, default_value = "0s")]
    pub service_tcpfin_timeout: Duration,

    /// UDP timeout for IPVS services (0s preserves the system default)
    #[clap(long, value_parser = parse_duration, default_value = "0s")]
    pub service_udp_timeout: Duration,

    /// Name of the primary interface inside pods. Runtime-dependent;
    /// override when the runtime does not produce eth0.
    #[clap(long = "container-iface-name", default_value = "eth0")]
    pub container_iface_name: String,

    /// Health check port, 0 = disabled
    #[clap(long, default_value_t = 20244)]
    pub health_port: u16,
}

/// Accept bare seconds ("30") or a value with an s/m/h suffix ("30s",
/// "5m", "1h").
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    let (number, unit): (&str, u64) = match value.chars().last() {
        Some('s') => (&value[..value.len() - 1], 1),
        Some('m') => (&value[..value.len() - 1], 60),
        Some('h') => (&value[..value.len() - 1], 3600),
        Some(c) if c.is_ascii_digit() => (value, 1),
        Some(c) => return Err(format!("unknown duration unit '{}'", c)),
        None => unreachable!(),
    };
    let seconds: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    Ok(Duration::from_secs(seconds * unit))
}

/// NodePort range in either "30000-32767" or "30000:32767" form.
pub fn parse_node_port_range(value: &str) -> Result<(u16, u16), String> {
    let sep = if value.contains('-') {
        '-'
    } else if value.contains(':') {
        ':'
    } else {
        return Err(format!("node port range '{}' has no separator", value));
    };
    let mut parts = value.splitn(2, sep);
    let low: u16 = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| format!("invalid node port range '{}'", value))?;
    let high: u16 = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse()
        .map_err(|_| format!("invalid node port range '{}'", value))?;
    if low >= high {
        return Err(format!("node port range '{}' is not ascending", value));
    }
    Ok((low, high))
}

impl Config {
    /// Families enabled by flags, in fixed order.
    pub fn families(&self) -> Vec<IpFamily> {
        let mut out = Vec::new();
        if self.enable_ipv4 {
            out.push(IpFamily::V4);
        }
        if self.enable_ipv6 {
            out.push(IpFamily::V6);
        }
        out
    }

    /// Reject configurations the reconcilers cannot run with. Called once
    /// at startup; any error refuses to start the agent.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enable_ipv4 && !self.enable_ipv6 {
            return Err("at least one of --enable-ipv4 / --enable-ipv6 must be set".to_string());
        }
        if self.cluster_ip_cidrs.is_empty() {
            return Err("--service-cluster-ip-range must not be empty".to_string());
        }
        if self.cluster_ip_cidrs.len() > 2 {
            return Err(format!(
                "--service-cluster-ip-range accepts at most 2 CIDRs, got {}",
                self.cluster_ip_cidrs.len()
            ));
        }
        for cidr in self
            .cluster_ip_cidrs
            .iter()
            .chain(&self.external_ip_cidrs)
            .chain(&self.loadbalancer_cidrs)
        {
            validate_cidr(cidr)?;
        }
        parse_node_port_range(&self.node_port_range)?;

        for family in self.families() {
            if !self
                .node_ips
                .iter()
                .any(|ip| IpFamily::of(ip) == family)
            {
                return Err(format!(
                    "--node-ip missing an address for enabled family {}",
                    family
                ));
            }
        }

        for (name, period) in [
            ("--iptables-sync-period", self.iptables_sync_period),
            ("--ipvs-sync-period", self.ipvs_sync_period),
            ("--routes-sync-period", self.routes_sync_period),
            ("--loadbalancer-sync-period", self.loadbalancer_sync_period),
            ("--ipvs-graceful-period", self.ipvs_graceful_period),
        ] {
            if period.is_zero() {
                return Err(format!("{} must be greater than 0", name));
            }
        }

        if self.container_iface_name.is_empty() {
            return Err("--container-iface-name must not be empty".to_string());
        }
        Ok(())
    }
}

fn validate_cidr(cidr: &str) -> Result<(), String> {
    let mut parts = cidr.splitn(2, '/');
    let addr = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("invalid CIDR '{}'", cidr))?;
    let prefix = parts
        .next()
        .ok_or_else(|| format!("CIDR '{}' is missing a prefix length", cidr))?;

    let ip: IpAddr = addr
        .parse()
        .map_err(|_| format!("invalid address in CIDR '{}'", cidr))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("invalid prefix length in CIDR '{}'", cidr))?;
    if prefix > IpFamily::of(&ip).full_prefix() {
        return Err(format!("prefix length out of range in CIDR '{}'", cidr));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["seam", "--node-ip", "192.168.1.10"])
    }

    #[test]
    fn defaults_are_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn duration_parsing_accepts_suffixes_and_bare_seconds() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn node_port_range_accepts_both_separators() {
        assert_eq!(parse_node_port_range("30000-32767").unwrap(), (30000, 32767));
        assert_eq!(parse_node_port_range("30000:32767").unwrap(), (30000, 32767));
        assert!(parse_node_port_range("32767-30000").is_err());
        assert!(parse_node_port_range("30000").is_err());
    }

    #[test]
    fn rejects_both_families_disabled() {
        let mut cfg = base_config();
        cfg.enable_ipv4 = false;
        assert!(cfg.validate().unwrap_err().contains("enable-ipv4"));
    }

    #[test]
    fn rejects_more_than_two_cluster_cidrs() {
        let mut cfg = base_config();
        cfg.cluster_ip_cidrs = vec![
            "10.96.0.0/12".into(),
            "fd00:1::/112".into(),
            "10.200.0.0/16".into(),
        ];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_cidr() {
        let mut cfg = base_config();
        cfg.external_ip_cidrs = vec!["not-a-cidr".into()];
        assert!(cfg.validate().is_err());
        cfg.external_ip_cidrs = vec!["10.0.0.0/40".into()];
        assert!(cfg.validate().is_err());
        cfg.external_ip_cidrs = vec!["10.0.0.0".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_missing_node_ip_for_enabled_family() {
        let mut cfg = base_config();
        cfg.enable_ipv6 = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("ipv6"));

        cfg.node_ips.push("fd00::10".parse().unwrap());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_sync_period() {
        let mut cfg = base_config();
        cfg.ipvs_sync_period = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn families_follow_flags() {
        let mut cfg = base_config();
        assert_eq!(cfg.families(), vec![IpFamily::V4]);
        cfg.enable_ipv6 = true;
        assert_eq!(cfg.families(), vec![IpFamily::V4, IpFamily::V6]);
    }
}
