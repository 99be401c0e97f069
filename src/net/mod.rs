// Kernel adapter module - typed wrappers over netlink, IPVS generic netlink,
// the iptables-restore batch interface, network namespaces, and the few `ip`
// invocations whose netlink equivalents are unreliable.

pub mod error;
pub mod iptables;
pub mod ipvs;
pub mod netlink;
pub mod netns;

pub use error::{KernelError, KernelResult};

use std::net::IpAddr;

/// IP family, the unit of isolation for all reconcilers: every batch,
/// virtual-service set and address set is kept and committed per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// AF_INET / AF_INET6 as the kernel sees them.
    pub fn af(self) -> u16 {
        match self {
            IpFamily::V4 => libc_af_inet(),
            IpFamily::V6 => libc_af_inet6(),
        }
    }

    /// Host-address prefix length for this family (/32 or /128).
    pub fn full_prefix(self) -> u8 {
        match self {
            IpFamily::V4 => crate::utils::constants::IPV4_NETMASK_BITS,
            IpFamily::V6 => crate::utils::constants::IPV6_NETMASK_BITS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpFamily::V4 => "ipv4",
            IpFamily::V6 => "ipv6",
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn libc_af_inet() -> u16 {
    nix::libc::AF_INET as u16
}

const fn libc_af_inet6() -> u16 {
    nix::libc::AF_INET6 as u16
}

/// An IPv6 address in fe80::/10 never belongs on the dummy interface and is
/// skipped by the VIP reconciler.
pub fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_of_addresses() {
        assert_eq!(IpFamily::of(&"10.1.2.3".parse().unwrap()), IpFamily::V4);
        assert_eq!(IpFamily::of(&"fd00::1".parse().unwrap()), IpFamily::V6);
    }

    #[test]
    fn full_prefix_lengths() {
        assert_eq!(IpFamily::V4.full_prefix(), 32);
        assert_eq!(IpFamily::V6.full_prefix(), 128);
    }

    #[test]
    fn link_local_detection() {
        assert!(is_link_local(&"fe80::2".parse().unwrap()));
        assert!(!is_link_local(&"fd00::2".parse().unwrap()));
        assert!(!is_link_local(&"169.254.0.1".parse().unwrap()));
    }
}
