use std::fmt;
use std::net::IpAddr;

/// Error type for all kernel-facing operations.
///
/// The benign variants (`AddrExists`, `AddrNotFound`, `LinkNotFound`,
/// `IpvsServerExists`, `RouteNotFound`) are produced by the adapters
/// themselves, which are the only place allowed to sniff errno values or
/// `ip` output. Reconcilers match on the variants and never on strings.
#[derive(Debug)]
pub enum KernelError {
    /// rtnetlink transport or request failure
    Netlink(rtnetlink::Error),
    /// generic-netlink (IPVS) transport or request failure
    Genetlink(String),
    /// System I/O error
    Io(std::io::Error),
    /// External program exited non-zero
    Command { program: String, stderr: String },
    /// Address already bound to the interface; reconcile no-op
    AddrExists,
    /// Address was already absent; reconcile no-op
    AddrNotFound,
    /// Link does not exist; callers usually create it
    LinkNotFound(String),
    /// IPVS destination already present; callers fall back to update
    IpvsServerExists,
    /// IPVS service or destination already absent; benign on delete
    IpvsEntryNotFound,
    /// Route was already absent ("No such process")
    RouteNotFound,
    /// VIP and node IP belong to different address families
    FamilyMismatch { ip: IpAddr, node_ip: IpAddr },
    /// Namespace transition failed
    Namespace(String),
    /// Operation timed out
    Timeout(String),
    /// Kernel or tool output could not be parsed
    Parse(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Netlink(e) => write!(f, "netlink error: {}", e),
            KernelError::Genetlink(msg) => write!(f, "genetlink error: {}", msg),
            KernelError::Io(e) => write!(f, "io error: {}", e),
            KernelError::Command { program, stderr } => {
                write!(f, "command '{}' failed: {}", program, stderr.trim())
            }
            KernelError::AddrExists => write!(f, "address already assigned"),
            KernelError::AddrNotFound => write!(f, "address not assigned"),
            KernelError::LinkNotFound(name) => write!(f, "link not found: {}", name),
            KernelError::IpvsServerExists => write!(f, "ipvs destination already exists"),
            KernelError::IpvsEntryNotFound => write!(f, "ipvs service or destination not found"),
            KernelError::RouteNotFound => write!(f, "route not found"),
            KernelError::FamilyMismatch { ip, node_ip } => write!(
                f,
                "ip {} does not match address family of node ip {}",
                ip, node_ip
            ),
            KernelError::Namespace(msg) => write!(f, "namespace error: {}", msg),
            KernelError::Timeout(msg) => write!(f, "timeout: {}", msg),
            KernelError::Parse(msg) => write!(f, "parse error: {}", msg),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<rtnetlink::Error> for KernelError {
    fn from(e: rtnetlink::Error) -> Self {
        KernelError::Netlink(e)
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::Io(e)
    }
}

impl KernelError {
    /// Benign errors are expected idempotence signals: the kernel is
    /// already in (or already left) the desired state.
    #[allow(dead_code)]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            KernelError::AddrExists
                | KernelError::AddrNotFound
                | KernelError::RouteNotFound
                | KernelError::IpvsServerExists
                | KernelError::IpvsEntryNotFound
        )
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_classification() {
        assert!(KernelError::AddrExists.is_benign());
        assert!(KernelError::AddrNotFound.is_benign());
        assert!(KernelError::RouteNotFound.is_benign());
        assert!(KernelError::IpvsServerExists.is_benign());
        assert!(!KernelError::Namespace("x".into()).is_benign());
        assert!(!KernelError::LinkNotFound("eth9".into()).is_benign());
    }

    #[test]
    fn family_mismatch_display_names_both_addresses() {
        let err = KernelError::FamilyMismatch {
            ip: "2001:db8::1".parse().unwrap(),
            node_ip: "10.0.0.1".parse().unwrap(),
        };
        let text = err.to_string();
        assert!(text.contains("2001:db8::1"));
        assert!(text.contains("10.0.0.1"));
    }
}
