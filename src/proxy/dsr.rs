//! DSR endpoint configuration.
//!
//! For endpoints of DSR-annotated services, the agent enters the endpoint
//! pod's network namespace, ensures an IP-in-IP tunnel device carrying the
//! VIP, and relaxes reverse-path filtering so the endpoint can answer with
//! the VIP as source. All in-namespace work runs through
//! [`crate::net::netns::run_in_namespace`], which pins a dedicated thread
//! and restores the host namespace on every exit path.

use futures::TryStreamExt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::net::error::{KernelError, KernelResult};
use crate::net::netns;
use crate::utils::command::CommandExecutor;
use crate::utils::constants::*;

/// Container-runtime lookup of a container's PID. Implemented outside the
/// core (CRI / docker clients); the configurator only consumes the pid.
pub trait ContainerPidLookup: Send + Sync {
    fn pid_for_container(&self, container_id: &str) -> KernelResult<i32>;
}

pub struct DsrConfigurator {
    /// Name of the pod's primary interface. Assumed `eth0` by default but
    /// runtime-dependent, hence configurable.
    container_iface: String,
    proc_root: PathBuf,
}

impl DsrConfigurator {
    pub fn new(container_iface: &str) -> Self {
        Self {
            container_iface: container_iface.to_string(),
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Find the host-side peer ifindex for a pod's primary interface.
    /// Consumed by the hairpin and advertisement machinery outside this
    /// crate.
    #[allow(dead_code)]
    pub fn find_iface_link_for_pid(&self, pid: i32) -> KernelResult<u32> {
        netns::find_iface_link_for_pid(&self.proc_root, pid, &self.container_iface)
    }

    /// Set up one (service, endpoint) pair: tunnel device up, VIP bound,
    /// rp_filter off. Idempotent; safe to re-run every sync.
    pub async fn configure_endpoint(
        &self,
        vip: IpAddr,
        endpoint_ip: IpAddr,
        container_id: &str,
        pid: i32,
    ) -> KernelResult<()> {
        let container_iface = self.container_iface.clone();
        let container_id = container_id.to_string();

        netns::run_in_namespace(pid, move || {
            configure_in_pod_namespace(vip, endpoint_ip, &container_iface)
        })
        .await
        .map_err(|e| match e {
            KernelError::Namespace(msg) => KernelError::Namespace(format!(
                "container {} (pid {}): {}",
                container_id, pid, msg
            )),
            other => other,
        })?;

        tracing::info!(%vip, endpoint = %endpoint_ip, "dsr endpoint configured");
        Ok(())
    }
}

/// Everything below runs on the pinned worker thread with the pod's
/// network namespace active.
fn configure_in_pod_namespace(
    vip: IpAddr,
    endpoint_ip: IpAddr,
    container_iface: &str,
) -> KernelResult<()> {
    ensure_tunnel_device(endpoint_ip)?;

    // A fresh netlink connection is required: it must be created inside
    // this namespace to see the pod's links.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(KernelError::Io)?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = wait_for_link(&handle, KUBE_TUNNEL_IF).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(KernelError::Netlink)?;

        let prefix = crate::net::IpFamily::of(&vip).full_prefix();
        let mut req = handle.address().add(index, vip, prefix);
        req.message_mut().header.scope = netlink_packet_route::constants::RT_SCOPE_LINK;
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(KernelError::Netlink(e)),
        }
    })?;

    // The return path uses the tunnel, so strict reverse-path filtering on
    // any of these would drop the traffic.
    let proc_root = Path::new("/proc");
    for iface in [KUBE_TUNNEL_IF, container_iface, "all"] {
        netns::disable_rp_filter(proc_root, iface)?;
    }
    Ok(())
}

/// Create the tunnel device if missing: `ipip` for v4 endpoints, `ip6tnl`
/// for v6, local address = endpoint IP. Spawned from the pinned thread, so
/// the child process inherits the pod's network namespace while still
/// executing the host's `ip` binary.
fn ensure_tunnel_device(endpoint_ip: IpAddr) -> KernelResult<()> {
    let kind = match endpoint_ip {
        IpAddr::V4(_) => "ipip",
        IpAddr::V6(_) => "ip6tnl",
    };
    let local = endpoint_ip.to_string();
    let result = CommandExecutor::execute(
        "ip",
        &[
            "link", "add", "name", KUBE_TUNNEL_IF, "type", kind, "local", &local,
        ],
    )
    .map_err(|e| KernelError::Command {
        program: "ip".to_string(),
        stderr: e,
    })?;

    if result.success || result.stderr.contains("File exists") {
        Ok(())
    } else {
        Err(KernelError::Command {
            program: "ip".to_string(),
            stderr: result.stderr,
        })
    }
}

/// Tunnel devices are not always queryable immediately after creation;
/// poll with a bounded backoff before giving up.
async fn wait_for_link(handle: &rtnetlink::Handle, name: &str) -> KernelResult<u32> {
    for attempt in 0..INTERFACE_WAIT_RETRIES {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(msg)) => return Ok(msg.header.index),
            Ok(None) => {}
            Err(e) => {
                let not_found = e.to_string().contains("No such device");
                if !not_found {
                    return Err(KernelError::Netlink(e));
                }
            }
        }
        if attempt + 1 < INTERFACE_WAIT_RETRIES {
            tracing::debug!(link = name, attempt, "waiting for tunnel link to appear");
            tokio::time::sleep(INTERFACE_WAIT_SLEEP).await;
        }
    }
    Err(KernelError::Timeout(format!(
        "link {} did not become queryable",
        name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configurator_reads_iflink_through_proc_root() {
        let tmp = tempfile::tempdir().unwrap();
        let net = tmp.path().join("31337/cwd/sys/class/net/eth0");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::write(net.join("iflink"), "23\n").unwrap();

        let mut cfg = DsrConfigurator::new("eth0");
        cfg.proc_root = tmp.path().to_path_buf();
        assert_eq!(cfg.find_iface_link_for_pid(31337).unwrap(), 23);
    }

    #[test]
    fn configurator_honors_custom_container_iface() {
        let tmp = tempfile::tempdir().unwrap();
        let net = tmp.path().join("31337/cwd/sys/class/net/net1");
        std::fs::create_dir_all(&net).unwrap();
        std::fs::write(net.join("iflink"), "9\n").unwrap();

        let mut cfg = DsrConfigurator::new("net1");
        cfg.proc_root = tmp.path().to_path_buf();
        assert_eq!(cfg.find_iface_link_for_pid(31337).unwrap(), 9);

        let mut wrong = DsrConfigurator::new("eth0");
        wrong.proc_root = tmp.path().to_path_buf();
        assert!(wrong.find_iface_link_for_pid(31337).is_err());
    }
}
