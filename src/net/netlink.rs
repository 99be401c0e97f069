use futures::TryStreamExt;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::constants::RT_SCOPE_LINK;
use netlink_packet_route::route::nlas::Nla as RouteNla;
use std::net::IpAddr;

use crate::net::error::{KernelError, KernelResult};
use crate::net::IpFamily;
use crate::utils::command::CommandExecutor;
use crate::utils::constants::KUBE_DUMMY_IF;

/// Persistent netlink handle wrapping rtnetlink for link, address and route
/// operations. One handle per process, shared by the reconcilers.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

/// Extract the errno carried by a netlink error reply, if any.
fn netlink_errno(e: &rtnetlink::Error) -> Option<i32> {
    match e {
        rtnetlink::Error::NetlinkError(msg) => Some(-msg.code),
        _ => None,
    }
}

impl NetlinkHandle {
    pub fn new() -> KernelResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Link operations ───────────────────────────────────────────────

    /// Get a link's ifindex by name.
    pub async fn get_link_index(&self, name: &str) -> KernelResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(KernelError::LinkNotFound(name.to_string())),
            Err(e) => {
                if netlink_errno(&e) == Some(nix::libc::ENODEV) {
                    Err(KernelError::LinkNotFound(name.to_string()))
                } else {
                    Err(KernelError::Netlink(e))
                }
            }
        }
    }

    pub async fn set_link_up(&self, index: u32) -> KernelResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(KernelError::Netlink)
    }

    /// Delete a link by name. Idempotent.
    pub async fn delete_link(&self, name: &str) -> KernelResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(KernelError::LinkNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if netlink_errno(&e) == Some(nix::libc::ENODEV) => Ok(()),
            Err(e) => Err(KernelError::Netlink(e)),
        }
    }

    /// Ensure the dummy VIP interface exists and is up; returns its ifindex.
    pub async fn ensure_dummy_interface(&self) -> KernelResult<u32> {
        match self.get_link_index(KUBE_DUMMY_IF).await {
            Ok(idx) => return Ok(idx),
            Err(KernelError::LinkNotFound(_)) => {
                tracing::info!("creating dummy interface {}", KUBE_DUMMY_IF);
            }
            Err(e) => return Err(e),
        }

        match self
            .handle
            .link()
            .add()
            .dummy(KUBE_DUMMY_IF.to_string())
            .execute()
            .await
        {
            Ok(()) => {}
            // Lost a race with another invocation; the link is there.
            Err(e) if netlink_errno(&e) == Some(nix::libc::EEXIST) => {}
            Err(e) => return Err(KernelError::Netlink(e)),
        }

        let idx = self.get_link_index(KUBE_DUMMY_IF).await?;
        self.set_link_up(idx).await?;
        Ok(idx)
    }

    // ── Address operations ────────────────────────────────────────────

    /// Bind a host address (/32 or /128, scope link) to a link.
    /// Returns `AddrExists` when the kernel already has it.
    pub async fn addr_add(&self, link_index: u32, ip: IpAddr) -> KernelResult<()> {
        let prefix = IpFamily::of(&ip).full_prefix();
        let mut req = self.handle.address().add(link_index, ip, prefix);
        req.message_mut().header.scope = RT_SCOPE_LINK;
        match req.execute().await {
            Ok(()) => Ok(()),
            Err(e) if netlink_errno(&e) == Some(nix::libc::EEXIST) => Err(KernelError::AddrExists),
            Err(e) => Err(KernelError::Netlink(e)),
        }
    }

    /// Remove an address from a link. Returns `AddrNotFound` when the
    /// kernel never had it.
    pub async fn addr_del(&self, link_index: u32, ip: IpAddr) -> KernelResult<()> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        while let Some(msg) = addrs.try_next().await.map_err(KernelError::Netlink)? {
            if address_message_ip(&msg.nlas) == Some(ip) {
                return match self.handle.address().del(msg).execute().await {
                    Ok(()) => Ok(()),
                    Err(e) if netlink_errno(&e) == Some(nix::libc::EADDRNOTAVAIL) => {
                        Err(KernelError::AddrNotFound)
                    }
                    Err(e) => Err(KernelError::Netlink(e)),
                };
            }
        }
        Err(KernelError::AddrNotFound)
    }

    /// List addresses of one family currently bound to a link.
    pub async fn list_addresses(
        &self,
        link_index: u32,
        family: IpFamily,
    ) -> KernelResult<Vec<IpAddr>> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(link_index)
            .execute();

        let mut out = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(KernelError::Netlink)? {
            if u16::from(msg.header.family) != family.af() {
                continue;
            }
            if let Some(ip) = address_message_ip(&msg.nlas) {
                out.push(ip);
            }
        }
        Ok(out)
    }

    // ── VIP routes ────────────────────────────────────────────────────
    // The `local` table route keeps Linux from picking the VIP itself as
    // the source address for host-originated traffic. `ip route replace`
    // is used because the netlink RouteReplace path has proven unreliable
    // for local-table entries.

    /// Replace the local-table route for a VIP bound to the dummy interface.
    pub fn ip_route_replace_local(&self, vip: IpAddr, node_ip: IpAddr) -> KernelResult<()> {
        if IpFamily::of(&vip) != IpFamily::of(&node_ip) {
            return Err(KernelError::FamilyMismatch {
                ip: vip,
                node_ip,
            });
        }
        let vip_s = vip.to_string();
        let node_s = node_ip.to_string();
        let mut args: Vec<&str> = Vec::new();
        if vip.is_ipv6() {
            args.push("-6");
        }
        args.extend([
            "route", "replace", "local", &vip_s, "dev", KUBE_DUMMY_IF, "table", "local", "proto",
            "kernel", "scope", "host", "src", &node_s,
        ]);
        run_ip(&args)
    }

    /// Delete the local-table route for a VIP. `RouteNotFound` is benign.
    pub fn ip_route_delete_local(&self, vip: IpAddr, node_ip: IpAddr) -> KernelResult<()> {
        if IpFamily::of(&vip) != IpFamily::of(&node_ip) {
            return Err(KernelError::FamilyMismatch {
                ip: vip,
                node_ip,
            });
        }
        let vip_s = vip.to_string();
        let node_s = node_ip.to_string();
        let mut args: Vec<&str> = Vec::new();
        if vip.is_ipv6() {
            args.push("-6");
        }
        args.extend([
            "route", "delete", "local", &vip_s, "dev", KUBE_DUMMY_IF, "table", "local", "proto",
            "kernel", "scope", "host", "src", &node_s,
        ]);
        run_ip(&args)
    }

    /// IPv6 address adds spawn misc kernel routes that defeat the explicit
    /// src selection above. Remove any route for the VIP whose source is
    /// not the node IP.
    pub async fn prune_stray_v6_routes(&self, vip: IpAddr, node_ip: IpAddr) -> KernelResult<()> {
        let IpAddr::V6(vip6) = vip else {
            return Ok(());
        };
        let mut routes = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V6)
            .execute();

        while let Some(route) = routes.try_next().await.map_err(KernelError::Netlink)? {
            if route.header.destination_prefix_length != 128 {
                continue;
            }
            let mut dest = None;
            let mut src = None;
            for nla in &route.nlas {
                match nla {
                    RouteNla::Destination(bytes) => dest = bytes_to_ip(bytes),
                    RouteNla::PrefSource(bytes) => src = bytes_to_ip(bytes),
                    _ => {}
                }
            }
            if dest != Some(IpAddr::V6(vip6)) {
                continue;
            }
            if src.map_or(true, |s| s != node_ip) {
                tracing::debug!(vip = %vip, "pruning stray v6 route without node src");
                match self.handle.route().del(route).execute().await {
                    Ok(()) => {}
                    Err(e) if netlink_errno(&e) == Some(nix::libc::ESRCH) => {}
                    Err(e) => return Err(KernelError::Netlink(e)),
                }
            }
        }
        Ok(())
    }
}

fn run_ip(args: &[&str]) -> KernelResult<()> {
    let result = CommandExecutor::execute("ip", args).map_err(|e| KernelError::Command {
        program: "ip".to_string(),
        stderr: e,
    })?;
    if result.success {
        return Ok(());
    }
    if result.stderr.contains("No such process") {
        return Err(KernelError::RouteNotFound);
    }
    Err(KernelError::Command {
        program: "ip".to_string(),
        stderr: result.stderr,
    })
}

fn address_message_ip(nlas: &[AddressNla]) -> Option<IpAddr> {
    for nla in nlas {
        if let AddressNla::Address(bytes) = nla {
            return bytes_to_ip(bytes);
        }
    }
    None
}

fn bytes_to_ip(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let arr: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(arr))
        }
        16 => {
            let arr: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(arr))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_ip_parses_both_families() {
        assert_eq!(
            bytes_to_ip(&[10, 96, 1, 1]),
            Some("10.96.1.1".parse().unwrap())
        );
        let mut v6 = [0u8; 16];
        v6[0] = 0xfd;
        v6[15] = 1;
        assert_eq!(bytes_to_ip(&v6), Some("fd00::1".parse().unwrap()));
        assert_eq!(bytes_to_ip(&[1, 2, 3]), None);
    }

    #[tokio::test]
    async fn local_route_rejects_family_mismatch() {
        // The family gate fires before any command runs, so this is safe
        // without a kernel.
        let handle = match NetlinkHandle::new() {
            Ok(h) => h,
            Err(_) => return, // no netlink in the sandbox
        };
        let err = handle
            .ip_route_replace_local("fd00::1".parse().unwrap(), "10.0.0.1".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, KernelError::FamilyMismatch { .. }));
    }
}
