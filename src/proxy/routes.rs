//! Policy-routing scaffolding for DSR.
//!
//! Two custom tables: `kube_router_dsr` delivers fwmarked packets locally
//! (`local default dev lo`), and `kube_router_external_ip` carries one
//! route per active DSR external IP via the pod bridge so return traffic
//! from endpoints is not treated as martian.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::net::error::{KernelError, KernelResult};
use crate::snapshot::ServiceInfo;
use crate::utils::command::CommandExecutor;
use crate::utils::constants::*;

pub struct RouteTableManager {
    rt_tables_path: PathBuf,
    v4: bool,
    v6: bool,
}

impl RouteTableManager {
    pub fn new(v4: bool, v6: bool) -> Self {
        Self {
            rt_tables_path: PathBuf::from(RT_TABLES_PATH),
            v4,
            v6,
        }
    }

    #[cfg(test)]
    fn with_rt_tables_path(path: &std::path::Path, v4: bool, v6: bool) -> Self {
        Self {
            rt_tables_path: path.to_path_buf(),
            v4,
            v6,
        }
    }

    fn family_args(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.v4 {
            out.push("");
        }
        if self.v6 {
            out.push("-6");
        }
        out
    }

    /// Idempotently register a table id/name pair in rt_tables.
    pub fn ensure_route_table(&self, id: u32, name: &str) -> KernelResult<()> {
        let existing = match std::fs::read_to_string(&self.rt_tables_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(KernelError::Io(e)),
        };

        if rt_tables_has_entry(&existing, id, name) {
            return Ok(());
        }

        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!("{} {}\n", id, name));
        std::fs::write(&self.rt_tables_path, updated).map_err(KernelError::Io)
    }

    /// Ensure `local default dev lo` in the DSR table for each family.
    pub fn setup_dsr_policy_routing(&self) -> KernelResult<()> {
        self.ensure_route_table(DSR_ROUTE_TABLE_ID, DSR_ROUTE_TABLE_NAME)?;
        let table = DSR_ROUTE_TABLE_ID.to_string();

        for fam in self.family_args() {
            let list = self.run_ip(fam, &["route", "list", "table", &table])?;
            if list.stdout.contains(" lo ") || list.stdout.trim().ends_with("dev lo") {
                continue;
            }
            let add = self.run_ip(
                fam,
                &["route", "add", "local", "default", "dev", "lo", "table", &table],
            )?;
            if !add.success && !add.stderr.contains("File exists") {
                return Err(KernelError::Command {
                    program: "ip".to_string(),
                    stderr: add.stderr,
                });
            }
        }
        Ok(())
    }

    /// Reconcile the external-IP table: the lookup rule, one route per
    /// active DSR external IP, and removal of anything stale.
    pub fn sync_external_ip_routes(&self, services: &[ServiceInfo]) -> KernelResult<()> {
        self.ensure_route_table(EXTERNAL_IP_ROUTE_TABLE_ID, EXTERNAL_IP_ROUTE_TABLE_NAME)?;
        let table = EXTERNAL_IP_ROUTE_TABLE_ID.to_string();
        let prio = EXTERNAL_IP_RULE_PRIORITY.to_string();

        let active = active_dsr_external_ips(services);

        for fam in self.family_args() {
            let rules = self.run_ip(fam, &["rule", "list"])?;
            if !rules.stdout.contains(EXTERNAL_IP_ROUTE_TABLE_NAME)
                && !rules.stdout.contains(&format!("lookup {}", table))
            {
                let add = self.run_ip(
                    fam,
                    &["rule", "add", "prio", &prio, "from", "all", "lookup", &table],
                )?;
                if !add.success {
                    return Err(KernelError::Command {
                        program: "ip".to_string(),
                        stderr: add.stderr,
                    });
                }
            }

            let list = self.run_ip(fam, &["route", "list", "table", &table])?;
            let existing = parse_route_list(&list.stdout);

            for ip in &active {
                let ip_s = ip.to_string();
                if existing.iter().any(|route| route.first() == Some(&ip_s)) {
                    continue;
                }
                let add = self.run_ip(
                    fam,
                    &["route", "add", &ip_s, "dev", KUBE_BRIDGE, "table", &table],
                )?;
                if !add.success && !add.stderr.contains("File exists") {
                    tracing::error!(ip = %ip, error = %add.stderr.trim(), "failed to add external-ip route");
                }
            }

            for route in stale_routes(&existing, &active) {
                let mut args = vec!["route", "del", "table", &table];
                args.extend(route.iter().map(|s| s.as_str()));
                let del = self.run_ip(fam, &args)?;
                if !del.success && !del.stderr.contains("No such process") {
                    tracing::error!(route = ?route, error = %del.stderr.trim(), "failed to delete stale external-ip route");
                }
            }
        }
        Ok(())
    }

    /// Remove the lookup rules and flush both tables.
    pub fn cleanup(&self) -> KernelResult<()> {
        let ext_table = EXTERNAL_IP_ROUTE_TABLE_ID.to_string();
        let dsr_table = DSR_ROUTE_TABLE_ID.to_string();
        for fam in self.family_args() {
            let _ = self.run_ip(fam, &["rule", "del", "lookup", &ext_table]);
            let _ = self.run_ip(fam, &["route", "flush", "table", &ext_table]);
            let _ = self.run_ip(fam, &["route", "flush", "table", &dsr_table]);
        }
        Ok(())
    }

    fn run_ip(
        &self,
        family_arg: &str,
        args: &[&str],
    ) -> KernelResult<crate::utils::command::CommandResult> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
        if !family_arg.is_empty() {
            full.push(family_arg);
        }
        full.extend_from_slice(args);
        CommandExecutor::execute("ip", &full).map_err(|e| KernelError::Command {
            program: "ip".to_string(),
            stderr: e,
        })
    }
}

/// External IPs of services carrying the DSR annotation.
pub fn active_dsr_external_ips(services: &[ServiceInfo]) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for svc in services {
        if !svc.direct_server_return {
            continue;
        }
        for ip in &svc.external_ips {
            if !out.contains(ip) {
                out.push(*ip);
            }
        }
    }
    out
}

/// Tokenize `ip route list` output, one route per line.
pub fn parse_route_list(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.split_whitespace().map(str::to_string).collect())
        .collect()
}

/// Routes in the table whose destination is no longer active.
pub fn stale_routes<'a>(
    existing: &'a [Vec<String>],
    active: &[IpAddr],
) -> Vec<&'a Vec<String>> {
    let active: Vec<String> = active.iter().map(|ip| ip.to_string()).collect();
    existing
        .iter()
        .filter(|route| {
            route
                .first()
                .map_or(false, |dest| !active.contains(dest))
        })
        .collect()
}

fn rt_tables_has_entry(content: &str, id: u32, name: &str) -> bool {
    content.lines().any(|line| {
        let mut parts = line.split_whitespace();
        matches!(
            (parts.next(), parts.next()),
            (Some(first), Some(second)) if first == id.to_string() && second == name
        )
    })
}
