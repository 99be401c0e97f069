use std::collections::{BTreeSet, HashSet};

use crate::net::error::{KernelError, KernelResult};
use crate::net::IpFamily;
use crate::utils::command::CommandExecutor;

/// One sync's worth of filter-table state for a single IP family.
///
/// Rules are kept as an ordered list with set semantics: appending a line
/// that was already appended this sync is a no-op, preserving the position
/// of the first emission. Declared chains are rebuilt from scratch by the
/// restore (`:CHAIN - [0:0]` resets the chain), while chains we do not
/// declare are left untouched thanks to `--noflush`.
#[derive(Debug, Default)]
pub struct FilterBatch {
    chains: BTreeSet<String>,
    rules: Vec<String>,
    seen: HashSet<String>,
}

impl FilterBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a chain to be (re)built by this batch.
    pub fn declare_chain(&mut self, name: &str) {
        self.chains.insert(name.to_string());
    }

    #[allow(dead_code)]
    pub fn has_chain(&self, name: &str) -> bool {
        self.chains.contains(name)
    }

    /// Append `-A <chain> <args…>`. Idempotent within the batch.
    pub fn append_rule(&mut self, chain: &str, args: &[&str]) {
        let mut line = String::with_capacity(64);
        line.push_str("-A ");
        line.push_str(chain);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        if self.seen.insert(line.clone()) {
            self.rules.push(line);
        }
    }

    pub fn chains(&self) -> impl Iterator<Item = &str> {
        self.chains.iter().map(|s| s.as_str())
    }

    #[allow(dead_code)]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.rules.is_empty()
    }

    /// Render the complete iptables-restore program.
    pub fn render(&self) -> String {
        let mut out = String::from("*filter\n");
        for chain in &self.chains {
            out.push_str(":");
            out.push_str(chain);
            out.push_str(" - [0:0]\n");
        }
        for rule in &self.rules {
            out.push_str(rule);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        out
    }
}

/// Applies rendered batches and inspects live chains for one IP family.
#[derive(Debug, Clone, Copy)]
pub struct IptablesBackend {
    family: IpFamily,
}

impl IptablesBackend {
    pub fn new(family: IpFamily) -> Self {
        Self { family }
    }

    #[allow(dead_code)]
    pub fn family(&self) -> IpFamily {
        self.family
    }

    fn restore_bin(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables-restore",
            IpFamily::V6 => "ip6tables-restore",
        }
    }

    fn save_bin(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables-save",
            IpFamily::V6 => "ip6tables-save",
        }
    }

    fn iptables_bin(&self) -> &'static str {
        match self.family {
            IpFamily::V4 => "iptables",
            IpFamily::V6 => "ip6tables",
        }
    }

    /// Apply a batch transactionally. A non-zero exit commits nothing for
    /// this family; the caller retries on the next convergence tick.
    pub fn restore(&self, batch: &FilterBatch) -> KernelResult<()> {
        let program = batch.render();
        let result = CommandExecutor::execute_with_stdin(
            self.restore_bin(),
            &["--noflush", "-w"],
            &program,
        )
        .map_err(|e| KernelError::Command {
            program: self.restore_bin().to_string(),
            stderr: e,
        })?;

        if !result.success {
            return Err(KernelError::Command {
                program: self.restore_bin().to_string(),
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    /// List filter-table chain names starting with `prefix`.
    pub fn list_chains(&self, prefix: &str) -> KernelResult<Vec<String>> {
        let result = CommandExecutor::execute(self.save_bin(), &["-t", "filter"]).map_err(|e| {
            KernelError::Command {
                program: self.save_bin().to_string(),
                stderr: e,
            }
        })?;
        if !result.success {
            return Err(KernelError::Command {
                program: self.save_bin().to_string(),
                stderr: result.stderr,
            });
        }
        Ok(parse_chain_names(&result.stdout, prefix))
    }

    fn chain_op(&self, flag: &str, chain: &str) -> KernelResult<()> {
        let result =
            CommandExecutor::execute(self.iptables_bin(), &["-w", "-t", "filter", flag, chain])
                .map_err(|e| KernelError::Command {
                    program: self.iptables_bin().to_string(),
                    stderr: e,
                })?;
        if !result.success {
            return Err(KernelError::Command {
                program: self.iptables_bin().to_string(),
                stderr: result.stderr,
            });
        }
        Ok(())
    }

    /// Empty a chain without deleting it.
    pub fn flush_chain(&self, chain: &str) -> KernelResult<()> {
        self.chain_op("-F", chain)
    }

    /// Flush and delete a chain. The caller must have removed all
    /// references to it first (rebuilding the hook chains does that).
    pub fn delete_chain(&self, chain: &str) -> KernelResult<()> {
        self.chain_op("-F", chain)?;
        self.chain_op("-X", chain)
    }

    /// Ensure `-j <target>` exists at the top of a kernel base chain
    /// (FORWARD, OUTPUT). Done once at startup, not per sync.
    pub fn ensure_base_jump(&self, base: &str, target: &str) -> KernelResult<()> {
        let check = CommandExecutor::execute(
            self.iptables_bin(),
            &["-w", "-t", "filter", "-C", base, "-j", target],
        )
        .map_err(|e| KernelError::Command {
            program: self.iptables_bin().to_string(),
            stderr: e,
        })?;
        if check.success {
            return Ok(());
        }

        let insert = CommandExecutor::execute(
            self.iptables_bin(),
            &["-w", "-t", "filter", "-I", base, "1", "-j", target],
        )
        .map_err(|e| KernelError::Command {
            program: self.iptables_bin().to_string(),
            stderr: e,
        })?;
        if !insert.success {
            return Err(KernelError::Command {
                program: self.iptables_bin().to_string(),
                stderr: insert.stderr,
            });
        }
        Ok(())
    }

    /// Remove the base-chain jump if present. Used by cleanup.
    pub fn remove_base_jump(&self, base: &str, target: &str) -> KernelResult<()> {
        let result = CommandExecutor::execute(
            self.iptables_bin(),
            &["-w", "-t", "filter", "-D", base, "-j", target],
        )
        .map_err(|e| KernelError::Command {
            program: self.iptables_bin().to_string(),
            stderr: e,
        })?;
        // -D on a missing rule exits non-zero; that's the desired end state.
        let _ = result;
        Ok(())
    }
}

/// Extract chain names from `iptables-save -t filter` output.
pub fn parse_chain_names(save_output: &str, prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in save_output.lines() {
        if let Some(rest) = line.strip_prefix(':') {
            if let Some(name) = rest.split_whitespace().next() {
                if name.starts_with(prefix) {
                    names.push(name.to_string());
                }
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_idempotent_and_order_preserving() {
        let mut batch = FilterBatch::new();
        batch.declare_chain("KUBE-TEST");
        batch.append_rule("KUBE-TEST", &["-d", "10.0.0.1", "-j", "ACCEPT"]);
        batch.append_rule("KUBE-TEST", &["-d", "10.0.0.2", "-j", "ACCEPT"]);
        batch.append_rule("KUBE-TEST", &["-d", "10.0.0.1", "-j", "ACCEPT"]);
        assert_eq!(batch.rule_count(), 2);

        let rendered = batch.render();
        let first = rendered.find("10.0.0.1").unwrap();
        let second = rendered.find("10.0.0.2").unwrap();
        assert!(first < second);
        assert_eq!(rendered.matches("10.0.0.1").count(), 1);
    }

    #[test]
    fn render_shape() {
        let mut batch = FilterBatch::new();
        batch.declare_chain("KUBE-B");
        batch.declare_chain("KUBE-A");
        batch.append_rule("KUBE-A", &["-j", "KUBE-B"]);
        let text = batch.render();
        assert!(text.starts_with("*filter\n"));
        assert!(text.ends_with("COMMIT\n"));
        // Chain declarations are sorted and precede the rules.
        let a = text.find(":KUBE-A - [0:0]").unwrap();
        let b = text.find(":KUBE-B - [0:0]").unwrap();
        let rule = text.find("-A KUBE-A -j KUBE-B").unwrap();
        assert!(a < b && b < rule);
    }

    #[test]
    fn parse_chain_names_filters_by_prefix() {
        let save = "\
# Generated by iptables-save
*filter
:INPUT ACCEPT [0:0]
:KUBE-POD-FW-ABCDEF1234567890 - [0:0]
:KUBE-NWPLCY-XYZ - [0:0]
:DOCKER-USER - [0:0]
-A INPUT -j ACCEPT
COMMIT
";
        let pods = parse_chain_names(save, "KUBE-POD-FW-");
        assert_eq!(pods, vec!["KUBE-POD-FW-ABCDEF1234567890".to_string()]);
        let all_kube = parse_chain_names(save, "KUBE-");
        assert_eq!(all_kube.len(), 2);
    }
}
