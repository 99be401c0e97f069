//! Network-namespace plumbing for the DSR configurator.
//!
//! Entering a namespace mutates per-thread kernel state, so every
//! in-namespace operation runs on a dedicated OS thread that is spawned for
//! that one operation and exits afterwards. A thread that fails to restore
//! the host namespace is never returned to any pool; the work item is
//! retried by a fresh thread on the next sync.

use nix::sched::{setns, CloneFlags};
use nix::sys::stat::fstat;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::net::error::{KernelError, KernelResult};

const THREAD_SELF_NETNS: &str = "/proc/thread-self/ns/net";

/// Run `work` inside the network namespace of `pid`.
///
/// The closure executes on its own OS thread with the target namespace
/// active. The host namespace is restored and verified before the result
/// is handed back; a failed restore turns any result into an error.
pub async fn run_in_namespace<T, F>(pid: i32, work: F) -> KernelResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> KernelResult<T> + Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::spawn(move || {
        let _ = tx.send(enter_run_restore(pid, work));
    });

    rx.await
        .map_err(|_| KernelError::Namespace("namespace worker thread panicked".to_string()))?
}

fn enter_run_restore<T, F>(pid: i32, work: F) -> KernelResult<T>
where
    F: FnOnce() -> KernelResult<T>,
{
    let host_ns = File::open(THREAD_SELF_NETNS)
        .map_err(|e| KernelError::Namespace(format!("failed to open host netns: {}", e)))?;
    let host_stat = fstat(host_ns.as_raw_fd())
        .map_err(|e| KernelError::Namespace(format!("failed to stat host netns: {}", e)))?;

    let target_path = format!("/proc/{}/ns/net", pid);
    let target_ns = File::open(&target_path)
        .map_err(|e| KernelError::Namespace(format!("failed to open {}: {}", target_path, e)))?;

    setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
        KernelError::Namespace(format!("setns into pid {} failed: {}", pid, e))
    })?;

    let result = work();

    // From here on, failing to get back to the host namespace outranks
    // whatever `work` produced: the error must surface and this thread must
    // die without touching anything else.
    if let Err(e) = setns(host_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
        return Err(KernelError::Namespace(format!(
            "FATAL: failed to restore host netns after pid {}: {}",
            pid, e
        )));
    }

    let restored = File::open(THREAD_SELF_NETNS)
        .map_err(|e| KernelError::Namespace(format!("failed to re-open host netns: {}", e)))?;
    let restored_stat = fstat(restored.as_raw_fd())
        .map_err(|e| KernelError::Namespace(format!("failed to stat restored netns: {}", e)))?;
    if restored_stat.st_ino != host_stat.st_ino || restored_stat.st_dev != host_stat.st_dev {
        return Err(KernelError::Namespace(
            "restored namespace does not match the host namespace".to_string(),
        ));
    }

    result
}

/// Find the host-side ifindex of a container interface by reading
/// `<proc>/<pid>/cwd/sys/class/net/<iface>/iflink`.
///
/// The container's cwd is `/`, so `cwd/sys` resolves to the container's
/// sysfs without entering its mount namespace. Requires hostPID.
pub fn find_iface_link_for_pid(proc_root: &Path, pid: i32, iface: &str) -> KernelResult<u32> {
    let net_class_dir = proc_root
        .join(pid.to_string())
        .join("cwd/sys/class/net");
    let iflink_path = net_class_dir.join(iface).join("iflink");

    let diagnose = |err: String| -> KernelError {
        let visible = list_dir_names(&net_class_dir);
        KernelError::Parse(format!(
            "{}; interfaces visible in {}: [{}]",
            err,
            net_class_dir.display(),
            visible.join(" ")
        ))
    };

    let raw = match std::fs::read_to_string(&iflink_path) {
        Ok(s) => s,
        Err(e) => {
            return Err(diagnose(format!(
                "unable to read {}: {}",
                iflink_path.display(),
                e
            )))
        }
    };

    let id: u32 = match raw.trim().parse() {
        Ok(v) => v,
        Err(e) => {
            return Err(diagnose(format!(
                "unable to parse iflink '{}': {}",
                raw.trim(),
                e
            )))
        }
    };

    if id == 0 {
        return Err(diagnose(format!(
            "iflink in {} is zero",
            iflink_path.display()
        )));
    }
    Ok(id)
}

fn list_dir_names(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Path of the rp_filter knob for an interface under a given procfs root.
pub fn rp_filter_path(proc_root: &Path, iface: &str) -> PathBuf {
    proc_root
        .join("sys/net/ipv4/conf")
        .join(iface)
        .join("rp_filter")
}

/// Disable reverse-path filtering for an interface. `/proc/sys/net` always
/// reflects the network namespace of the writing thread, so calling this
/// from inside `run_in_namespace` affects the entered pod namespace.
pub fn disable_rp_filter(proc_root: &Path, iface: &str) -> KernelResult<()> {
    let path = rp_filter_path(proc_root, iface);
    std::fs::write(&path, "0").map_err(|e| {
        KernelError::Namespace(format!("failed to write {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_pod_sysfs(dir: &Path, pid: i32, ifaces: &[(&str, &str)]) {
        let net = dir.join(pid.to_string()).join("cwd/sys/class/net");
        for (name, iflink) in ifaces {
            let d = net.join(name);
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join("iflink"), iflink).unwrap();
        }
    }

    #[test]
    fn iflink_lookup_reads_decimal_id() {
        let tmp = tempfile::tempdir().unwrap();
        fake_pod_sysfs(tmp.path(), 4242, &[("eth0", "17\n"), ("lo", "1\n")]);
        let id = find_iface_link_for_pid(tmp.path(), 4242, "eth0").unwrap();
        assert_eq!(id, 17);
    }

    #[test]
    fn iflink_lookup_zero_id_fails_with_diagnostics() {
        let tmp = tempfile::tempdir().unwrap();
        fake_pod_sysfs(tmp.path(), 4242, &[("eth0", "0\n"), ("net1", "5\n")]);
        let err = find_iface_link_for_pid(tmp.path(), 4242, "eth0").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("zero"));
        // Diagnostics enumerate what the pod actually has.
        assert!(text.contains("net1"));
    }

    #[test]
    fn iflink_lookup_missing_iface_fails_with_diagnostics() {
        let tmp = tempfile::tempdir().unwrap();
        fake_pod_sysfs(tmp.path(), 4242, &[("net1", "5\n")]);
        let err = find_iface_link_for_pid(tmp.path(), 4242, "eth0").unwrap_err();
        assert!(err.to_string().contains("net1"));
    }

    #[test]
    fn rp_filter_write_hits_expected_path() {
        let tmp = tempfile::tempdir().unwrap();
        let conf = tmp.path().join("sys/net/ipv4/conf/kube-tunnel-if");
        fs::create_dir_all(&conf).unwrap();
        fs::write(conf.join("rp_filter"), "1").unwrap();

        disable_rp_filter(tmp.path(), "kube-tunnel-if").unwrap();
        assert_eq!(
            fs::read_to_string(conf.join("rp_filter")).unwrap(),
            "0"
        );
    }

    #[tokio::test]
    async fn run_in_namespace_on_own_pid_is_a_round_trip() {
        // Entering our own namespace is a no-op transition but exercises
        // the full enter/restore/verify path.
        let pid = std::process::id() as i32;
        match run_in_namespace(pid, || Ok(7)).await {
            Ok(v) => assert_eq!(v, 7),
            // Sandboxes without CAP_SYS_ADMIN refuse setns.
            Err(KernelError::Namespace(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
