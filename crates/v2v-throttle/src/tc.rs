//! Traffic-control plumbing: one HTB root qdisc + one shared class per managed
//! interface, fed by a cgroup classifier filter (SPEC_FULL.md §4.5). Grounded
//! on the original `TcController`: same `abc:` root handle, same
//! scan-for-first-free-minor class allocation, same 32-bit rate ceiling for
//! "unlimited".

use std::process::Command;

use anyhow::Result;
use tracing::{debug, warn};

use v2v_core::naming::class_id_to_hex;

use crate::cgroup::NetClsCgroup;

const ROOT_HANDLE: &str = "abc:";
const MAX_RATE: u64 = 0xffff_ffff;

/// The net_cls-relative cgroup name for a run, e.g. for use with `cgexec -g
/// net_cls:<name>`.
pub fn relative_cgroup_name(tag: &str) -> String {
    format!("v2v-conversion/{}", tag)
}

pub struct TcController {
    tag: String,
    class_id: Option<String>,
    interfaces: Vec<String>,
    owner: (u32, u32),
    cgroup: Option<NetClsCgroup>,
}

impl TcController {
    /// Discover root-level interfaces, set up qdisc/filter/class on each, and
    /// create the classifier cgroup. Interfaces tc can't manage are dropped
    /// from the managed set rather than failing the run.
    pub fn new(tag: &str, uid: u32, gid: u32) -> Result<Self> {
        let mut controller = TcController {
            tag: tag.to_string(),
            class_id: None,
            interfaces: Vec::new(),
            owner: (uid, gid),
            cgroup: None,
        };
        controller.prepare()?;
        Ok(controller)
    }

    fn prepare(&mut self) -> Result<()> {
        for iface in list_root_interfaces()? {
            if self.create_qdisc(&iface).is_err() {
                warn!(iface, "failed to set up root qdisc, dropping interface from managed set");
                continue;
            }
            if self.create_filter(&iface).is_err() {
                warn!(iface, "failed to add cgroup filter, dropping interface");
                continue;
            }
            if self.create_class(&iface).is_err() {
                warn!(iface, "failed to create class, dropping interface");
                continue;
            }
            self.interfaces.push(iface);
        }

        let Some(class_id) = self.class_id.clone() else {
            return Ok(());
        };
        let classid_hex = class_id_to_hex(&class_id)?;
        self.cgroup = Some(NetClsCgroup::create(&self.tag, self.owner.0, self.owner.1, &classid_hex)?);
        Ok(())
    }

    fn create_qdisc(&self, iface: &str) -> Result<()> {
        let show = run_tc(&["qdisc", "show", "dev", iface])?;
        let already_ours = show
            .lines()
            .any(|l| l.contains(ROOT_HANDLE) && l.contains("htb") && l.contains("root"));
        if already_ours {
            return Ok(());
        }
        run_tc(&["qdisc", "add", "dev", iface, "root", "handle", ROOT_HANDLE, "htb"])?;
        Ok(())
    }

    fn create_filter(&self, iface: &str) -> Result<()> {
        run_tc(&[
            "filter", "add", "dev", iface, "parent", ROOT_HANDLE, "protocol", "ip", "prio", "10", "handle", "1:",
            "cgroup",
        ])?;
        Ok(())
    }

    fn create_class(&mut self, iface: &str) -> Result<()> {
        if let Some(class_id) = &self.class_id {
            run_tc(&[
                "class", "add", "dev", iface, "parent", ROOT_HANDLE, "classid", class_id, "htb", "rate",
                &format!("{}bps", MAX_RATE),
            ])?;
            return Ok(());
        }

        let show = run_tc(&["class", "show", "dev", iface, "parent", ROOT_HANDLE]).unwrap_or_default();
        let mut used = std::collections::HashSet::new();
        let prefix = format!("class htb {}", ROOT_HANDLE);
        for line in show.lines() {
            if let Some(rest) = line.trim().strip_prefix(&prefix) {
                if let Some(minor) = rest.split_whitespace().next() {
                    if let Ok(n) = u32::from_str_radix(minor, 16) {
                        used.insert(n);
                    }
                }
            }
        }

        let minor = (1..=0xFFFFu32)
            .find(|n| !used.contains(n))
            .ok_or_else(|| anyhow::anyhow!("no free tc class minor available on {}", iface))?;
        let new_id = format!("{}{:x}", ROOT_HANDLE, minor);

        run_tc(&[
            "class", "add", "dev", iface, "parent", ROOT_HANDLE, "classid", &new_id, "htb", "rate",
            &format!("{}bps", MAX_RATE),
        ])?;
        self.class_id = Some(new_id);
        Ok(())
    }

    /// Apply a rate limit (bytes/sec) to every managed interface; `None` maps
    /// to the 32-bit ceiling ("unlimited").
    pub fn set_limit(&self, limit: Option<u64>) -> Result<()> {
        let rate = limit.unwrap_or(MAX_RATE);
        let Some(class_id) = &self.class_id else {
            debug!("no managed tc class, ignoring set_limit");
            return Ok(());
        };
        for iface in &self.interfaces {
            run_tc(&[
                "class", "change", "dev", iface, "parent", ROOT_HANDLE, "classid", class_id, "htb", "rate",
                &format!("{}bps", rate),
            ])?;
        }
        Ok(())
    }

    pub fn cgroup_path(&self) -> Option<&std::path::Path> {
        self.cgroup.as_ref().map(|c| c.path())
    }
}

impl Drop for TcController {
    fn drop(&mut self) {
        if let Some(class_id) = &self.class_id {
            for iface in &self.interfaces {
                if let Err(e) = run_tc(&["class", "del", "dev", iface, "classid", class_id]) {
                    warn!(iface, error = %e, "failed to remove tc class during cleanup");
                }
            }
        }
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.remove() {
                warn!(error = %e, "failed to remove net_cls cgroup during cleanup");
            }
        }
    }
}

fn list_root_interfaces() -> Result<Vec<String>> {
    let show = run_tc(&["qdisc", "show"]).unwrap_or_default();
    let mut interfaces = Vec::new();
    for line in show.lines() {
        if let Some(idx) = line.find("dev ") {
            let rest = &line[idx + 4..];
            if let Some(name) = rest.split_whitespace().next() {
                if line.contains("root") {
                    interfaces.push(name.to_string());
                }
            }
        }
    }
    Ok(interfaces)
}

fn run_tc(args: &[&str]) -> Result<String> {
    let output = Command::new("tc")
        .args(args)
        .output()
        .map_err(|e| anyhow::anyhow!("failed to spawn tc {:?}: {}", args, e))?;
    if !output.status.success() {
        anyhow::bail!(
            "tc {:?} exited with {}: {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_rate_is_32bit_ceiling() {
        assert_eq!(MAX_RATE, u32::MAX as u64);
    }

    #[test]
    fn test_class_allocation_picks_first_free_minor() {
        let show = "class htb abc:1 root prio 0 rate 100bps\nclass htb abc:3 root prio 0 rate 100bps\n";
        let mut used = std::collections::HashSet::new();
        let prefix = format!("class htb {}", ROOT_HANDLE);
        for line in show.lines() {
            if let Some(rest) = line.trim().strip_prefix(&prefix) {
                if let Some(minor) = rest.split_whitespace().next() {
                    if let Ok(n) = u32::from_str_radix(minor, 16) {
                        used.insert(n);
                    }
                }
            }
        }
        let minor = (1..=0xFFFFu32).find(|n| !used.contains(n)).unwrap();
        assert_eq!(minor, 2);
    }
}
