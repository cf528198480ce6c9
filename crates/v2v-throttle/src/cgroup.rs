//! The per-run net_cls classifier cgroup: `v2v-conversion/<tag>` under the
//! network-classifier hierarchy. Member processes get their outgoing packets
//! stamped with `net_cls.classid`, which the tc filter then matches against.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{Gid, Uid};

/// Root of the net_cls v1 cgroup hierarchy. Overridable so tests don't need
/// real cgroupfs access, mirroring the env-override pattern used for other
/// filesystem roots in this codebase.
fn net_cls_root() -> PathBuf {
    std::env::var("V2V_NET_CLS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup/net_cls"))
}

pub struct NetClsCgroup {
    path: PathBuf,
}

impl NetClsCgroup {
    /// Create `<net_cls_root>/v2v-conversion/<tag>`, chown its `tasks` file to
    /// (uid, gid) so the converter process can add itself, and write the packed
    /// class id into `net_cls.classid`.
    pub fn create(tag: &str, uid: u32, gid: u32, classid_hex: &str) -> Result<Self> {
        let path = net_cls_root().join("v2v-conversion").join(tag);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create cgroup dir {}", path.display()))?;

        let tasks = path.join("tasks");
        if tasks.exists() {
            nix::unistd::chown(&tasks, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .with_context(|| format!("failed to chown {}", tasks.display()))?;
        }

        let classid_path = path.join("net_cls.classid");
        std::fs::write(&classid_path, classid_hex)
            .with_context(|| format!("failed to write {}", classid_path.display()))?;

        Ok(NetClsCgroup { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_dir(&self.path)
                .with_context(|| format!("failed to remove cgroup dir {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove_cgroup_dir() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("V2V_NET_CLS_ROOT", dir.path());
        }
        let cgroup = NetClsCgroup::create("20240305T123045-1", std::process::id(), std::process::id(), "0x00010002")
            .unwrap();
        assert!(cgroup.path().exists());
        let classid = std::fs::read_to_string(cgroup.path().join("net_cls.classid")).unwrap();
        assert_eq!(classid, "0x00010002");
        cgroup.remove().unwrap();
        assert!(!cgroup.path().exists());
        unsafe {
            std::env::remove_var("V2V_NET_CLS_ROOT");
        }
    }
}
