//! The Secret Materializer (§4.2): short-lived, owner-restricted files for
//! passwords and LUKS keys, plus the LUKS vault ownership/permission policy.

use std::fs::Permissions;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid};
use serde::Deserialize;

use v2v_core::request::LuksKeyFile;

/// Write `plaintext` to a new `.v2v`-suffixed file owned by (uid, gid), mode
/// 0600. Returns the absolute path; the caller owns deletion.
pub fn write_secret(plaintext: &str, uid: u32, gid: u32) -> Result<PathBuf> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".secret-")
        .suffix(".v2v")
        .tempfile()
        .context("failed to create secret file")?;

    use std::io::Write;
    tmp.write_all(plaintext.as_bytes()).context("failed to write secret file")?;
    tmp.flush().context("failed to flush secret file")?;

    let (file, path) = tmp.keep().context("failed to persist secret file")?;
    std::fs::set_permissions(&path, Permissions::from_mode(0o600))
        .with_context(|| format!("failed to chmod {}", path.display()))?;
    nix::unistd::fchown(&file, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .with_context(|| format!("failed to chown {}", path.display()))?;
    drop(file);

    path.canonicalize().with_context(|| format!("failed to canonicalize {}", path.display()))
}

/// Delete a secret file, logging but never failing the caller on error
/// (§7 "Secret-file removal error").
pub fn remove_secret(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove secret file");
    }
}

#[derive(Debug, Deserialize)]
struct VaultEntry {
    device: String,
    key: String,
}

/// Validate vault ownership/permissions, then materialize every key entry
/// tagged with `vm_name` into its own secret file (§4.2 "Extra policy for
/// LUKS vault").
pub fn materialize_luks_vault(
    vault_path: &Path,
    vm_name: &str,
    converter_uid: u32,
    gid: u32,
) -> Result<Vec<LuksKeyFile>> {
    let meta = std::fs::metadata(vault_path)
        .with_context(|| format!("failed to stat luks vault {}", vault_path.display()))?;

    if meta.uid() != converter_uid {
        bail!(
            "luks vault {} is owned by uid {}, expected {}",
            vault_path.display(),
            meta.uid(),
            converter_uid
        );
    }
    let mode = meta.mode();
    if mode & 0o077 != 0 {
        bail!(
            "luks vault {} must not be group/other-accessible (mode {:o})",
            vault_path.display(),
            mode & 0o777
        );
    }

    let raw = std::fs::read_to_string(vault_path)
        .with_context(|| format!("failed to read luks vault {}", vault_path.display()))?;
    let vault: std::collections::HashMap<String, Vec<VaultEntry>> =
        serde_json::from_str(&raw).context("failed to parse luks vault JSON")?;

    let mut materialized = Vec::new();
    if let Some(entries) = vault.get(vm_name) {
        for entry in entries {
            let filename = write_secret(&entry.key, converter_uid, gid)?;
            materialized.push(LuksKeyFile {
                device: entry.device.clone(),
                filename: filename.to_string_lossy().to_string(),
            });
        }
    }
    Ok(materialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_secret_has_owner_mode_0600() {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let path = write_secret("hunter2", uid, gid).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(meta.uid(), uid);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hunter2");
        remove_secret(&path);
        assert!(!path.exists());
    }

    #[test]
    fn test_materialize_luks_vault_rejects_group_readable() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault.json");
        std::fs::write(&vault, "{}").unwrap();
        std::fs::set_permissions(&vault, Permissions::from_mode(0o640)).unwrap();
        let uid = nix::unistd::getuid().as_raw();
        let result = materialize_luks_vault(&vault, "my-vm", uid, uid);
        assert!(result.is_err());
    }

    #[test]
    fn test_materialize_luks_vault_materializes_tagged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let vault = dir.path().join("vault.json");
        std::fs::write(
            &vault,
            r#"{"my-vm": [{"device": "/dev/sda", "key": "s3cr3t"}]}"#,
        )
        .unwrap();
        std::fs::set_permissions(&vault, Permissions::from_mode(0o600)).unwrap();
        let uid = nix::unistd::getuid().as_raw();

        let files = materialize_luks_vault(&vault, "my-vm", uid, uid).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].device, "/dev/sda");
        assert_eq!(std::fs::read_to_string(&files[0].filename).unwrap(), "s3cr3t");
        remove_secret(Path::new(&files[0].filename));
    }
}
