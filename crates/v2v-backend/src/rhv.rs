//! The oVirt/RHV back-end (§4.6, §9 "External SDKs for target platforms").
//!
//! Grounded on `VDSMHost` in the original wrapper: the oVirt Python SDK is
//! replaced with a small REST client (`rhv_client`) exposing only the
//! capabilities this back-end actually uses (`find_storage_domain`,
//! `list_transfers`, `cancel_transfer`, `get_disk_status`, `remove_disk`).

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use v2v_core::config::{
    FINALIZE_DEADLINE_SECS, RHV_MNT_ROOT, VDSM_CA_DEFAULT, VDSM_GID, VDSM_UID,
};
use v2v_core::error::RequestError;
use v2v_core::request::{Allocation, OutputFormat, Request};
use v2v_core::retry::retry;
use v2v_core::state::StateStore;
use v2v_runtime::runner::{DirectRunner, Runner, ServiceRunner};

use crate::backend::Backend;
use crate::iso::select_best;
use crate::rhv_client::RhvClient;

const PREALLOCATED_STORAGE_TYPES: &[&str] = &["cinder", "fcp", "glusterfs", "iscsi", "posixfs"];

pub struct RhvBackend {
    /// Set during `validate` when `export_domain` is the target; mounting the
    /// NFS export requires root, unlike the rhv-upload path.
    export_domain: Cell<bool>,
}

impl RhvBackend {
    pub fn new() -> Self {
        RhvBackend { export_domain: Cell::new(false) }
    }

    fn find_iso_domain(&self) -> Option<PathBuf> {
        if !Path::new(RHV_MNT_ROOT).is_dir() {
            warn!(root = RHV_MNT_ROOT, "cannot find RHV domains");
            return None;
        }
        for entry in walk_dirs(Path::new(RHV_MNT_ROOT)) {
            let metadata = entry.join("dom_md").join("metadata");
            if metadata.is_file() && is_iso_domain(&metadata) {
                return Some(entry.join("images").join("11111111-1111-1111-1111-111111111111"));
            }
        }
        None
    }
}

fn walk_dirs(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
                out.push(path);
            }
        }
    }
    out
}

fn is_iso_domain(metadata_path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(metadata_path) else { return false };
    contents.lines().any(|l| l.trim() == "CLASS=Iso")
}

impl Backend for RhvBackend {
    fn validate(&self, request: &mut Request) -> Result<(), RequestError> {
        if request.extra.contains_key("export_domain") {
            self.export_domain.set(true);
            request.set_extra("backend", serde_json::json!("direct"));
        } else if request.extra.contains_key("rhv_url") {
            for key in ["rhv_cluster", "rhv_password", "rhv_storage"] {
                if !request.extra.contains_key(key) {
                    return Err(RequestError::MissingField(leak(key)));
                }
            }
            if !request.extra.contains_key("rhv_cafile") {
                info!("path to CA certificate not specified, trying VDSM default: {}", VDSM_CA_DEFAULT);
                request.set_extra("rhv_cafile", serde_json::json!(VDSM_CA_DEFAULT));
            }
        } else {
            return Err(RequestError::MissingField("rhv_url or export_domain"));
        }

        if !request.extra.contains_key("insecure_connection") {
            request.set_extra("insecure_connection", serde_json::json!(false));
        }

        // Allocation is only inferred from storage-domain type when the target is
        // reachable over REST; an export-domain target has no engine URL to query
        // (the original's unconditional SDK call would simply KeyError here).
        if request.allocation.is_none() && request.extra.contains_key("rhv_url") {
            let client = RhvClient::from_request(request)
                .map_err(|e| RequestError::TargetQueryFailed(e.to_string()))?;
            let storage_name = request.require_extra_str("rhv_storage")?.to_string();
            let domain = client
                .find_storage_domain(&storage_name)
                .map_err(|e| RequestError::TargetQueryFailed(e.to_string()))?;
            info!(storage = %storage_name, storage_type = ?domain.storage_type, "storage domain type");
            let allocation = infer_allocation(domain.storage_type.as_deref());
            info!(?allocation, "selected allocation type");
            request.allocation = Some(allocation);
        }

        Ok(())
    }

    fn get_uid(&self, _request: &Request) -> u32 {
        if self.export_domain.get() { 0 } else { VDSM_UID }
    }

    fn get_gid(&self, _request: &Request) -> u32 {
        VDSM_GID
    }

    fn build_args(
        &self,
        request: &Request,
        mut base_args: Vec<String>,
        mut base_env: HashMap<String, String>,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        let output_format = match request.output_format {
            OutputFormat::Raw => "raw",
            OutputFormat::Qcow2 => "qcow2",
        };
        base_args.extend(["--bridge".to_string(), "ovirtmgmt".to_string(), "-of".to_string(), output_format.to_string()]);

        if let Some(allocation) = request.allocation {
            let allocation = match allocation {
                v2v_core::request::Allocation::Sparse => "sparse",
                v2v_core::request::Allocation::Preallocated => "preallocated",
            };
            base_args.extend(["-oa".to_string(), allocation.to_string()]);
        }

        if let Some(rhv_url) = request.extra_str("rhv_url") {
            let insecure = request.extra_bool("insecure_connection").unwrap_or(false);
            let rhv_storage = request.require_extra_str("rhv_storage")?;
            let rhv_password_file = request.require_extra_str("rhv_password_file")?;
            let rhv_cluster = request.require_extra_str("rhv_cluster")?;
            base_args.extend([
                "-o".to_string(), "rhv-upload".to_string(),
                "-oc".to_string(), rhv_url.to_string(),
                "-os".to_string(), rhv_storage.to_string(),
                "-op".to_string(), rhv_password_file.to_string(),
                "-oo".to_string(), format!("rhv-cluster={}", rhv_cluster),
                "-oo".to_string(), "rhv-direct".to_string(),
                "-oo".to_string(), format!("rhv-verifypeer={}", !insecure),
            ]);
            if !insecure {
                let cafile = request.extra_str("rhv_cafile").unwrap_or(VDSM_CA_DEFAULT);
                base_args.extend(["-oo".to_string(), format!("rhv-cafile={}", cafile)]);
            }
        } else if let Some(export_domain) = request.extra_str("export_domain") {
            base_args.extend(["-o".to_string(), "rhv".to_string(), "-os".to_string(), export_domain.to_string()]);
        }

        if self.get_uid(request) != 0 {
            // Dropping XDG_RUNTIME_DIR: it would otherwise leak through su/sudo
            // and cause permission errors for the converter (rhbz#967509).
            base_env.remove("XDG_RUNTIME_DIR");
        }

        Ok((base_args, base_env))
    }

    fn finalize(&self, _request: &Request, _state: &mut StateStore) -> Result<bool> {
        // rhv-upload and the export-domain writer both leave the target-side
        // disk attached by virt-v2v itself; there is nothing left to do here.
        Ok(true)
    }

    fn cleanup(&self, request: &Request, state: &mut StateStore) {
        let mut disk_ids: Vec<String> = state.internal.disk_ids.values().cloned().collect();
        if disk_ids.is_empty() {
            debug!("no disks to clean up");
            return;
        }

        // The export-domain target has no engine URL to cancel transfers or
        // remove disks through; virt-v2v itself owns cleanup of its own writes there.
        if request.extra_str("rhv_url").is_none() {
            debug!("no rhv_url target, skipping REST-based disk cleanup");
            return;
        }
        let client = match RhvClient::from_request(request) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build RHV REST client, skipping disk cleanup");
                return;
            }
        };

        match client.list_transfers() {
            Ok(transfers) => {
                let cancellable: Vec<_> = transfers.into_iter().filter(|t| disk_ids.contains(&t.image_id)).collect();
                if cancellable.is_empty() {
                    debug!("no active transfers to cancel");
                }
                for transfer in cancellable {
                    info!(transfer_id = %transfer.id, disk_id = %transfer.image_id, "canceling transfer");
                    match client.cancel_transfer(&transfer.id) {
                        Ok(()) => disk_ids.retain(|id| id != &transfer.image_id),
                        Err(e) => warn!(transfer_id = %transfer.id, error = %e, "failed to cancel transfer"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list transfers to cancel"),
        }

        info!(count = disk_ids.len(), "removing disks after failed conversion");
        let deadline = Instant::now() + Duration::from_secs(FINALIZE_DEADLINE_SECS);
        while !disk_ids.is_empty() {
            disk_ids.retain(|id| {
                match remove_disk_best_effort(&client, id) {
                    Ok(true) => {
                        info!(disk_id = %id, "removed disk");
                        false
                    }
                    Ok(false) => true,
                    Err(e) => {
                        warn!(disk_id = %id, error = %e, "failed to remove disk, will retry");
                        true
                    }
                }
            });
            if !disk_ids.is_empty() {
                if Instant::now() > deadline {
                    warn!(remaining = ?disk_ids, "timed out waiting for disk removal");
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn update_progress(&self, _request: &Request, _state: &mut StateStore) -> Result<()> {
        Ok(())
    }

    fn create_runner(
        &self,
        args: Vec<String>,
        env: HashMap<String, String>,
        log_path: PathBuf,
        uid: u32,
        gid: u32,
        tag: &str,
        daemonize: bool,
    ) -> Box<dyn Runner> {
        if daemonize {
            Box::new(ServiceRunner::new("virt-v2v", args, env, log_path, uid, gid, tag))
        } else {
            Box::new(DirectRunner::new("virt-v2v", args, env, log_path))
        }
    }

    fn check_install_drivers(&self, request: &mut Request) -> Result<()> {
        self.resolve_install_drivers(request)
    }
}

/// Best-effort disk removal, separated from `cleanup` so the REST error type
/// never has to flow through the trait's infallible `cleanup` signature
/// (§7 "Cleanup error — logged but never re-raised"). `Ok(true)` means the
/// disk is gone (removed, or already absent); `Ok(false)` means it is still
/// transitioning and the caller should retry without logging, matching
/// `VDSMHost.handle_cleanup`'s silent `continue` on a non-OK disk status.
fn remove_disk_best_effort(client: &RhvClient, disk_id: &str) -> Result<bool> {
    match client.get_disk_status(disk_id)? {
        None => Ok(true),
        Some(status) if status != "ok" => Ok(false),
        Some(_) => {
            retry(3, Duration::from_secs(2), "remove RHV disk", || client.remove_disk(disk_id))?;
            Ok(true)
        }
    }
}

fn leak(s: &str) -> &'static str {
    Box::leak(s.to_string().into_boxed_str())
}

/// Decides allocation type from a storage domain's type, the only signal
/// currently available for this (§4.6 `validate`).
fn infer_allocation(storage_type: Option<&str>) -> Allocation {
    match storage_type {
        Some(t) if PREALLOCATED_STORAGE_TYPES.contains(&t) => Allocation::Preallocated,
        _ => Allocation::Sparse,
    }
}

impl RhvBackend {
    /// Finds and records the best ISO with guest tools/drivers, honoring an
    /// explicit absolute `virtio_win` path if one was given (§4.6).
    pub fn resolve_install_drivers(&self, request: &mut Request) -> Result<()> {
        if let Some(virtio_win) = &request.virtio_win {
            if Path::new(virtio_win).is_absolute() {
                if !Path::new(virtio_win).is_file() {
                    anyhow::bail!("\"virtio_win\" must be a path or file name of image in ISO domain");
                }
                return Ok(());
            }
        }

        let iso_domain = self.find_iso_domain();
        let iso_name = match (&request.virtio_win, &iso_domain) {
            (Some(name), None) => anyhow::bail!("ISO domain not found (virtio_win={name:?} requested)"),
            (Some(name), Some(_)) => name.clone(),
            (None, None) => {
                warn!("ISO domain not found (but install_drivers is true)");
                request.install_drivers = Some(false);
                return Ok(());
            }
            (None, Some(domain)) => {
                let names: Vec<String> = std::fs::read_dir(domain)
                    .with_context(|| format!("failed to list ISO domain {}", domain.display()))?
                    .flatten()
                    .filter(|e| e.path().is_file())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect();
                match select_best(names.iter().map(String::as_str)) {
                    Some(best) => best.to_string(),
                    None => {
                        warn!("could not find any ISO with drivers (but install_drivers is true)");
                        request.install_drivers = Some(false);
                        return Ok(());
                    }
                }
            }
        };

        let full_path = iso_domain.unwrap().join(&iso_name);
        if !full_path.is_file() {
            anyhow::bail!("\"virtio_win\" must be a path or file name of image in ISO domain");
        }
        info!(path = %full_path.display(), "virtio_win (re)defined");
        request.virtio_win = Some(full_path.to_string_lossy().into_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use v2v_core::request::Transport;

    fn base_request() -> Request {
        Request {
            vm_name: "vm1".to_string(),
            transport_method: Transport::Ssh,
            vmware_password: None,
            vmware_fingerprint: None,
            ssh_key: None,
            network_mappings: vec![],
            output_format: OutputFormat::Raw,
            allocation: None,
            install_drivers: None,
            virtio_win: None,
            throttling: None,
            daemonize: true,
            source_disks: vec![],
            luks_keys_vault: None,
            luks_keys_files: vec![],
            extra: Map::new(),
        }
    }

    #[test]
    fn test_validate_export_domain_forces_direct_backend_and_root_uid() {
        let backend = RhvBackend::new();
        let mut r = base_request();
        r.set_extra("export_domain", serde_json::json!("/mnt/export"));
        backend.validate(&mut r).unwrap();
        assert_eq!(r.extra_str("backend"), Some("direct"));
        assert_eq!(backend.get_uid(&r), 0);
        assert_eq!(backend.get_gid(&r), VDSM_GID);
    }

    #[test]
    fn test_validate_rhv_url_requires_cluster_password_storage() {
        let backend = RhvBackend::new();
        let mut r = base_request();
        r.set_extra("rhv_url", serde_json::json!("https://engine/ovirt-engine/api"));
        assert!(matches!(backend.validate(&mut r), Err(RequestError::MissingField("rhv_cluster"))));
    }

    #[test]
    fn test_validate_rhv_url_defaults_cafile() {
        let backend = RhvBackend::new();
        let mut r = base_request();
        r.set_extra("rhv_url", serde_json::json!("https://engine/ovirt-engine/api"));
        r.set_extra("rhv_cluster", serde_json::json!("Default"));
        r.set_extra("rhv_password", serde_json::json!("secret"));
        r.set_extra("rhv_storage", serde_json::json!("data"));
        // An explicit allocation skips the storage-domain REST lookup below.
        r.allocation = Some(Allocation::Sparse);
        backend.validate(&mut r).unwrap();
        assert_eq!(r.extra_str("rhv_cafile"), Some(VDSM_CA_DEFAULT));
        assert_eq!(backend.get_uid(&r), VDSM_UID);
    }

    #[test]
    fn test_validate_export_domain_skips_allocation_lookup() {
        // export_domain has no rhv_url to query; allocation stays unset rather
        // than attempting a REST call with no engine URL available.
        let backend = RhvBackend::new();
        let mut r = base_request();
        r.set_extra("export_domain", serde_json::json!("/mnt/export"));
        backend.validate(&mut r).unwrap();
        assert_eq!(r.allocation, None);
    }

    #[test]
    fn test_infer_allocation_preallocated_for_iscsi() {
        assert_eq!(infer_allocation(Some("iscsi")), Allocation::Preallocated);
    }

    #[test]
    fn test_infer_allocation_sparse_for_nfs() {
        assert_eq!(infer_allocation(Some("nfs")), Allocation::Sparse);
    }

    #[test]
    fn test_infer_allocation_sparse_when_unknown() {
        assert_eq!(infer_allocation(None), Allocation::Sparse);
    }
}
