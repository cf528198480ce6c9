//! The `--checks` / `--check-<name>` surface (§6). Both checks run without a
//! real conversion request; grounded on `checks.py`'s `CHECKS` dict.

use std::collections::HashMap;
use std::process::Command;

use anyhow::{bail, Context, Result};

use v2v_backend::{factory, Backend, BackendKind};
use v2v_core::config::VDSM_MIN_VERSION;
use v2v_core::request::{OutputFormat, Request, Transport};

pub const CHECK_NAMES: &[&str] = &["rhv-guest-tools", "rhv-version"];

pub fn run(name: &str) -> Result<bool> {
    match name {
        "rhv-guest-tools" => check_rhv_guest_tools(),
        "rhv-version" => check_rhv_version(),
        other => bail!("unknown check: {other}"),
    }
}

fn synthetic_request() -> Request {
    Request {
        vm_name: "check".to_string(),
        transport_method: Transport::Ssh,
        vmware_password: None,
        vmware_fingerprint: None,
        ssh_key: None,
        network_mappings: vec![],
        output_format: OutputFormat::Raw,
        allocation: None,
        install_drivers: Some(true),
        virtio_win: None,
        throttling: None,
        daemonize: false,
        source_disks: vec![],
        luks_keys_vault: None,
        luks_keys_files: vec![],
        extra: HashMap::new(),
    }
}

/// Make sure there is an ISO domain with at least one ISO carrying Windows
/// drivers, preferably the RHV Guest Tools ISO.
fn check_rhv_guest_tools() -> Result<bool> {
    let backend = factory(BackendKind::Rhv);
    let mut request = synthetic_request();
    backend.check_install_drivers(&mut request)?;
    Ok(request.virtio_win.is_some())
}

/// Originally an RPM-transaction-database lookup comparing the installed
/// `vdsm` package's version against `VDSM_MIN_VERSION` (see DESIGN.md Open
/// Question 4): shells to `rpm` instead of binding librpm.
fn check_rhv_version() -> Result<bool> {
    let output = Command::new("rpm")
        .args(["-q", "--qf", "%{VERSION}", "vdsm"])
        .output()
        .context("failed to run rpm")?;

    if !output.status.success() {
        eprintln!("vdsm package is not installed");
        eprintln!("Minimal required oVirt/RHV version is {}", VDSM_MIN_VERSION);
        return Ok(false);
    }

    let installed = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if compare_versions(&installed, VDSM_MIN_VERSION) >= std::cmp::Ordering::Equal {
        return Ok(true);
    }

    eprintln!("Version of VDSM on the host: {installed}");
    eprintln!("Minimal required oVirt/RHV version is {}", VDSM_MIN_VERSION);
    Ok(false)
}

/// Compare two dotted-decimal version strings component-wise; missing
/// trailing components compare as zero.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> { s.split('.').map(|p| p.parse().unwrap_or(0)).collect() };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let (x, y) = (va.get(i).copied().unwrap_or(0), vb.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_versions_equal() {
        assert_eq!(compare_versions("4.20.31", "4.20.31"), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_compare_versions_newer_passes() {
        assert_eq!(compare_versions("4.20.32", "4.20.31"), std::cmp::Ordering::Greater);
        assert_eq!(compare_versions("4.21.0", "4.20.31"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn test_compare_versions_older_fails() {
        assert_eq!(compare_versions("4.19.99", "4.20.31"), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_compare_versions_missing_trailing_component() {
        assert_eq!(compare_versions("4.20", "4.20.0"), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_check_names_lists_both() {
        assert_eq!(CHECK_NAMES, &["rhv-guest-tools", "rhv-version"]);
    }
}
