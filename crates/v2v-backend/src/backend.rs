//! The Host Back-end strategy (§4.6): one trait, three struct implementations,
//! selected by `detect()`. Never inheritance, never a hierarchy deeper than
//! this trait (§9 "Back-end polymorphism").

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;

use v2v_core::error::RequestError;
use v2v_core::request::Request;
use v2v_core::state::StateStore;
use v2v_runtime::runner::Runner;

use crate::inpod::InPodBackend;
use crate::openstack::OpenStackBackend;
use crate::rhv::RhvBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Rhv,
    OpenStack,
    InPod,
}

/// Target-platform strategy: validate the request, compose converter
/// arguments, finalize or clean up the target-side objects, and report
/// progress for anything the log parser cannot observe from converter output.
pub trait Backend {
    fn validate(&self, request: &mut Request) -> Result<(), RequestError>;
    fn get_uid(&self, request: &Request) -> u32;
    fn get_gid(&self, request: &Request) -> u32;
    fn build_args(
        &self,
        request: &Request,
        base_args: Vec<String>,
        base_env: HashMap<String, String>,
    ) -> Result<(Vec<String>, HashMap<String, String>)>;
    fn finalize(&self, request: &Request, state: &mut StateStore) -> Result<bool>;
    fn cleanup(&self, request: &Request, state: &mut StateStore);
    fn update_progress(&self, request: &Request, state: &mut StateStore) -> Result<()>;
    fn create_runner(
        &self,
        args: Vec<String>,
        env: HashMap<String, String>,
        log_path: PathBuf,
        uid: u32,
        gid: u32,
        tag: &str,
        daemonize: bool,
    ) -> Box<dyn Runner>;
    fn check_install_drivers(&self, request: &mut Request) -> Result<()>;
}

/// Picks a back-end by the presence of target-selector keys (§4.6). Exactly
/// one of `export_domain`/`rhv_url`/`osp_environment` is guaranteed present
/// by `Request::validate_generic` before this is ever called; zero selectors
/// means in-pod.
pub fn detect(request: &Request) -> BackendKind {
    if request.extra.contains_key("export_domain") || request.extra.contains_key("rhv_url") {
        BackendKind::Rhv
    } else if request.extra.contains_key("osp_environment") {
        BackendKind::OpenStack
    } else {
        BackendKind::InPod
    }
}

pub fn factory(kind: BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Rhv => Box::new(RhvBackend::new()),
        BackendKind::OpenStack => Box::new(OpenStackBackend::new()),
        BackendKind::InPod => Box::new(InPodBackend::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use v2v_core::request::{OutputFormat, Transport};

    fn base() -> Request {
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
    fn test_detect_rhv_via_export_domain() {
        let mut r = base();
        r.set_extra("export_domain", serde_json::json!("/mnt/export"));
        assert_eq!(detect(&r), BackendKind::Rhv);
    }

    #[test]
    fn test_detect_rhv_via_rhv_url() {
        let mut r = base();
        r.set_extra("rhv_url", serde_json::json!("https://engine/ovirt-engine/api"));
        assert_eq!(detect(&r), BackendKind::Rhv);
    }

    #[test]
    fn test_detect_openstack() {
        let mut r = base();
        r.set_extra("osp_environment", serde_json::json!("myenv"));
        assert_eq!(detect(&r), BackendKind::OpenStack);
    }

    #[test]
    fn test_detect_inpod_when_no_selectors() {
        let r = base();
        assert_eq!(detect(&r), BackendKind::InPod);
    }
}
