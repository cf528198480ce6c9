//! The in-pod (Kubernetes/KubeVirt) back-end (§4.6). Grounded on `CNVHost`
//! and `K8SCommunicator`: the Kubernetes API server reachable from inside
//! the pod is the opaque transport, reached here through a lazily
//! constructed `reqwest::blocking::Client` (built on first use, always
//! post-fork — §9 "Daemonization") instead of the original's pycurl calls.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use v2v_core::error::RequestError;
use v2v_core::request::Request;
use v2v_core::state::StateStore;
use v2v_runtime::runner::{DirectRunner, Runner};

use crate::backend::Backend;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Talks to the Kubernetes API server's pod endpoint for this pod. Built
/// lazily per call so nothing constructs TLS/connection-pool state before
/// the daemonizing fork.
struct K8sCommunicator {
    url: String,
    token: String,
    ca_cert: PathBuf,
}

impl K8sCommunicator {
    fn from_env() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST not set")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").context("KUBERNETES_SERVICE_PORT not set")?;
        let pod = std::env::var("HOSTNAME").context("HOSTNAME not set")?;
        let namespace = std::fs::read_to_string(format!("{}/namespace", SERVICE_ACCOUNT_DIR))
            .context("failed to read service-account namespace")?;
        let token = std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
            .context("failed to read service-account token")?;
        let url = format!(
            "https://{host}:{port}/api/v1/namespaces/{ns}/pods/{pod}",
            host = host,
            port = port,
            ns = namespace.trim(),
            pod = pod,
        );
        Ok(K8sCommunicator {
            url,
            token: token.trim().to_string(),
            ca_cert: PathBuf::from(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR)),
        })
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        let cert_pem = std::fs::read(&self.ca_cert).context("failed to read service-account CA cert")?;
        let cert = reqwest::Certificate::from_pem(&cert_pem).context("failed to parse service-account CA cert")?;
        reqwest::blocking::Client::builder()
            .add_root_certificate(cert)
            .build()
            .context("failed to build Kubernetes API client")
    }

    fn get(&self) -> Result<Value> {
        debug!(url = %self.url, "GET pod description");
        let resp = self
            .client()?
            .get(&self.url)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .context("GET to Kubernetes API failed")?;
        resp.json().context("failed to parse pod description JSON")
    }

    fn patch(&self, patch: &Value) -> Result<()> {
        debug!(url = %self.url, "PATCH pod description");
        let resp = self
            .client()?
            .patch(&self.url)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/json-patch+json")
            .json(patch)
            .send()
            .context("PATCH to Kubernetes API failed")?;
        if resp.status().as_u16() >= 300 {
            debug!(status = %resp.status(), "non-2xx response from Kubernetes API");
        }
        Ok(())
    }
}

pub struct InPodBackend;

impl InPodBackend {
    pub fn new() -> Self {
        InPodBackend
    }
}

impl Backend for InPodBackend {
    fn validate(&self, request: &mut Request) -> Result<(), RequestError> {
        // No libvirt inside the pod: enforce the direct backend.
        request.set_extra("backend", serde_json::json!("direct"));
        Ok(())
    }

    fn get_uid(&self, _request: &Request) -> u32 {
        0
    }

    fn get_gid(&self, _request: &Request) -> u32 {
        0
    }

    fn build_args(
        &self,
        _request: &Request,
        mut base_args: Vec<String>,
        base_env: HashMap<String, String>,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        base_args.extend([
            "-o".to_string(), "json".to_string(),
            "-os".to_string(), "/data/vm".to_string(),
            "-oo".to_string(), "json-disks-pattern=disk%{DiskNo}/disk.img".to_string(),
        ]);
        Ok((base_args, base_env))
    }

    fn finalize(&self, request: &Request, _state: &mut StateStore) -> Result<bool> {
        let vm_json_path = format!("/data/vm/{}.json", request.vm_name);
        let vm_data = std::fs::read_to_string(&vm_json_path)
            .with_context(|| format!("failed to read {}", vm_json_path))?;
        let patch = serde_json::json!([{
            "op": "add",
            "path": "/metadata/annotations/v2vConversionMetadata",
            "value": vm_data,
        }]);
        K8sCommunicator::from_env()?.patch(&patch)?;
        Ok(true)
    }

    fn cleanup(&self, _request: &Request, _state: &mut StateStore) {
        // Nothing to clean up: the pod's own lifecycle owns cleanup on failure.
    }

    fn update_progress(&self, _request: &Request, state: &mut StateStore) -> Result<()> {
        let disks = &state.snapshot().disks;
        let progress = if disks.is_empty() {
            0.0
        } else {
            disks.iter().map(|d| d.progress).sum::<f64>() / disks.len() as f64
        };

        let k8s = K8sCommunicator::from_env()?;
        let pod = k8s.get()?;
        let mut patch = Vec::new();
        let has_metadata = pod.get("metadata").is_some();
        if !has_metadata {
            patch.push(serde_json::json!({"op": "add", "path": "/metadata", "value": {}}));
            debug!("creating /metadata in pod description");
        }
        let has_annotations = pod.get("metadata").and_then(|m| m.get("annotations")).is_some();
        if !has_annotations {
            patch.push(serde_json::json!({"op": "add", "path": "/metadata/annotations", "value": {}}));
            debug!("creating /metadata/annotations in pod description");
            patch.push(serde_json::json!({
                "op": "add",
                "path": "/metadata/annotations/v2vConversionProgress",
                "value": progress.to_string(),
            }));
            debug!("updating progress in pod annotation");
            k8s.patch(&Value::Array(patch))?;
        }
        Ok(())
    }

    fn create_runner(
        &self,
        args: Vec<String>,
        env: HashMap<String, String>,
        log_path: PathBuf,
        _uid: u32,
        _gid: u32,
        _tag: &str,
        _daemonize: bool,
    ) -> Box<dyn Runner> {
        // Always direct: there is no service manager inside the pod.
        Box::new(DirectRunner::new("virt-v2v", args, env, log_path))
    }

    fn check_install_drivers(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use v2v_core::request::{OutputFormat, Transport};

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
            daemonize: false,
            source_disks: vec![],
            luks_keys_vault: None,
            luks_keys_files: vec![],
            extra: Map::new(),
        }
    }

    #[test]
    fn test_validate_forces_direct_backend() {
        let backend = InPodBackend::new();
        let mut r = base_request();
        backend.validate(&mut r).unwrap();
        assert_eq!(r.extra_str("backend"), Some("direct"));
    }

    #[test]
    fn test_build_args_includes_json_output() {
        let backend = InPodBackend::new();
        let r = base_request();
        let (args, _) = backend.build_args(&r, vec![], Map::new()).unwrap();
        assert!(args.windows(2).any(|w| w == ["-o", "json"]));
        assert!(args.iter().any(|a| a == "/data/vm"));
    }

    #[test]
    fn test_get_uid_gid_root() {
        let backend = InPodBackend::new();
        let r = base_request();
        assert_eq!(backend.get_uid(&r), 0);
        assert_eq!(backend.get_gid(&r), 0);
    }
}
