//! The OpenStack back-end (§4.6). Grounded on `OSPHost`: the `openstack` CLI
//! is the opaque transport (§9 "External SDKs for target platforms" —
//! `run_cli(args) -> Option<Vec<u8>>` plus JSON decoders for its output),
//! shelled exactly the way the reference runtime's `shell` module runs any
//! other host command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use v2v_core::config::FINALIZE_DEADLINE_SECS;
use v2v_core::error::RequestError;
use v2v_core::naming::{ipv4_in_cidr, openstack_disk_name};
use v2v_core::request::Request;
use v2v_core::state::StateStore;
use v2v_runtime::runner::{DirectRunner, Runner, ServiceRunner};
use v2v_runtime::shell;

use crate::backend::Backend;

pub struct OpenStackBackend;

impl OpenStackBackend {
    pub fn new() -> Self {
        OpenStackBackend
    }

    /// Shells `openstack <cmd...>`, prefixed with `--os-*` flags derived from
    /// `osp_environment` and, when `destination` is true, pinned to the
    /// destination project. Returns `None` on non-zero exit (never turned
    /// into an error — stderr here may contain credentials, so only the
    /// sanitized command and return code are logged, per §7 propagation
    /// policy).
    fn run_openstack(&self, request: &Request, cmd: &[&str], destination: bool) -> Option<String> {
        let mut args: Vec<String> = Vec::new();
        if request.extra_bool("insecure_connection").unwrap_or(false) {
            args.push("--insecure".to_string());
        }
        if let Some(Value::Object(env)) = request.extra.get("osp_environment") {
            for (k, v) in env {
                let flag = k.to_lowercase().replace('_', "-");
                args.push(format!("--{}={}", flag, value_to_string(v)));
            }
        }
        if destination {
            if let Some(project) = request.extra_str("osp_destination_project_id") {
                args.push(format!("--os-project-id={}", project));
            }
        }
        args.extend(cmd.iter().map(|s| s.to_string()));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        match shell::run_host("openstack", &arg_refs) {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                error!(
                    code = output.status.code().unwrap_or(-1),
                    output = %String::from_utf8_lossy(&output.stdout),
                    "openstack command exited non-zero"
                );
                None
            }
            Err(e) => {
                error!(error = %e, "failed to invoke openstack CLI");
                None
            }
        }
    }

    fn ip_in_network(&self, request: &Request, destination_network: &str, addr: &str) -> bool {
        let Some(subnets_json) = self.run_openstack(
            request,
            &["subnet", "list", "--network", destination_network, "-f", "json"],
            true,
        ) else {
            return false;
        };
        let Ok(subnets) = serde_json::from_str::<Vec<Value>>(&subnets_json) else { return false };
        subnets.iter().any(|s| {
            s.get("Subnet")
                .and_then(|v| v.as_str())
                .map(|cidr| ipv4_in_cidr(addr, cidr).unwrap_or(false))
                .unwrap_or(false)
        })
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Backend for OpenStackBackend {
    fn validate(&self, request: &mut Request) -> Result<(), RequestError> {
        request.set_extra("backend", serde_json::json!("direct"));

        for key in [
            "osp_destination_project_id",
            "osp_environment",
            "osp_flavor_id",
            "osp_security_groups_ids",
            "osp_server_id",
        ] {
            if !request.extra.contains_key(key) {
                return Err(RequestError::MissingField(leak(key)));
            }
        }

        if !request.extra.contains_key("insecure_connection") {
            request.set_extra("insecure_connection", serde_json::json!(false));
        }

        if let Some(Value::Object(env)) = request.extra.get("osp_environment") {
            for k in env.keys() {
                let prefix: String = k.chars().take(3).collect::<String>().to_lowercase();
                if !(prefix.starts_with("os-") || prefix.starts_with("os_")) {
                    return Err(RequestError::InvalidValue { field: "osp_environment", value: k.clone() });
                }
            }
        }

        if !request.extra.contains_key("osp_guest_id") {
            request.set_extra("osp_guest_id", serde_json::json!(uuid::Uuid::new_v4().to_string()));
        }

        if !matches!(request.extra.get("osp_security_groups_ids"), Some(Value::Array(_))) {
            return Err(RequestError::InvalidValue {
                field: "osp_security_groups_ids",
                value: "must be a list".to_string(),
            });
        }

        for (i, m) in request.network_mappings.iter().enumerate() {
            if m.mac_address.is_none() {
                return Err(RequestError::BadNetworkMapping { index: i, field: "mac_address" });
            }
        }

        Ok(())
    }

    fn get_uid(&self, _request: &Request) -> u32 {
        // OpenStack mode always runs as root: it cannot use the libvirt
        // backend and must run direct (§"Tweaks" in the reference source).
        0
    }

    fn get_gid(&self, _request: &Request) -> u32 {
        0
    }

    fn build_args(
        &self,
        request: &Request,
        mut base_args: Vec<String>,
        base_env: HashMap<String, String>,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        let server_id = request.require_extra_str("osp_server_id")?;
        let guest_id = request.require_extra_str("osp_guest_id")?;
        base_args.extend([
            "-o".to_string(), "openstack".to_string(),
            "-oo".to_string(), format!("server-id={}", server_id),
            "-oo".to_string(), format!("guest-id={}", guest_id),
        ]);

        if let Some(Value::Object(env)) = request.extra.get("osp_environment") {
            for (k, v) in env {
                let flag = k.to_lowercase().replace('_', "-");
                base_args.extend(["-oo".to_string(), format!("{}={}", flag, value_to_string(v))]);
            }
        }

        if let Some(volume_type) = request.extra_str("osp_volume_type_id") {
            base_args.extend(["-os".to_string(), volume_type.to_string()]);
        }

        if request.extra_bool("insecure_connection").unwrap_or(false) {
            base_args.extend(["-oo".to_string(), "verify-server-certificate=false".to_string()]);
        }

        Ok((base_args, base_env))
    }

    fn finalize(&self, request: &Request, state: &mut StateStore) -> Result<bool> {
        let vm_name = state.internal.display_name.clone().unwrap_or_else(|| request.vm_name.clone());

        if self.run_openstack(request, &["token", "issue"], false).is_none() {
            error!("create VM failed: could not issue keystone token");
            return Ok(false);
        }

        let mut keys: Vec<&String> = state.internal.disk_ids.keys().collect();
        keys.sort_by_key(|k| k.parse::<u64>().unwrap_or(0));
        let volumes: Vec<String> = keys.iter().map(|k| state.internal.disk_ids[*k].clone()).collect();
        if volumes.is_empty() {
            error!("no volumes found");
            return Ok(false);
        }
        if volumes.len() != state.internal.disk_ids.len() {
            error!("detected duplicate indices of Cinder volumes");
            return Ok(false);
        }

        let deadline = Instant::now() + Duration::from_secs(FINALIZE_DEADLINE_SECS);
        for vol in &volumes {
            info!(volume = %vol, "transferring volume");
            let mut available = false;
            while Instant::now() < deadline {
                let Some(status) = self.run_openstack(
                    request,
                    &["volume", "show", "-f", "value", "-c", "status", vol],
                    false,
                ) else {
                    error!("unable to get volume state, quitting");
                    return Ok(false);
                };
                let status = status.trim();
                info!(status, "current volume state");
                if status == "available" {
                    available = true;
                    break;
                }
                std::thread::sleep(Duration::from_secs(20));
            }
            if !available {
                error!(seconds = FINALIZE_DEADLINE_SECS, "volume did not become available for transfer in time");
                return Ok(false);
            }

            let Some(transfer_json) = self.run_openstack(
                request,
                &["volume", "transfer", "request", "create", "--format", "json", vol],
                false,
            ) else {
                error!("failed to transfer volume");
                return Ok(false);
            };
            let transfer: Value = serde_json::from_str(&transfer_json).context("failed to parse transfer JSON")?;
            let auth_key = transfer.get("auth_key").and_then(|v| v.as_str()).unwrap_or_default();
            let id = transfer.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            self.run_openstack(
                request,
                &["volume", "transfer", "request", "accept", "--auth-key", auth_key, id],
                true,
            );
        }

        let mut ports = Vec::new();
        for nic in &request.network_mappings {
            let mac = nic.mac_address.as_deref().unwrap_or_default();
            let port_name = format!("{}_port_{}", vm_name, ports.len());
            let mut port_cmd = vec![
                "port".to_string(), "create".to_string(), "--format".to_string(), "json".to_string(),
                "--network".to_string(), nic.destination.clone(),
                "--mac-address".to_string(), mac.to_string(),
                "--enable".to_string(),
            ];
            if let Some(ip) = &nic.ip_address {
                if self.ip_in_network(request, &nic.destination, ip) {
                    port_cmd.extend(["--fixed-ip".to_string(), format!("ip-address={}", ip)]);
                }
            }
            if let Some(Value::Array(groups)) = request.extra.get("osp_security_groups_ids") {
                for g in groups {
                    if let Some(g) = g.as_str() {
                        port_cmd.extend(["--security-group".to_string(), g.to_string()]);
                    }
                }
            }
            port_cmd.push(port_name);
            let port_cmd_refs: Vec<&str> = port_cmd.iter().map(String::as_str).collect();
            let Some(port_json) = self.run_openstack(request, &port_cmd_refs, true) else {
                error!("failed to create port");
                return Ok(false);
            };
            let port: Value = serde_json::from_str(&port_json).context("failed to parse port JSON")?;
            let port_id = port.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            info!(port_id, "created port");
            ports.push(port_id);
        }
        state.internal.ports = ports.clone();

        let mut server_cmd = vec![
            "server".to_string(), "create".to_string(), "--format".to_string(), "json".to_string(),
            "--flavor".to_string(), request.require_extra_str("osp_flavor_id")?.to_string(),
        ];
        if let Some(Value::Array(groups)) = request.extra.get("osp_security_groups_ids") {
            for g in groups {
                if let Some(g) = g.as_str() {
                    server_cmd.extend(["--security-group".to_string(), g.to_string()]);
                }
            }
        }
        server_cmd.extend(["--volume".to_string(), volumes[0].clone()]);
        for (i, vol) in volumes.iter().enumerate().skip(1) {
            let disk_name = openstack_disk_name((i + 1) as i64)?;
            server_cmd.extend(["--block-device-mapping".to_string(), format!("{}={}", disk_name, vol)]);
        }
        for port in &ports {
            server_cmd.extend(["--nic".to_string(), format!("port-id={}", port)]);
        }
        server_cmd.push(vm_name);
        let server_cmd_refs: Vec<&str> = server_cmd.iter().map(String::as_str).collect();

        let Some(vm_json) = self.run_openstack(request, &server_cmd_refs, true) else {
            error!("create VM failed");
            return Ok(false);
        };
        let vm: Value = serde_json::from_str(&vm_json).context("failed to parse server JSON")?;
        let vm_id = vm.get("id").and_then(|v| v.as_str()).map(str::to_string);
        state.snapshot_mut().vm_id = vm_id.clone();
        info!(vm_id = ?vm_id, "created OpenStack instance");
        Ok(true)
    }

    fn cleanup(&self, request: &Request, state: &mut StateStore) {
        let volumes: Vec<String> = state.internal.disk_ids.values().cloned().collect();
        let ports = state.internal.ports.clone();
        let Some(server_id) = request.extra_str("osp_server_id").map(str::to_string) else {
            warn!("no osp_server_id on request, skipping volume detach");
            return;
        };

        for v in &volumes {
            self.run_openstack(request, &["server", "remove", "volume", &server_id, v], false);
        }

        if let Some(transfers_json) =
            self.run_openstack(request, &["volume", "transfer", "request", "list", "--format", "json"], false)
        {
            if let Ok(Value::Array(transfers)) = serde_json::from_str(&transfers_json) {
                let ids: Vec<String> = transfers
                    .iter()
                    .filter(|t| {
                        t.get("Volume").and_then(|v| v.as_str()).map(|v| volumes.iter().any(|x| x == v)).unwrap_or(false)
                    })
                    .filter_map(|t| t.get("ID").and_then(|v| v.as_str()).map(str::to_string))
                    .collect();
                if !ids.is_empty() {
                    let mut cmd = vec!["volume".to_string(), "transfer".to_string(), "request".to_string(), "delete".to_string()];
                    cmd.extend(ids);
                    let cmd_refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
                    if self.run_openstack(request, &cmd_refs, false).is_none() {
                        error!("failed to remove transfer(s)");
                    }
                }
            } else {
                error!("failed to remove transfer(s)");
            }
        }

        if !ports.is_empty() {
            info!(?ports, "removing ports");
            let mut cmd = vec!["port".to_string(), "delete".to_string()];
            cmd.extend(ports);
            let cmd_refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
            if self.run_openstack(request, &cmd_refs, true).is_none() {
                error!("failed to remove port(s)");
            }
        }

        if !volumes.is_empty() {
            info!(?volumes, "removing volumes");
            let mut cmd = vec!["volume".to_string(), "delete".to_string()];
            cmd.extend(volumes.clone());
            let cmd_refs: Vec<&str> = cmd.iter().map(String::as_str).collect();
            if self.run_openstack(request, &cmd_refs, false).is_none() {
                error!("failed to remove volume(s) from current project");
            }
            if self.run_openstack(request, &cmd_refs, true).is_none() {
                error!("failed to remove volume(s) from destination project");
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

    fn check_install_drivers(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }
}

fn leak(s: &str) -> &'static str {
    Box::leak(s.to_string().into_boxed_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use v2v_core::request::{NetworkMapping, OutputFormat, Transport};

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

    fn valid_request() -> Request {
        let mut r = base_request();
        r.set_extra("osp_destination_project_id", serde_json::json!("proj"));
        r.set_extra("osp_environment", serde_json::json!({"OS_AUTH_URL": "http://keystone"}));
        r.set_extra("osp_flavor_id", serde_json::json!("flavor1"));
        r.set_extra("osp_security_groups_ids", serde_json::json!(["sg1"]));
        r.set_extra("osp_server_id", serde_json::json!("srv1"));
        r
    }

    #[test]
    fn test_validate_rejects_missing_required_keys() {
        let backend = OpenStackBackend::new();
        let mut r = base_request();
        assert!(matches!(backend.validate(&mut r), Err(RequestError::MissingField(_))));
    }

    #[test]
    fn test_validate_accepts_full_request_and_assigns_guest_id() {
        let backend = OpenStackBackend::new();
        let mut r = valid_request();
        backend.validate(&mut r).unwrap();
        assert!(r.extra_str("osp_guest_id").is_some());
        assert_eq!(r.extra_str("backend"), Some("direct"));
    }

    #[test]
    fn test_validate_rejects_network_mapping_without_mac() {
        let backend = OpenStackBackend::new();
        let mut r = valid_request();
        r.network_mappings.push(NetworkMapping {
            source: "src".to_string(),
            destination: "dst".to_string(),
            mac_address: None,
            ip_address: None,
        });
        assert!(matches!(
            backend.validate(&mut r),
            Err(RequestError::BadNetworkMapping { index: 0, field: "mac_address" })
        ));
    }

    #[test]
    fn test_validate_rejects_non_list_security_groups() {
        let backend = OpenStackBackend::new();
        let mut r = valid_request();
        r.set_extra("osp_security_groups_ids", serde_json::json!("sg1"));
        assert!(matches!(
            backend.validate(&mut r),
            Err(RequestError::InvalidValue { field: "osp_security_groups_ids", .. })
        ));
    }

    #[test]
    fn test_get_uid_gid_always_root() {
        let backend = OpenStackBackend::new();
        let r = valid_request();
        assert_eq!(backend.get_uid(&r), 0);
        assert_eq!(backend.get_gid(&r), 0);
    }
}
