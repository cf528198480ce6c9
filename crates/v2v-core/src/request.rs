//! The inbound conversion request (§3 "Request").
//!
//! Back-end-specific keys (`export_domain`, `rhv_url`, `osp_environment`, ...) vary
//! per target and are numerous enough that giving each its own struct field would
//! just re-implement a map with extra steps; they live in `extra` and each back-end
//! reads/writes the keys it owns through the typed helpers on `Request`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Vddk,
    Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Raw,
    Qcow2,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocation {
    Sparse,
    Preallocated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMapping {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Throttling {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub vm_name: String,
    pub transport_method: Transport,

    #[serde(default)]
    pub vmware_password: Option<String>,
    #[serde(default)]
    pub vmware_fingerprint: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,

    #[serde(default)]
    pub network_mappings: Vec<NetworkMapping>,

    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub allocation: Option<Allocation>,
    #[serde(default)]
    pub install_drivers: Option<bool>,
    #[serde(default)]
    pub virtio_win: Option<String>,
    #[serde(default)]
    pub throttling: Option<Throttling>,
    #[serde(default = "default_daemonize")]
    pub daemonize: bool,
    #[serde(default)]
    pub source_disks: Vec<String>,
    #[serde(default)]
    pub luks_keys_vault: Option<String>,
    /// Filled in by the Secret Materializer: `{device, filename}` pairs for materialized
    /// LUKS keys (§4.2 "Extra policy for LUKS vault").
    #[serde(default)]
    pub luks_keys_files: Vec<LuksKeyFile>,

    /// Back-end-specific fields, keyed exactly as the request JSON spells them
    /// (`export_domain`, `rhv_url`, `osp_environment`, ...).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_daemonize() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LuksKeyFile {
    pub device: String,
    pub filename: String,
}

impl Request {
    pub fn extra_str(&self, key: &'static str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    pub fn require_extra_str(&self, key: &'static str) -> Result<&str, RequestError> {
        self.extra_str(key).ok_or(RequestError::MissingField(key))
    }

    pub fn set_extra(&mut self, key: &str, value: serde_json::Value) {
        self.extra.insert(key.to_string(), value);
    }

    pub fn extra_bool(&self, key: &'static str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }

    /// Generic request validation performed by the Run Controller's `VALIDATED`
    /// phase, before any back-end-specific validation (§4.7).
    pub fn validate_generic(&self) -> Result<(), RequestError> {
        if self.vm_name.trim().is_empty() {
            return Err(RequestError::MissingField("vm_name"));
        }

        match self.transport_method {
            Transport::Vddk => {
                if self.extra_str("vmware_uri").is_none() {
                    return Err(RequestError::MissingField("vmware_uri"));
                }
                if self.vmware_password.is_none() {
                    return Err(RequestError::MissingField("vmware_password"));
                }
            }
            Transport::Ssh => {
                if self.extra_str("vmware_uri").is_none() {
                    return Err(RequestError::MissingField("vmware_uri"));
                }
            }
        }

        for (i, m) in self.network_mappings.iter().enumerate() {
            if m.source.trim().is_empty() {
                return Err(RequestError::BadNetworkMapping { index: i, field: "source" });
            }
            if m.destination.trim().is_empty() {
                return Err(RequestError::BadNetworkMapping { index: i, field: "destination" });
            }
        }

        let target_selectors = [
            self.extra.contains_key("export_domain"),
            self.extra.contains_key("rhv_url"),
            self.extra.contains_key("osp_environment"),
        ];
        let present = target_selectors.iter().filter(|b| **b).count();
        if present > 1 {
            return Err(RequestError::AmbiguousTarget { found: present });
        }
        // The in-pod back-end is selected by the *absence* of any selector, but only
        // when daemonize=false; a daemonized run with no selector has nothing to
        // detect (§4.6 detect()).
        if present == 0 && self.daemonize {
            return Err(RequestError::NoTargetSelected);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> Request {
        let mut extra = HashMap::new();
        extra.insert("vmware_uri".to_string(), serde_json::json!("esx://host/vm"));
        Request {
            vm_name: "my-vm".to_string(),
            transport_method: Transport::Vddk,
            vmware_password: Some("secret".to_string()),
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
            extra,
        }
    }

    #[test]
    fn test_validate_generic_accepts_minimal_request() {
        assert!(base_request().validate_generic().is_ok());
    }

    #[test]
    fn test_validate_generic_rejects_empty_vm_name() {
        let mut r = base_request();
        r.vm_name = "  ".to_string();
        assert!(matches!(
            r.validate_generic(),
            Err(RequestError::MissingField("vm_name"))
        ));
    }

    #[test]
    fn test_validate_generic_rejects_vddk_without_password() {
        let mut r = base_request();
        r.vmware_password = None;
        assert!(matches!(
            r.validate_generic(),
            Err(RequestError::MissingField("vmware_password"))
        ));
    }

    #[test]
    fn test_validate_generic_rejects_ambiguous_target() {
        let mut r = base_request();
        r.set_extra("export_domain", serde_json::json!("/mnt/export"));
        r.set_extra("rhv_url", serde_json::json!("https://engine/ovirt-engine/api"));
        assert!(matches!(
            r.validate_generic(),
            Err(RequestError::AmbiguousTarget { found: 2 })
        ));
    }

    #[test]
    fn test_validate_generic_rejects_no_target_when_daemonized() {
        let mut r = base_request();
        r.daemonize = true;
        assert!(matches!(r.validate_generic(), Err(RequestError::NoTargetSelected)));
    }

    #[test]
    fn test_validate_generic_accepts_no_target_when_not_daemonized() {
        let r = base_request();
        assert!(!r.daemonize);
        assert!(r.validate_generic().is_ok());
    }

    #[test]
    fn test_validate_generic_rejects_bad_network_mapping() {
        let mut r = base_request();
        r.network_mappings.push(NetworkMapping {
            source: "".to_string(),
            destination: "dest-net".to_string(),
            mac_address: None,
            ip_address: None,
        });
        assert!(matches!(
            r.validate_generic(),
            Err(RequestError::BadNetworkMapping { index: 0, field: "source" })
        ));
    }

    #[test]
    fn test_request_json_roundtrip_preserves_extra() {
        let json = serde_json::json!({
            "vm_name": "my-vm",
            "transport_method": "vddk",
            "vmware_uri": "esx://host/vm",
            "vmware_password": "secret",
            "rhv_url": "https://engine/ovirt-engine/api",
            "rhv_cluster": "Default",
        });
        let req: Request = serde_json::from_value(json).unwrap();
        assert_eq!(req.extra_str("rhv_cluster"), Some("Default"));
        assert_eq!(req.extra_str("rhv_url"), Some("https://engine/ovirt-engine/api"));
    }
}
