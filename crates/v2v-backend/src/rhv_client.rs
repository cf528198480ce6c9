//! Minimal REST client for the oVirt/RHV engine (§9 "External SDKs for target
//! platforms"). Grounded on `VDSMHost.sdk_connection` and the handful of
//! `ovirtsdk4` service calls `VDSMHost` actually makes: the SDK connection
//! itself is replaced with a lazily built `reqwest::blocking::Client` (same
//! post-fork-safe construction as `inpod.rs`'s `K8sCommunicator`), and each
//! SDK service call becomes one REST request against the matching endpoint.
//! Responses are walked as `serde_json::Value` rather than deserialized into
//! full SDK-shaped structs, since each caller only ever needs one or two
//! fields off of them.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::debug;

use v2v_core::request::Request;

pub struct RhvClient {
    base_url: String,
    username: String,
    password: String,
    ca_cert: PathBuf,
    insecure: bool,
}

impl RhvClient {
    /// Builds a client from the same `rhv_*` fields `validate` already
    /// required to be present, so this never fails once `validate` passed.
    pub fn from_request(request: &Request) -> Result<Self> {
        let rhv_url = request.require_extra_str("rhv_url").map_err(anyhow::Error::from)?;
        let username = request
            .extra_str("rhv_url")
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| if u.username().is_empty() { None } else { Some(u.username().to_string()) })
            .unwrap_or_else(|| "admin@internal".to_string());
        let password = request.require_extra_str("rhv_password").map_err(anyhow::Error::from)?;
        let cafile = request.require_extra_str("rhv_cafile").map_err(anyhow::Error::from)?;
        Ok(RhvClient {
            base_url: rhv_url.trim_end_matches('/').to_string(),
            username,
            password: password.to_string(),
            ca_cert: PathBuf::from(cafile),
            insecure: request.extra_bool("insecure_connection").unwrap_or(false),
        })
    }

    fn client(&self) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder();
        if self.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        } else {
            let cert_pem = std::fs::read(&self.ca_cert)
                .with_context(|| format!("failed to read CA cert {}", self.ca_cert.display()))?;
            let cert = reqwest::Certificate::from_pem(&cert_pem).context("failed to parse RHV CA cert")?;
            builder = builder.add_root_certificate(cert);
        }
        builder.build().context("failed to build RHV API client")
    }

    fn get(&self, path: &str) -> Result<Value> {
        let resp = self.get_raw(path)?;
        let resp = resp.error_for_status().context("oVirt API returned an error status")?;
        resp.json().context("failed to parse oVirt API JSON response")
    }

    /// Like `get`, but returns `None` for a 404 instead of an error, for
    /// callers that treat "not found" as a legitimate outcome.
    fn get_optional(&self, path: &str) -> Result<Option<Value>> {
        let resp = self.get_raw(path)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().context("oVirt API returned an error status")?;
        Ok(Some(resp.json().context("failed to parse oVirt API JSON response")?))
    }

    fn get_raw(&self, path: &str) -> Result<reqwest::blocking::Response> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "GET oVirt API");
        self.client()?
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json")
            .send()
            .context("GET to oVirt API failed")
    }

    fn delete(&self, path: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "DELETE oVirt API");
        self.client()?
            .delete(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .context("DELETE to oVirt API failed")?
            .error_for_status()
            .context("oVirt API returned an error status")?;
        Ok(())
    }

    fn post(&self, path: &str) -> Result<()> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(url = %url, "POST oVirt API");
        self.client()?
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Length", "0")
            .send()
            .context("POST to oVirt API failed")?
            .error_for_status()
            .context("oVirt API returned an error status")?;
        Ok(())
    }

    /// `storage_domains_service().list(search='name="..."')`.
    pub fn find_storage_domain(&self, name: &str) -> Result<StorageDomain> {
        let search = format!("name=\"{}\"", name);
        let body = self.get(&format!("storagedomains?search={}", urlencoding_encode(&search)))?;
        let domains = body
            .get("storage_domain")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if domains.len() != 1 {
            bail!("found {} domains matching \"{}\"", domains.len(), name);
        }
        let domain = &domains[0];
        Ok(StorageDomain {
            id: domain.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            storage_type: domain
                .get("storage")
                .and_then(|s| s.get("type"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    /// `image_transfers_service().list()`, filtered by the caller.
    pub fn list_transfers(&self) -> Result<Vec<ImageTransfer>> {
        let body = self.get("imagetransfers")?;
        let transfers = body
            .get("image_transfer")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(transfers
            .iter()
            .filter_map(|t| {
                let id = t.get("id").and_then(|v| v.as_str())?.to_string();
                let image_id = t.get("image").and_then(|i| i.get("id")).and_then(|v| v.as_str())?.to_string();
                Some(ImageTransfer { id, image_id })
            })
            .collect())
    }

    /// `image_transfers_service().image_transfer_service(id).cancel()`.
    pub fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        self.post(&format!("imagetransfers/{}/cancel", transfer_id))
    }

    /// `disks_service().disk_service(id).get()`, returning `None` for a 404
    /// (the disk was already removed).
    pub fn get_disk_status(&self, disk_id: &str) -> Result<Option<String>> {
        let body = self.get_optional(&format!("disks/{}", disk_id))?;
        Ok(body.and_then(|b| b.get("status").and_then(|v| v.as_str()).map(str::to_string)))
    }

    /// `disks_service().disk_service(id).remove()`.
    pub fn remove_disk(&self, disk_id: &str) -> Result<()> {
        self.delete(&format!("disks/{}", disk_id))
    }
}

pub struct StorageDomain {
    #[allow(dead_code)]
    pub id: String,
    pub storage_type: Option<String>,
}

pub struct ImageTransfer {
    pub id: String,
    pub image_id: String,
}

fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
