use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use v2v_core::config::LOG_WAIT_SECS;
use v2v_core::state::{Disk, LastMessage, StateStore};

struct Patterns {
    copy_disk: Regex,
    disk_progress: Regex,
    nbdkit_disk_path: Regex,
    overlay_source: Regex,
    overlay_source2: Regex,
    vmdk_path: Regex,
    rhv_disk_uuid: Regex,
    rhv_vm_id: Regex,
    osp_volume_id: Regex,
    osp_volume_props: Regex,
    ssh_vmx_guest_name: Regex,
}

impl Patterns {
    fn new() -> Self {
        Patterns {
            copy_disk: Regex::new(r".*Copying disk (\d+)/(\d+) to.*").unwrap(),
            disk_progress: Regex::new(r"\s+\((\d+\.\d+)/100%\)").unwrap(),
            nbdkit_disk_path: Regex::new(r"nbdkit: debug: Opening file (.*) \(.*\)").unwrap(),
            overlay_source: Regex::new(r#" *overlay source qemu URI: json:.*"file\.path": ?"([^"]+)""#).unwrap(),
            overlay_source2: Regex::new(
                r#"libguestfs: parse_json: qemu-img info JSON output:.*"backing-filename".*\\"file\.path\\": ?\\"([^"]+)\\""#,
            )
            .unwrap(),
            vmdk_path: Regex::new(r"/vmfs/volumes/(?P<store>[^/]*)/(?P<vm>[^/]*)/(?P<disk>.*?)(-flat)?\.vmdk").unwrap(),
            rhv_disk_uuid: Regex::new(r"disk\.id = '(?P<uuid>[a-fA-F0-9-]*)'").unwrap(),
            rhv_vm_id: Regex::new(r"<VirtualSystem ovf:id='(?P<uuid>[a-fA-F0-9-]*)'>").unwrap(),
            osp_volume_id: Regex::new(r"openstack .*'?volume'? '?show'?.* '?(?P<uuid>[a-fA-F0-9-]*)'?$").unwrap(),
            osp_volume_props: Regex::new(
                r"openstack .*'?volume'? '?set.*'?--property'? '?virt_v2v_disk_index=(?P<volume>[0-9]+)/[0-9]+.* '?(?P<uuid>[a-fA-F0-9-]*)'?$",
            )
            .unwrap(),
            ssh_vmx_guest_name: Regex::new(r#"^displayName = "(.*)"$"#).unwrap(),
        }
    }

    /// Transform an ESX datastore path into `[<store>] <vm>/<disk>.vmdk`, as seen
    /// inside the overlay-source and libguestfs backing-filename log lines.
    fn transform_vmdk_path(&self, path: &str) -> Option<String> {
        let caps = self.vmdk_path.captures(path)?;
        Some(format!(
            "[{}] {}/{}.vmdk",
            &caps["store"], &caps["vm"], &caps["disk"]
        ))
    }
}

/// Tails the converter's text log and machine-readable (JSON-lines) log,
/// reconciling both into the State Store (SPEC_FULL.md §4.3).
pub struct OutputParser {
    v2v_log_path: PathBuf,
    mr_log_path: PathBuf,
    v2v_file: Option<BufReader<File>>,
    mr_file: Option<BufReader<File>>,
    current_disk: Option<usize>,
    current_path: Option<String>,
    patterns: Patterns,
}

impl OutputParser {
    /// Poll for up to `LOG_WAIT_SECS` for both log files to exist before opening them.
    pub fn open(v2v_log_path: impl Into<PathBuf>, mr_log_path: impl Into<PathBuf>) -> Result<Self> {
        let v2v_log_path = v2v_log_path.into();
        let mr_log_path = mr_log_path.into();

        wait_for_file(&v2v_log_path)?;
        wait_for_file(&mr_log_path)?;

        let v2v_file = BufReader::new(
            File::open(&v2v_log_path)
                .with_context(|| format!("failed to open {}", v2v_log_path.display()))?,
        );
        let mr_file = BufReader::new(
            File::open(&mr_log_path)
                .with_context(|| format!("failed to open {}", mr_log_path.display()))?,
        );

        Ok(OutputParser {
            v2v_log_path,
            mr_log_path,
            v2v_file: Some(v2v_file),
            mr_file: Some(mr_file),
            current_disk: None,
            current_path: None,
            patterns: Patterns::new(),
        })
    }

    /// Drain whatever content is currently buffered in both logs into `state`,
    /// in file order: the machine-readable log first (error surfacing), then the
    /// text log. Restartable: a later call resumes from where the last left off.
    pub fn parse(&mut self, state: &mut StateStore) -> Result<()> {
        self.parse_machine_readable(state)?;
        self.parse_text(state)?;
        Ok(())
    }

    fn parse_machine_readable(&mut self, state: &mut StateStore) -> Result<()> {
        let Some(file) = self.mr_file.as_mut() else { return Ok(()) };
        loop {
            let mut line = String::new();
            let n = file.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(trimmed) {
                Ok(value) => {
                    if value.get("type").and_then(|t| t.as_str()) == Some("error") {
                        let message = value
                            .get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown converter error")
                            .to_string();
                        surface_error(state, &message);
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        line = %trimmed,
                        log = %self.mr_log_path.display(),
                        "failed to parse machine-readable log line"
                    );
                }
            }
        }
        Ok(())
    }

    fn parse_text(&mut self, state: &mut StateStore) -> Result<()> {
        let Some(file) = self.v2v_file.as_mut() else { return Ok(()) };
        loop {
            let mut line = String::new();
            let n = file.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let line = line.trim_end_matches(['\n', '\r']);
            apply_line(&self.patterns, line, &mut self.current_disk, &mut self.current_path, state);
        }
        Ok(())
    }

    pub fn v2v_log_path(&self) -> &Path {
        &self.v2v_log_path
    }
}

fn wait_for_file(path: &Path) -> Result<()> {
    for _ in 0..LOG_WAIT_SECS {
        if path.exists() {
            return Ok(());
        }
        thread::sleep(Duration::from_secs(1));
    }
    if path.exists() {
        Ok(())
    } else {
        anyhow::bail!("log file {} did not appear within {}s", path.display(), LOG_WAIT_SECS)
    }
}

fn surface_error(state: &mut StateStore, message: &str) {
    warn!(message, "converter reported error");
    state.snapshot_mut().last_message = Some(LastMessage {
        message: message.to_string(),
        kind: "error".to_string(),
    });
}

fn apply_line(
    patterns: &Patterns,
    line: &str,
    current_disk: &mut Option<usize>,
    current_path: &mut Option<String>,
    state: &mut StateStore,
) {
    if let Some(caps) = patterns.copy_disk.captures(line) {
        let n: usize = caps[1].parse().unwrap_or(0);
        let m: u32 = caps[2].parse().unwrap_or(0);
        *current_disk = Some(n.saturating_sub(1));
        *current_path = None;
        state.snapshot_mut().disk_count = Some(m);
        if state.snapshot().disks.len() != m as usize {
            debug!(expected = m, actual = state.snapshot().disks.len(), "disk count mismatch");
        }
    }

    if let Some(caps) = patterns.nbdkit_disk_path.captures(line) {
        *current_path = Some(caps[1].to_string());
        locate_disk(current_disk, current_path, state);
    }

    if let Some(caps) = patterns.overlay_source.captures(line) {
        if let Some(p) = patterns.transform_vmdk_path(&caps[1]) {
            *current_path = Some(p);
            locate_disk(current_disk, current_path, state);
        }
    }

    if let Some(caps) = patterns.overlay_source2.captures(line) {
        if let Some(p) = patterns.transform_vmdk_path(&caps[1]) {
            *current_path = Some(p);
            locate_disk(current_disk, current_path, state);
        }
    }

    if let Some(caps) = patterns.disk_progress.captures(line) {
        if let (Some(disk), Some(_path)) = (*current_disk, current_path.as_ref()) {
            if let Ok(progress) = caps[1].parse::<f64>() {
                if let Some(entry) = state.snapshot_mut().disks.get_mut(disk) {
                    entry.progress = progress;
                }
            }
        }
    }

    if let Some(caps) = patterns.rhv_disk_uuid.captures(line) {
        if let Some(path) = current_path.clone() {
            state.internal.disk_ids.insert(path, caps["uuid"].to_string());
        }
    }

    if let Some(caps) = patterns.rhv_vm_id.captures(line) {
        state.snapshot_mut().vm_id = Some(caps["uuid"].to_string());
    }

    if let Some(caps) = patterns.osp_volume_id.captures(line) {
        // 1-based: matches the `virt_v2v_disk_index=K/M` values `osp_volume_props` checks below.
        let next_key = (state.internal.disk_ids.len() + 1).to_string();
        state.internal.disk_ids.insert(next_key, caps["uuid"].to_string());
    }

    if let Some(caps) = patterns.osp_volume_props.captures(line) {
        if let Some(existing) = state.internal.disk_ids.get(&caps["volume"]) {
            if existing != &caps["uuid"] {
                warn!(
                    volume = &caps["volume"],
                    expected = existing.as_str(),
                    got = &caps["uuid"],
                    "openstack volume index/uuid mismatch"
                );
            }
        }
    }

    if let Some(caps) = patterns.ssh_vmx_guest_name.captures(line) {
        state.internal.display_name = Some(caps[1].to_string());
    }
}

/// Locate Disk algorithm (§4.3). Precondition: `current_disk` is set.
fn locate_disk(current_disk: &Option<usize>, current_path: &Option<String>, state: &mut StateStore) {
    let (Some(current), Some(path)) = (*current_disk, current_path.clone()) else {
        return;
    };
    let disks = &mut state.snapshot_mut().disks;

    if let Some(found) = disks.iter().skip(current).position(|d| d.path == path) {
        let j = current + found;
        if j == current {
            return;
        }
        let entry = disks.remove(j);
        disks.insert(current, entry);
        return;
    }

    disks.insert(current, Disk { path, progress: 0.0 });
}
