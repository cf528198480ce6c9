//! The Run Controller (§4.7): the top-level state machine threading every
//! other component together for one conversion run.
//!
//! `INIT`/`VALIDATED` happen in `main` (request parsing, `validate_generic`,
//! `check_install_drivers`, `Backend::validate` — all of which can fail with
//! a `RequestError` and must exit 1 before any side effect). Everything from
//! `SECRETS_WRITTEN` onward lives here and reports failure as exit 2 (§6).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use v2v_core::config::{state_dir, POLL_INTERVAL_SECS};
use v2v_core::naming::run_tag;
use v2v_core::request::{Request, Transport};
use v2v_core::state::{Disk, StateStore};
use v2v_runtime::runner::Runner;
use v2v_runtime::ssh_agent::{spawn_ssh_agent, SshAgent};
use v2v_runtime::{daemon, secrets};

use v2v_backend::Backend;
use v2v_logparser::OutputParser;

use crate::logging::{self, LogFormat};

/// Run a fully validated request to completion. Returns the process exit
/// code: 0 on success, 2 if the converter or any supervisor phase failed.
pub fn run(mut request: Request, backend: Box<dyn Backend>) -> Result<i32> {
    let uid = backend.get_uid(&request);
    let gid = backend.get_gid(&request);
    let tag = run_tag(chrono::Utc::now(), std::process::id());

    let base = PathBuf::from(state_dir());
    let v2v_log = base.join(format!("v2v-import-{tag}.log"));
    let mr_log = base.join(format!("v2v-import-{tag}-mr.log"));
    let wrapper_log = base.join(format!("v2v-import-{tag}-wrapper.log"));
    let state_file = base.join(format!("v2v-import-{tag}.state"));
    let throttling_file = base.join(format!("v2v-import-{tag}.throttle"));

    let mut password_files = Vec::new();
    let ssh_key_file = write_secrets(&mut request, uid, gid, &mut password_files)?;

    let mut state = StateStore::new(state_file.clone());
    state.internal.v2v_log = Some(v2v_log.clone());
    state.internal.machine_readable_log = Some(mr_log.clone());
    state.internal.throttling_file = Some(throttling_file.clone());
    for path in &request.source_disks {
        state.snapshot_mut().disks.push(Disk { path: path.clone(), progress: 0.0 });
    }
    if !request.source_disks.is_empty() {
        state.snapshot_mut().disk_count = Some(request.source_disks.len() as u32);
    }
    state.write().context("failed to create initial state file")?;

    // §6: exactly one JSON object on stdout, before daemonization.
    println!(
        "{}",
        serde_json::json!({
            "v2v_log": v2v_log.to_string_lossy(),
            "wrapper_log": wrapper_log.to_string_lossy(),
            "state_file": state_file.to_string_lossy(),
            "throttling_file": throttling_file.to_string_lossy(),
        })
    );

    let format = if request.daemonize { LogFormat::Json } else { LogFormat::Human };
    let _log_guard = logging::init(format, Some(&wrapper_log)).context("failed to initialize logging")?;

    info!(uid, gid, daemonize = request.daemonize, "starting conversion");

    if request.daemonize {
        info!("daemonizing");
        daemon::daemonize().context("failed to daemonize")?;
    } else {
        info!("staying in foreground as requested");
    }

    let agent = spawn_agent_if_needed(&request, uid, gid, ssh_key_file.as_deref())?;

    let (base_args, mut base_env) = prepare_base_command(&request, &mr_log);
    if let Some(agent) = &agent {
        base_env.insert("SSH_AUTH_SOCK".to_string(), agent.auth_sock.clone());
    }
    let (args, env) = backend.build_args(&request, base_args, base_env)?;

    info!(
        args = ?v2v_runtime::shell::redact_args(&args),
        env = ?v2v_runtime::shell::redact_env(&env),
        "starting converter"
    );

    let mut runner = backend.create_runner(args, env, v2v_log.clone(), uid, gid, &tag, request.daemonize);

    let run_result = run_and_monitor(&request, &*backend, runner.as_mut(), &mut state, &v2v_log, &mr_log, &throttling_file);

    if let Some(agent) = agent {
        agent.kill();
    }

    if let Err(e) = run_result {
        warn!(error = %e, "error while monitoring converter");
        state.snapshot_mut().failed = true;
        runner.kill();
    }

    state.snapshot_mut().return_code = runner.return_code();
    if state.snapshot().return_code != Some(0) {
        state.snapshot_mut().failed = true;
    }
    state.write().context("failed to persist post-run state")?;

    if !state.snapshot().failed {
        match backend.finalize(&request, &mut state) {
            Ok(true) => {}
            Ok(false) => state.snapshot_mut().failed = true,
            Err(e) => {
                warn!(error = %e, "finalize failed");
                state.snapshot_mut().failed = true;
            }
        }
    }

    if state.snapshot().failed {
        info!("cleanup phase");
        backend.cleanup(&request, &mut state);
    }

    info!("removing password files");
    for path in &password_files {
        secrets::remove_secret(path);
    }

    state.snapshot_mut().finished = true;
    state.write().context("failed to persist final state")?;

    info!(failed = state.snapshot().failed, "finished");
    Ok(if state.snapshot().failed { 2 } else { 0 })
}

/// Writes every password/key secret the request carries to owner-restricted
/// files, records `password_files` for later cleanup, and returns the
/// ssh-agent key file path (if an `ssh_key` was given) for the caller to pass
/// on to `spawn_agent_if_needed`.
fn write_secrets(request: &mut Request, uid: u32, gid: u32, password_files: &mut Vec<PathBuf>) -> Result<Option<String>> {
    info!("writing password file(s)");

    if let Some(pw) = request.vmware_password.clone() {
        let path = secrets::write_secret(&pw, uid, gid).context("failed to write vmware password file")?;
        request.set_extra("vmware_password_file", serde_json::json!(path.to_string_lossy()));
        password_files.push(path);
    }
    if let Some(pw) = request.extra_str("rhv_password").map(str::to_string) {
        let path = secrets::write_secret(&pw, uid, gid).context("failed to write rhv password file")?;
        request.set_extra("rhv_password_file", serde_json::json!(path.to_string_lossy()));
        password_files.push(path);
    }
    let ssh_key_file = if let Some(key) = request.ssh_key.clone() {
        let path = secrets::write_secret(&key, uid, gid).context("failed to write ssh key file")?;
        password_files.push(path.clone());
        Some(path.to_string_lossy().to_string())
    } else {
        None
    };

    let vault_path = request
        .luks_keys_vault
        .clone()
        .or_else(|| std::env::var("HOME").ok().map(|home| format!("{home}/.v2v_luks_keys_vault.json")))
        .context("no HOME set and no luks_keys_vault given")?;
    if Path::new(&vault_path).exists() {
        let files = secrets::materialize_luks_vault(Path::new(&vault_path), &request.vm_name, uid, gid)
            .context("failed to materialize luks keys vault")?;
        for f in &files {
            password_files.push(PathBuf::from(&f.filename));
        }
        request.luks_keys_files = files;
    }

    Ok(ssh_key_file)
}

fn spawn_agent_if_needed(request: &Request, uid: u32, gid: u32, key_file: Option<&str>) -> Result<Option<SshAgent>> {
    if request.transport_method != Transport::Ssh {
        return Ok(None);
    }
    match spawn_ssh_agent(uid, gid, key_file) {
        Some(agent) => Ok(Some(agent)),
        None => anyhow::bail!("failed to start ssh-agent"),
    }
}

/// Grounded on `prepare_command` in the original wrapper: the transport- and
/// network-mapping-derived base arguments/environment, before the back-end
/// appends its own target-specific ones.
fn prepare_base_command(request: &Request, mr_log: &Path) -> (Vec<String>, HashMap<String, String>) {
    let mut args = vec![
        "-v".to_string(),
        "-x".to_string(),
        request.vm_name.clone(),
        "--root".to_string(),
        "first".to_string(),
        format!("--machine-readable=file:{}", mr_log.display()),
    ];

    match request.transport_method {
        Transport::Vddk => {
            args.extend([
                "-i".to_string(),
                "libvirt".to_string(),
                "-ic".to_string(),
                request.extra_str("vmware_uri").unwrap_or_default().to_string(),
                "-it".to_string(),
                "vddk".to_string(),
                "-io".to_string(),
                "vddk-libdir=/opt/vmware-vix-disklib-distrib".to_string(),
                "-io".to_string(),
                format!("vddk-thumbprint={}", request.vmware_fingerprint.as_deref().unwrap_or_default()),
                "--password-file".to_string(),
                request.extra_str("vmware_password_file").unwrap_or_default().to_string(),
            ]);
        }
        Transport::Ssh => {
            args.extend(["-i".to_string(), "vmx".to_string(), "-it".to_string(), "ssh".to_string()]);
        }
    }

    // Every virt-v2v in the pack's supported range understands --mac; the
    // original's capability probe (`virt-v2v --machine-readable`) gating this
    // is not reproduced here (see DESIGN.md).
    for mapping in &request.network_mappings {
        if let Some(mac) = &mapping.mac_address {
            args.extend(["--mac".to_string(), format!("{}:bridge:{}", mac, mapping.destination)]);
        } else {
            args.extend(["--bridge".to_string(), format!("{}:{}", mapping.source, mapping.destination)]);
        }
    }

    for key in &request.luks_keys_files {
        args.extend(["--key".to_string(), format!("{}:file:{}", key.device, key.filename)]);
    }

    let mut env = HashMap::new();
    env.insert("LANG".to_string(), "C".to_string());
    if let Some(backend_name) = request.extra_str("backend") {
        env.insert("LIBGUESTFS_BACKEND".to_string(), backend_name.to_string());
    }
    if let Some(virtio_win) = &request.virtio_win {
        env.insert("VIRTIO_WIN".to_string(), virtio_win.clone());
    }

    (args, env)
}

#[allow(clippy::too_many_arguments)]
fn run_and_monitor(
    request: &Request,
    backend: &dyn Backend,
    runner: &mut dyn Runner,
    state: &mut StateStore,
    v2v_log: &Path,
    mr_log: &Path,
    throttling_file: &Path,
) -> Result<()> {
    runner.run().context("failed to start converter")?;
    state.snapshot_mut().pid = runner.pid().map(|p| p as i32);
    state.snapshot_mut().started = true;
    state.write()?;

    if let Some(throttling) = &request.throttling {
        apply_throttling(runner, &serde_json::to_value(throttling)?, state);
    }

    let mut parser = OutputParser::open(v2v_log, mr_log).context("converter logs never appeared")?;

    while runner.is_running() {
        parser.parse(state)?;
        state.write()?;
        backend.update_progress(request, state)?;
        apply_throttling_dropfile(runner, throttling_file, state);
        thread::sleep(Duration::from_secs(POLL_INTERVAL_SECS));
    }
    info!(return_code = ?runner.return_code(), "converter terminated");
    parser.parse(state)?;

    Ok(())
}

fn apply_throttling_dropfile(runner: &dyn Runner, throttling_file: &Path, state: &mut StateStore) {
    let payload = match std::fs::read_to_string(throttling_file) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(error = %e, "failed to read throttling file");
            return;
        }
    };
    let _ = std::fs::remove_file(throttling_file);

    match serde_json::from_str::<Value>(&payload) {
        Ok(value) => {
            info!("fetched updated throttling info from file");
            apply_throttling(runner, &value, state);
        }
        Err(e) => warn!(error = %e, "failed to parse throttling file"),
    }
}

fn apply_throttling(runner: &dyn Runner, payload: &Value, state: &mut StateStore) {
    let Some(obj) = payload.as_object() else { return };
    for (key, value) in obj {
        match key.as_str() {
            "cpu" => apply_cpu_limit(runner, value, state),
            "network" => apply_network_limit(runner, value, state),
            other => warn!(key = other, "ignoring unknown throttling request"),
        }
    }
    info!(throttling = ?state.snapshot().throttling, "new throttling setup");
}

fn cpu_digits(s: &str) -> Option<&str> {
    let core = s.strip_suffix('%').unwrap_or(s);
    (!core.is_empty() && core.chars().all(|c| c == '+' || c.is_ascii_digit())).then_some(core)
}

fn apply_cpu_limit(runner: &dyn Runner, value: &Value, state: &mut StateStore) {
    if !runner.supports_throttling() {
        warn!("runner does not support throttling, ignoring CPU limit request");
        return;
    }
    let (display, set_val): (Option<String>, String) = match value {
        Value::Null => (None, String::new()),
        Value::String(s) if s == "unlimited" => (None, String::new()),
        Value::String(s) => match cpu_digits(s) {
            Some(digits) => (Some(format!("{digits}%")), format!("{digits}%")),
            None => {
                warn!(value = %s, "failed to parse value for CPU limit");
                return;
            }
        },
        other => {
            warn!(value = ?other, "failed to parse value for CPU limit");
            return;
        }
    };
    if runner.set_cpu_quota(&set_val).is_ok() {
        state.snapshot_mut().throttling.cpu = display;
    } else {
        warn!(set_val = %set_val, "failed to set CPU limit");
    }
}

fn apply_network_limit(runner: &dyn Runner, value: &Value, state: &mut StateStore) {
    if !runner.supports_throttling() {
        warn!("runner does not support throttling, ignoring network limit request");
        return;
    }
    let limit: Option<u64> = match value {
        Value::Null => None,
        Value::String(s) if s == "unlimited" => None,
        Value::String(s) => {
            let core = s.strip_prefix('+').unwrap_or(s);
            if !core.is_empty() && core.chars().all(|c| c.is_ascii_digit()) {
                match core.parse() {
                    Ok(n) => Some(n),
                    Err(_) => {
                        warn!(value = %s, "failed to parse value for network limit");
                        return;
                    }
                }
            } else {
                warn!(value = %s, "failed to parse value for network limit");
                return;
            }
        }
        other => {
            warn!(value = ?other, "failed to parse value for network limit");
            return;
        }
    };
    if runner.set_network_limit(limit).is_ok() {
        state.snapshot_mut().throttling.network = limit.map(|n| n.to_string());
    } else {
        warn!(?limit, "failed to set network limit");
    }
}

#[cfg(test)]
mod throttling_gate_tests {
    use super::*;
    use v2v_runtime::runner::DirectRunner;

    fn state() -> StateStore {
        StateStore::new(PathBuf::from("/tmp/does-not-matter.json"))
    }

    #[test]
    fn test_apply_cpu_limit_skips_unsupported_runner() {
        let runner = DirectRunner::new("true", vec![], HashMap::new(), PathBuf::from("/tmp/log"));
        assert!(!runner.supports_throttling());
        let mut st = state();
        apply_cpu_limit(&runner, &Value::String("50%".to_string()), &mut st);
        assert_eq!(st.snapshot().throttling.cpu, None);
    }

    #[test]
    fn test_apply_network_limit_skips_unsupported_runner() {
        let runner = DirectRunner::new("true", vec![], HashMap::new(), PathBuf::from("/tmp/log"));
        let mut st = state();
        apply_network_limit(&runner, &Value::String("1000".to_string()), &mut st);
        assert_eq!(st.snapshot().throttling.network, None);
    }
}
