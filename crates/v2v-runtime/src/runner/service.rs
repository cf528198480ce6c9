use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::warn;

use v2v_core::config::{UNIT_PID_POLL_INTERVAL_SECS, UNIT_PID_POLL_SECS};
use v2v_core::retry::poll_until;
use v2v_throttle::TcController;

use super::Runner;

/// Launches the converter as an ephemeral systemd-run unit under the
/// configured uid/gid, placed in the per-run net_cls cgroup via `cgexec` so
/// the Traffic-Control Controller can throttle its egress (§4.4
/// "Service-manager variant").
pub struct ServiceRunner {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    log_path: PathBuf,
    uid: u32,
    gid: u32,
    tag: String,
    unit_name: Option<String>,
    pid: Option<u32>,
    return_code: Option<i32>,
    tc: Option<TcController>,
}

impl ServiceRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        log_path: PathBuf,
        uid: u32,
        gid: u32,
        tag: impl Into<String>,
    ) -> Self {
        ServiceRunner {
            program: program.into(),
            args,
            env,
            log_path,
            uid,
            gid,
            tag: tag.into(),
            unit_name: None,
            pid: None,
            return_code: None,
            tc: None,
        }
    }

    fn systemd_property(&self, name: &str) -> Option<String> {
        let unit = self.unit_name.as_ref()?;
        let output = Command::new("systemctl")
            .args(["show", "-p", name, "--value", unit])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }
}

impl Runner for ServiceRunner {
    fn run(&mut self) -> Result<()> {
        let tc = TcController::new(&self.tag, self.uid, self.gid).context("failed to prepare traffic control")?;
        let cgroup_name = v2v_throttle::relative_cgroup_name(&self.tag);

        let exec_line = format!(
            "exec \"$0\" \"$@\" > \"{}\" 2>&1",
            self.log_path.display()
        );

        let mut unit_args = vec![
            "--description=virt-v2v conversion".to_string(),
            format!("--uid={}", self.uid),
            format!("--gid={}", self.gid),
        ];
        for (k, v) in &self.env {
            unit_args.push(format!("--setenv={}={}", k, v));
        }
        unit_args.push("cgexec".to_string());
        unit_args.push("-g".to_string());
        unit_args.push(format!("net_cls:{}", cgroup_name));
        unit_args.push("/bin/sh".to_string());
        unit_args.push("-c".to_string());
        unit_args.push(exec_line);
        unit_args.push(self.program.clone());
        unit_args.extend(self.args.iter().cloned());

        let output = Command::new("systemd-run")
            .args(&unit_args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .output()
            .context("failed to invoke systemd-run")?;

        let run_output = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let unit_re = Regex::new(r"\b(run-r?[0-9a-f]+\.service)\b").unwrap();
        let unit_name = unit_re
            .captures(&run_output)
            .map(|c| c[1].to_string())
            .context("could not find unit name in systemd-run output")?;
        self.unit_name = Some(unit_name);
        self.tc = Some(tc);

        let pid = poll_until(
            Duration::from_secs(UNIT_PID_POLL_SECS),
            Duration::from_secs(UNIT_PID_POLL_INTERVAL_SECS),
            "wait for unit main pid",
            || self.systemd_property("ExecMainPID"),
        )
        .context("unit main PID never populated")?;
        self.pid = Some(pid.parse().context("unit reported a non-numeric main PID")?);

        Ok(())
    }

    fn is_running(&mut self) -> bool {
        let Some(unit) = self.unit_name.as_ref() else { return false };
        let active = Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);

        if !active {
            self.return_code = self
                .systemd_property("ExecMainStatus")
                .and_then(|s| s.parse().ok())
                .or(Some(-1));
            if self.return_code != Some(0) {
                if let Some(unit) = self.unit_name.clone() {
                    if let Err(e) = Command::new("systemctl").args(["reset-failed", &unit]).status() {
                        warn!(unit, error = %e, "failed to reset-failed unit");
                    }
                }
            }
        }
        active
    }

    fn kill(&mut self) {
        if let Some(unit) = &self.unit_name {
            let _ = Command::new("systemctl").args(["kill", unit]).status();
        }
    }

    fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn set_network_limit(&self, limit: Option<u64>) -> Result<()> {
        if let Some(tc) = &self.tc {
            tc.set_limit(limit)
        } else {
            Ok(())
        }
    }

    fn set_cpu_quota(&self, quota: &str) -> Result<()> {
        let unit = self.unit_name.as_ref().context("no unit to set CPUQuota on")?;
        let status = Command::new("systemctl")
            .args(["set-property", unit, &format!("CPUQuota={}", quota)])
            .status()
            .context("failed to run systemctl set-property")?;
        if !status.success() {
            anyhow::bail!("systemctl set-property exited with {}", status);
        }
        Ok(())
    }

    fn supports_throttling(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name_regex_matches_documented_forms() {
        let re = Regex::new(r"\b(run-r?[0-9a-f]+\.service)\b").unwrap();
        assert_eq!(&re.captures("Running as unit: run-abc123.service").unwrap()[1], "run-abc123.service");
        assert_eq!(&re.captures("Running as unit: run-rdeadbeef.service").unwrap()[1], "run-rdeadbeef.service");
    }
}
