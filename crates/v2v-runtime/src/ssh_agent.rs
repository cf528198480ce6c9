//! Spawns an `ssh-agent` under the converter's uid/gid for the `ssh` transport
//! (§4.7 `SSH_AGENT_READY?`). Grounded on the original `spawn_ssh_agent`: launch
//! via `setpriv`, scrape `SSH_AUTH_SOCK=` and the agent pid from its stdout,
//! then `ssh-add` the configured key (or the user's defaults).

use std::process::Command;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use regex::Regex;
use tracing::warn;

pub struct SshAgent {
    pub pid: u32,
    pub auth_sock: String,
}

impl SshAgent {
    pub fn kill(&self) {
        if let Err(e) = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            warn!(pid = self.pid, error = %e, "failed to kill ssh-agent");
        }
    }
}

/// Spawn an agent as (uid, gid), then add `key_file` (or ssh-add's defaults if
/// `None`). Returns `None` on any failure, matching the original's
/// fail-soft behavior — an agent failure downgrades the run to no ssh-agent
/// rather than aborting it.
pub fn spawn_ssh_agent(uid: u32, gid: u32, key_file: Option<&str>) -> Option<SshAgent> {
    match try_spawn(uid, gid, key_file) {
        Ok(agent) => Some(agent),
        Err(e) => {
            warn!(error = %e, "failed to spawn ssh-agent");
            None
        }
    }
}

fn try_spawn(uid: u32, gid: u32, key_file: Option<&str>) -> Result<SshAgent> {
    let sock_re = Regex::new(r"^SSH_AUTH_SOCK=([^;]+);").unwrap();
    let pid_re = Regex::new(r"^echo Agent pid ([0-9]+);").unwrap();

    let output = Command::new("setpriv")
        .args([
            &format!("--reuid={}", uid),
            &format!("--regid={}", gid),
            "--clear-groups",
            "ssh-agent",
        ])
        .output()
        .context("failed to spawn ssh-agent via setpriv")?;
    if !output.status.success() {
        anyhow::bail!("ssh-agent exited with {}", output.status);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);

    let auth_sock = stdout
        .lines()
        .find_map(|l| sock_re.captures(l).map(|c| c[1].to_string()))
        .context("ssh-agent output did not contain SSH_AUTH_SOCK")?;
    let pid: u32 = stdout
        .lines()
        .find_map(|l| pid_re.captures(l).map(|c| c[1].to_string()))
        .context("ssh-agent output did not contain agent pid")?
        .parse()
        .context("ssh-agent reported a non-numeric pid")?;

    let agent = SshAgent { pid, auth_sock };

    let mut add_args = vec![
        format!("--reuid={}", uid),
        format!("--regid={}", gid),
        "--clear-groups".to_string(),
        "ssh-add".to_string(),
    ];
    if let Some(key) = key_file {
        add_args.push(key.to_string());
    }

    let add_status = Command::new("setpriv")
        .args(&add_args)
        .env("SSH_AUTH_SOCK", &agent.auth_sock)
        .status()
        .context("failed to run ssh-add")?;

    if !add_status.success() {
        agent.kill();
        anyhow::bail!("ssh-add exited with {}", add_status);
    }

    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sock_regex_matches_agent_output() {
        let re = Regex::new(r"^SSH_AUTH_SOCK=([^;]+);").unwrap();
        let line = "SSH_AUTH_SOCK=/tmp/ssh-abc/agent.123; export SSH_AUTH_SOCK;";
        let caps = re.captures(line).unwrap();
        assert_eq!(&caps[1], "/tmp/ssh-abc/agent.123");
    }

    #[test]
    fn test_pid_regex_matches_agent_output() {
        let re = Regex::new(r"^echo Agent pid ([0-9]+);").unwrap();
        let line = "echo Agent pid 4242;";
        let caps = re.captures(line).unwrap();
        assert_eq!(&caps[1], "4242");
    }
}
