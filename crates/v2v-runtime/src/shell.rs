//! Thin wrappers around `std::process::Command`, plus the secret-redaction
//! policy every caller that logs a command line must apply (§7 "Propagation
//! policy").

use std::collections::HashMap;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};

pub fn run_host(cmd: &str, args: &[&str]) -> Result<Output> {
    Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("failed to run: {} {}", cmd, args.join(" ")))
}

pub fn run_host_visible(cmd: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(cmd)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("failed to run: {} {}", cmd, args.join(" ")))?;
    if !status.success() {
        anyhow::bail!("command failed (exit {}): {} {}", status, cmd, args.join(" "));
    }
    Ok(())
}

/// Redact any `key=value` argument whose key case-insensitively contains
/// "password", for safe logging of back-end CLI invocations.
pub fn redact_args(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|a| match a.split_once('=') {
            Some((key, _)) if key.to_lowercase().contains("password") => format!("{}=*****", key),
            _ => a.clone(),
        })
        .collect()
}

/// Redact the value of any environment entry whose key case-insensitively
/// contains "password".
pub fn redact_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            if k.to_lowercase().contains("password") {
                (k.clone(), "*****".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_args_masks_password_keys() {
        let args = vec!["--password=hunter2".to_string(), "--other=value".to_string()];
        let redacted = redact_args(&args);
        assert_eq!(redacted, vec!["--password=*****", "--other=value"]);
    }

    #[test]
    fn test_redact_args_case_insensitive() {
        let args = vec!["OS-PASSWORD=hunter2".to_string()];
        assert_eq!(redact_args(&args), vec!["OS-PASSWORD=*****"]);
    }

    #[test]
    fn test_redact_env_masks_password_values() {
        let mut env = HashMap::new();
        env.insert("RHV_PASSWORD".to_string(), "hunter2".to_string());
        env.insert("LANG".to_string(), "C".to_string());
        let redacted = redact_env(&env);
        assert_eq!(redacted.get("RHV_PASSWORD"), Some(&"*****".to_string()));
        assert_eq!(redacted.get("LANG"), Some(&"C".to_string()));
    }
}
