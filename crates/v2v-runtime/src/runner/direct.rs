use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};

use super::Runner;

/// Starts the converter as a plain child process; output goes to the text
/// log, stdin is `/dev/null` (§4.4 "Direct variant").
pub struct DirectRunner {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    log_path: PathBuf,
    child: Option<Child>,
    return_code: Option<i32>,
}

impl DirectRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, env: HashMap<String, String>, log_path: PathBuf) -> Self {
        DirectRunner {
            program: program.into(),
            args,
            env,
            log_path,
            child: None,
            return_code: None,
        }
    }
}

impl Runner for DirectRunner {
    fn run(&mut self) -> Result<()> {
        let log = File::create(&self.log_path)
            .with_context(|| format!("failed to create log file {}", self.log_path.display()))?;
        let stderr = log.try_clone().context("failed to clone log file handle")?;

        let child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(stderr)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;

        self.child = Some(child);
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else { return false };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.return_code = Some(status.code().unwrap_or(-1));
                false
            }
            Err(_) => false,
        }
    }

    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }

    fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_runner_runs_true_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("v2v.log");
        let mut runner = DirectRunner::new("true", vec![], HashMap::new(), log);
        runner.run().unwrap();
        assert!(runner.pid().is_some());
        while runner.is_running() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(runner.return_code(), Some(0));
    }

    #[test]
    fn test_direct_runner_captures_stdout_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("v2v.log");
        let mut runner = DirectRunner::new(
            "sh",
            vec!["-c".to_string(), "echo hello".to_string()],
            HashMap::new(),
            log.clone(),
        );
        runner.run().unwrap();
        while runner.is_running() {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents.trim(), "hello");
    }
}
