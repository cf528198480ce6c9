//! The standard double-fork/setsid/umask/redirect detach sequence (§4.7
//! `DAEMONIZED`). Grounded on the original wrapper's `daemonize()`: fork,
//! parent exits; `setsid`; fork again, parent exits; `umask(0)`; `chdir("/")`;
//! stdin/stdout/stderr redirected to `/dev/null`.
//!
//! The original re-initializes pycurl's global TLS/PKCS#11 state after fork
//! because libcurl caches security tokens that fork invalidates. This
//! implementation never constructs a shared HTTP client before the fork point
//! (back-ends build their `reqwest::blocking::Client` lazily on first use,
//! which is always post-fork) — see DESIGN.md on the daemonization note.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};

/// Perform the double-fork detach. Only returns in the final daemon process;
/// both forked-off parents call `process::exit(0)` directly.
pub fn daemonize() -> Result<()> {
    use std::io::Write as _;
    std::io::stdout().flush().ok();
    std::io::stderr().flush().ok();

    // SAFETY: called early in main(), before any threads are spawned and
    // before any state that would be unsafe to duplicate across fork exists.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("setsid failed")?;

    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    chdir("/").context("chdir to / failed")?;
    redirect_stdio_to_devnull()?;

    Ok(())
}

fn redirect_stdio_to_devnull() -> Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    let fd = devnull.as_raw_fd();
    dup2(fd, 0).context("failed to redirect stdin")?;
    dup2(fd, 1).context("failed to redirect stdout")?;
    dup2(fd, 2).context("failed to redirect stderr")?;
    Ok(())
}
