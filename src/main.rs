mod checks;
mod controller;
mod logging;

use std::io::Read as _;

use anyhow::{Context, Result};
use mimalloc::MiMalloc;

use v2v_backend::{detect, factory};
use v2v_core::request::Request;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const USAGE: &str = "\
virt-v2v-wrapper reads a conversion request as JSON on standard input.

USAGE:
    virt-v2v-wrapper [FLAG]

FLAGS:
    -h, --help        print this message
        --version     print the wrapper's version
        --checks      list the names accepted by --check-<name>
        --check-<name>
                       run a single named pre-flight check and exit 0/1";

/// Raw argv dispatch, matching the three self-describing switches in §6:
/// `--version`, `--checks`, `--check-<name>`, plus `-h`/`--help`. Everything
/// else falls through to reading a conversion request from standard input.
fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("-h") | Some("--help") | Some("help") => {
            println!("{USAGE}");
            Ok(())
        }
        Some("--version") => {
            println!("virt-v2v-wrapper {}", v2v_wrapper::version());
            Ok(())
        }
        Some("--checks") => {
            for name in checks::CHECK_NAMES {
                println!("{name}");
            }
            Ok(())
        }
        Some(flag) if flag.starts_with("--check-") => {
            let name = &flag["--check-".len()..];
            match checks::run(name) {
                Ok(true) => Ok(()),
                Ok(false) => std::process::exit(1),
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            }
        }
        _ => run_conversion(),
    }
}

fn run_conversion() -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input).context("failed to read request from stdin")?;

    let request: Request = match serde_json::from_str(&input) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("malformed request: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = request.validate_generic() {
        eprintln!("invalid request: {e}");
        std::process::exit(1);
    }

    let mut request = request;
    if request.virtio_win.is_some() {
        // Backward compatibility: a caller supplying virtio_win without
        // install_drivers means install them.
        request.install_drivers = Some(true);
    }

    let backend = factory(detect(&request));

    if request.install_drivers == Some(true) {
        if let Err(e) = backend.check_install_drivers(&mut request) {
            eprintln!("failed to check install drivers: {e:#}");
            std::process::exit(1);
        }
    } else {
        request.install_drivers = Some(false);
    }

    if let Err(e) = backend.validate(&mut request) {
        eprintln!("invalid request: {e}");
        std::process::exit(1);
    }

    // Nothing beyond this point is a request-validation failure; any error
    // from here on is a supervisor failure (exit 2, never exit 1).
    match controller::run(request, backend) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(2);
        }
    }
}
