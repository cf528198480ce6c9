//! `v2v_wrapper`: facade crate re-exporting the supervisor's workspace crates
//! so consumers can depend on a single library.
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | v2v-core | Request/state types, naming, retry, config |
//! | [`logparser`] | v2v-logparser | Live converter log parsing |
//! | [`throttle`] | v2v-throttle | tc/cgroup egress throttling |
//! | [`runtime`] | v2v-runtime | Daemonization, secrets, runners, shell |
//! | [`backend`] | v2v-backend | RHV/OpenStack/in-pod host back-ends |

pub use v2v_backend as backend;
pub use v2v_core as core;
pub use v2v_logparser as logparser;
pub use v2v_runtime as runtime;
pub use v2v_throttle as throttle;

/// Build-time version string, falling back to the crate version when no
/// override is baked in (mirrors the versioned-build-knob pattern used for
/// other `option_env!`-backed constants in this workspace).
pub fn version() -> &'static str {
    option_env!("V2V_WRAPPER_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}
