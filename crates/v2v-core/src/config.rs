/// Directory state files, the wrapper log, and drop-files live under by default.
/// Overridable at runtime via `V2V_STATE_DIR` so tests and non-standard hosts can relocate it.
pub const STATE_DIR_DEFAULT: &str = "/var/run/v2v-conversion";

pub fn state_dir() -> String {
    std::env::var("V2V_STATE_DIR").unwrap_or_else(|_| STATE_DIR_DEFAULT.to_string())
}

/// Well-known uid/gid the VDSM (RHV host) back-end runs the converter as,
/// except when targeting an NFS export domain (root is required to mount it).
pub const VDSM_UID: u32 = 36;
pub const VDSM_GID: u32 = 36;

pub const VDSM_CA_DEFAULT: &str = "/etc/pki/vdsm/certs/cacert.pem";

/// Root of the mounted oVirt/RHV storage domains, walked to locate an ISO domain.
pub const RHV_MNT_ROOT: &str = "/rhev/data-center/mnt";

/// Monitor-loop tick interval (Run Controller §4.7).
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Deadline for target-side polling loops in back-end finalize/cleanup (§4.6).
pub const FINALIZE_DEADLINE_SECS: u64 = 300;

/// How long the log parser waits for the converter's log files to appear.
pub const LOG_WAIT_SECS: u64 = 10;

/// How long the service-manager runner waits for the unit's main PID to populate.
pub const UNIT_PID_POLL_SECS: u64 = 25;
pub const UNIT_PID_POLL_INTERVAL_SECS: u64 = 5;

/// Minimum installed vdsm package version required by the `rhv-version` check.
/// See DESIGN.md Open Question 4 for why this is a version string, not an RPM query.
pub const VDSM_MIN_VERSION: &str = "4.20.31";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_dir_default() {
        unsafe {
            std::env::remove_var("V2V_STATE_DIR");
        }
        assert_eq!(state_dir(), STATE_DIR_DEFAULT);
    }
}
