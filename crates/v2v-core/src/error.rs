use thiserror::Error;

/// Failures raised while validating an inbound request, before any side effects.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("exactly one target selector must be present, found {found}")]
    AmbiguousTarget { found: usize },

    #[error("network mapping at index {index} is missing required field: {field}")]
    BadNetworkMapping { index: usize, field: &'static str },

    #[error("no target selector present (export_domain, rhv_url, osp_environment) for a daemonized run")]
    NoTargetSelected,

    #[error("failed to query target platform: {0}")]
    TargetQueryFailed(String),
}

/// Domain error for the OpenStack disk-naming scheme.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiskNameError {
    #[error("disk index {0} is out of range [1, 702]")]
    OutOfRange(i64),
}
