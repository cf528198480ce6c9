//! The Runner abstraction (§4.4): launches the converter either as a direct
//! child process or as an ephemeral service-manager unit.

mod direct;
mod service;

pub use direct::DirectRunner;
pub use service::ServiceRunner;

use anyhow::Result;

/// Abstract operations every Runner variant implements.
pub trait Runner {
    fn run(&mut self) -> Result<()>;
    fn is_running(&mut self) -> bool;
    fn kill(&mut self);
    fn return_code(&self) -> Option<i32>;
    fn pid(&self) -> Option<u32>;

    /// Only the service-manager variant can apply live throttling; the
    /// direct variant ignores these (§4.7 throttling_update "warns otherwise").
    fn set_network_limit(&self, _limit: Option<u64>) -> Result<()> {
        Ok(())
    }
    fn set_cpu_quota(&self, _quota: &str) -> Result<()> {
        Ok(())
    }
    fn supports_throttling(&self) -> bool {
        false
    }
}
