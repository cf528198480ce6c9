//! v2v-throttle: per-run egress bandwidth and CPU throttling plumbing
//! (SPEC_FULL.md §4.5). `TcController` owns the qdisc/class/filter/cgroup
//! lifecycle for one run and tears it down on drop.

mod cgroup;
mod tc;

pub use tc::{relative_cgroup_name, TcController};
