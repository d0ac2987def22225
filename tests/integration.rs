//! Integration tests for eos-updater.
//!
//! Each test serves an origin repository over real HTTP on 127.0.0.1 and
//! drives a throwaway sysroot against it.

mod common;

#[path = "integration/update_flow_test.rs"]
mod update_flow_test;

#[path = "integration/daemon_test.rs"]
mod daemon_test;

#[path = "integration/server_test.rs"]
mod server_test;
