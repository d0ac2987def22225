//! eos-updater - image-based OS updates
//!
//! Polls for new OS commits from the Internet, peers on the local network
//! and removable volumes, downloads them into the local content-addressed
//! repository and deploys them for the next boot. The same repository is
//! advertised and served to peers.

pub mod advertise;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod facade;
pub mod finder;
pub mod live_boot;
pub mod metrics;
pub mod refspec;
pub mod repo;
pub mod server;
pub mod sysroot;
pub mod transport;
pub mod updater;
pub mod utils;

pub use eos_updater_client::proto;
pub use error::{Result, UpdaterError};
pub use updater::{Properties, Updater, UpdaterState};
