//! Typed Rust client for the eos-updater daemon.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use eos_updater_client::{UpdaterClient, proto::UpdaterState};
//! use std::time::Duration;
//!
//! async fn example() -> eos_updater_client::Result<()> {
//!     let client = UpdaterClient::connect("http://127.0.0.1:50151").await?;
//!     client.poll().await?;
//!     let props = client.wait_while(UpdaterState::Polling, Duration::from_secs(60)).await?;
//!     if props.updater_state() == UpdaterState::UpdateAvailable {
//!         client.fetch().await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod proto;

pub use client::{UpdaterClient, DEFAULT_ENDPOINT};
pub use error::{ClientError, Result, ERROR_NAME_METADATA_KEY};
