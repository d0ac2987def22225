//! Local advertisement of updates to peers on the network.
//!
//! [`selector`] picks the deployed commit to offer, [`txt`] and [`bloom`]
//! encode what is offered into DNS-SD TXT records and [`service_file`]
//! hands them to Avahi; [`update`] applies the advertisement policy.

pub mod bloom;
pub mod selector;
pub mod service_file;
pub mod txt;
pub mod update;

pub use bloom::BloomFilter;
pub use selector::{advertisable_commit, AdvertisableCommit};
pub use update::{update_service_files, AdvertiseOutcome};
pub use txt::{decode_txt, encode_txt, Advertisement, DecodedTxt, SizeLevel, TxtError, TxtOptions};
