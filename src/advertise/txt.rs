//! DNS-SD TXT record codec for `_ostree_repo._tcp` advertisements.
//!
//! Records (binary values):
//!
//! | key  | value                                             |
//! |------|---------------------------------------------------|
//! | `v`  | `u8` format version, always 1                     |
//! | `rb` | `u8` k, `u8` hash id, then the bloom filter bytes |
//! | `st` | `u64` big-endian summary timestamp                |
//! | `ri` | `u16` big-endian repository index                 |
//! | `p`  | UTF-8 ostree path (optional)                      |
//!
//! The legacy `_eos_updater._tcp` service uses plain `key=value` text.

use crate::error::UpdaterError;
use crate::refspec::CollectionRef;

use super::bloom::{BloomFilter, HASH_ID_STR};

/// Current TXT format version.
pub const TXT_VERSION: u8 = 1;
/// DNS-SD service type of repository advertisements.
pub const OSTREE_SERVICE_TYPE: &str = "_ostree_repo._tcp";
/// DNS-SD service type of the legacy advertisement.
pub const LEGACY_SERVICE_TYPE: &str = "_eos_updater._tcp";
/// Largest bloom filter that fits the default record size.
pub const MAX_BLOOM_SIZE: usize = 250;

const KEY_VERSION: &str = "v";
const KEY_BLOOM: &str = "rb";
const KEY_SUMMARY_TIMESTAMP: &str = "st";
const KEY_REPO_INDEX: &str = "ri";
const KEY_OSTREE_PATH: &str = "p";

/// Legacy record keys.
pub const LEGACY_TXT_VERSION_KEY: &str = "eos_txt_version";
pub const LEGACY_OSTREE_PATH_KEY: &str = "eos_ostree_path";
pub const LEGACY_HEAD_COMMIT_TIMESTAMP_KEY: &str = "eos_head_commit_timestamp";

/// A TXT record: key and raw value bytes.
pub type TxtRecord = (String, Vec<u8>);

/// TXT encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxtError {
    #[error("Unsupported TXT version {0}")]
    UnsupportedVersion(u8),

    #[error("Unsupported bloom hash id {0}")]
    UnsupportedHashId(u8),

    #[error("Invalid bloom parameter: {0}")]
    InvalidBloom(String),

    #[error("Invalid port 0")]
    InvalidPort,

    #[error("TXT record ‘{0}’ is longer than 255 bytes")]
    RecordTooLong(String),

    #[error("TXT records need {needed} bytes but the limit is {limit}")]
    TooLarge { needed: usize, limit: usize },

    #[error("Missing TXT record ‘{0}’")]
    Missing(&'static str),

    #[error("Malformed TXT record ‘{0}’")]
    Malformed(&'static str),
}

impl From<TxtError> for UpdaterError {
    fn from(e: TxtError) -> Self {
        UpdaterError::WrongConfiguration(e.to_string())
    }
}

/// Upper bound on the encoded size of all TXT records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeLevel {
    /// Works around broken network hardware.
    FaultyHardware,
    /// Fits a single DNS message.
    #[default]
    SingleDnsMessage,
    /// Fits an Ethernet frame.
    Ethernet,
    /// Largest multicast DNS message.
    MulticastDns,
    /// Largest DNS message.
    Max,
    Unlimited,
    Custom(usize),
}

impl SizeLevel {
    pub fn limit(self) -> Option<usize> {
        match self {
            SizeLevel::FaultyHardware => Some(256),
            SizeLevel::SingleDnsMessage => Some(400),
            SizeLevel::Ethernet => Some(1300),
            SizeLevel::MulticastDns => Some(8900),
            SizeLevel::Max => Some(65535),
            SizeLevel::Unlimited => None,
            SizeLevel::Custom(limit) => Some(limit),
        }
    }
}

/// Encoding parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxtOptions {
    pub bloom_k: u8,
    pub bloom_hash_id: u8,
    pub bloom_size: usize,
    pub size_level: SizeLevel,
}

impl Default for TxtOptions {
    fn default() -> Self {
        Self {
            bloom_k: 1,
            bloom_hash_id: HASH_ID_STR,
            bloom_size: MAX_BLOOM_SIZE,
            size_level: SizeLevel::default(),
        }
    }
}

impl TxtOptions {
    pub fn validate(&self) -> Result<(), TxtError> {
        if self.bloom_hash_id != HASH_ID_STR {
            return Err(TxtError::UnsupportedHashId(self.bloom_hash_id));
        }
        if self.bloom_k == 0 {
            return Err(TxtError::InvalidBloom("k must be at least 1".into()));
        }
        if self.bloom_size == 0 || self.bloom_size > MAX_BLOOM_SIZE {
            return Err(TxtError::InvalidBloom(format!(
                "size {} is outside 1..={}",
                self.bloom_size, MAX_BLOOM_SIZE
            )));
        }
        Ok(())
    }
}

/// What a repository advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub refs: Vec<CollectionRef>,
    pub summary_timestamp: u64,
    pub repo_index: u16,
    pub ostree_path: Option<String>,
}

/// A decoded advertisement; refs are only known through the bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTxt {
    pub version: u8,
    pub bloom: BloomFilter,
    pub bloom_hash_id: u8,
    pub summary_timestamp: u64,
    pub repo_index: u16,
    pub ostree_path: Option<String>,
}

impl DecodedTxt {
    pub fn may_offer(&self, collection_ref: &CollectionRef) -> bool {
        self.bloom.may_contain(collection_ref)
    }
}

/// Encode an advertisement for a server on `port`.
pub fn encode_txt(
    ad: &Advertisement,
    port: u16,
    options: &TxtOptions,
) -> Result<Vec<TxtRecord>, TxtError> {
    options.validate()?;
    if port == 0 {
        return Err(TxtError::InvalidPort);
    }

    let mut bloom = BloomFilter::new(options.bloom_size, options.bloom_k);
    for r in &ad.refs {
        bloom.add(r);
    }
    let mut bloom_value = Vec::with_capacity(2 + options.bloom_size);
    bloom_value.push(options.bloom_k);
    bloom_value.push(options.bloom_hash_id);
    bloom_value.extend_from_slice(bloom.as_bytes());

    let mut records = vec![
        (KEY_VERSION.to_string(), vec![TXT_VERSION]),
        (KEY_BLOOM.to_string(), bloom_value),
        (
            KEY_SUMMARY_TIMESTAMP.to_string(),
            ad.summary_timestamp.to_be_bytes().to_vec(),
        ),
        (KEY_REPO_INDEX.to_string(), ad.repo_index.to_be_bytes().to_vec()),
    ];
    if let Some(path) = &ad.ostree_path {
        records.push((KEY_OSTREE_PATH.to_string(), path.as_bytes().to_vec()));
    }

    let needed = encoded_size(&records)?;
    if let Some(limit) = options.size_level.limit() {
        if needed > limit {
            return Err(TxtError::TooLarge { needed, limit });
        }
    }
    Ok(records)
}

/// Wire size of `records`: one length byte plus `key=value` each.
pub fn encoded_size(records: &[TxtRecord]) -> Result<usize, TxtError> {
    let mut total = 0;
    for (key, value) in records {
        let len = key.len() + 1 + value.len();
        if len > 255 {
            return Err(TxtError::RecordTooLong(key.clone()));
        }
        total += 1 + len;
    }
    Ok(total)
}

/// Decode records received from a peer.
pub fn decode_txt(records: &[TxtRecord]) -> Result<DecodedTxt, TxtError> {
    let get = |key: &'static str| {
        records
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    };

    let version = match get(KEY_VERSION).ok_or(TxtError::Missing(KEY_VERSION))? {
        [v] => *v,
        _ => return Err(TxtError::Malformed(KEY_VERSION)),
    };
    if version != TXT_VERSION {
        return Err(TxtError::UnsupportedVersion(version));
    }

    let bloom_value = get(KEY_BLOOM).ok_or(TxtError::Missing(KEY_BLOOM))?;
    let (k, hash_id, bits) = match bloom_value {
        [k, hash_id, bits @ ..] if !bits.is_empty() => (*k, *hash_id, bits),
        _ => return Err(TxtError::Malformed(KEY_BLOOM)),
    };
    if hash_id != HASH_ID_STR {
        return Err(TxtError::UnsupportedHashId(hash_id));
    }
    if k == 0 {
        return Err(TxtError::InvalidBloom("k must be at least 1".into()));
    }

    let summary_timestamp = get(KEY_SUMMARY_TIMESTAMP)
        .ok_or(TxtError::Missing(KEY_SUMMARY_TIMESTAMP))?
        .try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| TxtError::Malformed(KEY_SUMMARY_TIMESTAMP))?;

    let repo_index = get(KEY_REPO_INDEX)
        .ok_or(TxtError::Missing(KEY_REPO_INDEX))?
        .try_into()
        .map(u16::from_be_bytes)
        .map_err(|_| TxtError::Malformed(KEY_REPO_INDEX))?;

    let ostree_path = match get(KEY_OSTREE_PATH) {
        Some(bytes) => Some(
            String::from_utf8(bytes.to_vec()).map_err(|_| TxtError::Malformed(KEY_OSTREE_PATH))?,
        ),
        None => None,
    };

    Ok(DecodedTxt {
        version,
        bloom: BloomFilter::from_bytes(bits.to_vec(), k),
        bloom_hash_id: hash_id,
        summary_timestamp,
        repo_index,
        ostree_path,
    })
}

/// Split a raw DNS TXT string into key and value at the first `=`.
pub fn split_txt_string(raw: &[u8]) -> TxtRecord {
    match raw.iter().position(|b| *b == b'=') {
        Some(pos) => (
            String::from_utf8_lossy(&raw[..pos]).into_owned(),
            raw[pos + 1..].to_vec(),
        ),
        None => (String::from_utf8_lossy(raw).into_owned(), Vec::new()),
    }
}

/// Records of the legacy `_eos_updater._tcp` service.
pub fn legacy_txt(ostree_path: &str, head_commit_timestamp: u64) -> Vec<TxtRecord> {
    vec![
        (LEGACY_TXT_VERSION_KEY.to_string(), b"1".to_vec()),
        (LEGACY_OSTREE_PATH_KEY.to_string(), ostree_path.as_bytes().to_vec()),
        (
            LEGACY_HEAD_COMMIT_TIMESTAMP_KEY.to_string(),
            head_commit_timestamp.to_string().into_bytes(),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement() -> Advertisement {
        Advertisement {
            refs: vec![
                CollectionRef::new(Some("com.example.Os"), "os/eos/amd64/eos3"),
                CollectionRef::new(Some("com.example.Apps"), "app/org.example.App/x86_64/stable"),
            ],
            summary_timestamp: 1_500_000_000,
            repo_index: 3,
            ostree_path: Some("ostree/eos-amd64".to_string()),
        }
    }

    #[test]
    fn test_round_trip() {
        let ad = advertisement();
        let records = encode_txt(&ad, 43381, &TxtOptions::default()).unwrap();
        let decoded = decode_txt(&records).unwrap();

        assert_eq!(decoded.version, TXT_VERSION);
        assert_eq!(decoded.summary_timestamp, ad.summary_timestamp);
        assert_eq!(decoded.repo_index, ad.repo_index);
        assert_eq!(decoded.ostree_path, ad.ostree_path);
        assert_eq!(decoded.bloom.k(), 1);
        assert_eq!(decoded.bloom.size(), MAX_BLOOM_SIZE);
        assert!(ad.refs.iter().all(|r| decoded.may_offer(r)));
    }

    #[test]
    fn test_default_fits_single_dns_message() {
        let records = encode_txt(&advertisement(), 1, &TxtOptions::default()).unwrap();
        assert!(encoded_size(&records).unwrap() <= 400);
    }

    #[test]
    fn test_faulty_hardware_limit_rejects_default_bloom() {
        let options = TxtOptions {
            size_level: SizeLevel::FaultyHardware,
            ..Default::default()
        };
        assert!(matches!(
            encode_txt(&advertisement(), 1, &options),
            Err(TxtError::TooLarge { limit: 256, .. })
        ));
    }

    #[test]
    fn test_custom_limit() {
        let options = TxtOptions {
            bloom_size: 10,
            size_level: SizeLevel::Custom(64),
            ..Default::default()
        };
        let ad = Advertisement {
            ostree_path: None,
            ..advertisement()
        };
        assert!(encode_txt(&ad, 1, &options).is_ok());
        assert!(SizeLevel::Unlimited.limit().is_none());
    }

    #[test]
    fn test_invalid_options() {
        let bad = |options: TxtOptions| encode_txt(&advertisement(), 1, &options).is_err();
        assert!(bad(TxtOptions { bloom_k: 0, ..Default::default() }));
        assert!(bad(TxtOptions { bloom_hash_id: 2, ..Default::default() }));
        assert!(bad(TxtOptions { bloom_size: 251, ..Default::default() }));
        assert!(bad(TxtOptions { bloom_size: 0, ..Default::default() }));
        assert_eq!(
            encode_txt(&advertisement(), 0, &TxtOptions::default()),
            Err(TxtError::InvalidPort)
        );
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let mut records = encode_txt(&advertisement(), 1, &TxtOptions::default()).unwrap();
        records[0].1 = vec![2];
        assert_eq!(decode_txt(&records), Err(TxtError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_decode_rejects_truncated_timestamp() {
        let mut records = encode_txt(&advertisement(), 1, &TxtOptions::default()).unwrap();
        records.retain(|(k, _)| k != "st");
        records.push(("st".to_string(), vec![0, 1]));
        assert_eq!(
            decode_txt(&records),
            Err(TxtError::Malformed("st"))
        );
    }

    #[test]
    fn test_split_txt_string() {
        assert_eq!(split_txt_string(b"v=\x01"), ("v".to_string(), vec![1]));
        assert_eq!(split_txt_string(b"flag"), ("flag".to_string(), vec![]));
        assert_eq!(split_txt_string(b"p=a=b"), ("p".to_string(), b"a=b".to_vec()));
    }

    #[test]
    fn test_legacy_records() {
        let records = legacy_txt("ostree/eos-amd64", 42);
        assert_eq!(records[0], ("eos_txt_version".to_string(), b"1".to_vec()));
        assert_eq!(records[2].1, b"42".to_vec());
    }
}
