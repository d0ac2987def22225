//! Refspecs and collection refs.
//!
//! A refspec is `remote:ref` (or a bare `ref` for local branches). A
//! collection ref pairs a ref with the peer-independent collection id that
//! finders use to match offers across sources.

use std::fmt;

use crate::error::UpdaterError;

/// Errors produced while parsing refs and refspecs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefspecError {
    #[error("Invalid refspec ‘{0}’")]
    InvalidRefspec(String),

    #[error("Invalid ref name ‘{0}’")]
    InvalidRef(String),

    #[error("Invalid remote name ‘{0}’")]
    InvalidRemote(String),
}

impl From<RefspecError> for UpdaterError {
    fn from(e: RefspecError) -> Self {
        UpdaterError::InvalidConfig(e.to_string())
    }
}

/// A `(remote, ref)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Refspec {
    /// Remote name; `None` for local refs.
    pub remote: Option<String>,
    /// Ref name, e.g. `os/eos/amd64/eos3`.
    pub ref_name: String,
}

impl Refspec {
    /// Build a refspec from validated parts.
    pub fn new(remote: Option<&str>, ref_name: &str) -> Result<Self, RefspecError> {
        if let Some(remote) = remote {
            validate_remote(remote)?;
        }
        validate_ref(ref_name)?;
        Ok(Self {
            remote: remote.map(str::to_string),
            ref_name: ref_name.to_string(),
        })
    }

    /// Parse `remote:ref` or `ref`.
    pub fn parse(s: &str) -> Result<Self, RefspecError> {
        match s.split_once(':') {
            Some((remote, ref_name)) => {
                if remote.is_empty() {
                    return Err(RefspecError::InvalidRefspec(s.to_string()));
                }
                Self::new(Some(remote), ref_name)
            }
            None => Self::new(None, s),
        }
    }

    /// Same remote, different ref.
    pub fn with_ref(&self, ref_name: &str) -> Result<Self, RefspecError> {
        Self::new(self.remote.as_deref(), ref_name)
    }
}

impl fmt::Display for Refspec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.remote {
            Some(remote) => write!(f, "{}:{}", remote, self.ref_name),
            None => f.write_str(&self.ref_name),
        }
    }
}

/// A `(collection id, ref)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    /// Collection id; `None` for legacy remotes without one.
    pub collection_id: Option<String>,
    /// Ref name.
    pub ref_name: String,
}

impl CollectionRef {
    pub fn new(collection_id: Option<&str>, ref_name: &str) -> Self {
        Self {
            collection_id: collection_id.map(str::to_string),
            ref_name: ref_name.to_string(),
        }
    }

    /// Whether an offer for `(collection_id, ref_name)` satisfies this ref.
    ///
    /// Without a collection id only the ref name has to match.
    pub fn matches(&self, collection_id: Option<&str>, ref_name: &str) -> bool {
        if self.ref_name != ref_name {
            return false;
        }
        match (&self.collection_id, collection_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection_id {
            Some(id) => write!(f, "({}, {})", id, self.ref_name),
            None => write!(f, "(-, {})", self.ref_name),
        }
    }
}

/// Validate a ref name: non-empty `/`-separated components without `..`
/// or whitespace.
pub fn validate_ref(ref_name: &str) -> Result<(), RefspecError> {
    let invalid = || RefspecError::InvalidRef(ref_name.to_string());
    if ref_name.is_empty() || ref_name.contains("..") {
        return Err(invalid());
    }
    for component in ref_name.split('/') {
        if component.is_empty()
            || component
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == ':')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

fn validate_remote(remote: &str) -> Result<(), RefspecError> {
    if remote.is_empty()
        || remote
            .chars()
            .any(|c| c == '/' || c.is_whitespace() || c.is_control())
    {
        return Err(RefspecError::InvalidRemote(remote.to_string()));
    }
    Ok(())
}
