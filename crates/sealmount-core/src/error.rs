//! Error taxonomy shared across the workspace.
//!
//! Nothing here is retried automatically: subprocess failures, header policy
//! violations, and mount failures are all terminal for the operation that
//! raised them.

use std::path::PathBuf;
use thiserror::Error;

pub type SealmountResult<T> = Result<T, SealmountError>;

#[derive(Debug, Error)]
pub enum SealmountError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{tool} failed: {detail}")]
    Tool { tool: String, detail: String },

    /// The detached LUKS2 header deviated from the hardened baseline. Always
    /// terminal; the device must not be opened or mounted.
    #[error("LUKS2 header rejected ({field}): {reason}")]
    HeaderPolicy { field: String, reason: String },

    #[error("unable to resolve block device id `{id}`: {reason}")]
    DeviceResolution { id: String, reason: String },

    #[error("invalid mount request: {0}")]
    InvalidRequest(String),

    #[error("mount of {mapper} at {mount_point} failed: {detail}")]
    Mount {
        mapper: PathBuf,
        mount_point: PathBuf,
        detail: String,
    },

    #[error("key material at {path} rejected: {reason}")]
    InvalidKey { path: PathBuf, reason: String },

    /// A step failed and the follow-up cleanup failed too. Both are
    /// reported; the cleanup error never replaces the original.
    #[error("{original}; cleanup also failed: {cleanup}")]
    Cleanup {
        original: Box<SealmountError>,
        cleanup: Box<SealmountError>,
    },

    #[error("block-device provisioning is not supported on this platform")]
    Unsupported,

    #[error("configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SealmountError {
    /// Convenience constructor for subprocess diagnostics.
    pub fn tool(tool: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            detail: detail.into(),
        }
    }

    /// Join a cleanup failure onto `self` without losing either error.
    pub fn with_cleanup(self, cleanup: SealmountError) -> Self {
        Self::Cleanup {
            original: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }
}
