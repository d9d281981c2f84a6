//! Contract for LUKS2 block-device provisioning.
//!
//! The backing device is host-controlled and untrusted. Implementations must
//! only ever reason about header metadata read from the detached backup copy
//! a `Device` names, never from the raw device itself.

use std::error::Error;
use std::path::{Path, PathBuf};

/// One managed LUKS2 volume for the duration of a provisioning operation.
///
/// The detached header is the only header ever trusted: after formatting, the
/// embedded header is backed up into `header_path` and all metadata reads go
/// through that copy, so a host that rewrites the raw device's header cannot
/// silently change the parameters this system relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Raw block-special path handed to us by the host (untrusted).
    pub device_path: PathBuf,
    /// Detached header backup, kept in VM-private storage (e.g. tmpfs).
    pub header_path: PathBuf,
    /// Ephemeral key file holding raw passphrase bytes.
    pub key_path: PathBuf,
    /// Device-mapper name assigned once opened.
    pub mapper_name: String,
}

impl Device {
    pub fn new(
        device_path: impl Into<PathBuf>,
        header_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        mapper_name: impl Into<String>,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            header_path: header_path.into(),
            key_path: key_path.into(),
            mapper_name: mapper_name.into(),
        }
    }
}

/// Normalised state for a device-mapper entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    Active,
    Inactive,
    Unknown(String),
}

/// Abstraction over the LUKS2 lifecycle of one block device.
///
/// A non-Linux build gets an implementation whose every method reports the
/// platform as unsupported; callers never need runtime OS checks.
pub trait BlockDeviceProvisioner {
    type Error: Error + Send + Sync + 'static;

    /// Whether `device` carries a LUKS header. A device that simply is not
    /// LUKS-formatted is `Ok(false)`, not an error.
    fn is_luks(&self, device: &Path) -> Result<bool, Self::Error>;

    /// Create a LUKS2 header on the raw device using the hardened profile,
    /// keyed by the device's key file.
    fn format(&self, device: &Device) -> Result<(), Self::Error>;

    /// Back up the on-device header, verify the backup against the hardened
    /// baseline, and activate the mapping. Returns the mapper device path.
    ///
    /// A baseline violation aborts before any activation is attempted.
    fn open(&self, device: &Device) -> Result<PathBuf, Self::Error>;

    /// Tear down the device-mapper entry. Tolerant of mappings that are
    /// already gone.
    fn close(&self, mapper_name: &str) -> Result<(), Self::Error>;

    /// Current state of the named mapping.
    fn mapping_state(&self, mapper_name: &str) -> Result<MappingState, Self::Error>;
}
