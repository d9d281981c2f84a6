//! Contract for filesystem provisioning on an opened mapping.

use std::error::Error;
use std::path::Path;

/// Durability class requested for a mount.
///
/// Persistent workload volumes force synchronous, fully journaled writes so
/// data survives an abrupt restart of the confidential VM; ad-hoc service
/// mounts take the kernel defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountDurability {
    Journaled,
    Standard,
}

/// Abstraction over ext4 detection, creation, and mounting.
///
/// Implementations operate on the decrypted mapper device, which may sit on
/// an integrity-protected target that returns I/O errors for sectors never
/// written with a valid tag.
pub trait FilesystemProvisioner {
    type Error: Error + Send + Sync + 'static;

    /// Whether the mapping already carries an ext4 filesystem. A probe-read
    /// failure on a fresh integrity-protected mapping is `Ok(false)`.
    fn is_ext4(&self, mapper: &Path) -> Result<bool, Self::Error>;

    /// Create an ext4 filesystem on the mapping, pre-initialising every
    /// block the formatter will probe so the format succeeds on an
    /// integrity-protected device.
    fn make_ext4(&self, mapper: &Path) -> Result<(), Self::Error>;

    /// Mount the mapping at `mount_point` with the requested durability.
    fn mount(
        &self,
        mapper: &Path,
        mount_point: &Path,
        durability: MountDurability,
    ) -> Result<(), Self::Error>;

    /// Unmount `mount_point`. Used by teardown paths.
    fn unmount(&self, mount_point: &Path) -> Result<(), Self::Error>;
}
