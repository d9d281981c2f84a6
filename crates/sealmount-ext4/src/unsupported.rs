//! Non-Linux stand-in selected at compile time.

use sealmount_core::config::SealmountConfig;
use sealmount_core::error::{SealmountError, SealmountResult};
use sealmount_provider::{FilesystemProvisioner, MountDurability};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SystemExt4Provisioner;

impl SystemExt4Provisioner {
    pub fn from_config(_config: &SealmountConfig) -> SealmountResult<Self> {
        Ok(Self)
    }
}

impl FilesystemProvisioner for SystemExt4Provisioner {
    type Error = SealmountError;

    fn is_ext4(&self, _mapper: &Path) -> SealmountResult<bool> {
        Err(SealmountError::Unsupported)
    }

    fn make_ext4(&self, _mapper: &Path) -> SealmountResult<()> {
        Err(SealmountError::Unsupported)
    }

    fn mount(
        &self,
        _mapper: &Path,
        _mount_point: &Path,
        _durability: MountDurability,
    ) -> SealmountResult<()> {
        Err(SealmountError::Unsupported)
    }

    fn unmount(&self, _mount_point: &Path) -> SealmountResult<()> {
        Err(SealmountError::Unsupported)
    }
}
