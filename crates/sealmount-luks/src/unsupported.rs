//! Non-Linux stand-in selected at compile time.
//!
//! Every operation reports the platform as unsupported instead of
//! panicking, so portable callers fail cleanly.

use sealmount_core::config::SealmountConfig;
use sealmount_core::error::{SealmountError, SealmountResult};
use sealmount_provider::{BlockDeviceProvisioner, Device, MappingState};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SystemDeviceProvisioner;

impl SystemDeviceProvisioner {
    pub fn from_config(_config: &SealmountConfig) -> SealmountResult<Self> {
        Ok(Self)
    }
}

impl BlockDeviceProvisioner for SystemDeviceProvisioner {
    type Error = SealmountError;

    fn is_luks(&self, _device: &Path) -> SealmountResult<bool> {
        Err(SealmountError::Unsupported)
    }

    fn format(&self, _device: &Device) -> SealmountResult<()> {
        Err(SealmountError::Unsupported)
    }

    fn open(&self, _device: &Device) -> SealmountResult<PathBuf> {
        Err(SealmountError::Unsupported)
    }

    fn close(&self, _mapper_name: &str) -> SealmountResult<()> {
        Err(SealmountError::Unsupported)
    }

    fn mapping_state(&self, _mapper_name: &str) -> SealmountResult<MappingState> {
        Err(SealmountError::Unsupported)
    }
}
