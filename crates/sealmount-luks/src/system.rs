//! System-backed `BlockDeviceProvisioner` implementation.
//!
//! Drives the host `cryptsetup` binary. The open path enforces the
//! detached-header invariant: back up the embedded header, dump metadata
//! from the backup only, verify it against the hardened baseline, and only
//! then activate the mapping.

use crate::command::CryptsetupCommand;
use crate::header::{verify_header, HeaderMetadata};
use sealmount_core::config::{self, SealmountConfig};
use sealmount_core::error::{SealmountError, SealmountResult};
use sealmount_provider::{BlockDeviceProvisioner, Device, MappingState};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// `cryptsetup status` reports an inactive mapping with this status.
const STATUS_INACTIVE_EXIT: i32 = 4;

/// System provisioner that manages LUKS2 mappings via the host `cryptsetup`.
#[derive(Debug, Clone)]
pub struct SystemDeviceProvisioner {
    cryptsetup: CryptsetupCommand,
    mapper_root: PathBuf,
    lock_dir: PathBuf,
}

impl SystemDeviceProvisioner {
    /// Build a provisioner from configuration, resolving the `cryptsetup`
    /// binary path.
    pub fn from_config(config: &SealmountConfig) -> SealmountResult<Self> {
        let binary = resolve_cryptsetup_path(config)?;
        Ok(Self {
            cryptsetup: CryptsetupCommand::new(binary, config.tool_timeout()),
            mapper_root: config.mapper_root(),
            lock_dir: config.lock_dir(),
        })
    }

    fn mapper_node(&self, mapper_name: &str) -> PathBuf {
        self.mapper_root.join(mapper_name)
    }

    fn mapper_node_exists(&self, mapper_name: &str) -> bool {
        self.mapper_root.is_dir() && self.mapper_node(mapper_name).exists()
    }

    /// cryptsetup requires its lock directory to exist; create it before
    /// every invocation.
    fn ensure_lock_dir(&self) -> SealmountResult<()> {
        fs::create_dir_all(&self.lock_dir)?;
        Ok(())
    }

    fn ensure_parent_dir(path: &Path) -> SealmountResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl BlockDeviceProvisioner for SystemDeviceProvisioner {
    type Error = SealmountError;

    fn is_luks(&self, device: &Path) -> SealmountResult<bool> {
        self.ensure_lock_dir()?;
        self.cryptsetup.is_luks(device)
    }

    fn format(&self, device: &Device) -> SealmountResult<()> {
        Self::ensure_parent_dir(&device.header_path)?;
        Self::ensure_parent_dir(&device.key_path)?;
        self.ensure_lock_dir()?;
        self.cryptsetup.luks_format(device)
    }

    fn open(&self, device: &Device) -> SealmountResult<PathBuf> {
        Self::ensure_parent_dir(&device.header_path)?;
        self.ensure_lock_dir()?;

        self.cryptsetup.header_backup(device)?;

        let payload = self.cryptsetup.dump_header_json(&device.header_path)?;
        let metadata = HeaderMetadata::from_json(&payload)?;
        verify_header(&metadata)?;
        log::debug!(
            "detached header {} matches the hardened baseline",
            device.header_path.display()
        );

        self.cryptsetup.open(device)?;

        let node = self.mapper_node(&device.mapper_name);
        if !node.exists() {
            return Err(SealmountError::tool(
                "cryptsetup open",
                format!(
                    "reported success but {} did not appear",
                    node.display()
                ),
            ));
        }
        Ok(node)
    }

    fn close(&self, mapper_name: &str) -> SealmountResult<()> {
        if !self.mapper_node_exists(mapper_name) {
            return Ok(());
        }
        self.ensure_lock_dir()?;
        self.cryptsetup.close(mapper_name)
    }

    fn mapping_state(&self, mapper_name: &str) -> SealmountResult<MappingState> {
        if self.mapper_node_exists(mapper_name) {
            return Ok(MappingState::Active);
        }

        self.ensure_lock_dir()?;
        let (status, diagnostic) = self.cryptsetup.status(mapper_name)?;
        match status {
            0 => Ok(MappingState::Active),
            STATUS_INACTIVE_EXIT => Ok(MappingState::Inactive),
            _ => {
                let lower = diagnostic.to_ascii_lowercase();
                if lower.contains("is inactive")
                    || lower.contains("not active")
                    || lower.contains("does not exist")
                    || lower.contains("doesn't exist")
                {
                    Ok(MappingState::Inactive)
                } else {
                    Ok(MappingState::Unknown(format!(
                        "cryptsetup status {mapper_name} exited with code {status}: {diagnostic}"
                    )))
                }
            }
        }
    }
}

fn resolve_cryptsetup_path(config: &SealmountConfig) -> SealmountResult<PathBuf> {
    if let Some(path) = config
        .paths
        .cryptsetup_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(SealmountError::InvalidConfig(format!(
                "cryptsetup binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    let candidates = config::default_cryptsetup_candidates();
    if let Some(found) = config::detect_binary_path(candidates) {
        return Ok(PathBuf::from(found));
    }

    find_in_path("cryptsetup").ok_or_else(|| {
        SealmountError::InvalidConfig(format!(
            "unable to locate cryptsetup binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
