//! System-backed `FilesystemProvisioner` implementation.

use crate::command::ToolCommand;
use crate::{probe, wipe};
use sealmount_core::config::{self, SealmountConfig};
use sealmount_core::error::{SealmountError, SealmountResult};
use sealmount_provider::{FilesystemProvisioner, MountDurability};
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Mount options for persistent workload volumes: data must be durable
/// across an abrupt restart of the confidential VM.
const JOURNALED_MOUNT_OPTIONS: &str = "sync,data=journal";
const DEFAULT_MOUNT_OPTIONS: &str = "defaults";

/// System provisioner that manages ext4 via `mkfs.ext4` and the mount tools.
#[derive(Debug, Clone)]
pub struct SystemExt4Provisioner {
    mkfs: ToolCommand,
    mount: ToolCommand,
    umount: ToolCommand,
}

impl SystemExt4Provisioner {
    pub fn from_config(cfg: &SealmountConfig) -> SealmountResult<Self> {
        let timeout = cfg.tool_timeout();
        Ok(Self {
            mkfs: ToolCommand::new(
                "mkfs.ext4",
                resolve_tool(
                    cfg.paths.mkfs_path.as_deref(),
                    config::default_mkfs_candidates(),
                    "mkfs.ext4",
                )?,
                timeout,
            ),
            mount: ToolCommand::new(
                "mount",
                resolve_tool(
                    cfg.paths.mount_path.as_deref(),
                    config::default_mount_candidates(),
                    "mount",
                )?,
                timeout,
            ),
            umount: ToolCommand::new(
                "umount",
                resolve_tool(
                    cfg.paths.umount_path.as_deref(),
                    config::default_umount_candidates(),
                    "umount",
                )?,
                timeout,
            ),
        })
    }
}

impl FilesystemProvisioner for SystemExt4Provisioner {
    type Error = SealmountError;

    fn is_ext4(&self, mapper: &Path) -> SealmountResult<bool> {
        probe::is_ext4(mapper)
    }

    fn make_ext4(&self, mapper: &Path) -> SealmountResult<()> {
        // Dry run as an oracle for which blocks the real run will probe; it
        // performs no writes.
        let dry = self
            .mkfs
            .run_checked(&[OsString::from("-n"), OsString::from(mapper)])?;
        let mut listing = dry.stdout;
        listing.push('\n');
        listing.push_str(&dry.stderr);

        let blocks = wipe::wipe_set(&listing);
        log::debug!(
            "pre-zeroing {} block(s) on {} before mkfs",
            blocks.len(),
            mapper.display()
        );
        wipe::wipe_blocks(mapper, &blocks)?;

        self.mkfs
            .run_checked(&[OsString::from("-F"), OsString::from(mapper)])?;
        Ok(())
    }

    fn mount(
        &self,
        mapper: &Path,
        mount_point: &Path,
        durability: MountDurability,
    ) -> SealmountResult<()> {
        let options = match durability {
            MountDurability::Journaled => JOURNALED_MOUNT_OPTIONS,
            MountDurability::Standard => DEFAULT_MOUNT_OPTIONS,
        };

        let out = self.mount.run(&[
            OsString::from("-o"),
            OsString::from(options),
            OsString::from(mapper),
            OsString::from(mount_point),
        ])?;
        if out.status != 0 {
            return Err(SealmountError::Mount {
                mapper: mapper.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                detail: format!("exit code {}: {}", out.status, out.diagnostic()),
            });
        }
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> SealmountResult<()> {
        self.umount.run_checked(&[OsString::from(mount_point)])?;
        Ok(())
    }
}

fn resolve_tool(
    explicit: Option<&str>,
    candidates: &[&str],
    name: &str,
) -> SealmountResult<PathBuf> {
    if let Some(path) = explicit.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(SealmountError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    if let Some(found) = config::detect_binary_path(candidates) {
        return Ok(PathBuf::from(found));
    }

    find_in_path(name).ok_or_else(|| {
        SealmountError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
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
