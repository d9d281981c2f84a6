//! Resolution of opaque kernel block-device IDs to block-special paths.
//!
//! The host hands the guest a `major:minor` style device ID; the kernel
//! exposes it as a symlink under `/sys/dev/block/<id>` whose target's
//! basename is the device name under `/dev`.

use crate::error::{SealmountError, SealmountResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Resolve `device_id` through the sysfs symlink to `/dev/<basename>`.
///
/// Resolution failure is a fatal precondition error; there is no fallback
/// probing.
pub fn resolve_device_id(sysfs_block_root: &Path, device_id: &str) -> SealmountResult<PathBuf> {
    let trimmed = device_id.trim();
    if trimmed.is_empty() {
        return Err(SealmountError::DeviceResolution {
            id: device_id.to_string(),
            reason: "device id is empty".to_string(),
        });
    }

    let link = sysfs_block_root.join(trimmed);
    let target = fs::read_link(&link).map_err(|err| SealmountError::DeviceResolution {
        id: trimmed.to_string(),
        reason: format!("reading {} failed: {err}", link.display()),
    })?;

    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SealmountError::DeviceResolution {
            id: trimmed.to_string(),
            reason: format!("sysfs link target {} has no basename", target.display()),
        })?;

    Ok(Path::new("/dev").join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn resolves_symlink_basename_under_dev() {
        let root = tempdir().unwrap();
        symlink(
            "../../devices/pci0000:00/0000:00:05.0/virtio2/block/vdb",
            root.path().join("253:16"),
        )
        .unwrap();

        let resolved = resolve_device_id(root.path(), "253:16").unwrap();
        assert_eq!(resolved, PathBuf::from("/dev/vdb"));
    }

    #[test]
    fn missing_id_is_fatal() {
        let root = tempdir().unwrap();
        let err = resolve_device_id(root.path(), "8:0").unwrap_err();
        match err {
            SealmountError::DeviceResolution { id, .. } => assert_eq!(id, "8:0"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_id_is_fatal() {
        let root = tempdir().unwrap();
        assert!(resolve_device_id(root.path(), "  ").is_err());
    }
}
