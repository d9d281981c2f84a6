//! Mount orchestration: compose the device manager and the filesystem
//! provisioner into one idempotent "ensure encrypted, formatted, mounted
//! volume" operation.

use crate::config::SealmountConfig;
use crate::error::{SealmountError, SealmountResult};
use crate::keyfile;
use rand::rngs::OsRng;
use rand::RngCore;
use sealmount_provider::{BlockDeviceProvisioner, Device, FilesystemProvisioner, MountDurability};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MAPPER_PREFIX: &str = "sealmount";

/// Ephemeral description of one provisioning operation.
///
/// Persistent volumes derive a stable mapper name from device and mount
/// point; ad-hoc requests draw fresh random identifiers so concurrent
/// provisioning of different devices cannot collide.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub device_path: PathBuf,
    pub mount_point: PathBuf,
    pub mapper_name: String,
    pub key_path: PathBuf,
    pub durability: MountDurability,
}

impl MountRequest {
    /// Request for a workload volume: deterministic mapper name, journaled
    /// mount options.
    pub fn persistent(config: &SealmountConfig, device_path: &Path, mount_point: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(device_path.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        hasher.update(mount_point.as_os_str().as_encoded_bytes());
        let tag = hex::encode(&hasher.finalize()[..8]);
        let mapper_name = format!("{MAPPER_PREFIX}-{tag}");

        Self {
            device_path: device_path.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            key_path: config.key_dir().join(format!("{mapper_name}.key")),
            mapper_name,
            durability: MountDurability::Journaled,
        }
    }

    /// Request for an ad-hoc service mount: fresh random mapper and key-file
    /// names, default mount options.
    pub fn ephemeral(config: &SealmountConfig, device_path: &Path, mount_point: &Path) -> Self {
        let mut token = [0u8; 16];
        OsRng.fill_bytes(&mut token);
        let tag = hex::encode(token);
        let mapper_name = format!("{MAPPER_PREFIX}-tmp-{tag}");

        Self {
            device_path: device_path.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            key_path: config.key_dir().join(format!("{mapper_name}.key")),
            mapper_name,
            durability: MountDurability::Standard,
        }
    }
}

/// Outcome summary returned by `setup_mount`.
#[derive(Debug, Clone)]
pub struct MountReport {
    pub mount_point: PathBuf,
    pub mapper_path: PathBuf,
    /// Whether the device needed a fresh LUKS2 format.
    pub formatted: bool,
    /// Whether an ext4 filesystem was created during this operation.
    pub created_fs: bool,
}

/// Removes the ephemeral key file when dropped, success or failure alike.
struct KeyFileGuard {
    path: PathBuf,
}

impl Drop for KeyFileGuard {
    fn drop(&mut self) {
        if let Err(err) = keyfile::remove_key_file(&self.path) {
            log::warn!("failed to remove key file {}: {err}", self.path.display());
        }
    }
}

/// Orchestrates the device manager and filesystem provisioner for one
/// volume at a time. All operations are synchronous; concurrent callers for
/// the same backing device are not supported.
#[derive(Debug, Clone)]
pub struct MountService<B, F> {
    config: Arc<SealmountConfig>,
    block: B,
    fs: F,
}

impl<B, F> MountService<B, F>
where
    B: BlockDeviceProvisioner<Error = SealmountError>,
    F: FilesystemProvisioner<Error = SealmountError>,
{
    pub fn new(config: Arc<SealmountConfig>, block: B, fs: F) -> Self {
        Self { config, block, fs }
    }

    pub fn config(&self) -> &SealmountConfig {
        &self.config
    }

    /// Ensure `request.device_path` is LUKS2-formatted, opened with a
    /// verified detached header, carries ext4, and is mounted at the target
    /// path.
    ///
    /// A verification failure inside open is terminal: the device stays
    /// formatted but unmapped and nothing is mounted. Any failure after a
    /// successful open closes the mapping again; a failing close is joined
    /// with the original error rather than replacing it.
    pub fn setup_mount(&self, request: &MountRequest, key: &[u8]) -> SealmountResult<MountReport> {
        keyfile::write_key_file(&request.key_path, key)?;
        let _key_guard = KeyFileGuard {
            path: request.key_path.clone(),
        };

        let device = Device::new(
            &request.device_path,
            self.config
                .header_dir()
                .join(format!("{}.hdr", request.mapper_name)),
            &request.key_path,
            &request.mapper_name,
        );

        let formatted = if self.block.is_luks(&device.device_path)? {
            log::debug!(
                "device {} already carries a LUKS header; format skipped",
                device.device_path.display()
            );
            false
        } else {
            log::info!("formatting {} as LUKS2", device.device_path.display());
            self.block.format(&device)?;
            true
        };

        let mapper_path = self.block.open(&device)?;

        let created_fs = match self.provision_filesystem(request, &mapper_path) {
            Ok(created) => created,
            Err(original) => {
                log::warn!(
                    "provisioning failed after open; closing mapping {}",
                    request.mapper_name
                );
                return Err(match self.block.close(&request.mapper_name) {
                    Ok(()) => original,
                    Err(cleanup) => original.with_cleanup(cleanup),
                });
            }
        };

        Ok(MountReport {
            mount_point: request.mount_point.clone(),
            mapper_path,
            formatted,
            created_fs,
        })
    }

    /// Unmount and close a previously provisioned volume.
    ///
    /// Both steps run even if the first fails; errors are joined.
    pub fn teardown(&self, mount_point: Option<&Path>, mapper_name: &str) -> SealmountResult<()> {
        let unmount_result = match mount_point {
            Some(path) => self.fs.unmount(path),
            None => Ok(()),
        };

        match (unmount_result, self.block.close(mapper_name)) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) => Err(err),
            (Ok(()), Err(err)) => Err(err),
            (Err(unmount), Err(close)) => Err(unmount.with_cleanup(close)),
        }
    }

    fn provision_filesystem(
        &self,
        request: &MountRequest,
        mapper_path: &Path,
    ) -> SealmountResult<bool> {
        let created = if self.fs.is_ext4(mapper_path)? {
            log::debug!("{} already carries ext4; mkfs skipped", mapper_path.display());
            false
        } else {
            log::info!("creating ext4 on {}", mapper_path.display());
            self.fs.make_ext4(mapper_path)?;
            true
        };

        fs::create_dir_all(&request.mount_point)?;
        self.fs
            .mount(mapper_path, &request.mount_point, request.durability)?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealmount_provider::MappingState;
    use std::collections::HashSet;
    use std::sync::Mutex;

    type CallLog = Arc<Mutex<Vec<String>>>;

    #[derive(Clone)]
    struct MockBlock {
        calls: CallLog,
        luks: bool,
        fail_open: bool,
        fail_close: bool,
    }

    impl BlockDeviceProvisioner for MockBlock {
        type Error = SealmountError;

        fn is_luks(&self, _device: &Path) -> SealmountResult<bool> {
            self.calls.lock().unwrap().push("is_luks".into());
            Ok(self.luks)
        }

        fn format(&self, _device: &Device) -> SealmountResult<()> {
            self.calls.lock().unwrap().push("format".into());
            Ok(())
        }

        fn open(&self, device: &Device) -> SealmountResult<PathBuf> {
            self.calls.lock().unwrap().push("open".into());
            if self.fail_open {
                return Err(SealmountError::HeaderPolicy {
                    field: "keyslots".into(),
                    reason: "expected exactly 1 keyslot, found 2".into(),
                });
            }
            Ok(PathBuf::from("/dev/mapper").join(&device.mapper_name))
        }

        fn close(&self, _mapper_name: &str) -> SealmountResult<()> {
            self.calls.lock().unwrap().push("close".into());
            if self.fail_close {
                return Err(SealmountError::tool("cryptsetup", "close failed"));
            }
            Ok(())
        }

        fn mapping_state(&self, _mapper_name: &str) -> SealmountResult<MappingState> {
            Ok(MappingState::Inactive)
        }
    }

    #[derive(Clone)]
    struct MockFs {
        calls: CallLog,
        ext4: bool,
        fail_mount: bool,
    }

    impl FilesystemProvisioner for MockFs {
        type Error = SealmountError;

        fn is_ext4(&self, _mapper: &Path) -> SealmountResult<bool> {
            self.calls.lock().unwrap().push("is_ext4".into());
            Ok(self.ext4)
        }

        fn make_ext4(&self, _mapper: &Path) -> SealmountResult<()> {
            self.calls.lock().unwrap().push("make_ext4".into());
            Ok(())
        }

        fn mount(
            &self,
            mapper: &Path,
            mount_point: &Path,
            _durability: MountDurability,
        ) -> SealmountResult<()> {
            self.calls.lock().unwrap().push("mount".into());
            if self.fail_mount {
                return Err(SealmountError::Mount {
                    mapper: mapper.to_path_buf(),
                    mount_point: mount_point.to_path_buf(),
                    detail: "mount: unknown filesystem".into(),
                });
            }
            Ok(())
        }

        fn unmount(&self, _mount_point: &Path) -> SealmountResult<()> {
            self.calls.lock().unwrap().push("unmount".into());
            Ok(())
        }
    }

    fn harness(
        luks: bool,
        ext4: bool,
        fail_open: bool,
        fail_mount: bool,
        fail_close: bool,
    ) -> (
        MountService<MockBlock, MockFs>,
        CallLog,
        MountRequest,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SealmountConfig::default();
        config.storage.key_dir = dir.path().join("keys").to_string_lossy().into_owned();
        config.storage.header_dir = dir.path().join("headers").to_string_lossy().into_owned();
        let config = Arc::new(config);

        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let block = MockBlock {
            calls: calls.clone(),
            luks,
            fail_open,
            fail_close,
        };
        let fs = MockFs {
            calls: calls.clone(),
            ext4,
            fail_mount,
        };

        let request = MountRequest::persistent(
            &config,
            Path::new("/dev/vdb"),
            &dir.path().join("mnt").join("data"),
        );
        (MountService::new(config, block, fs), calls, request, dir)
    }

    #[test]
    fn fresh_device_runs_full_sequence() {
        let (service, calls, request, _dir) = harness(false, false, false, false, false);
        let report = service.setup_mount(&request, &[0xAB; 64]).unwrap();

        assert!(report.formatted);
        assert!(report.created_fs);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["is_luks", "format", "open", "is_ext4", "make_ext4", "mount"]
        );
        assert!(request.mount_point.is_dir());
        assert!(!request.key_path.exists(), "key file must be removed");
    }

    #[test]
    fn provisioned_device_skips_format_and_mkfs() {
        let (service, calls, request, _dir) = harness(true, true, false, false, false);
        let report = service.setup_mount(&request, &[0xAB; 64]).unwrap();

        assert!(!report.formatted);
        assert!(!report.created_fs);
        assert_eq!(*calls.lock().unwrap(), vec!["is_luks", "open", "is_ext4", "mount"]);
    }

    #[test]
    fn open_failure_is_terminal_without_close() {
        let (service, calls, request, _dir) = harness(false, false, true, false, false);
        let err = service.setup_mount(&request, &[0xAB; 64]).unwrap_err();

        match err {
            SealmountError::HeaderPolicy { field, .. } => assert_eq!(field, "keyslots"),
            other => panic!("unexpected error: {other:?}"),
        }
        let calls = calls.lock().unwrap();
        assert!(!calls.contains(&"close".to_string()));
        assert!(!calls.contains(&"mount".to_string()));
        assert!(!request.key_path.exists(), "key file must be removed");
    }

    #[test]
    fn mount_failure_closes_mapping_and_keeps_original_error() {
        let (service, calls, request, _dir) = harness(true, true, false, true, false);
        let err = service.setup_mount(&request, &[0xAB; 64]).unwrap_err();

        assert!(matches!(err, SealmountError::Mount { .. }));
        assert_eq!(calls.lock().unwrap().last().unwrap(), "close");
    }

    #[test]
    fn failing_cleanup_is_joined_not_swallowed() {
        let (service, _calls, request, _dir) = harness(true, true, false, true, true);
        let err = service.setup_mount(&request, &[0xAB; 64]).unwrap_err();

        match err {
            SealmountError::Cleanup { original, cleanup } => {
                assert!(matches!(*original, SealmountError::Mount { .. }));
                assert!(matches!(*cleanup, SealmountError::Tool { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn setup_mount_is_idempotent_per_request() {
        let (service, calls, request, _dir) = harness(true, true, false, false, false);
        service.setup_mount(&request, &[0xCD; 64]).unwrap();
        service.setup_mount(&request, &[0xCD; 64]).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| *c == "format").count(), 0);
        assert_eq!(calls.iter().filter(|c| *c == "make_ext4").count(), 0);
        assert_eq!(calls.iter().filter(|c| *c == "mount").count(), 2);
    }

    #[test]
    fn persistent_names_are_stable_and_distinct() {
        let config = SealmountConfig::default();
        let a = MountRequest::persistent(&config, Path::new("/dev/vdb"), Path::new("/mnt/a"));
        let b = MountRequest::persistent(&config, Path::new("/dev/vdb"), Path::new("/mnt/a"));
        let c = MountRequest::persistent(&config, Path::new("/dev/vdb"), Path::new("/mnt/b"));

        assert_eq!(a.mapper_name, b.mapper_name);
        assert_ne!(a.mapper_name, c.mapper_name);
        assert_eq!(a.durability, MountDurability::Journaled);
    }

    #[test]
    fn ephemeral_names_do_not_collide() {
        let config = SealmountConfig::default();
        let mut mappers = HashSet::new();
        let mut keys = HashSet::new();
        for _ in 0..512 {
            let request =
                MountRequest::ephemeral(&config, Path::new("/dev/vdb"), Path::new("/mnt/x"));
            assert!(mappers.insert(request.mapper_name.clone()));
            assert!(keys.insert(request.key_path.clone()));
            assert_eq!(request.durability, MountDurability::Standard);
        }
    }
}
