//! Key-file persistence helpers shared by the CLI and the agent.
//!
//! Key files hold raw passphrase bytes for the lifetime of one provisioning
//! operation and are removed afterwards regardless of outcome.

use crate::error::{SealmountError, SealmountResult};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Length of the ephemeral keys generated for ad-hoc secure mounts.
pub const EPHEMERAL_KEY_LEN: usize = 64;

/// Generate fresh random key material for an ad-hoc mount request.
pub fn generate_ephemeral_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; EPHEMERAL_KEY_LEN]);
    OsRng.fill_bytes(&mut key);
    key
}

/// Read the workload secret as raw passphrase bytes.
pub fn read_secret(path: &Path) -> SealmountResult<Zeroizing<Vec<u8>>> {
    let contents = fs::read(path).map_err(|err| SealmountError::InvalidKey {
        path: path.to_path_buf(),
        reason: format!("unable to read workload secret: {err}"),
    })?;
    if contents.is_empty() {
        return Err(SealmountError::InvalidKey {
            path: path.to_path_buf(),
            reason: "workload secret is empty".to_string(),
        });
    }
    Ok(Zeroizing::new(contents))
}

/// Write raw key material to `path`, applying owner-only permissions.
///
/// The write goes through a sibling temp file that is persisted over the
/// destination, and the parent directory is fsynced afterwards.
pub fn write_key_file(path: &Path, key: &[u8]) -> SealmountResult<()> {
    let dest = refuse_symlink(path)?;
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(key)?;
    temp.as_file_mut().flush()?;
    #[cfg(unix)]
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o400))?;

    let _ = temp.as_file().sync_all();
    temp.persist(&dest)
        .map_err(|err| SealmountError::Io(err.error))?;
    let _ = sync_parent_dir(parent);
    Ok(())
}

/// Remove a key file, tolerating one that is already gone.
pub fn remove_key_file(path: &Path) -> SealmountResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SealmountError::Io(err)),
    }
}

/// Key material must never be written through a host-plantable symlink.
fn refuse_symlink(path: &Path) -> SealmountResult<PathBuf> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(SealmountError::InvalidKey {
            path: path.to_path_buf(),
            reason: "refusing to write key material through a symlink".to_string(),
        }),
        Ok(_) => Ok(path.to_path_buf()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(path.to_path_buf()),
        Err(err) => Err(SealmountError::Io(err)),
    }
}

fn sync_parent_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
