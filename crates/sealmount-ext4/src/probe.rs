//! ext4 superblock detection.

use sealmount_core::error::SealmountResult;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Superblock offset (1024) plus the in-superblock magic offset (56).
pub const EXT4_MAGIC_OFFSET: u64 = 1024 + 56;

/// ext4 magic 0xEF53, little-endian on disk.
pub const EXT4_MAGIC: [u8; 2] = [0x53, 0xEF];

/// Whether `mapper` carries an ext4 superblock.
///
/// A failure of the magic read itself maps to `Ok(false)`: on an
/// integrity-protected mapping, sectors that were never written return I/O
/// errors until the filesystem exists. Failing to open the device remains
/// fatal.
pub fn is_ext4(mapper: &Path) -> SealmountResult<bool> {
    let mut file = File::open(mapper)?;
    file.seek(SeekFrom::Start(EXT4_MAGIC_OFFSET))?;

    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == EXT4_MAGIC),
        Err(err) => {
            log::debug!(
                "magic probe read on {} failed ({err}); treating as unformatted",
                mapper.display()
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn image_with(payload: &[u8], at: u64, size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let mut contents = vec![0u8; size];
        contents[at as usize..at as usize + payload.len()].copy_from_slice(payload);
        file.write_all(&contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn zeroed_device_is_not_ext4() {
        let image = image_with(&[], 0, 8192);
        assert!(!is_ext4(image.path()).unwrap());
    }

    #[test]
    fn magic_at_1080_is_ext4() {
        let image = image_with(&EXT4_MAGIC, EXT4_MAGIC_OFFSET, 8192);
        assert!(is_ext4(image.path()).unwrap());
    }

    #[test]
    fn byteswapped_magic_is_not_ext4() {
        let image = image_with(&[0xEF, 0x53], EXT4_MAGIC_OFFSET, 8192);
        assert!(!is_ext4(image.path()).unwrap());
    }

    #[test]
    fn failing_probe_read_means_unformatted() {
        // Too short for the magic read to complete, like an integrity
        // device erroring on unwritten sectors.
        let image = image_with(&[], 0, 100);
        assert!(!is_ext4(image.path()).unwrap());
    }

    #[test]
    fn missing_device_stays_fatal() {
        assert!(is_ext4(Path::new("/nonexistent/mapper/volume")).is_err());
    }
}
