//! Pre-initialisation of the blocks the ext4 formatter will probe.
//!
//! On a dm-integrity target every read of a never-written block fails, and
//! mkfs reads some of the locations it is about to write. The dry run is
//! used as an oracle for which blocks those are; each one is overwritten
//! with a zeroed block first so it carries a valid integrity tag.

use sealmount_core::error::{SealmountError, SealmountResult};
use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Fixed marker preceding the superblock-backup block list in mkfs output.
const BACKUP_MARKER: &str = "Superblock backups stored on blocks:";

/// Blocks are wiped in filesystem-block units of 4096 bytes.
pub(crate) const WIPE_BLOCK_SIZE: usize = 4096;

#[repr(C, align(4096))]
struct AlignedBlock([u8; WIPE_BLOCK_SIZE]);

/// Parse the dry-run output into the set of blocks to wipe.
///
/// Block 0 is always included: the primary superblock region is read by the
/// formatter whether or not backups exist.
pub(crate) fn wipe_set(dry_run_output: &str) -> BTreeSet<u64> {
    let mut blocks = BTreeSet::new();
    blocks.insert(0);

    let Some(position) = dry_run_output.find(BACKUP_MARKER) else {
        return blocks;
    };
    let tail = &dry_run_output[position + BACKUP_MARKER.len()..];

    let mut current = String::new();
    for ch in tail.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if !current.is_empty() {
            if let Ok(block) = current.parse::<u64>() {
                blocks.insert(block);
            }
            current.clear();
        }
        // The list is digits separated by commas and whitespace; anything
        // else ends it.
        if !matches!(ch, ',' | ' ' | '\t' | '\n' | '\r') {
            break;
        }
    }
    if let Ok(block) = current.parse::<u64>() {
        blocks.insert(block);
    }

    blocks
}

/// Write one zeroed block at `block * 4096` for every entry, bypassing the
/// page cache.
pub(crate) fn wipe_blocks(device: &Path, blocks: &BTreeSet<u64>) -> SealmountResult<()> {
    let fd = match open_for_wipe(device, libc::O_DIRECT) {
        Ok(fd) => fd,
        // dm targets accept O_DIRECT; plain-file backings may not.
        Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
            log::debug!(
                "{} does not accept O_DIRECT; wiping through the page cache",
                device.display()
            );
            open_for_wipe(device, 0).map_err(SealmountError::Io)?
        }
        Err(err) => return Err(SealmountError::Io(err)),
    };

    let result = write_zero_blocks(fd, blocks);
    // SAFETY: fd was returned by open() above and is closed exactly once.
    unsafe { libc::close(fd) };
    result.map_err(|err| {
        SealmountError::tool(
            "wipe",
            format!("zeroing blocks on {} failed: {err}", device.display()),
        )
    })
}

fn open_for_wipe(device: &Path, extra_flags: libc::c_int) -> std::io::Result<libc::c_int> {
    let path = CString::new(device.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: path is a valid NUL-terminated string for the duration of the
    // call.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC | extra_flags,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn write_zero_blocks(fd: libc::c_int, blocks: &BTreeSet<u64>) -> std::io::Result<()> {
    let buffer = Box::new(AlignedBlock([0u8; WIPE_BLOCK_SIZE]));

    for &block in blocks {
        let offset = block
            .checked_mul(WIPE_BLOCK_SIZE as u64)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        pwrite_full(fd, &buffer.0, offset as libc::off_t)?;
    }

    // SAFETY: fd is open for the duration of the call.
    if unsafe { libc::fsync(fd) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// A single direct write is not guaranteed to transfer the whole buffer;
/// loop until it has.
fn pwrite_full(fd: libc::c_int, buf: &[u8], offset: libc::off_t) -> std::io::Result<()> {
    let mut written = 0usize;
    while written < buf.len() {
        // SAFETY: the pointer/length pair stays inside `buf`.
        let rc = unsafe {
            libc::pwrite(
                fd,
                buf[written..].as_ptr().cast(),
                buf.len() - written,
                offset + written as libc::off_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero));
        }
        written += rc as usize;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const DRY_RUN_OUTPUT: &str = "\
mke2fs 1.47.0 (5-Feb-2023)
Creating filesystem with 262144 4k blocks and 65536 inodes
Filesystem UUID: 3d9f4c1e-53ef-4e6e-9c3b-0a1b2c3d4e5f
Superblock backups stored on blocks:
\t32768, 98304, 163840, 229376

";

    #[test]
    fn wipe_set_parses_backup_blocks_and_always_holds_zero() {
        let blocks = wipe_set(DRY_RUN_OUTPUT);
        assert_eq!(
            blocks.iter().copied().collect::<Vec<_>>(),
            vec![0, 32768, 98304, 163840, 229376]
        );
    }

    #[test]
    fn wipe_set_without_marker_is_just_block_zero() {
        let blocks = wipe_set("mke2fs 1.47.0 (5-Feb-2023)\nCreating filesystem\n");
        assert_eq!(blocks.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn wipe_set_stops_at_trailing_prose() {
        let output = "Superblock backups stored on blocks: \n\t8, 24\n\nAllocating group tables: done\n";
        let blocks = wipe_set(output);
        assert_eq!(blocks.iter().copied().collect::<Vec<_>>(), vec![0, 8, 24]);
    }

    #[test]
    fn wipe_zeroes_exactly_the_listed_blocks() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("volume.img");
        fs::write(&image, vec![0xFFu8; WIPE_BLOCK_SIZE * 4]).unwrap();

        let blocks: BTreeSet<u64> = [0u64, 2].into_iter().collect();
        wipe_blocks(&image, &blocks).unwrap();

        let contents = fs::read(&image).unwrap();
        assert!(contents[..WIPE_BLOCK_SIZE].iter().all(|b| *b == 0));
        assert!(contents[WIPE_BLOCK_SIZE..2 * WIPE_BLOCK_SIZE]
            .iter()
            .all(|b| *b == 0xFF));
        assert!(contents[2 * WIPE_BLOCK_SIZE..3 * WIPE_BLOCK_SIZE]
            .iter()
            .all(|b| *b == 0));
        assert!(contents[3 * WIPE_BLOCK_SIZE..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn wiping_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("volume.img");
        fs::write(&image, vec![0xAAu8; WIPE_BLOCK_SIZE * 3]).unwrap();

        let blocks: BTreeSet<u64> = [0u64, 1].into_iter().collect();
        wipe_blocks(&image, &blocks).unwrap();
        let first = fs::read(&image).unwrap();
        wipe_blocks(&image, &blocks).unwrap();
        let second = fs::read(&image).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wipe_extends_past_end_of_backing() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("volume.img");
        fs::write(&image, vec![0u8; WIPE_BLOCK_SIZE]).unwrap();

        let blocks: BTreeSet<u64> = [0u64, 8].into_iter().collect();
        wipe_blocks(&image, &blocks).unwrap();
        let len = fs::metadata(&image).unwrap().len();
        assert_eq!(len, 9 * WIPE_BLOCK_SIZE as u64);
    }
}
