//! Device manager for LUKS2 volumes backed by untrusted block devices.
//!
//! Integrates with the host via `cryptsetup` (isLuks/luksFormat/
//! luksHeaderBackup/luksDump/open/close). Header metadata is only ever read
//! from the detached backup and must match the hardened baseline in
//! `header` before a mapping is activated.

mod command;
pub mod header;

#[cfg(target_os = "linux")]
mod system;
#[cfg(target_os = "linux")]
pub use system::SystemDeviceProvisioner;

#[cfg(not(target_os = "linux"))]
mod unsupported;
#[cfg(not(target_os = "linux"))]
pub use unsupported::SystemDeviceProvisioner;

pub use header::{verify_header, HeaderMetadata};
