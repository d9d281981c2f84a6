//! Core building blocks shared by SealMount binaries.
//!
//! Configuration, the mount orchestrator, and the secure-mount request layer
//! live here so downstream crates can focus on operator surfaces instead of
//! reimplementing provisioning logic.

pub mod config;
pub mod devpath;
pub mod error;
pub mod keyfile;
pub mod logging;
pub mod secure_mount;
pub mod service;
pub mod workflow;

pub use config::{AgentCfg, CryptoCfg, PathsCfg, SealmountConfig, StorageCfg};
pub use error::{SealmountError, SealmountResult};
pub use secure_mount::{SecureMountRequest, SecureMountResponse};
pub use service::{MountReport, MountRequest, MountService};
