//! Configuration model and helpers used by SealMount services.

use crate::error::{SealmountError, SealmountResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sealmount.toml";
const SECRET_PATH_ENV: &str = "SEALMOUNT_SECRET_PATH";
const BOOTSTRAP_FILE_NAME: &str = "sealmount.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "SealMount";
const APP_NAME: &str = "sealmount";

pub(crate) const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
pub(crate) const KNOWN_MKFS_PATHS: &[&str] = &[
    "/sbin/mkfs.ext4",
    "/usr/sbin/mkfs.ext4",
    "/usr/bin/mkfs.ext4",
];
pub(crate) const KNOWN_MOUNT_PATHS: &[&str] = &["/bin/mount", "/usr/bin/mount"];
pub(crate) const KNOWN_UMOUNT_PATHS: &[&str] = &["/bin/umount", "/usr/bin/umount"];

/// Return the first existing candidate path, if any.
pub fn detect_binary_path(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(|path| path.to_string_lossy().into_owned())
}

pub fn default_cryptsetup_candidates() -> &'static [&'static str] {
    KNOWN_CRYPTSETUP_PATHS
}

pub fn default_mkfs_candidates() -> &'static [&'static str] {
    KNOWN_MKFS_PATHS
}

pub fn default_mount_candidates() -> &'static [&'static str] {
    KNOWN_MOUNT_PATHS
}

pub fn default_umount_candidates() -> &'static [&'static str] {
    KNOWN_UMOUNT_PATHS
}

/// Host paths and tool locations. Everything the provisioners touch on the
/// host filesystem is explicit configuration so tests can point the stack at
/// fakes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PathsCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub mkfs_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    #[serde(default = "default_mapper_root")]
    pub mapper_root: String,

    #[serde(default = "default_sysfs_block_root")]
    pub sysfs_block_root: String,

    /// cryptsetup uses this directory for cross-process locking; it must
    /// exist before the tool is invoked.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: String,
}

fn default_mapper_root() -> String {
    "/dev/mapper".to_string()
}

fn default_sysfs_block_root() -> String {
    "/sys/dev/block".to_string()
}

fn default_lock_dir() -> String {
    "/run/cryptsetup".to_string()
}

impl Default for PathsCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            mkfs_path: None,
            mount_path: None,
            umount_path: None,
            mapper_root: default_mapper_root(),
            sysfs_block_root: default_sysfs_block_root(),
            lock_dir: default_lock_dir(),
        }
    }
}

/// Where detached headers, ephemeral key files, and the workload secret live.
/// Header and key directories must sit in VM-private storage (tmpfs) that the
/// host cannot silently rewrite.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageCfg {
    #[serde(default = "default_header_dir")]
    pub header_dir: String,

    #[serde(default = "default_key_dir")]
    pub key_dir: String,

    #[serde(default = "default_secret_path")]
    pub secret_path: String,
}

fn default_header_dir() -> String {
    "/run/sealmount/headers".to_string()
}

fn default_key_dir() -> String {
    "/run/sealmount/keys".to_string()
}

fn default_secret_path() -> String {
    "/run/sealmount/workload-secret".to_string()
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            header_dir: default_header_dir(),
            key_dir: default_key_dir(),
            secret_path: default_secret_path(),
        }
    }
}

/// Timeouts applied to external tool invocations.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Secure-mount agent settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentCfg {
    #[serde(default = "default_agent_socket")]
    pub socket_path: String,

    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

fn default_agent_socket() -> String {
    "/run/sealmount/agent.sock".to_string()
}

fn default_max_request_bytes() -> usize {
    64 * 1024
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            socket_path: default_agent_socket(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SealmountConfig {
    #[serde(default)]
    pub paths: PathsCfg,

    #[serde(default)]
    pub storage: StorageCfg,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(default)]
    pub agent: AgentCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl Default for SealmountConfig {
    fn default() -> Self {
        Self {
            paths: PathsCfg::default(),
            storage: StorageCfg::default(),
            crypto: CryptoCfg::default(),
            agent: AgentCfg::default(),
            path: PathBuf::new(),
            format: ConfigFormat::Toml,
        }
    }
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl SealmountConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// If the requested path does not exist a bootstrap template is
    /// materialised there. When the caller requests the global default and
    /// the process lacks permission to create it, a per-user configuration
    /// is written to the platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> SealmountResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("sealmount config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(SealmountError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    SealmountError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/sealmount.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    SealmountError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!(
                        "sealmount config bootstrap created at {}",
                        user_path.display()
                    );
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> SealmountResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let issues = cfg.validate();
        if let Some(issue) = issues.first() {
            return Err(SealmountError::InvalidConfig(issue.clone()));
        }

        Ok(cfg)
    }

    /// Perform a best-effort validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for (field, value) in [
            ("paths.mapper_root", &self.paths.mapper_root),
            ("paths.sysfs_block_root", &self.paths.sysfs_block_root),
            ("paths.lock_dir", &self.paths.lock_dir),
            ("storage.header_dir", &self.storage.header_dir),
            ("storage.key_dir", &self.storage.key_dir),
            ("storage.secret_path", &self.storage.secret_path),
            ("agent.socket_path", &self.agent.socket_path),
        ] {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                issues.push(format!("{field} must not be empty"));
            } else if !trimmed.starts_with('/') {
                issues.push(format!("{field} must be an absolute path: {trimmed}"));
            }
        }

        for (field, value) in [
            ("paths.cryptsetup_path", &self.paths.cryptsetup_path),
            ("paths.mkfs_path", &self.paths.mkfs_path),
            ("paths.mount_path", &self.paths.mount_path),
            ("paths.umount_path", &self.paths.umount_path),
        ] {
            if let Some(path) = value.as_deref().map(str::trim) {
                if path.is_empty() {
                    issues.push(format!("{field} is set but empty"));
                }
            }
        }

        if self.crypto.timeout_secs == 0 {
            issues.push("crypto.timeout_secs must be at least 1".to_string());
        }
        if self.agent.max_request_bytes < 1024 {
            issues.push("agent.max_request_bytes must be at least 1024".to_string());
        }

        issues
    }

    /// Resolve the workload-secret path, honouring the env override.
    pub fn secret_path(&self) -> PathBuf {
        if let Ok(override_path) = env::var(SECRET_PATH_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.storage.secret_path)
    }

    pub fn header_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.header_dir)
    }

    pub fn key_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.key_dir)
    }

    pub fn mapper_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.mapper_root)
    }

    pub fn sysfs_block_root(&self) -> PathBuf {
        PathBuf::from(&self.paths.sysfs_block_root)
    }

    pub fn lock_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.lock_dir)
    }

    /// Mapper device path for a mapping name.
    pub fn mapper_path(&self, mapper_name: &str) -> PathBuf {
        self.mapper_root().join(mapper_name)
    }

    /// Translate the stored timeout into a `Duration`.
    pub fn tool_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.crypto.timeout_secs)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> SealmountResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|err| SealmountError::InvalidConfig(err.to_string()))?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

/// Render the commented bootstrap template written on first run.
pub fn bootstrap_template() -> String {
    let cryptsetup = detect_binary_path(KNOWN_CRYPTSETUP_PATHS)
        .unwrap_or_else(|| "/usr/sbin/cryptsetup".to_string());
    let mkfs =
        detect_binary_path(KNOWN_MKFS_PATHS).unwrap_or_else(|| "/sbin/mkfs.ext4".to_string());

    format!(
        "# Auto-generated SealMount configuration bootstrap.\n\
         # Header and key directories must live on guest-private tmpfs.\n\
         \n\
         [paths]\n\
         cryptsetup_path = \"{cryptsetup}\"\n\
         mkfs_path = \"{mkfs}\"\n\
         mapper_root = \"/dev/mapper\"\n\
         sysfs_block_root = \"/sys/dev/block\"\n\
         lock_dir = \"/run/cryptsetup\"\n\
         \n\
         [storage]\n\
         header_dir = \"/run/sealmount/headers\"\n\
         key_dir = \"/run/sealmount/keys\"\n\
         secret_path = \"/run/sealmount/workload-secret\"\n\
         \n\
         [crypto]\n\
         timeout_secs = 120\n\
         \n\
         [agent]\n\
         socket_path = \"/run/sealmount/agent.sock\"\n"
    )
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            let template = bootstrap_template();
            file.write_all(template.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") { 0o640 } else { 0o600 };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: impl Into<String>) -> Self {
            let prev = env::var(key).ok();
            env::set_var(key, value.into());
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(prev) = &self.prev {
                env::set_var(self.key, prev);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    #[test]
    fn secret_path_respects_env_override() {
        let config = SealmountConfig::default();

        let guard = EnvGuard::set(SECRET_PATH_ENV, "/tmp/override.secret");
        assert_eq!(config.secret_path(), PathBuf::from("/tmp/override.secret"));
        drop(guard);
        assert_eq!(config.secret_path(), PathBuf::from(default_secret_path()));
    }

    #[test]
    fn defaults_pass_validation() {
        let config = SealmountConfig::default();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn validation_flags_relative_and_empty_paths() {
        let mut config = SealmountConfig::default();
        config.paths.mapper_root = "dev/mapper".to_string();
        config.storage.key_dir = String::new();
        config.crypto.timeout_secs = 0;

        let issues = config.validate();
        assert!(issues.iter().any(|i| i.contains("paths.mapper_root")));
        assert!(issues.iter().any(|i| i.contains("storage.key_dir")));
        assert!(issues.iter().any(|i| i.contains("crypto.timeout_secs")));
    }

    #[test]
    fn load_parses_toml_and_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sealmount.toml");
        fs::write(
            &path,
            "[paths]\ncryptsetup_path = \"/opt/bin/cryptsetup\"\n\n[crypto]\ntimeout_secs = 30\n",
        )
        .unwrap();

        let config = SealmountConfig::load(&path).unwrap();
        assert_eq!(
            config.paths.cryptsetup_path.as_deref(),
            Some("/opt/bin/cryptsetup")
        );
        assert_eq!(config.crypto.timeout_secs, 30);
        assert_eq!(config.paths.mapper_root, default_mapper_root());
        assert_eq!(config.mapper_path("vol"), PathBuf::from("/dev/mapper/vol"));
    }

    #[test]
    fn bootstrap_template_parses_back() {
        let parsed: SealmountConfig = toml::from_str(&bootstrap_template()).unwrap();
        assert!(parsed.validate().is_empty());
    }
}
