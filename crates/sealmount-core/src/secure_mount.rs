//! Ad-hoc secure-mount request layer.
//!
//! One request/response operation: the caller supplies a mount point and an
//! options map naming a kernel block-device ID; SealMount provisions the
//! device with a fresh random mapper name and ephemeral key and answers with
//! the mount path. Transport framing lives in the agent binary; everything
//! here is transport-agnostic.

use crate::devpath::resolve_device_id;
use crate::error::{SealmountError, SealmountResult};
use crate::keyfile::generate_ephemeral_key;
use crate::service::{MountRequest, MountService};
use sealmount_provider::{BlockDeviceProvisioner, FilesystemProvisioner};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const OPT_DEVICE_ID: &str = "deviceId";
pub const OPT_ENCRYPT_TYPE: &str = "encryptType";
pub const OPT_DATA_INTEGRITY: &str = "dataIntegrity";
const ENCRYPT_TYPE_LUKS: &str = "LUKS";

/// Wire form of one secure-mount request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMountRequest {
    pub mount_point: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Wire form of the answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMountResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SecureMountResponse {
    pub fn success(mount_path: &Path) -> Self {
        Self {
            ok: true,
            mount_path: Some(mount_path.to_string_lossy().into_owned()),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            mount_path: None,
            error: Some(message.into()),
        }
    }
}

/// Validate the options map and extract the device ID.
///
/// The accepted combination is exactly: a non-empty `deviceId`,
/// `encryptType` equal to `LUKS`, and a non-empty `dataIntegrity` marker.
/// Anything else is an invalid-argument error.
pub fn validate_request(request: &SecureMountRequest) -> SealmountResult<String> {
    let mount_point = request.mount_point.trim();
    if mount_point.is_empty() || !mount_point.starts_with('/') {
        return Err(SealmountError::InvalidRequest(format!(
            "mount_point must be an absolute path, got `{}`",
            request.mount_point
        )));
    }

    let device_id = request
        .options
        .get(OPT_DEVICE_ID)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            SealmountError::InvalidRequest(format!("options must carry a non-empty `{OPT_DEVICE_ID}`"))
        })?;

    match request.options.get(OPT_ENCRYPT_TYPE).map(|v| v.trim()) {
        Some(ENCRYPT_TYPE_LUKS) => {}
        Some(other) => {
            return Err(SealmountError::InvalidRequest(format!(
                "unsupported `{OPT_ENCRYPT_TYPE}` `{other}`; only `{ENCRYPT_TYPE_LUKS}` is served"
            )))
        }
        None => {
            return Err(SealmountError::InvalidRequest(format!(
                "options must carry `{OPT_ENCRYPT_TYPE}={ENCRYPT_TYPE_LUKS}`"
            )))
        }
    }

    let integrity_missing = request
        .options
        .get(OPT_DATA_INTEGRITY)
        .map(|value| value.trim().is_empty())
        .unwrap_or(true);
    if integrity_missing {
        return Err(SealmountError::InvalidRequest(format!(
            "options must carry a non-empty `{OPT_DATA_INTEGRITY}` marker"
        )));
    }

    Ok(device_id.to_string())
}

/// Serve one secure-mount request: validate, resolve the device ID, and
/// provision with a fresh ephemeral key. Returns the mount path.
pub fn handle_secure_mount<B, F>(
    service: &MountService<B, F>,
    request: &SecureMountRequest,
) -> SealmountResult<PathBuf>
where
    B: BlockDeviceProvisioner<Error = SealmountError>,
    F: FilesystemProvisioner<Error = SealmountError>,
{
    let device_id = validate_request(request)?;
    let device_path = resolve_device_id(&service.config().sysfs_block_root(), &device_id)?;

    let mount_request = MountRequest::ephemeral(
        service.config(),
        &device_path,
        Path::new(request.mount_point.trim()),
    );
    let key = generate_ephemeral_key();
    let report = service.setup_mount(&mount_request, &key)?;
    Ok(report.mount_point)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(entries: &[(&str, &str)]) -> SecureMountRequest {
        SecureMountRequest {
            mount_point: "/run/volumes/data".to_string(),
            options: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            flags: Vec::new(),
        }
    }

    fn valid_options() -> Vec<(&'static str, &'static str)> {
        vec![
            (OPT_DEVICE_ID, "253:16"),
            (OPT_ENCRYPT_TYPE, "LUKS"),
            (OPT_DATA_INTEGRITY, "true"),
        ]
    }

    #[test]
    fn valid_request_yields_device_id() {
        let id = validate_request(&request(&valid_options())).unwrap();
        assert_eq!(id, "253:16");
    }

    #[test]
    fn missing_device_id_is_rejected() {
        let options: Vec<_> = valid_options()
            .into_iter()
            .filter(|(k, _)| *k != OPT_DEVICE_ID)
            .collect();
        let err = validate_request(&request(&options)).unwrap_err();
        assert!(err.to_string().contains(OPT_DEVICE_ID));
    }

    #[test]
    fn wrong_encrypt_type_is_rejected() {
        let mut options = valid_options();
        options[1] = (OPT_ENCRYPT_TYPE, "plain");
        let err = validate_request(&request(&options)).unwrap_err();
        assert!(err.to_string().contains("plain"));
    }

    #[test]
    fn missing_encrypt_type_is_rejected() {
        let options: Vec<_> = valid_options()
            .into_iter()
            .filter(|(k, _)| *k != OPT_ENCRYPT_TYPE)
            .collect();
        assert!(validate_request(&request(&options)).is_err());
    }

    #[test]
    fn empty_data_integrity_is_rejected() {
        let mut options = valid_options();
        options[2] = (OPT_DATA_INTEGRITY, "  ");
        let err = validate_request(&request(&options)).unwrap_err();
        assert!(err.to_string().contains(OPT_DATA_INTEGRITY));
    }

    #[test]
    fn relative_mount_point_is_rejected() {
        let mut req = request(&valid_options());
        req.mount_point = "volumes/data".to_string();
        assert!(matches!(
            validate_request(&req),
            Err(SealmountError::InvalidRequest(_))
        ));
    }

    #[test]
    fn response_wire_forms_round_trip() {
        let ok = SecureMountResponse::success(Path::new("/run/volumes/data"));
        let encoded = serde_json::to_string(&ok).unwrap();
        assert!(encoded.contains("mount_path"));
        assert!(!encoded.contains("error"));

        let failed: SecureMountResponse =
            serde_json::from_str(r#"{"ok":false,"error":"boom"}"#).unwrap();
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
