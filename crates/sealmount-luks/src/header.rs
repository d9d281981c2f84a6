//! LUKS2 header metadata model and the hardened-baseline check.
//!
//! The metadata parsed here always comes from the detached header backup.
//! The check is an exact-equality policy, not a minimum-strength one: the
//! host fully controls the raw device, so any successfully parsed header
//! that is not exactly the expected shape is treated as a substituted or
//! downgraded header and rejected.

use sealmount_core::error::{SealmountError, SealmountResult};
use serde::Deserialize;
use std::collections::BTreeMap;

const EXPECTED_CIPHER: &str = "aes-xts-plain64";
const EXPECTED_KDF: &str = "argon2id";
/// 512-bit XTS key, expressed in bytes as luksDump reports it.
const EXPECTED_KEY_BYTES: u64 = 64;

/// Structured dump of a LUKS2 header (`cryptsetup luksDump` JSON metadata),
/// each section a mapping from a slot ID to its parameters.
///
/// Unknown fields are ignored on parse; everything the policy depends on is
/// checked explicitly by [`verify_header`].
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderMetadata {
    #[serde(default)]
    pub keyslots: BTreeMap<String, Keyslot>,
    #[serde(default)]
    pub tokens: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub segments: BTreeMap<String, Segment>,
    #[serde(default)]
    pub digests: BTreeMap<String, DigestSlot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Keyslot {
    #[serde(rename = "type")]
    pub slot_type: Option<String>,
    pub key_size: Option<u64>,
    pub area: Option<KeyslotArea>,
    pub kdf: Option<KeyslotKdf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyslotArea {
    pub encryption: Option<String>,
    pub key_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyslotKdf {
    #[serde(rename = "type")]
    pub kdf_type: Option<String>,
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub segment_type: Option<String>,
    pub encryption: Option<String>,
    pub iv_tweak: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestSlot {
    #[serde(rename = "type")]
    pub digest_type: Option<String>,
    pub hash: Option<String>,
    #[serde(default)]
    pub keyslots: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    pub salt: Option<String>,
    pub digest: Option<String>,
}

impl HeaderMetadata {
    /// Parse the luksDump JSON. A dump that does not parse cannot be
    /// validated and is rejected outright.
    pub fn from_json(payload: &str) -> SealmountResult<Self> {
        serde_json::from_str(payload).map_err(|err| SealmountError::HeaderPolicy {
            field: "metadata".to_string(),
            reason: format!("header metadata is not valid JSON: {err}"),
        })
    }
}

fn violation(field: &str, reason: impl Into<String>) -> SealmountError {
    SealmountError::HeaderPolicy {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Check `header` against the hardened baseline.
///
/// Accepted shape, exactly:
/// - one keyslot: `luks2`, `aes-xts-plain64`, 512-bit keys, `argon2id` KDF
///   with a non-empty salt;
/// - one segment: `crypt`, `aes-xts-plain64`, IV tweak `0`, zero flags;
/// - one `pbkdf2`/`sha256` digest referencing that keyslot and segment,
///   with non-empty salt and digest;
/// - zero tokens.
pub fn verify_header(header: &HeaderMetadata) -> SealmountResult<()> {
    if !header.tokens.is_empty() {
        return Err(violation(
            "tokens",
            format!("expected 0 tokens, found {}", header.tokens.len()),
        ));
    }

    if header.keyslots.len() != 1 {
        return Err(violation(
            "keyslots",
            format!("expected exactly 1 keyslot, found {}", header.keyslots.len()),
        ));
    }
    let (keyslot_id, keyslot) = header.keyslots.iter().next().expect("length checked");

    match keyslot.slot_type.as_deref() {
        Some("luks2") => {}
        other => {
            return Err(violation(
                "keyslot.type",
                format!("expected `luks2`, found {other:?}"),
            ))
        }
    }
    if keyslot.key_size != Some(EXPECTED_KEY_BYTES) {
        return Err(violation(
            "keyslot.key_size",
            format!(
                "expected {EXPECTED_KEY_BYTES} bytes (512-bit), found {:?}",
                keyslot.key_size
            ),
        ));
    }

    let area = keyslot
        .area
        .as_ref()
        .ok_or_else(|| violation("keyslot.area", "keyslot area missing"))?;
    if area.encryption.as_deref() != Some(EXPECTED_CIPHER) {
        return Err(violation(
            "keyslot.area.encryption",
            format!("expected `{EXPECTED_CIPHER}`, found {:?}", area.encryption),
        ));
    }
    if area.key_size != Some(EXPECTED_KEY_BYTES) {
        return Err(violation(
            "keyslot.area.key_size",
            format!(
                "expected {EXPECTED_KEY_BYTES} bytes, found {:?}",
                area.key_size
            ),
        ));
    }

    let kdf = keyslot
        .kdf
        .as_ref()
        .ok_or_else(|| violation("keyslot.kdf", "keyslot KDF missing"))?;
    if kdf.kdf_type.as_deref() != Some(EXPECTED_KDF) {
        return Err(violation(
            "keyslot.kdf.type",
            format!("expected `{EXPECTED_KDF}`, found {:?}", kdf.kdf_type),
        ));
    }
    if kdf.salt.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return Err(violation("keyslot.kdf.salt", "KDF salt is missing or empty"));
    }

    if header.segments.len() != 1 {
        return Err(violation(
            "segments",
            format!("expected exactly 1 segment, found {}", header.segments.len()),
        ));
    }
    let (segment_id, segment) = header.segments.iter().next().expect("length checked");

    if segment.segment_type.as_deref() != Some("crypt") {
        return Err(violation(
            "segment.type",
            format!("expected `crypt`, found {:?}", segment.segment_type),
        ));
    }
    if segment.encryption.as_deref() != Some(EXPECTED_CIPHER) {
        return Err(violation(
            "segment.encryption",
            format!(
                "expected `{EXPECTED_CIPHER}`, found {:?}",
                segment.encryption
            ),
        ));
    }
    if segment.iv_tweak.as_deref() != Some("0") {
        return Err(violation(
            "segment.iv_tweak",
            format!("expected `0`, found {:?}", segment.iv_tweak),
        ));
    }
    if !segment.flags.is_empty() {
        return Err(violation(
            "segment.flags",
            format!("expected zero flags, found {:?}", segment.flags),
        ));
    }

    if header.digests.len() != 1 {
        return Err(violation(
            "digests",
            format!("expected exactly 1 digest, found {}", header.digests.len()),
        ));
    }
    let digest = header.digests.values().next().expect("length checked");

    if digest.digest_type.as_deref() != Some("pbkdf2") {
        return Err(violation(
            "digest.type",
            format!("expected `pbkdf2`, found {:?}", digest.digest_type),
        ));
    }
    if digest.hash.as_deref() != Some("sha256") {
        return Err(violation(
            "digest.hash",
            format!("expected `sha256`, found {:?}", digest.hash),
        ));
    }
    if digest.keyslots != [keyslot_id.clone()] {
        return Err(violation(
            "digest.keyslots",
            format!(
                "expected [{keyslot_id:?}], found {:?}",
                digest.keyslots
            ),
        ));
    }
    if digest.segments != [segment_id.clone()] {
        return Err(violation(
            "digest.segments",
            format!(
                "expected [{segment_id:?}], found {:?}",
                digest.segments
            ),
        ));
    }
    if digest.salt.as_deref().map(str::trim).unwrap_or("").is_empty() {
        return Err(violation("digest.salt", "digest salt is missing or empty"));
    }
    if digest
        .digest
        .as_deref()
        .map(str::trim)
        .unwrap_or("")
        .is_empty()
    {
        return Err(violation("digest.digest", "digest value is missing or empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn baseline() -> Value {
        json!({
            "keyslots": {
                "0": {
                    "type": "luks2",
                    "key_size": 64,
                    "af": { "type": "luks1", "stripes": 4000, "hash": "sha256" },
                    "area": {
                        "type": "raw",
                        "offset": "32768",
                        "size": "258048",
                        "encryption": "aes-xts-plain64",
                        "key_size": 64
                    },
                    "kdf": {
                        "type": "argon2id",
                        "time": 4,
                        "memory": 32768,
                        "cpus": 1,
                        "salt": "qPbcl0dgsjNhJMRM2fRMyLJw3hTrWkyq1mXYIsTx4DM="
                    }
                }
            },
            "tokens": {},
            "segments": {
                "0": {
                    "type": "crypt",
                    "offset": "16777216",
                    "size": "dynamic",
                    "iv_tweak": "0",
                    "encryption": "aes-xts-plain64",
                    "sector_size": 512
                }
            },
            "digests": {
                "0": {
                    "type": "pbkdf2",
                    "keyslots": ["0"],
                    "segments": ["0"],
                    "hash": "sha256",
                    "iterations": 117448,
                    "salt": "z6vz4xK7bjan32ZGo6+1M8FlSh8sBbdv9OTvqUSt+qA=",
                    "digest": "SxQIp/7V0ZTp2bQmQX/ZX5lzhCzDMvLhtaXt3V8RS3s="
                }
            },
            "config": { "json_size": "12288", "keyslots_size": "16744448" }
        })
    }

    fn verify_value(value: &Value) -> SealmountResult<()> {
        let header = HeaderMetadata::from_json(&value.to_string())?;
        verify_header(&header)
    }

    fn expect_violation(value: &Value, field: &str) {
        match verify_value(value) {
            Err(SealmountError::HeaderPolicy { field: found, .. }) => {
                assert_eq!(found, field, "wrong violated field reported")
            }
            Err(other) => panic!("unexpected error kind: {other:?}"),
            Ok(()) => panic!("expected `{field}` violation, header accepted"),
        }
    }

    #[test]
    fn baseline_header_is_accepted() {
        verify_value(&baseline()).unwrap();
    }

    #[test]
    fn weak_key_size_is_rejected() {
        let mut value = baseline();
        value["keyslots"]["0"]["key_size"] = json!(32);
        expect_violation(&value, "keyslot.key_size");
    }

    #[test]
    fn wrong_cipher_is_rejected() {
        let mut value = baseline();
        value["keyslots"]["0"]["area"]["encryption"] = json!("cipher_null-ecb");
        expect_violation(&value, "keyslot.area.encryption");

        let mut value = baseline();
        value["segments"]["0"]["encryption"] = json!("aes-cbc-essiv:sha256");
        expect_violation(&value, "segment.encryption");
    }

    #[test]
    fn weak_kdf_is_rejected() {
        let mut value = baseline();
        value["keyslots"]["0"]["kdf"]["type"] = json!("pbkdf2");
        expect_violation(&value, "keyslot.kdf.type");
    }

    #[test]
    fn missing_kdf_salt_is_rejected() {
        let mut value = baseline();
        value["keyslots"]["0"]["kdf"]["salt"] = json!("");
        expect_violation(&value, "keyslot.kdf.salt");
    }

    #[test]
    fn extra_keyslot_is_rejected() {
        let mut value = baseline();
        let slot = value["keyslots"]["0"].clone();
        value["keyslots"]["1"] = slot;
        expect_violation(&value, "keyslots");
    }

    #[test]
    fn extra_token_is_rejected() {
        let mut value = baseline();
        value["tokens"]["0"] = json!({ "type": "clevis", "keyslots": ["0"] });
        expect_violation(&value, "tokens");
    }

    #[test]
    fn extra_segment_is_rejected() {
        let mut value = baseline();
        let segment = value["segments"]["0"].clone();
        value["segments"]["1"] = segment;
        expect_violation(&value, "segments");
    }

    #[test]
    fn segment_flags_are_rejected() {
        let mut value = baseline();
        value["segments"]["0"]["flags"] = json!(["backup-previous"]);
        expect_violation(&value, "segment.flags");
    }

    #[test]
    fn nonzero_iv_tweak_is_rejected() {
        let mut value = baseline();
        value["segments"]["0"]["iv_tweak"] = json!("8192");
        expect_violation(&value, "segment.iv_tweak");
    }

    #[test]
    fn wrong_digest_hash_is_rejected() {
        let mut value = baseline();
        value["digests"]["0"]["hash"] = json!("sha1");
        expect_violation(&value, "digest.hash");
    }

    #[test]
    fn digest_reference_mismatch_is_rejected() {
        let mut value = baseline();
        value["digests"]["0"]["keyslots"] = json!(["1"]);
        expect_violation(&value, "digest.keyslots");

        let mut value = baseline();
        value["digests"]["0"]["segments"] = json!([]);
        expect_violation(&value, "digest.segments");
    }

    #[test]
    fn missing_digest_salt_is_rejected() {
        let mut value = baseline();
        value["digests"]["0"]["salt"] = json!("   ");
        expect_violation(&value, "digest.salt");
    }

    #[test]
    fn garbage_payload_is_rejected() {
        match HeaderMetadata::from_json("not json at all") {
            Err(SealmountError::HeaderPolicy { field, .. }) => assert_eq!(field, "metadata"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
