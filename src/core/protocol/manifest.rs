//! Upload manifest and progress payloads.
//!
//! The manifest travels in `upload_start` and names every file of an
//! upload by its content-derived `fileId`. The receiver never trusts the
//! sender's file name for storage: bytes are written to
//! `<fileId>.<extension>` and the extension is sanitised first.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// One file announced in `upload_start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub file_id: String,
    /// Display name on the sender (informational only).
    pub name: String,
    #[serde(default)]
    pub extension: String,
    pub size_bytes: u64,
    /// Media instances on the sender referencing this file.
    #[serde(default)]
    pub media_ids: Vec<String>,
}

impl ManifestEntry {
    /// Storage file name on the receiver: `<fileId>[.<ext>]`.
    pub fn storage_name(&self) -> String {
        let ext = sanitize_extension(&self.extension);
        let id = sanitize_file_id(&self.file_id);
        if ext.is_empty() {
            id
        } else {
            format!("{}.{}", id, ext)
        }
    }
}

/// Per-file percentage inside `upload_progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub file_id: String,
    pub percent: u8,
}

/// Keep only ASCII alphanumerics, lowercased. Anything else would let a
/// peer steer the storage path.
pub fn sanitize_extension(extension: &str) -> String {
    extension
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(16)
        .collect::<String>()
        .to_ascii_lowercase()
}

fn is_safe_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Storage-safe form of a file (or client) id.
///
/// Ids made of `[A-Za-z0-9_-]` are used as is. Anything else is replaced
/// by the SHA3 hex digest of the id, so distinct ids never share a name
/// and no id maps to an empty one.
pub fn sanitize_file_id(file_id: &str) -> String {
    if !file_id.is_empty() && file_id.chars().all(is_safe_id_char) {
        return file_id.to_string();
    }
    hex::encode(Sha3_256::digest(file_id.as_bytes()))
}

/// Integer percentage of `done / total`, rounded, 0 when `total` is 0.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (done as f64 * 100.0 / total as f64).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Serde helper: serialize `Vec<u8>` as a base64 string rather than a JSON
/// array of numbers.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&b64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
