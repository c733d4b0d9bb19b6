use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Forward-slash path relative to the datasites root. The first segment is
/// the owning datasite email. Never absolute, never contains `.`/`..`
/// components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(anyhow!("relative path is empty"));
        }
        if raw.starts_with('/') {
            return Err(anyhow!("relative path is absolute: {raw}"));
        }
        if raw.contains('\\') {
            return Err(anyhow!("relative path contains backslash: {raw}"));
        }
        if raw.contains('\0') {
            return Err(anyhow!("relative path contains NUL: {raw}"));
        }
        for part in raw.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(anyhow!("invalid path component in {raw}"));
            }
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Email of the datasite this path belongs to (first segment).
    pub fn datasite(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Join onto `root` component by component, staying inside it.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for part in self.0.split('/') {
            out.push(part);
        }
        out
    }

    /// Relative path of the parent directory, if any.
    pub fn parent(&self) -> Option<RelativePath> {
        self.0.rsplit_once('/').map(|(dir, _)| Self(dir.to_string()))
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for RelativePath {
    type Error = anyhow::Error;

    fn try_from(raw: &str) -> Result<Self> {
        Self::new(raw)
    }
}

impl Serialize for RelativePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelativePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RelativePath::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Snapshot of one file's content identity. `hash` is the SHA-256 of the
/// exact bytes the signature was computed over; equality for sync decisions
/// is hash equality only (size and mtime are informational).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileMetadata {
    pub path: RelativePath,
    pub hash: String,
    pub signature: String,
    #[serde(default)]
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl FileMetadata {
    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        b85_decode(&self.signature)
    }
}

impl PartialEq for FileMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for FileMetadata {}

/// Hash equality lifted over absence: two missing files are equal.
pub fn metadata_equal(a: Option<&FileMetadata>, b: Option<&FileMetadata>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.hash == b.hash,
        _ => false,
    }
}

pub fn b85_encode(data: &[u8]) -> String {
    base85::encode(data)
}

pub fn b85_decode(raw: &str) -> Result<Vec<u8>> {
    base85::decode(raw).map_err(|e| anyhow!("decode base85: {e}"))
}

// Wire bodies. Requests are parsed leniently by the server (unknown fields
// ignored for forward compatibility); responses are parsed strictly by the
// client.

#[derive(Debug, Serialize, Deserialize)]
pub struct FileMetadataRequest {
    /// SQL LIKE pattern over relative paths.
    pub path_like: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiffRequest {
    pub path: RelativePath,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiffResponse {
    pub path: RelativePath,
    pub diff: String,
    pub hash: String,
}

impl DiffResponse {
    pub fn diff_bytes(&self) -> Result<Vec<u8>> {
        b85_decode(&self.diff)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyDiffRequest {
    pub path: RelativePath,
    pub diff: String,
    pub expected_hash: String,
}

impl ApplyDiffRequest {
    pub fn diff_bytes(&self) -> Result<Vec<u8>> {
        b85_decode(&self.diff)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyDiffResponse {
    pub path: RelativePath,
    pub current_hash: String,
    pub previous_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileRequest {
    pub path: RelativePath,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadBulkRequest {
    pub paths: Vec<RelativePath>,
}

pub type DatasiteStatesResponse = HashMap<String, Vec<FileMetadata>>;

#[derive(Debug, Serialize, Deserialize)]
pub struct EmailTokenRequest {
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailTokenResponse {
    pub email_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ValidateEmailTokenRequest {
    pub email: String,
    pub email_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessTokenResponse {
    pub access_token: String,
}

/// Error body shape shared by all server endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_accepts_nested_and_unicode() {
        let p = RelativePath::new("alice@example.com/folder/ünïcodé.txt").unwrap();
        assert_eq!(p.datasite(), "alice@example.com");
        assert_eq!(p.file_name(), "ünïcodé.txt");
        assert_eq!(p.parent().unwrap().as_str(), "alice@example.com/folder");
    }

    #[test]
    fn relative_path_rejects_escapes() {
        assert!(RelativePath::new("").is_err());
        assert!(RelativePath::new("/etc/passwd").is_err());
        assert!(RelativePath::new("a@x.com/../secret").is_err());
        assert!(RelativePath::new("a@x.com/./x").is_err());
        assert!(RelativePath::new("a@x.com//x").is_err());
        assert!(RelativePath::new("a@x.com\\x").is_err());
    }

    #[test]
    fn relative_path_deserialize_is_strict() {
        let ok: RelativePath = serde_json::from_str("\"a@x.com/f.txt\"").unwrap();
        assert_eq!(ok.as_str(), "a@x.com/f.txt");
        let err = serde_json::from_str::<RelativePath>("\"../../escape\"");
        assert!(err.is_err());
    }

    #[test]
    fn base85_roundtrip() {
        let data = b"hello base85 \x00\x01\xff";
        let encoded = b85_encode(data);
        let decoded = b85_decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn metadata_equality_is_hash_only() {
        let a = FileMetadata {
            path: RelativePath::new("a@x.com/f.txt").unwrap(),
            hash: "abc".to_string(),
            signature: "sig1".to_string(),
            size: 10,
            last_modified: Utc::now(),
        };
        let mut b = a.clone();
        b.size = 999;
        b.signature = "sig2".to_string();
        assert_eq!(a, b);
        assert!(metadata_equal(Some(&a), Some(&b)));
        assert!(metadata_equal(None, None));
        assert!(!metadata_equal(Some(&a), None));
    }

    #[test]
    fn response_bodies_reject_unknown_fields() {
        let raw = r#"{"path":"a@x.com/f","diff":"d","hash":"h","extra":1}"#;
        assert!(serde_json::from_str::<DiffResponse>(raw).is_err());
    }
}
