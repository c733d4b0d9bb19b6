use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fast_rsync::{Signature, SignatureOptions};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::{b85_encode, FileMetadata, RelativePath};

// librsync-compatible signature parameters; both wire sides must agree.
pub const SIGNATURE_BLOCK_SIZE: u32 = 4096;
pub const SIGNATURE_CRYPTO_HASH_SIZE: u32 = 8;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("not a file: {0}")]
    NotAFile(PathBuf),
    #[error("not readable: {path}: {source}")]
    NotReadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0}")]
    InvalidPath(String),
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn compute_signature(data: &[u8]) -> Vec<u8> {
    Signature::calculate(
        data,
        SignatureOptions {
            block_size: SIGNATURE_BLOCK_SIZE,
            crypto_hash_size: SIGNATURE_CRYPTO_HASH_SIZE,
        },
    )
    .into_serialized()
}

/// Hash and sign the file at `abs_path`, producing metadata keyed by its
/// path relative to `root`. Hash and signature are pure functions of the
/// byte content.
pub fn hash_file(abs_path: &Path, root: &Path) -> Result<FileMetadata, HashError> {
    let meta = match fs::symlink_metadata(abs_path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HashError::FileNotFound(abs_path.to_path_buf()))
        }
        Err(e) => {
            return Err(HashError::NotReadable {
                path: abs_path.to_path_buf(),
                source: e,
            })
        }
    };
    if !meta.is_file() {
        return Err(HashError::NotAFile(abs_path.to_path_buf()));
    }

    let data = fs::read(abs_path).map_err(|e| HashError::NotReadable {
        path: abs_path.to_path_buf(),
        source: e,
    })?;

    let rel = abs_path.strip_prefix(root).map_err(|_| {
        HashError::InvalidPath(format!(
            "{} is outside {}",
            abs_path.display(),
            root.display()
        ))
    })?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    let path = RelativePath::new(&rel).map_err(|e| HashError::InvalidPath(e.to_string()))?;

    let last_modified: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(FileMetadata {
        path,
        hash: hash_bytes(&data),
        signature: b85_encode(&compute_signature(&data)),
        size: data.len() as u64,
        last_modified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn hash_file_produces_sha256_and_signature() {
        let root = make_temp_dir("syftbox-sync-hash-test");
        let abs = root.join("alice@example.com/public/hello.txt");
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, b"hello").unwrap();

        let meta = hash_file(&abs, &root).unwrap();
        assert_eq!(meta.path.as_str(), "alice@example.com/public/hello.txt");
        assert_eq!(
            meta.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(meta.size, 5);
        assert!(!meta.signature_bytes().unwrap().is_empty());
    }

    #[test]
    fn hash_of_empty_file_is_sha256_of_empty_string() {
        let root = make_temp_dir("syftbox-sync-hash-empty");
        let abs = root.join("alice@example.com/empty");
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(&abs, b"").unwrap();

        let meta = hash_file(&abs, &root).unwrap();
        assert_eq!(
            meta.hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(meta.size, 0);
    }

    #[test]
    fn hash_file_errors_are_typed() {
        let root = make_temp_dir("syftbox-sync-hash-errors");
        let missing = root.join("alice@example.com/nope");
        assert!(matches!(
            hash_file(&missing, &root),
            Err(HashError::FileNotFound(_))
        ));

        let dir = root.join("alice@example.com/dir");
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(hash_file(&dir, &root), Err(HashError::NotAFile(_))));
    }

    #[test]
    fn hash_and_signature_depend_only_on_content() {
        let root = make_temp_dir("syftbox-sync-hash-pure");
        let a = root.join("a@x.com/one.bin");
        let b = root.join("b@y.com/two.bin");
        fs::create_dir_all(a.parent().unwrap()).unwrap();
        fs::create_dir_all(b.parent().unwrap()).unwrap();
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let ma = hash_file(&a, &root).unwrap();
        let mb = hash_file(&b, &root).unwrap();
        assert_eq!(ma.hash, mb.hash);
        assert_eq!(ma.signature, mb.signature);
        assert_ne!(ma.path, mb.path);
    }
}
