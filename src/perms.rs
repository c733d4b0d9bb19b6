use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::RelativePath;

pub const PERMISSION_FILENAME: &str = "_.syftperm";

/// Grants everyone access when present in a permission list.
pub const EVERYONE: &str = "*";

/// Contents of a `_.syftperm` file. Governs access to sibling and
/// descendant paths; the nearest permission file above a path wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyftPermission {
    pub admin: Vec<String>,
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl SyftPermission {
    pub fn mine_with_public_read(owner: &str) -> Self {
        Self {
            admin: vec![owner.to_string()],
            read: vec![EVERYONE.to_string()],
            write: vec![owner.to_string()],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("parse permission file")
    }

    pub fn load(abs_path: &Path) -> Result<Self> {
        let data = std::fs::read(abs_path)
            .with_context(|| format!("read permission file {}", abs_path.display()))?;
        Self::from_bytes(&data)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(self).expect("permission serialization is infallible")
    }

    pub fn has_read(&self, email: &str) -> bool {
        grants(&self.read, email) || self.has_write(email)
    }

    pub fn has_write(&self, email: &str) -> bool {
        grants(&self.write, email) || self.has_admin(email)
    }

    pub fn has_admin(&self, email: &str) -> bool {
        grants(&self.admin, email)
    }
}

fn grants(list: &[String], email: &str) -> bool {
    list.iter().any(|e| e == email || e == EVERYONE)
}

pub fn is_permission_file(abs_path: &Path) -> bool {
    abs_path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name == PERMISSION_FILENAME)
}

pub fn is_permission_path(path: &RelativePath) -> bool {
    path.file_name() == PERMISSION_FILENAME
}

/// Syntactic validity: parses as a JSON object with `admin`, `read` and
/// `write` keys holding lists of strings.
pub fn is_valid(abs_path: &Path) -> bool {
    SyftPermission::load(abs_path).is_ok()
}
