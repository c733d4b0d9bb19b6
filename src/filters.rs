use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

const DEFAULT_IGNORE_LINES: &[&str] = &[
    // syft
    "syftignore",
    // temporary files from atomic writes and staged downloads
    "**/.*.tmp-*",
    "**/*.tmp-*",
    // python
    ".ipynb_checkpoints/",
    "__pycache__/",
    "*.py[cod]",
    "venv/",
    ".venv/",
    // IDE/Editor-specific
    ".vscode",
    ".idea",
    // General excludes
    ".git",
    "*.tmp",
    "*.log",
    "logs/",
    // OS-specific
    ".DS_Store",
    "Thumbs.db",
    "Icon",
];

/// Paths the sync engine never looks at: defaults plus a `syftignore` file
/// at the datasites root.
#[derive(Clone)]
pub struct SyncIgnoreList {
    #[allow(dead_code)]
    base_dir: PathBuf,
    ignore: Gitignore,
}

impl SyncIgnoreList {
    pub fn load(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .with_context(|| format!("create datasites dir {}", base_dir.display()))?;

        let mut builder = GitignoreBuilder::new(base_dir);
        for line in DEFAULT_IGNORE_LINES {
            builder
                .add_line(None, line)
                .with_context(|| format!("add default ignore line: {line}"))?;
        }

        let ignore_path = base_dir.join("syftignore");
        if ignore_path.exists() {
            let custom = read_ignore_file(&ignore_path)?;
            for line in custom {
                builder
                    .add_line(None, &line)
                    .with_context(|| format!("add syftignore line: {line}"))?;
            }
        }

        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            ignore,
        })
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}
