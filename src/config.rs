use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_MAX_FILE_SIZE_MB: u64 = 10;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    server_url: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    max_file_size_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub email: String,
    pub server_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub email: Option<String>,
    pub server_url: Option<String>,
    pub max_file_size_mb: Option<u64>,
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".syftbox").join("logs").join("sync.log")
}

impl Config {
    pub fn default_data_dir() -> PathBuf {
        home_dir().join("SyftBox")
    }

    pub fn default_server_url() -> &'static str {
        "https://syftbox.net"
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".syftbox").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("SYFTBOX_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir()
                .join(".config")
                .join("syftbox")
                .join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let data_dir = overrides
            .data_dir
            .or(env_cfg.data_dir)
            .or(file_cfg.data_dir)
            .unwrap_or_else(Self::default_data_dir);
        let email = overrides
            .email
            .or(env_cfg.email)
            .or(file_cfg.email)
            .unwrap_or_default();
        let server_url = overrides
            .server_url
            .or(env_cfg.server_url)
            .or(file_cfg.server_url)
            .unwrap_or_else(|| Self::default_server_url().to_string());
        let access_token = env_cfg.access_token.or(file_cfg.access_token);
        let max_file_size_mb = overrides
            .max_file_size_mb
            .or(env_cfg.max_file_size_mb)
            .or(file_cfg.max_file_size_mb)
            .unwrap_or(DEFAULT_MAX_FILE_SIZE_MB);

        let mut cfg = Config {
            data_dir,
            email,
            server_url,
            access_token,
            max_file_size_mb,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn datasites_dir(&self) -> PathBuf {
        self.data_dir.join("datasites")
    }

    pub fn sync_plugin_dir(&self) -> PathBuf {
        self.data_dir.join("plugins").join("sync")
    }

    pub fn local_state_path(&self) -> PathBuf {
        self.sync_plugin_dir().join("local_state.db")
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        save_config_file(path, self)
    }

    fn normalize(&mut self) -> Result<()> {
        self.email = self.email.to_lowercase();
        self.data_dir = absolutize_path(&self.data_dir);
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize_path(&p));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_email(&self.email)?;
        validate_url(&self.server_url).context("server_url")?;
        if self.max_file_size_mb == 0 {
            anyhow::bail!("max_file_size_mb must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    data_dir: &'a PathBuf,
    email: &'a str,
    server_url: &'a str,
    #[serde(skip_serializing_if = "is_none_or_empty")]
    access_token: &'a Option<String>,
    max_file_size_mb: u64,
}

fn is_none_or_empty(v: &Option<String>) -> bool {
    v.as_deref().unwrap_or("").trim().is_empty()
}

fn save_config_file(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let persisted = PersistedConfig {
        data_dir: &cfg.data_dir,
        email: &cfg.email,
        server_url: &cfg.server_url,
        access_token: &cfg.access_token,
        max_file_size_mb: cfg.max_file_size_mb,
    };
    let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub(crate) fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<()> {
    // Simple RFC5322-ish check.
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").unwrap()
    });
    if PATTERN.is_match(email) {
        Ok(())
    } else {
        anyhow::bail!("invalid email: {email}")
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    // Resolve symlinks (e.g. /tmp on macOS) so path comparisons use one
    // consistent form; fall back to the cleaned path if it doesn't exist yet.
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(_) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("SYFTBOX_EMAIL") {
        let v = v.trim();
        if !v.is_empty() {
            out.email = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_DATA_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            out.data_dir = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_SERVER_URL") {
        let v = v.trim();
        if !v.is_empty() {
            out.server_url = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_ACCESS_TOKEN") {
        let v = v.trim();
        if !v.is_empty() {
            out.access_token = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("SYFTBOX_MAX_FILE_SIZE_MB") {
        if let Ok(n) = v.trim().parse::<u64>() {
            out.max_file_size_mb = Some(n);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> =
        once_cell::sync::Lazy::new(|| Mutex::new(()));

    const ENV_KEYS: &[&str] = &[
        "SYFTBOX_EMAIL",
        "SYFTBOX_DATA_DIR",
        "SYFTBOX_SERVER_URL",
        "SYFTBOX_ACCESS_TOKEN",
        "SYFTBOX_MAX_FILE_SIZE_MB",
        "SYFTBOX_CONFIG_PATH",
    ];

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn clear_all() -> Self {
            let mut saved = HashMap::new();
            for k in ENV_KEYS {
                saved.insert((*k).to_string(), env::var(k).ok());
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn load_config_from_json_and_normalize() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::clear_all();

        let tmp = env::temp_dir().join("syftbox-sync-config-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let data_dir = tmp.join("data").display().to_string().replace('\\', "/");
        let json = format!(
            r#"{{
                "email": "Alice@Example.com",
                "data_dir": "{}",
                "server_url": "http://127.0.0.1:8080"
            }}"#,
            data_dir
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email, "alice@example.com");
        assert_eq!(cfg.server_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.max_file_size_mb, DEFAULT_MAX_FILE_SIZE_MB);
        assert!(cfg.data_dir.is_absolute());
        assert!(cfg.local_state_path().ends_with("plugins/sync/local_state.db"));
    }

    #[test]
    fn reject_invalid_url_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::clear_all();

        let tmp = env::temp_dir().join("syftbox-sync-config-bad-url");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let json = r#"{
            "email": "alice@example.com",
            "data_dir": "/tmp/data",
            "server_url": "ftp://bad.example.com"
        }"#;
        fs::write(&cfg_path, json).unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("server_url"));
    }

    #[test]
    fn reject_invalid_email() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::clear_all();

        let tmp = env::temp_dir().join("syftbox-sync-config-bad-email");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let json = r#"{
            "email": "not-an-email",
            "data_dir": "/tmp/data",
            "server_url": "http://localhost:8080"
        }"#;
        fs::write(&cfg_path, json).unwrap();
        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("invalid email"));
    }

    #[test]
    fn load_with_overrides_flag_beats_env_beats_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::clear_all();

        let tmp = env::temp_dir().join("syftbox-sync-config-precedence");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let file_data_dir = tmp.join("file-data");
        let env_data_dir = tmp.join("env-data");
        let flag_data_dir = tmp.join("flag-data");

        let cfg_path = tmp.join("config.json");
        let file_data_dir_str = file_data_dir.display().to_string().replace('\\', "/");
        fs::write(
            &cfg_path,
            format!(
                r#"{{
              "email": "file@example.com",
              "data_dir": "{}",
              "server_url": "https://file.syftbox.net",
              "max_file_size_mb": 5
            }}"#,
                file_data_dir_str
            ),
        )
        .unwrap();

        env::set_var("SYFTBOX_EMAIL", "env@example.com");
        env::set_var("SYFTBOX_DATA_DIR", env_data_dir.to_string_lossy().as_ref());
        env::set_var("SYFTBOX_SERVER_URL", "https://env.syftbox.net");
        env::set_var("SYFTBOX_MAX_FILE_SIZE_MB", "20");

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.email, "env@example.com");
        assert_eq!(cfg.data_dir, env_data_dir);
        assert_eq!(cfg.server_url, "https://env.syftbox.net");
        assert_eq!(cfg.max_file_size_mb, 20);

        let overrides = ConfigOverrides {
            email: Some("flag@example.com".to_string()),
            data_dir: Some(flag_data_dir.clone()),
            server_url: Some("https://flag.syftbox.net".to_string()),
            max_file_size_mb: Some(7),
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.email, "flag@example.com");
        assert_eq!(cfg.data_dir, flag_data_dir);
        assert_eq!(cfg.server_url, "https://flag.syftbox.net");
        assert_eq!(cfg.max_file_size_mb, 7);
    }

    #[test]
    fn resolve_config_path_flag_beats_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::clear_all();

        let tmp = env::temp_dir().join("syftbox-sync-config-path-flag");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let env_path = tmp.join("env").join("config.json");
        let flag_path = tmp.join("flag").join("config.json");
        env::set_var("SYFTBOX_CONFIG_PATH", &env_path);

        let resolved = Config::resolve_config_path(Some(&flag_path));
        assert_eq!(resolved, flag_path);

        let resolved = Config::resolve_config_path(None);
        assert_eq!(resolved, env_path);
    }

    #[test]
    fn save_persists_and_reloads() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::clear_all();

        let tmp = env::temp_dir().join("syftbox-sync-config-save");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");

        let cfg = Config {
            data_dir: tmp.join("data"),
            email: "alice@example.com".to_string(),
            server_url: "http://127.0.0.1:9999".to_string(),
            access_token: Some("tok-123".to_string()),
            max_file_size_mb: 12,
            config_path: Some(cfg_path.clone()),
        };
        cfg.save().unwrap();

        let loaded = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(loaded.email, "alice@example.com");
        assert_eq!(loaded.access_token.as_deref(), Some("tok-123"));
        assert_eq!(loaded.max_file_size_mb, 12);
    }
}
