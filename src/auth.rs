use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::client::SyncClient;
use crate::config::{self, Config};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Users and their tokens, persisted to `users.json`. The email token is
/// the short-lived proof from the login flow; the access token is the
/// bearer credential every sync request carries.
pub struct UserStore {
    path: PathBuf,
    users: HashMap<String, User>,
}

impl UserStore {
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let users = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read users {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("corrupt users file {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            users,
        })
    }

    pub fn issue_email_token(&mut self, email: &str) -> Result<String> {
        config::validate_email(email)?;
        let token = uuid::Uuid::new_v4().as_simple().to_string();
        let user = self.users.entry(email.to_string()).or_insert_with(|| User {
            email: email.to_string(),
            email_token: None,
            access_token: None,
        });
        user.email_token = Some(token.clone());
        self.save()?;
        Ok(token)
    }

    /// Exchange a valid email token for an access token. Returns None when
    /// the token does not match.
    pub fn validate_email_token(&mut self, email: &str, email_token: &str) -> Result<Option<String>> {
        let Some(user) = self.users.get_mut(email) else {
            return Ok(None);
        };
        if user.email_token.as_deref() != Some(email_token) {
            return Ok(None);
        }
        let token = uuid::Uuid::new_v4().as_simple().to_string();
        user.access_token = Some(token.clone());
        user.email_token = None;
        self.save()?;
        Ok(Some(token))
    }

    pub fn email_for_access_token(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.users
            .values()
            .find(|u| u.access_token.as_deref() == Some(token))
            .map(|u| u.email.clone())
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&self.users).context("serialize users")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoginArgs {
    pub config_path: PathBuf,
    pub server_url: String,
    pub data_dir: PathBuf,
    pub email: String,
    pub max_file_size_mb: u64,
}

/// Drive the email-token flow against the server and persist the resulting
/// access token to the config file.
pub async fn run_login(args: LoginArgs) -> Result<()> {
    config::validate_email(&args.email)?;
    let client = SyncClient::new(&args.server_url, &args.email, None)?;

    let email_token = client
        .request_email_token(&args.email)
        .await
        .context("request email token")?;
    let access_token = client
        .validate_email_token(&args.email, &email_token)
        .await
        .context("validate email token")?;

    let cfg = Config {
        data_dir: args.data_dir,
        email: args.email.to_lowercase(),
        server_url: args.server_url,
        access_token: Some(access_token),
        max_file_size_mb: args.max_file_size_mb,
        config_path: Some(args.config_path),
    };
    cfg.save()?;
    crate::logging::info(format!("logged in as {}", cfg.email));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn temp_users_path() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("syftbox-sync-users-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("users.json")
    }

    #[test]
    fn email_token_flow_issues_access_token() {
        let path = temp_users_path();
        let mut store = UserStore::load_or_init(&path).unwrap();

        let email_token = store.issue_email_token("alice@example.com").unwrap();
        assert!(store
            .validate_email_token("alice@example.com", "wrong")
            .unwrap()
            .is_none());

        let access = store
            .validate_email_token("alice@example.com", &email_token)
            .unwrap()
            .unwrap();
        assert_eq!(
            store.email_for_access_token(&access).as_deref(),
            Some("alice@example.com")
        );

        // email token is single use
        assert!(store
            .validate_email_token("alice@example.com", &email_token)
            .unwrap()
            .is_none());
    }

    #[test]
    fn store_persists_across_reload() {
        let path = temp_users_path();
        let mut store = UserStore::load_or_init(&path).unwrap();
        let email_token = store.issue_email_token("bob@example.com").unwrap();
        let access = store
            .validate_email_token("bob@example.com", &email_token)
            .unwrap()
            .unwrap();

        let reloaded = UserStore::load_or_init(&path).unwrap();
        assert_eq!(
            reloaded.email_for_access_token(&access).as_deref(),
            Some("bob@example.com")
        );
    }

    #[test]
    fn rejects_invalid_emails_and_unknown_tokens() {
        let path = temp_users_path();
        let mut store = UserStore::load_or_init(&path).unwrap();
        assert!(store.issue_email_token("not-an-email").is_err());
        assert!(store.email_for_access_token("").is_none());
        assert!(store.email_for_access_token("nope").is_none());
    }
}
