use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::client::SyncClient;
use crate::config::Config;
use crate::consumer::{FatalSyncError, SyncConsumer};
use crate::datasite::{DatasiteState, LocalScanner};
use crate::filters::SyncIgnoreList;
use crate::local_state::LocalState;
use crate::queue::SyncQueue;

pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the periodic reconciliation loop: one tick enumerates readable
/// datasites, enqueues out-of-sync paths (permission files first) and
/// drains the queue through the consumer.
pub struct SyncManager {
    client: SyncClient,
    consumer: SyncConsumer,
    queue: Arc<SyncQueue>,
    ignore: SyncIgnoreList,
    scanner: LocalScanner,
    datasites_root: PathBuf,
    sync_interval: Duration,
    stop_requested: Arc<AtomicBool>,
    sync_run_once: bool,
}

pub struct SyncManagerHandle {
    stop: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<Result<(), FatalSyncError>>,
}

impl SyncManagerHandle {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request termination and wait for the loop to finish its current
    /// tick.
    pub async fn stop(self) -> Result<(), FatalSyncError> {
        self.request_stop();
        match self.join.await {
            Ok(result) => result,
            Err(_) => Err(FatalSyncError("sync task panicked".to_string())),
        }
    }

    /// Wait for the loop to end on its own (fatal error or prior stop).
    pub async fn wait(&mut self) -> Result<(), FatalSyncError> {
        match (&mut self.join).await {
            Ok(result) => result,
            Err(_) => Err(FatalSyncError("sync task panicked".to_string())),
        }
    }
}

impl SyncManager {
    pub fn new(config: &Config, client: SyncClient) -> Result<Self> {
        let datasites_root = config.datasites_dir();
        let ignore = SyncIgnoreList::load(&datasites_root)?;
        let local_state = LocalState::load_or_init(&config.local_state_path())?;
        let queue = Arc::new(SyncQueue::new());
        let consumer = SyncConsumer::new(
            client.clone(),
            queue.clone(),
            local_state,
            datasites_root.clone(),
            config.max_file_size_bytes(),
        );

        Ok(Self {
            client,
            consumer,
            queue,
            ignore,
            scanner: LocalScanner::default(),
            datasites_root,
            sync_interval: SYNC_INTERVAL,
            stop_requested: Arc::new(AtomicBool::new(false)),
            sync_run_once: false,
        })
    }

    pub fn consumer(&self) -> &SyncConsumer {
        &self.consumer
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    /// Spawn the loop on the current runtime.
    pub fn start(mut self) -> SyncManagerHandle {
        let stop = self.stop_requested.clone();
        let join = tokio::spawn(async move { self.run().await });
        crate::logging::info(format!(
            "sync started, syncing every {} seconds",
            SYNC_INTERVAL.as_secs()
        ));
        SyncManagerHandle { stop, join }
    }

    /// Tick until stop is requested. The stop flag is checked between
    /// ticks; a fatal error aborts unconditionally.
    pub async fn run(&mut self) -> Result<(), FatalSyncError> {
        while !self.stop_requested.load(Ordering::SeqCst) {
            if let Err(e) = self.run_single_tick().await {
                crate::logging::error(format!("syncing encountered a fatal error: {e}"));
                return Err(e);
            }
            tokio::time::sleep(self.sync_interval).await;
        }
        crate::logging::info("sync stopped");
        Ok(())
    }

    pub async fn run_single_tick(&mut self) -> Result<(), FatalSyncError> {
        let datasite_states = self.get_datasite_states().await;
        crate::logging::debug(format!("syncing {} datasites", datasite_states.len()));

        if !self.sync_run_once {
            self.consumer
                .download_all_missing(&datasite_states, &self.ignore)
                .await?;
        }

        for datasite in &datasite_states {
            let (permission_changes, file_changes) = match datasite.get_out_of_sync_files(
                &self.datasites_root,
                &self.ignore,
                &mut self.scanner,
            ) {
                Ok(changes) => changes,
                Err(e) => {
                    crate::logging::error(format!(
                        "failed to get out of sync files for {}: {e:#}",
                        datasite.email
                    ));
                    continue;
                }
            };

            let total = permission_changes.len() + file_changes.len();
            if total != 0 {
                crate::logging::debug(format!(
                    "enqueuing {} permissions and {} files for {}",
                    permission_changes.len(),
                    file_changes.len(),
                    datasite.email
                ));
            }
            for change in permission_changes.into_iter().chain(file_changes) {
                self.queue.put(change);
            }
        }

        self.consumer.consume_all().await?;
        self.sync_run_once = true;
        Ok(())
    }

    /// The server's view of every datasite this client may read. A failure
    /// degrades to syncing only the caller's own datasite; own email is
    /// always present.
    async fn get_datasite_states(&self) -> Vec<DatasiteState> {
        let mut remote_states = match self.client.get_datasite_states(self.client.email()).await {
            Ok(states) => states,
            Err(e) => {
                crate::logging::error(format!(
                    "failed to retrieve datasites from server, only syncing own datasite: {e:#}"
                ));
                HashMap::new()
            }
        };

        remote_states
            .entry(self.client.email().to_string())
            .or_default();

        let mut emails: Vec<String> = remote_states.keys().cloned().collect();
        emails.sort();
        emails
            .into_iter()
            .map(|email| {
                let remote_state = remote_states.remove(&email).unwrap_or_default();
                DatasiteState::new(&email, remote_state)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PRIORITY_PERMISSION_FILE;
    use std::fs;
    use std::time::SystemTime;

    fn make_workspace(prefix: &str) -> Config {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("{prefix}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        Config {
            data_dir: root,
            email: "alice@example.com".to_string(),
            server_url: "http://127.0.0.1:9".to_string(),
            access_token: None,
            max_file_size_mb: 10,
            config_path: None,
        }
    }

    #[tokio::test]
    async fn enqueues_permissions_before_files() {
        let cfg = make_workspace("syftbox-sync-manager-order");
        let datasites = cfg.datasites_dir();
        let folder = datasites.join("alice@example.com/folder");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("file.txt"), b"data").unwrap();
        fs::write(
            folder.join("_.syftperm"),
            br#"{"admin":["alice@example.com"],"read":["*"],"write":["alice@example.com"]}"#,
        )
        .unwrap();

        let client = SyncClient::new(&cfg.server_url, &cfg.email, None).unwrap();
        let mut manager = SyncManager::new(&cfg, client).unwrap();

        let datasite = DatasiteState::new("alice@example.com", vec![]);
        let (permission_changes, file_changes) = datasite
            .get_out_of_sync_files(&manager.datasites_root, &manager.ignore, &mut manager.scanner)
            .unwrap();
        for change in permission_changes.into_iter().chain(file_changes) {
            manager.queue.put(change);
        }

        let first = manager.queue.get(Duration::from_millis(10)).unwrap();
        assert_eq!(first.priority, PRIORITY_PERMISSION_FILE);
        assert_eq!(first.path.file_name(), "_.syftperm");
    }

    #[tokio::test]
    async fn datasite_states_fall_back_to_own_email() {
        // server is unreachable: the manager still syncs its own datasite
        let cfg = make_workspace("syftbox-sync-manager-fallback");
        let client = SyncClient::new("http://127.0.0.1:9", &cfg.email, None).unwrap();
        let manager = SyncManager::new(&cfg, client).unwrap();

        let states = manager.get_datasite_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].email, "alice@example.com");
        assert!(states[0].remote_state.is_empty());
    }
}
