use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drive_core::{DriveClient, RemoteDrive};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sync::cache::{CacheConfig, DEFAULT_SYNC_COOLDOWN, MetadataCache};
use crate::sync::cleanup::{CleanupConfig, CleanupWatcher};
use crate::sync::coordinator::{Coordinator, CoordinatorEvent};
use crate::sync::locks::LockRegistry;
use crate::sync::snapshot::{AccountPaths, SnapshotStore};
use crate::sync::transfer::TransferContext;
use crate::sync::upload_watcher::{UploadWatcher, UploadWatcherConfig, UploadWatcherHandle};

const APP_DIR_NAME: &str = "drived";
const DEFAULT_ACCOUNT: &str = "default";
const DEFAULT_REMOTE_POLL_SECS: u64 = 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
const DEFAULT_CLEANUP_IDLE_SECS: u64 = 300;
const DEFAULT_UPLOAD_POLL_MS: u64 = 1000;
const DEFAULT_UPLOAD_RETRY_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Bearer token; only `run` needs it.
    pub token: Option<String>,
    pub account: String,
    pub api_url: Option<String>,
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    pub sync_cooldown: Duration,
    pub remote_poll_interval: Duration,
    pub cleanup: CleanupConfig,
    pub upload: UploadWatcherConfig,
    pub enable_upload_watcher: bool,
    pub enable_cleanup: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(|name| std::env::var(name).ok(), &home))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>, home: &Path) -> Self {
        let dir = |name: &str, default: fn() -> PathBuf| {
            lookup(name)
                .map(|value| expand_with_home(&value, home))
                .unwrap_or_else(default)
        };
        let secs = |name: &str, default: u64| Duration::from_secs(read_u64(lookup(name), default));

        Self {
            token: lookup("DRIVED_TOKEN").filter(|token| !token.trim().is_empty()),
            account: lookup("DRIVED_ACCOUNT").unwrap_or_else(|| DEFAULT_ACCOUNT.to_string()),
            api_url: lookup("DRIVED_API_URL"),
            data_dir: dir("DRIVED_DATA_DIR", default_data_dir),
            download_dir: dir("DRIVED_DOWNLOAD_DIR", default_download_dir),
            sync_cooldown: secs("DRIVED_SYNC_COOLDOWN_SECS", DEFAULT_SYNC_COOLDOWN.as_secs()),
            remote_poll_interval: secs("DRIVED_REMOTE_POLL_SECS", DEFAULT_REMOTE_POLL_SECS),
            cleanup: CleanupConfig {
                interval: secs("DRIVED_CLEANUP_INTERVAL_SECS", DEFAULT_CLEANUP_INTERVAL_SECS),
                idle_timeout: secs("DRIVED_CLEANUP_IDLE_SECS", DEFAULT_CLEANUP_IDLE_SECS),
            },
            upload: UploadWatcherConfig {
                poll_interval: Duration::from_millis(read_u64(
                    lookup("DRIVED_UPLOAD_POLL_MS"),
                    DEFAULT_UPLOAD_POLL_MS,
                )),
                retry_horizon: secs("DRIVED_UPLOAD_RETRY_SECS", DEFAULT_UPLOAD_RETRY_SECS),
            },
            enable_upload_watcher: read_bool(lookup("DRIVED_ENABLE_UPLOAD_WATCHER"), true),
            enable_cleanup: read_bool(lookup("DRIVED_ENABLE_CLEANUP"), true),
        }
    }

    pub fn account_paths(&self) -> AccountPaths {
        AccountPaths::new(&self.data_dir, &self.account)
    }
}

/// Wipes the account's snapshots and cursor files.
pub async fn reset_cache(config: &DaemonConfig) -> anyhow::Result<()> {
    let paths = config.account_paths();
    SnapshotStore::new(paths.clone())
        .clear()
        .await
        .with_context(|| format!("failed to clear cache at {}", paths.metadata_dir.display()))?;
    info!(account = %config.account, "metadata cache reset");
    Ok(())
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    cache: Arc<MetadataCache>,
    coordinator: Coordinator,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let token = config
            .token
            .clone()
            .context("DRIVED_TOKEN is not set")?;
        let client = match config.api_url.as_deref() {
            Some(url) => DriveClient::with_base_url(url, token),
            None => DriveClient::new(token),
        }
        .context("failed to build drive client")?;
        Self::with_remote(config, Arc::new(client)).await
    }

    pub async fn with_remote(
        config: DaemonConfig,
        remote: Arc<dyn RemoteDrive>,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("failed to create data dir at {:?}", config.data_dir))?;
        tokio::fs::create_dir_all(&config.download_dir)
            .await
            .with_context(|| {
                format!("failed to create download dir at {:?}", config.download_dir)
            })?;

        let cache = Arc::new(MetadataCache::new(
            remote.clone(),
            SnapshotStore::new(config.account_paths()),
            CacheConfig {
                sync_cooldown: config.sync_cooldown,
            },
        ));
        let ctx = TransferContext {
            remote,
            cache: cache.clone(),
            download_root: config.download_dir.clone(),
        };
        let coordinator = Coordinator::new(ctx, LockRegistry::new());
        Ok(Self {
            config,
            cache,
            coordinator,
        })
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            account = %self.config.account,
            download_dir = %self.config.download_dir.display(),
            upload_watcher = self.config.enable_upload_watcher,
            cleanup = self.config.enable_cleanup,
            "daemon started"
        );
        let background = self.spawn_background();

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutdown requested");

        background.shutdown();
        self.cache.flush_dirty().await;
        Ok(())
    }

    /// Starts every background loop the config enables.
    pub fn spawn_background(&self) -> Background {
        let mut tasks = vec![
            spawn_event_logger(self.coordinator.subscribe()),
            spawn_reconcile_loop(self.cache.clone(), self.config.remote_poll_interval),
        ];

        let upload_watcher = if self.config.enable_upload_watcher {
            let watcher = Arc::new(UploadWatcher::new(
                self.config.download_dir.clone(),
                self.cache.clone(),
                self.coordinator.clone(),
                self.config.upload,
            ));
            match watcher.start() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(error = %err, "failed to start upload watcher");
                    None
                }
            }
        } else {
            None
        };

        if self.config.enable_cleanup {
            let cleanup = Arc::new(CleanupWatcher::new(
                self.config.download_dir.clone(),
                self.cache.clone(),
                self.coordinator.clone(),
                self.config.cleanup,
            ));
            tasks.push(cleanup.start());
        }

        Background {
            tasks,
            upload_watcher,
        }
    }
}

/// Handles of the running background loops.
pub struct Background {
    tasks: Vec<JoinHandle<()>>,
    upload_watcher: Option<UploadWatcherHandle>,
}

impl Background {
    pub fn has_upload_watcher(&self) -> bool {
        self.upload_watcher.is_some()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_reconcile_loop(cache: Arc<MetadataCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match cache.reconcile().await {
                Ok(state) => debug!(?state, "reconcile pass finished"),
                Err(err) => warn!(error = %err, "reconcile pass failed"),
            }
        }
    })
}

fn spawn_event_logger(mut events: broadcast::Receiver<CoordinatorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
