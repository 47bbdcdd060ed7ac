//! Resource file reloading.
//!
//! Polls the file's modification time and publishes the whole resource set
//! to the store on change. The store diffs it into change events; an
//! unchanged set publishes nothing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use edgeway_resources::{load_file, ResourceStore};

/// Load `path` into `store` once.
///
/// Returns the number of change events published.
pub fn load_into(store: &ResourceStore, path: &Path) -> Result<usize> {
    let resources =
        load_file(path).with_context(|| format!("loading resources from {}", path.display()))?;
    let count = resources.len();
    let changes = store
        .replace_all(resources)
        .with_context(|| format!("publishing resources from {}", path.display()))?;
    debug!(path = %path.display(), resources = count, changes, "Resource file loaded");
    Ok(changes)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Watches one resource file.
#[derive(Debug)]
pub struct FileReloader {
    path: PathBuf,
    store: Arc<ResourceStore>,
    interval: Duration,
    last_modified: Option<SystemTime>,
}

impl FileReloader {
    /// `store` is assumed to already hold the file's current contents.
    pub fn new(path: PathBuf, store: Arc<ResourceStore>, interval: Duration) -> Self {
        let last_modified = modified(&path);
        Self {
            path,
            store,
            interval,
            last_modified,
        }
    }

    /// Check once. Returns the number of change events published.
    ///
    /// A file that fails to parse leaves the store untouched and is retried
    /// on its next modification.
    pub fn poll(&mut self) -> usize {
        let current = modified(&self.path);
        if current == self.last_modified {
            return 0;
        }
        self.last_modified = current;

        match load_into(&self.store, &self.path) {
            Ok(changes) => {
                if changes > 0 {
                    info!(path = %self.path.display(), changes, "Resource file reloaded");
                }
                changes
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %format!("{:#}", e), "Resource reload failed; keeping previous set");
                0
            }
        }
    }

    /// Poll forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll();
        }
    }
}
