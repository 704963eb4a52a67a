//! Filesystem marker watcher.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::{PendingOutcome, Resolver, SignalOutcome, SignalWatcher, once_channel};
use crate::error::Result;

/// Resolves `Success` when the daemon creates its marker file.
///
/// The marker is deleted when consumed. Arming checks for a marker that was
/// created before the directory watch was registered, so the setup race
/// resolves immediately instead of waiting out the timeout.
pub struct MarkerWatcher {
    dir: PathBuf,
    marker: String,
    watcher: Option<RecommendedWatcher>,
    pending: Option<PendingOutcome>,
}

impl std::fmt::Debug for MarkerWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerWatcher")
            .field("dir", &self.dir)
            .field("marker", &self.marker)
            .field("armed", &self.watcher.is_some())
            .finish()
    }
}

impl MarkerWatcher {
    pub fn new(dir: impl AsRef<Path>, marker: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            marker: marker.into(),
            watcher: None,
            pending: None,
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(&self.marker)
    }
}

fn is_creation(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)))
}

/// Delete the marker and resolve. Safe to race with itself.
fn consume(path: &Path, resolver: &Resolver) {
    if resolver.is_resolved() {
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("Consumed marker {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete marker {}: {e}", path.display()),
    }
    if resolver.resolve(SignalOutcome::Success) {
        info!("Marker {} observed", path.display());
    }
}

#[async_trait]
impl SignalWatcher for MarkerWatcher {
    fn name(&self) -> &str {
        "marker"
    }

    async fn reset(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.marker_path();
        match fs::remove_file(&path) {
            Ok(()) => info!("Removed stale marker {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn arm(&mut self) -> Result<()> {
        self.cancel();
        fs::create_dir_all(&self.dir)?;

        let (resolver, pending) = once_channel();
        let path = self.marker_path();

        let callback_resolver = resolver.clone();
        let callback_path = path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let is_marker = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == callback_path.file_name());
                if is_marker && is_creation(&event.kind) {
                    consume(&callback_path, &callback_resolver);
                }
            }
            Err(e) => warn!("Marker watch error: {e}"),
        })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {} for {}", self.dir.display(), self.marker);

        if path.exists() {
            consume(&path, &resolver);
        }

        self.watcher = Some(watcher);
        self.pending = Some(pending);
        Ok(())
    }

    fn take_pending(&mut self) -> Option<PendingOutcome> {
        self.pending.take()
    }

    fn cancel(&mut self) {
        self.pending = None;
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&self.dir) {
                debug!("Failed to unwatch {}: {e}", self.dir.display());
            }
        }
    }
}
