//! Per-file configuration watcher.
//!
//! Each persisted catalog gets a [`ConfigWatcher`] so that edits made by
//! other processes (or by hand) hot-reload into the running manager. The
//! watcher observes the file's containing directory, filters events down to
//! the target filename, coalesces bursts with a short debounce, and invokes
//! the caller's reload closure — unless the manager itself just wrote the
//! file, which it announces via [`ConfigWatcher::mark_self_write`].
//!
//! ```text
//! notify (directory events)
//!    │ filter to target filename
//!    ▼
//! mpsc ──► debounce (~400 ms quiet window)
//!              │ self-write marker fresh? ── yes ──► suppressed
//!              ▼ no
//!          on_reload()
//! ```
//!
//! Errors raised by the reload closure are caught and logged; the watcher
//! stays armed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};

/// Quiet window used to coalesce bursts of filesystem events.
const DEBOUNCE: Duration = Duration::from_millis(400);

/// How long a self-write marker suppresses reload callbacks.
const SELF_WRITE_WINDOW: Duration = Duration::from_millis(1000);

/// Watches a single file and invokes a reload closure on external changes.
pub struct ConfigWatcher {
    self_write: Arc<Mutex<Option<Instant>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    // Dropping the notify watcher tears down the OS-level watch.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path`. The `on_reload` closure runs after every
    /// debounced external modification of the file.
    ///
    /// Must be called from within a tokio runtime (the debounce loop is a
    /// spawned task).
    pub fn watch<F>(path: &Path, on_reload: F) -> Result<Self, notify::Error>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let target = path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| notify::Error::generic("watch path has no file name"))?;
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| notify::Error::generic("watch path has no parent directory"))?;
        std::fs::create_dir_all(&dir)
            .map_err(|e| notify::Error::generic(&format!("create watch dir: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
            if let Ok(event) = res {
                let hit = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(target.as_os_str()));
                if hit {
                    let _ = tx.send(());
                }
            }
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let self_write = Arc::new(Mutex::new(None::<Instant>));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let marker = self_write.clone();
        let display = path.display().to_string();
        tokio::spawn(debounce_loop(
            rx,
            shutdown_rx,
            marker,
            display,
            Arc::new(on_reload),
        ));

        Ok(Self {
            self_write,
            shutdown: Mutex::new(Some(shutdown_tx)),
            _watcher: watcher,
        })
    }

    /// Announce that the manager is about to write the watched file itself.
    ///
    /// Filesystem events arriving within the next second are treated as the
    /// echo of that write and do not trigger `on_reload`.
    pub fn mark_self_write(&self) {
        *self.self_write.lock().unwrap() = Some(Instant::now());
    }

    /// Stop watching. Idempotent.
    pub fn close(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<()>,
    mut shutdown_rx: oneshot::Receiver<()>,
    marker: Arc<Mutex<Option<Instant>>>,
    display: String,
    on_reload: Arc<dyn Fn() + Send + Sync>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            first = rx.recv() => {
                if first.is_none() {
                    break;
                }
                // Coalesce the burst: keep draining until the file has been
                // quiet for the debounce window.
                loop {
                    match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                        Ok(Some(_)) => continue,
                        _ => break,
                    }
                }
                let suppressed = marker
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed() < SELF_WRITE_WINDOW)
                    .unwrap_or(false);
                if suppressed {
                    log::debug!("ConfigWatcher: self-write on {}, reload suppressed", display);
                    continue;
                }
                log::info!("ConfigWatcher: external change on {}, reloading", display);
                if catch_unwind(AssertUnwindSafe(|| (*on_reload)())).is_err() {
                    log::error!("ConfigWatcher: reload callback for {} panicked", display);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(900)).await;
    }

    #[tokio::test]
    async fn external_write_fires_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "[]").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let watcher = ConfigWatcher::watch(&path, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A burst of writes inside the debounce window coalesces to one
        // callback.
        std::fs::write(&path, "[1]").unwrap();
        std::fs::write(&path, "[1,2]").unwrap();
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.close();
    }

    #[tokio::test]
    async fn self_write_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "[]").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let watcher = ConfigWatcher::watch(&path, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        watcher.mark_self_write();
        std::fs::write(&path, "[1]").unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // After the suppression window expires, external writes fire again.
        tokio::time::sleep(SELF_WRITE_WINDOW).await;
        std::fs::write(&path, "[1,2]").unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        watcher.close();
    }
}
