//! Shared configuration snapshot and hot reload
//!
//! Readers take a cheap `Arc<Config>` clone under a read lock and keep using
//! that snapshot for as long as they like. A reload loads and validates the
//! new file without holding any lock, swaps the pointer under the write lock,
//! then notifies callbacks with the old and new snapshots. The old snapshot
//! is freed once the last reader drops it.

use crate::config::Config;
use crate::error::{RelayError, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Quiet period after the last file event before reloading
const DEBOUNCE: Duration = Duration::from_millis(500);

type ReloadCallback = Box<dyn Fn(&Config, &Config) + Send + Sync>;

struct Inner {
    current: RwLock<Arc<Config>>,
    generation: AtomicU64,
    callbacks: Mutex<Vec<ReloadCallback>>,
}

/// Handle to the live configuration, cloned into every thread that needs it
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<Inner>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: RwLock::new(Arc::new(config)),
                generation: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The current snapshot
    pub fn current(&self) -> Arc<Config> {
        let guard = self
            .inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Incremented by every successful swap
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Register a callback run after each successful reload
    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn(&Config, &Config) + Send + Sync + 'static,
    {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Validate `config` and make it the current snapshot
    ///
    /// # Errors
    /// Returns the validation error and keeps the current snapshot.
    pub fn replace(&self, config: Config) -> Result<()> {
        config.validate()?;

        let new = Arc::new(config);
        let old = {
            let mut guard = self
                .inner
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, Arc::clone(&new))
        };
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Configuration updated (generation {})", generation);

        let callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(&old, &new);
        }
        drop(callbacks);
        drop(old);
        Ok(())
    }

    /// Load, validate and swap in the configuration file at `path`
    pub fn reload_from(&self, path: &Path) -> Result<()> {
        let config = Config::from_file(path)?;
        self.replace(config)
    }
}

/// Watches the configuration file and reloads it when it changes
pub struct ConfigWatcher {
    watcher: Option<RecommendedWatcher>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Start watching `path`
    ///
    /// The parent directory is watched so editors that replace the file by
    /// rename are noticed too.
    pub fn spawn(path: &Path, shared: SharedConfig) -> Result<Self> {
        let path = path
            .canonicalize()
            .map_err(|e| RelayError::Config(format!("Cannot watch {}: {}", path.display(), e)))?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| RelayError::Config(format!("Cannot watch {}", path.display())))?;

        let (tx, rx) = channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |result| {
                let _ = tx.send(result);
            },
            notify::Config::default(),
        )
        .map_err(|e| RelayError::Config(format!("Failed to create watcher: {}", e)))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RelayError::Config(format!("Failed to watch {}: {}", dir.display(), e)))?;
        debug!("Watching {:?} for configuration changes", path);

        let running = Arc::new(AtomicBool::new(true));
        let thread = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("config-watch".to_string())
                .spawn(move || watch_loop(path, shared, rx, running))?
        };

        Ok(Self {
            watcher: Some(watcher),
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        // Dropping the watcher disconnects the channel
        self.watcher = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn watch_loop(
    path: PathBuf,
    shared: SharedConfig,
    rx: std::sync::mpsc::Receiver<notify::Result<Event>>,
    running: Arc<AtomicBool>,
) {
    let mut pending: Option<Instant> = None;

    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                if affects(&event, &path) {
                    pending = Some(Instant::now());
                }
            }
            Ok(Err(e)) => warn!("Configuration watcher error: {}", e),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if pending.map_or(false, |at| at.elapsed() >= DEBOUNCE) {
            pending = None;
            info!("Configuration file changed, reloading {}", path.display());
            if let Err(e) = shared.reload_from(&path) {
                error!("Configuration reload failed, keeping current settings: {}", e);
            }
        }
    }
}

fn affects(event: &Event, path: &Path) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == path.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[test]
    fn test_replace_swaps_snapshot() {
        let shared = SharedConfig::new(Config::default());
        let before = shared.current();

        let mut next = Config::default();
        next.upstream.host = "smtp.example.com".to_string();
        shared.replace(next).unwrap();

        assert_eq!(shared.generation(), 1);
        assert_eq!(shared.current().upstream.host, "smtp.example.com");
        // Readers holding the old snapshot are unaffected
        assert_eq!(before.upstream.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let shared = SharedConfig::new(Config::default());
        let mut bad = Config::default();
        bad.upstream.relay_threads = 0;
        assert!(shared.replace(bad).is_err());
        assert_eq!(shared.generation(), 0);
        assert_eq!(shared.current().upstream.relay_threads, 4);
    }

    #[test]
    fn test_callbacks_see_old_and_new() {
        let shared = SharedConfig::new(Config::default());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            shared.on_reload(move |old, new| {
                assert_eq!(old.server.port, 25);
                assert_eq!(new.server.port, 2525);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut next = Config::default();
        next.server.port = 2525;
        shared.replace(next).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[upstream]\nport = 2600\n").unwrap();

        let shared = SharedConfig::new(Config::default());
        shared.reload_from(&path).unwrap();
        assert_eq!(shared.current().upstream.port, 2600);
    }

    #[test]
    fn test_watcher_reloads_on_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[upstream]\nport = 2600\n").unwrap();

        let shared = SharedConfig::new(Config::default());
        let watcher = ConfigWatcher::spawn(&path, shared.clone()).unwrap();

        thread::sleep(Duration::from_millis(200));
        std::fs::write(&path, "[upstream]\nport = 2700\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while shared.current().upstream.port != 2700 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        watcher.stop();
        assert_eq!(shared.current().upstream.port, 2700);
    }
}
