//! Pickup directory scanner
//!
//! Every pass claims each committed message (rename `new/` → `queue/`) and
//! pushes the claimed path onto the work queue. It then sweeps `queue/` for
//! deferred messages whose last attempt is older than the retry interval.
//! A file is never delivered straight out of `new/`.

use crate::config::SharedConfig;
use crate::relay::queue::{Push, WorkQueue};
use crate::stats::Stats;
use crate::storage::Spool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Scanner {
    spool: Arc<Spool>,
    queue: Arc<WorkQueue<PathBuf>>,
    shared: SharedConfig,
    stats: Arc<Stats>,
}

impl Scanner {
    pub fn new(
        spool: Arc<Spool>,
        queue: Arc<WorkQueue<PathBuf>>,
        shared: SharedConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            spool,
            queue,
            shared,
            stats,
        }
    }

    /// Scan until the queue is stopped
    pub fn run(self) {
        info!("Relay scanner started");
        let recovered = self.recover();
        if recovered > 0 {
            info!("Recovered {} message(s) from a previous run", recovered);
        }

        loop {
            let config = self.shared.current();
            let queued = self.scan_once(config.upstream.retry_interval());
            if queued > 0 {
                debug!("Queued {} message(s)", queued);
            }
            if self.queue.wait_stopped(config.upstream.scan_interval()) {
                break;
            }
        }
        info!("Relay scanner stopped");
    }

    /// Queue every message already in the work directory
    pub fn recover(&self) -> usize {
        let files = match self.spool.work_files() {
            Ok(files) => files,
            Err(e) => {
                error!("Cannot list {}: {}", self.spool.work_dir().display(), e);
                return 0;
            }
        };
        files.into_iter().filter(|path| self.enqueue(path.clone())).count()
    }

    /// One pass over the pickup and work directories; returns how many
    /// paths were queued
    pub fn scan_once(&self, retry_interval: Duration) -> usize {
        let mut queued = 0;

        match self.spool.pickup_files() {
            Ok(files) => {
                for path in files {
                    match self.spool.claim(&path) {
                        Ok(work_path) => {
                            if self.enqueue(work_path) {
                                queued += 1;
                            }
                        }
                        Err(e) => warn!(
                            "Failed to claim {}, retrying next scan: {}",
                            path.display(),
                            e
                        ),
                    }
                }
            }
            Err(e) => error!("Cannot list {}: {}", self.spool.pickup_dir().display(), e),
        }

        match self.spool.work_files() {
            Ok(files) => {
                for path in files {
                    if self.queue.is_claimed(&path) {
                        continue;
                    }
                    match self.spool.is_due(&path, retry_interval) {
                        Ok(true) => {
                            if self.enqueue(path) {
                                queued += 1;
                            }
                        }
                        Ok(false) => {}
                        // Delivered and removed since the listing
                        Err(e) => debug!("Skipping {}: {}", path.display(), e),
                    }
                }
            }
            Err(e) => error!("Cannot list {}: {}", self.spool.work_dir().display(), e),
        }

        self.stats.set_queue_depth(self.queue.len() as u64);
        queued
    }

    fn enqueue(&self, path: PathBuf) -> bool {
        match self.queue.push(path) {
            Push::Queued => true,
            Push::Duplicate => false,
            Push::Stopped(path) => {
                debug!("Queue stopped, {} stays for the next run", path.display());
                false
            }
        }
    }
}
