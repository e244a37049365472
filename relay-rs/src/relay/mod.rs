//! Relay pipeline
//!
//! ```text
//! new/ ──claim──→ queue/ ──→ Scanner ──push──→ WorkQueue ──pop──→ Worker×N ──→ upstream
//! ```
//!
//! - [`scanner`]: moves committed messages into the work directory
//! - [`queue`]: bounded blocking queue between scanner and workers
//! - [`worker`]: delivers one message and files the outcome
//! - [`envelope`]: reads the envelope back from a spool file

pub mod envelope;
pub mod queue;
pub mod scanner;
pub mod worker;

pub use envelope::RelayEnvelope;
pub use queue::WorkQueue;
pub use scanner::Scanner;
pub use worker::{Outcome, Worker};

use crate::config::SharedConfig;
use crate::error::Result;
use crate::stats::Stats;
use crate::storage::Spool;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info};

/// The scanner thread plus the worker pool
pub struct RelayService {
    queue: Arc<WorkQueue<PathBuf>>,
    scanner: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl RelayService {
    /// Spawn the scanner and `upstream.relay_threads` workers
    ///
    /// The worker count is read once; changing it needs a restart.
    pub fn start(shared: SharedConfig, spool: Arc<Spool>, stats: Arc<Stats>) -> Result<Self> {
        let config = shared.current();
        let queue = Arc::new(WorkQueue::new(config.upstream.queue_capacity));
        let mut service = Self {
            queue: Arc::clone(&queue),
            scanner: None,
            workers: Vec::with_capacity(config.upstream.relay_threads),
        };

        for id in 0..config.upstream.relay_threads {
            let worker = Worker::new(
                id,
                Arc::clone(&spool),
                Arc::clone(&queue),
                shared.clone(),
                Arc::clone(&stats),
            );
            let handle = thread::Builder::new()
                .name(format!("relay-worker-{}", id))
                .spawn(move || worker.run())?;
            service.workers.push(handle);
        }

        let scanner = Scanner::new(spool, queue, shared.clone(), stats);
        service.scanner = Some(
            thread::Builder::new()
                .name("relay-scanner".to_string())
                .spawn(move || scanner.run())?,
        );

        info!(
            "Relay pipeline started: {} worker(s) relaying to {}",
            service.workers.len(),
            config.upstream.address()
        );
        Ok(service)
    }

    pub fn queue(&self) -> &Arc<WorkQueue<PathBuf>> {
        &self.queue
    }

    /// Stop the queue, then join the scanner and every worker
    ///
    /// Workers finish the delivery they are in; queued paths stay in
    /// `queue/` and are recovered on the next start.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.queue.stop();
        if let Some(scanner) = self.scanner.take() {
            if scanner.join().is_err() {
                error!("Relay scanner panicked");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Relay worker panicked");
            }
        }
        info!("Relay pipeline stopped");
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        if self.scanner.is_some() || !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
