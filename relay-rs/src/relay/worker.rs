//! Relay workers
//!
//! A worker pops a claimed path, recovers the envelope from the file and
//! hands the message to the upstream server. The outcome decides what
//! happens to the file:
//!
//! | Outcome | File |
//! |---|---|
//! | upstream accepted | removed |
//! | envelope missing or malformed | moved to `failed/` |
//! | anything else | kept in `queue/`, retried after the retry interval |

use crate::config::SharedConfig;
use crate::error::Result;
use crate::relay::envelope::RelayEnvelope;
use crate::relay::queue::WorkQueue;
use crate::smtp::SmtpClient;
use crate::stats::Stats;
use crate::storage::Spool;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Deferred,
    DeadLettered,
}

pub struct Worker {
    id: usize,
    spool: Arc<Spool>,
    queue: Arc<WorkQueue<PathBuf>>,
    shared: SharedConfig,
    stats: Arc<Stats>,
}

impl Worker {
    pub fn new(
        id: usize,
        spool: Arc<Spool>,
        queue: Arc<WorkQueue<PathBuf>>,
        shared: SharedConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            id,
            spool,
            queue,
            shared,
            stats,
        }
    }

    /// Deliver queued messages until the queue is stopped
    pub fn run(self) {
        debug!("Relay worker {} started", self.id);
        while let Some(path) = self.queue.pop() {
            self.process(&path);
            self.queue.complete(&path);
            self.stats.set_queue_depth(self.queue.len() as u64);
        }
        debug!("Relay worker {} stopped", self.id);
    }

    /// Attempt one delivery and file the message according to the outcome
    pub fn process(&self, path: &Path) -> Outcome {
        let error = match self.deliver(path) {
            Ok(()) => {
                self.stats.relay_succeeded();
                if let Err(e) = self.spool.complete(path) {
                    error!("Delivered {} but cannot remove it: {}", path.display(), e);
                }
                return Outcome::Delivered;
            }
            Err(e) => e,
        };

        self.stats.relay_failed();
        if error.is_permanent() {
            error!("Cannot relay {}: {}", path.display(), error);
            self.stats.relay_dead_lettered();
            match self.spool.dead_letter(path) {
                Ok(failed) => info!("Moved {} to {}", path.display(), failed.display()),
                Err(e) => error!("Cannot dead-letter {}: {}", path.display(), e),
            }
            return Outcome::DeadLettered;
        }

        warn!("Relay of {} failed, will retry: {}", path.display(), error);
        self.stats.relay_deferred();
        if let Err(e) = self.spool.defer(path) {
            warn!("Cannot mark {} for retry: {}", path.display(), e);
        }
        Outcome::Deferred
    }

    fn deliver(&self, path: &Path) -> Result<()> {
        let config = self.shared.current();

        let mut reader = BufReader::new(self.spool.read(path)?);
        let (envelope, first_line) = RelayEnvelope::parse(&mut reader)?;
        let body = Cursor::new(first_line.unwrap_or_default()).chain(reader);

        debug!(
            "Worker {} relaying {} to {}",
            self.id,
            path.display(),
            config.upstream.address()
        );
        let client = SmtpClient::new(config.upstream.address(), config.server.hostname.clone())
            .with_timeout(config.upstream.timeout());
        client.send_mail(&envelope.sender, &envelope.recipients, body)
    }
}
