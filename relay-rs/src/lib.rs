//! relay-rs: SMTP relay gateway
//!
//! Accepts mail over SMTP, spools every message to disk with a
//! write-then-rename commit, and forwards spooled messages to an upstream
//! SMTP server. A message that cannot be delivered stays in the spool and is
//! retried later.
//!
//! # Architecture
//!
//! ```text
//! clients ──→ Reactor ──→ Connection ──→ SmtpSession ──→ Spool (tmp/ → new/)
//!                                                            │
//! upstream ←── Worker×N ←── WorkQueue ←── Scanner (new/ → queue/)
//! ```
//!
//! The reactor thread owns every connection, session and buffer. The relay
//! pipeline runs on its own blocking threads; the two sides meet only at
//! the spool directories.
//!
//! # Example
//!
//! ```no_run
//! use relay_rs::config::{Config, SharedConfig};
//! use relay_rs::net::StopHandle;
//! use relay_rs::relay::RelayService;
//! use relay_rs::smtp::SmtpServer;
//! use relay_rs::stats::Stats;
//! use relay_rs::storage::Spool;
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let shared = SharedConfig::new(Config::default());
//!     let spool = Arc::new(Spool::open_local(&shared.current().storage.path)?);
//!     let stats = Arc::new(Stats::new());
//!
//!     let relay = RelayService::start(shared.clone(), Arc::clone(&spool), Arc::clone(&stats))?;
//!     let server = SmtpServer::bind(shared, spool, stats, None)?;
//!     server.run(StopHandle::new())?;
//!     relay.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and hot reload
//! - [`error`]: Error types
//! - [`logging`]: Subscriber set-up
//! - [`net`]: Reactor and connections
//! - [`policy`]: Connection, sender and recipient checks
//! - [`relay`]: Scanner, work queue and delivery workers
//! - [`security`]: TLS
//! - [`smtp`]: SMTP session, server and client
//! - [`stats`]: Counters
//! - [`storage`]: Spool
//! - [`utils`]: Ring buffer and arena

pub mod config;
pub mod error;
pub mod logging;
pub mod net;
pub mod policy;
pub mod relay;
pub mod security;
pub mod smtp;
pub mod stats;
pub mod storage;
pub mod utils;

pub use config::Config;
pub use error::{RelayError, Result};
