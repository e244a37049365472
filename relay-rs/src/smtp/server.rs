//! SMTP listener on the reactor
//!
//! The server owns the listening sockets and runs the reactor on the calling
//! thread. Each listener is registered with an [`Acceptor`] that turns
//! pending clients into connections. Sessions are built from the
//! configuration snapshot current at accept time, so a reload affects new
//! connections only.

use crate::config::SharedConfig;
use crate::error::Result;
use crate::net::connection::{Accepted, Connection, ConnectionContext};
use crate::net::reactor::{EventHandler, Interest, Reactor, Readiness, StopHandle};
use crate::policy::{Policy, StaticPolicy};
use crate::security::TlsConfig;
use crate::smtp::session::SessionSettings;
use crate::stats::Stats;
use crate::storage::Spool;
use mio::net::TcpListener;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct SmtpServer {
    listener: TcpListener,
    tls_listener: Option<TcpListener>,
    contexts: ContextSource,
}

impl SmtpServer {
    /// Bind the configured listeners
    ///
    /// The implicit TLS listener is bound only when `server.tls_port` is set,
    /// which requires `tls`.
    pub fn bind(
        shared: SharedConfig,
        spool: Arc<Spool>,
        stats: Arc<Stats>,
        tls: Option<TlsConfig>,
    ) -> Result<Self> {
        let config = shared.current();

        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)?;
        info!("SMTP server listening on {}", listener.local_addr()?);

        let tls_listener = match config.tls_listen_addr()? {
            Some(addr) if tls.is_some() => {
                let listener = TcpListener::bind(addr)?;
                info!("SMTPS listening on {}", listener.local_addr()?);
                Some(listener)
            }
            Some(addr) => {
                warn!("No TLS certificate loaded, not listening on {}", addr);
                None
            }
            None => None,
        };

        Ok(Self {
            listener,
            tls_listener,
            contexts: ContextSource {
                shared,
                spool,
                stats,
                tls,
                policy: None,
                cached: None,
            },
        })
    }

    /// Use `policy` instead of the one built from `[policy]`
    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.contexts.policy = Some(policy);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn tls_local_addr(&self) -> Result<Option<SocketAddr>> {
        Ok(self
            .tls_listener
            .as_ref()
            .map(|l| l.local_addr())
            .transpose()?)
    }

    /// Serve until `stop` is triggered
    ///
    /// Blocks the calling thread. Every open connection is closed when this
    /// returns.
    pub fn run(self, stop: StopHandle) -> Result<()> {
        let mut reactor = Reactor::new(stop)?;

        let fd = self.listener.as_raw_fd();
        reactor.register(
            fd,
            Interest::READABLE,
            Box::new(Acceptor {
                listener: self.listener,
                implicit_tls: false,
                contexts: self.contexts.clone(),
            }),
        )?;

        if let Some(listener) = self.tls_listener {
            let fd = listener.as_raw_fd();
            reactor.register(
                fd,
                Interest::READABLE,
                Box::new(Acceptor {
                    listener,
                    implicit_tls: true,
                    contexts: self.contexts,
                }),
            )?;
        }

        reactor.run()?;
        info!(
            "SMTP server stopped, closing {} descriptor(s)",
            reactor.len()
        );
        Ok(())
    }
}

/// Builds connection contexts, following configuration reloads
#[derive(Clone)]
struct ContextSource {
    shared: SharedConfig,
    spool: Arc<Spool>,
    stats: Arc<Stats>,
    tls: Option<TlsConfig>,
    policy: Option<Arc<dyn Policy>>,
    cached: Option<(u64, ConnectionContext)>,
}

impl ContextSource {
    fn current(&mut self) -> &ConnectionContext {
        let generation = self.shared.generation();
        if matches!(&self.cached, Some((cached, _)) if *cached != generation) {
            self.cached = None;
        }

        let Self {
            shared,
            spool,
            stats,
            tls,
            policy,
            cached,
        } = self;
        let (_, ctx) = cached.get_or_insert_with(|| {
            let config = shared.current();
            let policy = match policy {
                Some(policy) => Arc::clone(policy),
                None => Arc::new(StaticPolicy::from_config(&config.policy)) as Arc<dyn Policy>,
            };
            let session = SessionSettings::from_config(
                &config,
                policy,
                Arc::clone(spool),
                Arc::clone(stats),
            );
            debug!("Connection settings built from generation {}", generation);
            (
                generation,
                ConnectionContext {
                    session: Arc::new(session),
                    tls: tls.clone(),
                    max_connections: config.server.max_connections,
                },
            )
        });
        ctx
    }
}

struct Acceptor {
    listener: TcpListener,
    implicit_tls: bool,
    contexts: ContextSource,
}

impl EventHandler for Acceptor {
    fn on_ready(&mut self, reactor: &mut Reactor, fd: RawFd, readiness: Readiness) {
        if readiness.is_error() {
            error!("Error condition on listener fd {}", fd);
        }
        if !readiness.is_readable() {
            return;
        }

        // Edge-triggered: accept until the backlog is empty
        loop {
            let ctx = self.contexts.current();
            match Connection::accept(reactor, &self.listener, ctx, self.implicit_tls) {
                Ok(Accepted::Live(_)) | Ok(Accepted::Rejected(_)) | Ok(Accepted::Skipped) => {}
                Ok(Accepted::Drained) => break,
                Err(e) => {
                    // Listener trouble such as descriptor exhaustion; retried on the next event
                    error!("Failed to accept connection: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.hostname = "relay.test".to_string();
        config.storage.path = dir.path().to_path_buf();
        config
    }

    fn read_line(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn test_server_accepts_and_stops() {
        let dir = TempDir::new().unwrap();
        let shared = SharedConfig::new(test_config(&dir));
        let spool = Arc::new(Spool::open_local(dir.path()).unwrap());
        let stats = Arc::new(Stats::new());

        let server = SmtpServer::bind(shared, spool, Arc::clone(&stats), None).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = StopHandle::new();
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || server.run(stop))
        };

        let client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(client.try_clone().unwrap());
        assert!(read_line(&mut reader).starts_with("220 relay.test"));

        (&client).write_all(b"NOOP\r\n").unwrap();
        assert_eq!(read_line(&mut reader), "250 OK\r\n");

        stop.stop();
        handle.join().unwrap().unwrap();
        // Stopping the reactor closes open connections
        assert_eq!(read_line(&mut reader), "");
        assert_eq!(stats.active_connections(), 0);
    }

    #[test]
    fn test_reload_applies_to_new_connections() {
        let dir = TempDir::new().unwrap();
        let shared = SharedConfig::new(test_config(&dir));
        let spool = Arc::new(Spool::open_local(dir.path()).unwrap());
        let stats = Arc::new(Stats::new());

        let server = SmtpServer::bind(shared.clone(), spool, stats, None).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = StopHandle::new();
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || server.run(stop))
        };

        let first = TcpStream::connect(addr).unwrap();
        first.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut first_reader = BufReader::new(first);
        assert!(read_line(&mut first_reader).starts_with("220 relay.test "));

        let mut config = (*shared.current()).clone();
        config.server.hostname = "renamed.test".to_string();
        // Port 0 never passes validation, so bypass the file path
        config.server.port = 2525;
        shared.replace(config).unwrap();

        let second = TcpStream::connect(addr).unwrap();
        second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut second_reader = BufReader::new(second);
        assert!(read_line(&mut second_reader).starts_with("220 renamed.test "));

        stop.stop();
        handle.join().unwrap().unwrap();
    }
}
