//! One accepted client socket
//!
//! A [`Connection`] owns its socket, an inbound and an outbound
//! [`RingBuffer`], the optional TLS session and the protocol context. It is
//! registered in the [`Reactor`] as the handler for its own descriptor and
//! never touched by another thread.
//!
//! The protocol layer only ever appends to the outbound buffer. Bytes reach
//! the socket from `on_writable`, and WRITABLE interest is enabled only
//! while something is pending, so an idle connection does not spin. When a
//! pipelining client fills the outbound buffer, reading flushes inline and
//! then pauses until `on_writable` has drained the backlog.
//!
//! Close order: deregister, then drop the socket, buffers, TLS session and
//! protocol context in that order (field declaration order).

use crate::error::{RelayError, Result};
use crate::net::reactor::{EventHandler, Interest, Reactor, Readiness};
use crate::security::TlsConfig;
use crate::smtp::session::{
    SessionIo, SessionSettings, SmtpSession, TlsStatus, MAX_REPLY_LENGTH,
};
use crate::stats::Stats;
use crate::utils::RingBuffer;
use mio::net::{TcpListener, TcpStream};
use rustls::ServerConnection;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Capacity of each ring buffer
pub const BUFFER_SIZE: usize = 16 * 1024;

const READ_CHUNK: usize = 4096;

/// Everything a listener needs to turn a socket into a live connection
#[derive(Clone)]
pub struct ConnectionContext {
    pub session: Arc<SessionSettings>,
    /// Offered through STARTTLS, and used directly on implicit-TLS listeners
    pub tls: Option<TlsConfig>,
    pub max_connections: u64,
}

/// Outcome of one accept attempt
#[derive(Debug, PartialEq, Eq)]
pub enum Accepted {
    Live(RawFd),
    Rejected(SocketAddr),
    /// The client went away or its socket could not be set up
    Skipped,
    /// The listener has no pending connection
    Drained,
}

enum Protocol {
    Smtp(SmtpSession),
}

pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    io: ConnectionIo,
    protocol: Protocol,
    stats: Arc<Stats>,
    /// Reading stopped until pending replies drain
    paused: bool,
    closed: bool,
}

impl Connection {
    /// Accept one pending client from `listener` and register it
    ///
    /// Connection-limit and policy checks run before any protocol state is
    /// created; a rejected socket is closed straight away. With
    /// `implicit_tls` the banner is held back until the handshake completes.
    ///
    /// # Errors
    /// Only failures of the listener itself; a client that cannot be set up
    /// is logged and reported as [`Accepted::Skipped`].
    pub fn accept(
        reactor: &mut Reactor,
        listener: &TcpListener,
        ctx: &ConnectionContext,
        implicit_tls: bool,
    ) -> Result<Accepted> {
        let (stream, peer) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Accepted::Drained),
            Err(e) if is_client_error(&e) => {
                debug!("Pending connection dropped before accept: {}", e);
                return Ok(Accepted::Skipped);
            }
            Err(e) => return Err(e.into()),
        };

        match Self::setup(reactor, stream, peer, ctx, implicit_tls) {
            Ok(accepted) => Ok(accepted),
            Err(e) => {
                warn!("Cannot set up connection from {}: {}", peer, e);
                Ok(Accepted::Skipped)
            }
        }
    }

    fn setup(
        reactor: &mut Reactor,
        mut stream: TcpStream,
        peer: SocketAddr,
        ctx: &ConnectionContext,
        implicit_tls: bool,
    ) -> Result<Accepted> {
        let settings = &ctx.session;
        let stats = &settings.stats;

        if stats.active_connections() >= ctx.max_connections {
            warn!("Too many connections, rejecting {}", peer);
            let reply = format!("421 {} Too many connections\r\n", settings.hostname);
            // Best effort; the socket is closed either way
            let _ = stream.write(reply.as_bytes());
            stats.connection_rejected();
            return Ok(Accepted::Rejected(peer));
        }

        if !settings.policy.allow_connection(peer.ip()) {
            warn!("Connection from {} rejected by policy", peer);
            stats.connection_rejected();
            return Ok(Accepted::Rejected(peer));
        }

        stream.set_nodelay(true)?;

        let tls = if implicit_tls {
            let config = ctx.tls.as_ref().ok_or_else(|| {
                RelayError::Tls("Implicit TLS listener without certificate".to_string())
            })?;
            Some(TlsLayer::new(config.server_session()?))
        } else {
            None
        };

        let fd = stream.as_raw_fd();
        stats.connection_opened();
        let mut connection = Connection {
            fd,
            peer,
            io: ConnectionIo {
                stream,
                inbound: RingBuffer::new(BUFFER_SIZE),
                outbound: RingBuffer::new(BUFFER_SIZE),
                cleartext: Vec::new(),
                tls,
                tls_config: ctx.tls.clone(),
                stats: Arc::clone(stats),
                close_requested: false,
                overflowed: false,
            },
            protocol: Protocol::Smtp(SmtpSession::new(Arc::clone(settings), peer)),
            stats: Arc::clone(stats),
            paused: false,
            closed: false,
        };

        match &mut connection.protocol {
            Protocol::Smtp(session) => session.start(&mut connection.io),
        }

        let interest = connection.desired_interest();
        reactor.register(fd, interest, Box::new(connection))?;
        info!("Accepted connection from {} (fd {})", peer, fd);
        Ok(Accepted::Live(fd))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn process(&mut self) {
        match &mut self.protocol {
            Protocol::Smtp(session) => session.process(&mut self.io),
        }
    }

    fn on_readable(&mut self, reactor: &mut Reactor) {
        let mut chunk = [0u8; READ_CHUNK];
        // Edge-triggered: keep reading until the socket would block
        loop {
            if self.io.close_requested {
                return;
            }
            // Buffered lines first; the session stops short of a full outbound buffer
            self.process();
            if self.io.outbound.available() < MAX_REPLY_LENGTH {
                if let Err(e) = self.io.flush() {
                    warn!("Write to {} failed: {}", self.peer, e);
                    return self.close(reactor);
                }
                if self.io.outbound.available() < MAX_REPLY_LENGTH {
                    trace!("Pausing reads from {} until replies drain", self.peer);
                    self.paused = true;
                    return;
                }
                continue;
            }
            match self.io.fill_inbound(&mut chunk) {
                Ok(Fill::Data) => {}
                Ok(Fill::WouldBlock) | Ok(Fill::Full) => return,
                Ok(Fill::Eof) => {
                    debug!("Peer {} closed the connection", self.peer);
                    return self.close(reactor);
                }
                Err(e) => {
                    if matches!(e, RelayError::Tls(_)) {
                        self.stats.tls_error();
                    }
                    warn!("Read from {} failed: {}", self.peer, e);
                    return self.close(reactor);
                }
            }
        }
    }

    fn on_writable(&mut self, reactor: &mut Reactor) {
        if let Err(e) = self.io.flush() {
            warn!("Write to {} failed: {}", self.peer, e);
            return self.close(reactor);
        }
        // Unread input gets no fresh READABLE edge, so resume here
        if self.paused && self.io.outbound.available() >= MAX_REPLY_LENGTH {
            self.paused = false;
            self.on_readable(reactor);
        }
    }

    fn desired_interest(&self) -> Interest {
        if self.io.has_pending_output() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Bring the registration in line with the buffers, or finish closing
    fn sync_interest(&mut self, reactor: &mut Reactor) {
        if self.io.overflowed {
            warn!("Outbound buffer overflow for {}, closing", self.peer);
            return self.close(reactor);
        }
        if self.io.close_requested && !self.io.has_pending_output() {
            return self.close(reactor);
        }
        let interest = self.desired_interest();
        if let Err(e) = reactor.modify(self.fd, interest) {
            warn!("Cannot update interest for {}: {}", self.peer, e);
            self.close(reactor);
        }
    }

    /// Idempotent; the reactor drops the connection once the callback returns
    fn close(&mut self, reactor: &mut Reactor) {
        if self.closed {
            return;
        }
        self.closed = true;
        drop(reactor.deregister(self.fd));
        debug!("Closed connection from {} (fd {})", self.peer, self.fd);
    }
}

impl EventHandler for Connection {
    fn on_ready(&mut self, reactor: &mut Reactor, fd: RawFd, readiness: Readiness) {
        trace!("fd {} ready: {:?}", fd, readiness);

        if readiness.is_readable() {
            self.on_readable(reactor);
        }
        if !self.closed && readiness.is_writable() {
            self.on_writable(reactor);
        }
        if !self.closed && readiness.is_error() {
            debug!("Error condition on fd {}", fd);
            self.close(reactor);
        }
        if !self.closed {
            self.sync_interest(reactor);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

/// Accept failures that concern one pending client, not the listener
fn is_client_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

enum Fill {
    Data,
    WouldBlock,
    /// Inbound buffer has no room left
    Full,
    Eof,
}

struct TlsLayer {
    conn: ServerConnection,
    handshake_done: bool,
}

impl TlsLayer {
    fn new(conn: ServerConnection) -> Self {
        Self {
            conn,
            handshake_done: false,
        }
    }
}

/// Socket side of a connection, as seen by the protocol layer
struct ConnectionIo {
    stream: TcpStream,
    inbound: RingBuffer,
    outbound: RingBuffer,
    /// Plain bytes that must leave before the TLS handshake
    cleartext: Vec<u8>,
    tls: Option<TlsLayer>,
    tls_config: Option<TlsConfig>,
    stats: Arc<Stats>,
    close_requested: bool,
    overflowed: bool,
}

impl ConnectionIo {
    fn has_pending_output(&self) -> bool {
        !self.cleartext.is_empty()
            || !self.outbound.is_empty()
            || self.tls.as_ref().map_or(false, |tls| tls.conn.wants_write())
    }

    /// Move at most one chunk of plaintext into the inbound buffer
    fn fill_inbound(&mut self, chunk: &mut [u8]) -> Result<Fill> {
        let want = chunk.len().min(self.inbound.available());
        if want == 0 {
            return Ok(Fill::Full);
        }
        let chunk = &mut chunk[..want];

        if self.tls.is_some() {
            return self.fill_from_tls(chunk);
        }

        loop {
            match self.stream.read(chunk) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    self.inbound.write(&chunk[..n]);
                    return Ok(Fill::Data);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn fill_from_tls(&mut self, chunk: &mut [u8]) -> Result<Fill> {
        let Self {
            stream,
            inbound,
            tls,
            stats,
            ..
        } = self;
        let Some(tls) = tls.as_mut() else {
            return Ok(Fill::WouldBlock);
        };

        loop {
            // Already decrypted plaintext first
            match tls.conn.reader().read(chunk) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => {
                    inbound.write(&chunk[..n]);
                    return Ok(Fill::Data);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }

            match tls.conn.read_tls(stream) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            if let Err(e) = tls.conn.process_new_packets() {
                // Let the alert out before the socket goes away
                let _ = tls.conn.write_tls(stream);
                return Err(e.into());
            }

            if !tls.handshake_done && !tls.conn.is_handshaking() {
                tls.handshake_done = true;
                stats.tls_handshake();
                debug!("TLS handshake complete");
            }
        }
    }

    /// Drain pending output until the socket would block
    fn flush(&mut self) -> io::Result<()> {
        while !self.cleartext.is_empty() {
            match self.stream.write(&self.cleartext) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.cleartext.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let Self {
            stream,
            outbound,
            tls,
            ..
        } = self;

        match tls.as_mut() {
            None => loop {
                let (head, _) = outbound.as_slices();
                if head.is_empty() {
                    return Ok(());
                }
                match stream.write(head) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        outbound.consume(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            },
            Some(tls) => {
                // rustls holds plaintext back until the handshake is done
                loop {
                    let (head, _) = outbound.as_slices();
                    if head.is_empty() {
                        break;
                    }
                    let n = tls.conn.writer().write(head)?;
                    if n == 0 {
                        break;
                    }
                    outbound.consume(n);
                }

                while tls.conn.wants_write() {
                    match tls.conn.write_tls(stream) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }
}

impl SessionIo for ConnectionIo {
    fn inbound(&mut self) -> &mut RingBuffer {
        &mut self.inbound
    }

    fn outbound_room(&self) -> usize {
        self.outbound.available()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        let written = self.outbound.write(data);
        if written < data.len() {
            self.overflowed = true;
            return Err(RelayError::BufferFull);
        }
        Ok(())
    }

    fn tls_status(&self) -> TlsStatus {
        match (&self.tls, &self.tls_config) {
            (Some(_), _) => TlsStatus::Active,
            (None, Some(_)) => TlsStatus::Available,
            (None, None) => TlsStatus::Unavailable,
        }
    }

    fn start_tls(&mut self) -> Result<()> {
        if self.tls.is_some() {
            return Err(RelayError::Tls("TLS already active".to_string()));
        }
        let config = self
            .tls_config
            .as_ref()
            .ok_or_else(|| RelayError::Tls("TLS not configured".to_string()))?;
        let conn = config.server_session()?;

        // The go-ahead reply is the last thing sent in the clear
        let (head, tail) = self.outbound.as_slices();
        self.cleartext.extend_from_slice(head);
        self.cleartext.extend_from_slice(tail);
        self.outbound.reset();

        // Anything pipelined behind STARTTLS was sent in the clear
        self.inbound.reset();

        self.tls = Some(TlsLayer::new(conn));
        Ok(())
    }

    fn close(&mut self) {
        self.close_requested = true;
    }
}
