//! SMTP protocol engine
//!
//! A session never touches a socket. It reads complete lines from the
//! connection's inbound ring buffer, answers through [`SessionIo::send`] and
//! streams message data into a spool transaction. The connection calls
//! [`SmtpSession::process`] whenever new bytes have been buffered, and
//! again once the outbound buffer has room: processing stops while fewer
//! than [`MAX_REPLY_LENGTH`] bytes are free.
//!
//! ```text
//! GREETING ─banner─→ HELO ─HELO/EHLO─→ MAIL ─MAIL FROM─→ RCPT ─DATA─→ DATA_HEADERS
//!                      ↑                 ↑                 │RCPT TO      │ empty line
//!                      │                 └──── RSET ───────┘             ↓
//!                      └── STARTTLS          ←─── "." commits ──── DATA_BODY
//! ```

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::policy::Policy;
use crate::relay::envelope::is_envelope_line;
use crate::smtp::SmtpCommand;
use crate::stats::Stats;
use crate::storage::{Spool, SpoolTransaction};
use crate::utils::arena::{Arena, Region, RegionList, DEFAULT_CHUNK_SIZE};
use crate::utils::RingBuffer;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest line accepted, terminator included
pub const MAX_LINE_LENGTH: usize = 1000;

/// Outbound room kept free before another command is handled
pub const MAX_REPLY_LENGTH: usize = 512;

/// Prepended to client headers that collide with the envelope block
const ORIGINAL_PREFIX: &[u8] = b"X-Original-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Greeting,
    Helo,
    Mail,
    Rcpt,
    DataHeaders,
    DataBody,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    Unavailable,
    Available,
    Active,
}

/// What a session may ask of the connection that owns it
pub trait SessionIo {
    fn inbound(&mut self) -> &mut RingBuffer;

    /// Bytes the outbound buffer can still take
    fn outbound_room(&self) -> usize;

    /// Queue bytes for the peer
    ///
    /// # Errors
    /// [`RelayError::BufferFull`] if the outbound buffer cannot take them all.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    fn tls_status(&self) -> TlsStatus;

    /// Switch the transport to TLS once pending output is flushed
    fn start_tls(&mut self) -> Result<()>;

    /// Close after pending output is flushed
    fn close(&mut self);
}

/// Settings shared by every session accepted under one configuration
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
    pub memory_limit: usize,
    pub policy: Arc<dyn Policy>,
    pub spool: Arc<Spool>,
    pub stats: Arc<Stats>,
}

impl SessionSettings {
    pub fn from_config(
        config: &Config,
        policy: Arc<dyn Policy>,
        spool: Arc<Spool>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            hostname: config.server.hostname.clone(),
            max_message_size: config.server.max_message_size,
            max_recipients: config.server.max_recipients,
            memory_limit: config.server.session_memory_limit,
            policy,
            spool,
            stats,
        }
    }
}

/// Envelope fields live in the session arena
#[derive(Debug, Default)]
struct Envelope {
    sender: Option<Region>,
    recipients: RegionList,
}

pub struct SmtpSession {
    settings: Arc<SessionSettings>,
    peer: SocketAddr,
    state: SmtpState,
    transaction: Option<SpoolTransaction>,
    message_size: usize,
    oversized: bool,
    envelope: Envelope,
    arena: Arena,
    scratch: Vec<u8>,
}

impl SmtpSession {
    pub fn new(settings: Arc<SessionSettings>, peer: SocketAddr) -> Self {
        let limit = settings.memory_limit;
        Self {
            settings,
            peer,
            state: SmtpState::Greeting,
            transaction: None,
            message_size: 0,
            oversized: false,
            envelope: Envelope::default(),
            arena: Arena::with_limit(DEFAULT_CHUNK_SIZE.min(limit), limit),
            scratch: vec![0u8; MAX_LINE_LENGTH],
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn sender(&self) -> Option<&str> {
        self.envelope.sender.map(|r| self.arena.str(r))
    }

    pub fn recipients(&self) -> Vec<&str> {
        self.envelope
            .recipients
            .iter(&self.arena)
            .map(|r| self.arena.str(r))
            .collect()
    }

    /// Emit the banner; the client speaks next
    pub fn start(&mut self, io: &mut dyn SessionIo) {
        let banner = format!("220 {} ESMTP relay-rs ready", self.settings.hostname);
        self.reply(io, &banner);
        self.state = SmtpState::Helo;
    }

    /// Handle every complete line buffered in the inbound ring
    pub fn process(&mut self, io: &mut dyn SessionIo) {
        loop {
            if self.state == SmtpState::Quit {
                return;
            }
            // The connection calls back once pending replies have drained
            if io.outbound_room() < MAX_REPLY_LENGTH {
                return;
            }

            let n = io.inbound().peek(&mut self.scratch);
            if n == 0 {
                return;
            }

            let Some(newline) = self.scratch[..n].iter().position(|&b| b == b'\n') else {
                if n == self.scratch.len() {
                    // No terminator within the window: drop what we have
                    io.inbound().consume(n);
                    warn!("Line too long from {}", self.peer);
                    self.reply(io, "500 Line too long");
                    continue;
                }
                return;
            };
            io.inbound().consume(newline + 1);

            let mut end = newline;
            while end > 0 && self.scratch[end - 1] == b'\r' {
                end -= 1;
            }

            let scratch = std::mem::take(&mut self.scratch);
            let line = &scratch[..end];
            match self.state {
                SmtpState::DataHeaders | SmtpState::DataBody => self.handle_data_line(io, line),
                _ => self.handle_command_line(io, line),
            }
            self.scratch = scratch;
        }
    }

    fn handle_command_line(&mut self, io: &mut dyn SessionIo, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        debug!("C: {}", text);

        if text.trim().is_empty() {
            self.reply(io, "500 Syntax error, command unrecognized");
            return;
        }

        let cmd = match SmtpCommand::parse(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                debug!("Rejected command from {}: {}", self.peer, e);
                self.reply(io, "501 Syntax error in parameters or arguments");
                return;
            }
        };

        match cmd {
            SmtpCommand::Helo(domain) => {
                info!("HELO from {} ({})", domain, self.peer);
                self.reset_envelope();
                self.state = SmtpState::Mail;
                let reply = format!("250 {}", self.settings.hostname);
                self.reply(io, &reply);
            }
            SmtpCommand::Ehlo(domain) => {
                info!("EHLO from {} ({})", domain, self.peer);
                self.reset_envelope();
                self.state = SmtpState::Mail;
                let reply = self.ehlo_reply(io.tls_status());
                self.reply(io, &reply);
            }
            SmtpCommand::MailFrom(sender) => self.handle_mail(io, &sender),
            SmtpCommand::RcptTo(recipient) => self.handle_rcpt(io, &recipient),
            SmtpCommand::Data => self.handle_data(io),
            SmtpCommand::Rset => {
                self.reset_envelope();
                if self.state != SmtpState::Helo {
                    self.state = SmtpState::Mail;
                }
                self.reply(io, "250 Reset OK");
            }
            SmtpCommand::Noop => self.reply(io, "250 OK"),
            SmtpCommand::Quit => {
                let reply = format!("221 {} closing connection", self.settings.hostname);
                self.reply(io, &reply);
                self.state = SmtpState::Quit;
                io.close();
            }
            SmtpCommand::StartTls => self.handle_starttls(io),
            SmtpCommand::Unknown(verb) => {
                debug!("Unknown command {} from {}", verb, self.peer);
                self.reply(io, "500 Command unrecognized");
            }
        }
    }

    fn ehlo_reply(&self, tls: TlsStatus) -> String {
        let mut reply = format!(
            "250-{}\r\n250-8BITMIME\r\n250-PIPELINING\r\n250-SIZE {}\r\n",
            self.settings.hostname, self.settings.max_message_size
        );
        if tls == TlsStatus::Available {
            reply.push_str("250-STARTTLS\r\n");
        }
        reply.push_str("250 OK");
        reply
    }

    fn handle_mail(&mut self, io: &mut dyn SessionIo, sender: &str) {
        match self.state {
            SmtpState::Mail => {}
            SmtpState::Helo => return self.reply(io, "503 Send HELO/EHLO first"),
            _ => return self.reply(io, "503 Sender already specified"),
        }

        let Some(region) = self.arena.alloc_str(sender) else {
            return self.reply(io, "452 Insufficient system storage");
        };
        // Recorded even when policy rejects it
        self.envelope.sender = Some(region);

        if !self.settings.policy.allow_sender(sender) {
            warn!("Sender {} rejected by policy ({})", sender, self.peer);
            self.settings.stats.email_rejected();
            return self.reply(io, "550 Sender rejected by policy");
        }

        debug!("MAIL FROM:<{}>", sender);
        self.state = SmtpState::Rcpt;
        self.reply(io, "250 OK");
    }

    fn handle_rcpt(&mut self, io: &mut dyn SessionIo, recipient: &str) {
        if self.state != SmtpState::Rcpt {
            return self.reply(io, "503 Need MAIL command");
        }
        if self.envelope.recipients.len() >= self.settings.max_recipients {
            return self.reply(io, "452 Too many recipients");
        }
        if !self.settings.policy.allow_recipient(recipient) {
            warn!("Recipient {} rejected by policy ({})", recipient, self.peer);
            return self.reply(io, "550 Recipient rejected by policy");
        }

        let Some(region) = self.arena.alloc_str(recipient) else {
            return self.reply(io, "452 Insufficient system storage");
        };
        if self
            .envelope
            .recipients
            .push(&mut self.arena, region)
            .is_err()
        {
            return self.reply(io, "452 Too many recipients");
        }

        debug!("RCPT TO:<{}>", recipient);
        self.reply(io, "250 OK");
    }

    fn handle_data(&mut self, io: &mut dyn SessionIo) {
        if self.envelope.recipients.is_empty() {
            return self.reply(io, "503 Need RCPT first");
        }
        if self.state != SmtpState::Rcpt {
            return self.reply(io, "503 Bad sequence of commands");
        }

        let mut tx = match self.settings.spool.open(None) {
            Ok(tx) => tx,
            Err(e) => {
                error!("Cannot open spool transaction: {}", e);
                self.reset_envelope();
                self.state = SmtpState::Mail;
                return self.reply(io, "451 Local error in processing");
            }
        };

        let sender = match self.sender() {
            Some("") | None => "<>",
            Some(sender) => sender,
        };
        tx.write(format!("X-Envelope-From: {}\r\n", sender).as_bytes());
        for recipient in self.recipients() {
            tx.write(format!("X-Envelope-To: {}\r\n", recipient).as_bytes());
        }

        debug!("Receiving message {} from {}", tx.id(), self.peer);
        self.transaction = Some(tx);
        self.message_size = 0;
        self.oversized = false;
        self.state = SmtpState::DataHeaders;
        self.settings.stats.email_received();
        self.reply(io, "354 Start mail input; end with <CRLF>.<CRLF>");
    }

    fn handle_data_line(&mut self, io: &mut dyn SessionIo, line: &[u8]) {
        if line == b"." {
            return self.finish_message(io);
        }

        // Transparency: a leading ".." stands for "."
        let line = if line.starts_with(b"..") { &line[1..] } else { line };

        self.message_size += line.len() + 2;
        if self.message_size > self.settings.max_message_size {
            self.oversized = true;
        } else if let Some(tx) = self.transaction.as_mut() {
            // Client headers must not read back as envelope lines
            if self.state == SmtpState::DataHeaders && is_envelope_line(line) {
                tx.write(ORIGINAL_PREFIX);
            }
            tx.write(line);
            tx.write(b"\r\n");
        }

        if self.state == SmtpState::DataHeaders && line.is_empty() {
            self.state = SmtpState::DataBody;
        }
    }

    fn finish_message(&mut self, io: &mut dyn SessionIo) {
        let tx = self.transaction.take();
        let oversized = self.oversized;
        self.reset_envelope();
        self.state = SmtpState::Mail;

        let Some(tx) = tx else {
            return self.reply(io, "451 Local error in processing");
        };

        if oversized {
            warn!(
                "Message {} from {} exceeds {} bytes",
                tx.id(),
                self.peer,
                self.settings.max_message_size
            );
            tx.abort();
            self.settings.stats.email_rejected();
            return self.reply(io, "552 Message size exceeds fixed maximum message size");
        }

        match tx.commit() {
            Ok(path) => {
                info!("Message from {} spooled as {}", self.peer, path.display());
                self.settings.stats.email_stored();
                self.reply(io, "250 OK Message accepted");
            }
            Err(e) => {
                error!("Spool commit failed: {}", e);
                self.reply(io, "451 Failed to commit message");
            }
        }
    }

    fn handle_starttls(&mut self, io: &mut dyn SessionIo) {
        match io.tls_status() {
            TlsStatus::Unavailable => {
                self.reply(io, "454 TLS not available due to temporary reason")
            }
            TlsStatus::Active => self.reply(io, "454 TLS already active"),
            TlsStatus::Available => {
                self.reply(io, "220 Ready to start TLS");
                match io.start_tls() {
                    Ok(()) => {
                        info!("STARTTLS with {}", self.peer);
                        // Nothing learned before the upgrade carries over
                        self.reset_envelope();
                        self.state = SmtpState::Helo;
                    }
                    Err(e) => {
                        error!("STARTTLS with {} failed: {}", self.peer, e);
                        self.settings.stats.tls_error();
                        self.state = SmtpState::Quit;
                        io.close();
                    }
                }
            }
        }
    }

    fn reset_envelope(&mut self) {
        if let Some(tx) = self.transaction.take() {
            tx.abort();
        }
        self.envelope = Envelope::default();
        self.arena.reset();
        self.message_size = 0;
        self.oversized = false;
    }

    fn reply(&mut self, io: &mut dyn SessionIo, text: &str) {
        debug!("S: {}", text);
        let mut line = String::with_capacity(text.len() + 2);
        line.push_str(text);
        line.push_str("\r\n");
        if let Err(RelayError::BufferFull) = io.send(line.as_bytes()) {
            warn!("Outbound buffer full for {}", self.peer);
        }
    }
}
