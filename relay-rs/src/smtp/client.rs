//! SMTP client for relaying spooled mail upstream
//!
//! Relay workers are plain threads, so the client is blocking and speaks
//! over `std::net::TcpStream` with read and write timeouts.
//!
//! # Features
//! - Multi-line reply parsing
//! - Several recipients per transaction
//! - Dot-stuffing of the streamed body

use crate::error::{RelayError, Result};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error, info};

/// SMTP client for one upstream server
///
/// # Examples
/// ```no_run
/// use relay_rs::smtp::SmtpClient;
/// use std::io::Cursor;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SmtpClient::new("mail.example.com:25", "relay.example.com");
/// client.send_mail(
///     "sender@example.com",
///     &["recipient@other.com".to_string()],
///     Cursor::new(&b"Subject: Test\r\n\r\nHello!\r\n"[..]),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SmtpClient {
    server_addr: String,
    hostname: String,
    timeout: Option<Duration>,
}

impl SmtpClient {
    pub fn new(server_addr: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            hostname: hostname.into(),
            timeout: None,
        }
    }

    /// Bound connect, read and write; `None` blocks indefinitely
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Deliver one message
    ///
    /// # Arguments
    /// * `from` - Reverse path; empty for the null sender
    /// * `recipients` - Forward paths, at least one
    /// * `body` - Message lines, any line ending; re-terminated with CRLF
    ///
    /// # Errors
    /// Returns error if:
    /// - Cannot connect to server
    /// - A reply code is not the one expected at that step
    /// - Timeout occurs
    pub fn send_mail<B: BufRead>(&self, from: &str, recipients: &[String], mut body: B) -> Result<()> {
        info!(
            "Relaying mail from <{}> to {} recipient(s) via {}",
            from,
            recipients.len(),
            self.server_addr
        );

        let stream = self.connect()?;
        let mut dialogue = Dialogue {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        };

        dialogue.expect("greeting", &["220"], "220")?;

        dialogue.command(&format!("EHLO {}", self.hostname))?;
        dialogue.expect("EHLO", &["250"], "250")?;

        dialogue.command(&format!("MAIL FROM:<{}>", from))?;
        dialogue.expect("MAIL FROM", &["250"], "250")?;

        for recipient in recipients {
            dialogue.command(&format!("RCPT TO:<{}>", recipient))?;
            dialogue.expect("RCPT TO", &["250", "251"], "250 or 251")?;
        }

        dialogue.command("DATA")?;
        dialogue.expect("DATA", &["354"], "354")?;

        let lines = dialogue.stream_body(&mut body)?;
        debug!("Sent {} body line(s)", lines);
        dialogue.expect("end of data", &["250"], "250")?;

        // The message is accepted at this point; QUIT is a courtesy
        if let Err(e) = dialogue.command("QUIT").and_then(|_| dialogue.read_reply()) {
            debug!("QUIT not acknowledged: {}", e);
        }

        info!("Mail relayed via {}", self.server_addr);
        Ok(())
    }

    fn connect(&self) -> Result<TcpStream> {
        let mut last_error = None;
        for addr in self.server_addr.to_socket_addrs()? {
            let attempt = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_read_timeout(self.timeout)?;
                    stream.set_write_timeout(self.timeout)?;
                    debug!("Connected to {}", addr);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => RelayError::Io(e),
            None => RelayError::SmtpProtocol(format!(
                "No address found for {}",
                self.server_addr
            )),
        })
    }
}

struct Dialogue {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Dialogue {
    fn command(&mut self, line: &str) -> Result<()> {
        debug!("> {}", line);
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Read one complete, possibly multi-line, reply
    fn read_reply(&mut self) -> Result<String> {
        let mut full_response = String::new();

        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(RelayError::SmtpProtocol(
                    "Connection closed by upstream".to_string(),
                ));
            }
            debug!("< {}", line.trim_end());
            full_response.push_str(&line);

            // "250-" continues, anything else ends the reply
            if line.as_bytes().get(3) != Some(&b'-') {
                break;
            }
        }

        Ok(full_response)
    }

    fn expect(
        &mut self,
        stage: &'static str,
        codes: &[&str],
        expected: &'static str,
    ) -> Result<String> {
        let reply = self.read_reply()?;
        if codes.iter().any(|code| reply.starts_with(code)) {
            return Ok(reply);
        }

        error!("Unexpected reply to {}: {}", stage, reply.trim_end());
        Err(RelayError::UnexpectedReply {
            stage,
            expected,
            reply: reply.trim_end().to_string(),
        })
    }

    fn stream_body<B: BufRead>(&mut self, body: &mut B) -> Result<usize> {
        let mut line = Vec::new();
        let mut count = 0;
        loop {
            line.clear();
            if body.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let mut end = line.len();
            while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
                end -= 1;
            }

            if line.first() == Some(&b'.') {
                self.writer.write_all(b".")?;
            }
            self.writer.write_all(&line[..end])?;
            self.writer.write_all(b"\r\n")?;
            count += 1;
        }

        self.writer.write_all(b".\r\n")?;
        self.writer.flush()?;
        Ok(count)
    }
}
