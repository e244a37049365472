//! Envelope recovery from spool files
//!
//! The SMTP session writes `X-Envelope-From` and `X-Envelope-To` lines ahead
//! of the message. The relay reads them back from the file itself so a retry
//! never depends on state that died with the session.

use crate::error::{RelayError, Result};
use std::io::BufRead;

const FROM_HEADER: &str = "X-Envelope-From:";
const TO_HEADER: &str = "X-Envelope-To:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEnvelope {
    /// Empty for the null sender
    pub sender: String,
    pub recipients: Vec<String>,
}

impl RelayEnvelope {
    /// Consume the envelope lines at the head of `reader`
    ///
    /// Returns the envelope and the first message line (terminator included),
    /// which had to be read to find the end of the envelope block.
    ///
    /// # Errors
    /// [`RelayError::Envelope`] when the sender or every recipient is missing.
    pub fn parse<R: BufRead + ?Sized>(reader: &mut R) -> Result<(Self, Option<Vec<u8>>)> {
        let mut sender = None;
        let mut recipients = Vec::new();
        let mut first_line = None;

        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }

            match classify(&line) {
                EnvelopeLine::From(value) => sender = Some(value),
                EnvelopeLine::To(value) => {
                    if !value.is_empty() {
                        recipients.push(value);
                    }
                }
                EnvelopeLine::Message => {
                    first_line = Some(std::mem::take(&mut line));
                    break;
                }
            }
        }

        let sender = sender
            .ok_or_else(|| RelayError::Envelope(format!("Missing {} line", FROM_HEADER)))?;
        if recipients.is_empty() {
            return Err(RelayError::Envelope(format!("Missing {} line", TO_HEADER)));
        }

        Ok((Self { sender, recipients }, first_line))
    }
}

/// True when `line` would be read back as an envelope line
pub fn is_envelope_line(line: &[u8]) -> bool {
    !matches!(classify(line), EnvelopeLine::Message)
}

enum EnvelopeLine {
    From(String),
    To(String),
    Message,
}

fn classify(line: &[u8]) -> EnvelopeLine {
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end_matches(&['\r', '\n'][..]);
    if let Some(value) = strip_header(text, FROM_HEADER) {
        EnvelopeLine::From(normalize(value))
    } else if let Some(value) = strip_header(text, TO_HEADER) {
        EnvelopeLine::To(normalize(value))
    } else {
        EnvelopeLine::Message
    }
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let prefix = line.get(..name.len())?;
    if prefix.eq_ignore_ascii_case(name) {
        Some(&line[name.len()..])
    } else {
        None
    }
}

fn normalize(value: &str) -> String {
    let value = value.trim();
    let value = value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value);
    value.trim().to_string()
}
