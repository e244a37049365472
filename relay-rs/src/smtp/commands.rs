use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    /// Reverse path without angle brackets; empty for the null sender
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    StartTls,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RelayError::SmtpProtocol("Empty command".to_string()));
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };
        let command = verb.to_ascii_uppercase();

        match command.as_str() {
            "HELO" => {
                if args.is_empty() {
                    return Err(RelayError::SmtpProtocol("HELO requires domain".to_string()));
                }
                Ok(SmtpCommand::Helo(args.to_string()))
            }
            "EHLO" => {
                if args.is_empty() {
                    return Err(RelayError::SmtpProtocol("EHLO requires domain".to_string()));
                }
                Ok(SmtpCommand::Ehlo(args.to_string()))
            }
            "MAIL" => {
                let from = Self::parse_path(args, "FROM:")?;
                Ok(SmtpCommand::MailFrom(from))
            }
            "RCPT" => {
                let to = Self::parse_path(args, "TO:")?;
                if to.is_empty() {
                    return Err(RelayError::SmtpProtocol("Empty recipient".to_string()));
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            "STARTTLS" => Ok(SmtpCommand::StartTls),
            _ => Ok(SmtpCommand::Unknown(command)),
        }
    }

    /// Parse `FROM:<path> [params]` or `TO:<path> [params]`
    fn parse_path(args: &str, keyword: &str) -> Result<String> {
        let prefix = args.get(..keyword.len()).unwrap_or("");
        if !prefix.eq_ignore_ascii_case(keyword) {
            return Err(RelayError::SmtpProtocol(format!(
                "Expected {} in {:?}",
                keyword, args
            )));
        }

        let path = args[keyword.len()..].trim();
        let address = match path.strip_prefix('<') {
            Some(rest) => {
                let end = rest.find('>').ok_or_else(|| {
                    RelayError::SmtpProtocol(format!("Unterminated path: {:?}", path))
                })?;
                &rest[..end]
            }
            // Bare address; anything after whitespace is an ESMTP parameter
            None => path.split_whitespace().next().unwrap_or(""),
        };

        Ok(address.trim().to_string())
    }
}
