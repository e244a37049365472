//! Acceptance policy
//!
//! The SMTP layer consults a [`Policy`] at three points: when a client
//! connects, on `MAIL FROM` and on every `RCPT TO`. [`StaticPolicy`] is the
//! implementation driven by the `[policy]` section of the configuration.

use crate::config::PolicyConfig;
use std::collections::HashSet;
use std::net::IpAddr;

pub trait Policy: Send + Sync {
    fn allow_connection(&self, peer: IpAddr) -> bool;
    fn allow_sender(&self, sender: &str) -> bool;
    fn allow_recipient(&self, recipient: &str) -> bool;
}

/// Accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Policy for AllowAll {
    fn allow_connection(&self, _peer: IpAddr) -> bool {
        true
    }

    fn allow_sender(&self, _sender: &str) -> bool {
        true
    }

    fn allow_recipient(&self, _recipient: &str) -> bool {
        true
    }
}

/// Block lists and a recipient domain allow-list
#[derive(Debug, Default, Clone)]
pub struct StaticPolicy {
    blocked_clients: HashSet<IpAddr>,
    blocked_senders: HashSet<String>,
    allowed_recipient_domains: HashSet<String>,
}

impl StaticPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            blocked_clients: config.blocked_clients.iter().copied().collect(),
            blocked_senders: config
                .blocked_senders
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
            allowed_recipient_domains: config
                .allowed_recipient_domains
                .iter()
                .map(|d| d.trim_start_matches('@').to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Policy for StaticPolicy {
    fn allow_connection(&self, peer: IpAddr) -> bool {
        !self.blocked_clients.contains(&peer)
    }

    fn allow_sender(&self, sender: &str) -> bool {
        !self.blocked_senders.contains(&sender.to_ascii_lowercase())
    }

    fn allow_recipient(&self, recipient: &str) -> bool {
        if self.allowed_recipient_domains.is_empty() {
            return true;
        }
        match recipient.rsplit_once('@') {
            Some((_, domain)) => self
                .allowed_recipient_domains
                .contains(&domain.to_ascii_lowercase()),
            None => false,
        }
    }
}
