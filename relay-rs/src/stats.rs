//! Process-wide counters
//!
//! A single [`Stats`] is created at start-up and shared through `Arc` with
//! the reactor thread and the relay pipeline. Counters are plain atomics;
//! nothing reads them to make decisions except the connection limit.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    connections_active: AtomicU64,
    connections_total: AtomicU64,
    connections_rejected: AtomicU64,

    emails_received: AtomicU64,
    emails_stored: AtomicU64,
    emails_rejected: AtomicU64,

    relay_success: AtomicU64,
    relay_failed: AtomicU64,
    relay_deferred: AtomicU64,
    relay_dead_lettered: AtomicU64,
    relay_queue_depth: AtomicU64,

    tls_handshakes: AtomicU64,
    tls_errors: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub connections_rejected: u64,
    pub emails_received: u64,
    pub emails_stored: u64,
    pub emails_rejected: u64,
    pub relay_success: u64,
    pub relay_failed: u64,
    pub relay_deferred: u64,
    pub relay_dead_lettered: u64,
    pub relay_queue_depth: u64,
    pub tls_handshakes: u64,
    pub tls_errors: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        bump(&self.connections_active);
        bump(&self.connections_total);
    }

    pub fn connection_closed(&self) {
        // Saturate instead of wrapping if a close is ever reported twice
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_rejected(&self) {
        bump(&self.connections_rejected);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn email_received(&self) {
        bump(&self.emails_received);
    }

    pub fn email_stored(&self) {
        bump(&self.emails_stored);
    }

    pub fn email_rejected(&self) {
        bump(&self.emails_rejected);
    }

    pub fn relay_succeeded(&self) {
        bump(&self.relay_success);
    }

    pub fn relay_failed(&self) {
        bump(&self.relay_failed);
    }

    pub fn relay_deferred(&self) {
        bump(&self.relay_deferred);
    }

    pub fn relay_dead_lettered(&self) {
        bump(&self.relay_dead_lettered);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.relay_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn tls_handshake(&self) {
        bump(&self.tls_handshakes);
    }

    pub fn tls_error(&self) {
        bump(&self.tls_errors);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connections_active: get(&self.connections_active),
            connections_total: get(&self.connections_total),
            connections_rejected: get(&self.connections_rejected),
            emails_received: get(&self.emails_received),
            emails_stored: get(&self.emails_stored),
            emails_rejected: get(&self.emails_rejected),
            relay_success: get(&self.relay_success),
            relay_failed: get(&self.relay_failed),
            relay_deferred: get(&self.relay_deferred),
            relay_dead_lettered: get(&self.relay_dead_lettered),
            relay_queue_depth: get(&self.relay_queue_depth),
            tls_handshakes: get(&self.tls_handshakes),
            tls_errors: get(&self.tls_errors),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Zero every counter except the active connection gauge
    pub fn reset(&self) {
        for counter in [
            &self.connections_total,
            &self.connections_rejected,
            &self.emails_received,
            &self.emails_stored,
            &self.emails_rejected,
            &self.relay_success,
            &self.relay_failed,
            &self.relay_deferred,
            &self.relay_dead_lettered,
            &self.relay_queue_depth,
            &self.tls_handshakes,
            &self.tls_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Connections: active={} total={} rejected={}",
            self.connections_active, self.connections_total, self.connections_rejected
        )?;
        writeln!(
            f,
            "Emails:      received={} stored={} rejected={}",
            self.emails_received, self.emails_stored, self.emails_rejected
        )?;
        writeln!(
            f,
            "Relay:       success={} failed={} deferred={} dead_lettered={} queue_depth={}",
            self.relay_success,
            self.relay_failed,
            self.relay_deferred,
            self.relay_dead_lettered,
            self.relay_queue_depth
        )?;
        write!(
            f,
            "TLS:         handshakes={} errors={}",
            self.tls_handshakes, self.tls_errors
        )
    }
}
