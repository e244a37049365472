//! SMTP server and upstream client (RFC 5321)
//!
//! - [`server`]: listener and acceptor on the reactor
//! - [`session`]: per-connection protocol state machine
//! - [`commands`]: command line parsing
//! - [`client`]: blocking client used by relay workers

pub mod client;
pub mod commands;
pub mod server;
pub mod session;

pub use client::SmtpClient;
pub use commands::SmtpCommand;
pub use server::SmtpServer;
pub use session::{SessionIo, SessionSettings, SmtpSession, SmtpState, TlsStatus};
