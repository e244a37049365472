//! Security module
//!
//! - [`tls`]: TLS/STARTTLS configuration

pub mod tls;

pub use tls::TlsConfig;
