//! TLS context for STARTTLS and the implicit-TLS listener
//!
//! # Features
//! - Certificate chain and private key loading (PEM)
//! - TLS 1.2 minimum
//! - Self-signed certificate generation (development)

use crate::error::{RelayError, Result};
use rustls::{ServerConfig, ServerConnection};
use rustls_pemfile::{certs, Item};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Server-side TLS settings shared by every connection
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from certificate and key files
    ///
    /// # Arguments
    /// * `cert_path` - Path to PEM certificate chain
    /// * `key_path` - Path to PEM private key (PKCS#8, RSA or SEC1)
    ///
    /// # Examples
    /// ```no_run
    /// use relay_rs::security::TlsConfig;
    ///
    /// # fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let tls_config = TlsConfig::from_pem_files(
    ///     "/etc/relay/cert.pem",
    ///     "/etc/relay/key.pem"
    /// )?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_pem_files<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Self> {
        info!("Loading TLS certificate from {:?}", cert_path.as_ref());

        let cert_file = File::open(cert_path.as_ref())
            .map_err(|e| RelayError::Tls(format!("Failed to open certificate file: {}", e)))?;
        let mut cert_reader = BufReader::new(cert_file);

        let certs = certs(&mut cert_reader)
            .map_err(|e| RelayError::Tls(format!("Failed to read certificates: {}", e)))?;

        if certs.is_empty() {
            return Err(RelayError::Tls("No certificates found in file".to_string()));
        }

        debug!("Loaded {} certificate(s)", certs.len());

        let private_key = load_private_key(key_path.as_ref())?;

        let config = ServerConfig::builder()
            .with_safe_default_cipher_suites()
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| RelayError::Tls(format!("Unsupported protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(
                certs.into_iter().map(rustls::Certificate).collect(),
                private_key,
            )
            .map_err(|e| RelayError::Tls(format!("Failed to create TLS config: {}", e)))?;

        info!("TLS configuration created successfully");

        Ok(Self {
            server_config: Arc::new(config),
        })
    }

    /// Get the rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Start a server-side TLS session for one connection
    pub fn server_session(&self) -> Result<ServerConnection> {
        Ok(ServerConnection::new(self.server_config())?)
    }
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey> {
    let key_file = File::open(path)
        .map_err(|e| RelayError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut key_reader = BufReader::new(key_file);

    loop {
        let item = rustls_pemfile::read_one(&mut key_reader)
            .map_err(|e| RelayError::Tls(format!("Failed to read private key: {}", e)))?;
        match item {
            Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) | Some(Item::ECKey(key)) => {
                debug!("Loaded private key");
                return Ok(rustls::PrivateKey(key));
            }
            Some(_) => continue,
            None => return Err(RelayError::Tls("No private key found in file".to_string())),
        }
    }
}

/// Generate self-signed certificate for development/testing
///
/// **WARNING**: Only use for development! Not secure for production.
///
/// # Examples
/// ```no_run
/// use relay_rs::security::tls::generate_self_signed_cert;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// generate_self_signed_cert("localhost", "dev-cert.pem", "dev-key.pem")?;
/// # Ok(())
/// # }
/// ```
pub fn generate_self_signed_cert<P: AsRef<Path>>(
    domain: &str,
    cert_output: P,
    key_output: P,
) -> Result<()> {
    use rcgen::{CertificateParams, DistinguishedName};

    info!("Generating self-signed certificate for {}", domain);

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(domain.to_string()),
        rcgen::SanType::DnsName(format!("*.{}", domain)),
    ];

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| RelayError::Tls(format!("Failed to generate certificate: {}", e)))?;

    let cert_pem = cert
        .serialize_pem()
        .map_err(|e| RelayError::Tls(format!("Failed to serialize certificate: {}", e)))?;
    std::fs::write(cert_output.as_ref(), cert_pem)
        .map_err(|e| RelayError::Tls(format!("Failed to write certificate: {}", e)))?;

    std::fs::write(key_output.as_ref(), cert.serialize_private_key_pem())
        .map_err(|e| RelayError::Tls(format!("Failed to write private key: {}", e)))?;

    info!(
        "Self-signed certificate generated: {} and {}",
        cert_output.as_ref().display(),
        key_output.as_ref().display()
    );

    Ok(())
}
