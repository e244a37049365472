mod common;

use common::{test_config, wait_for, Client, TestServer, HOSTNAME};
use relay_rs::security::tls::generate_self_signed_cert;
use relay_rs::security::TlsConfig;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, ServerName, StreamOwned};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Accepts the self-signed test certificate
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

type TlsStream = BufReader<StreamOwned<ClientConnection, TcpStream>>;

fn tls_config(dir: &TempDir) -> TlsConfig {
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    generate_self_signed_cert(HOSTNAME, &cert, &key).unwrap();
    TlsConfig::from_pem_files(&cert, &key).unwrap()
}

fn wrap(stream: TcpStream) -> TlsStream {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    let name = ServerName::try_from(HOSTNAME).unwrap();
    let conn = ClientConnection::new(Arc::new(config), name).unwrap();
    BufReader::new(StreamOwned::new(conn, stream))
}

fn connect_implicit(addr: SocketAddr) -> TlsStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    wrap(stream)
}

fn reply(stream: &mut TlsStream) -> String {
    let mut full = String::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).unwrap() == 0 {
            return full;
        }
        full.push_str(&line);
        if line.as_bytes().get(3) != Some(&b'-') {
            return full;
        }
    }
}

fn command(stream: &mut TlsStream, line: &str) -> String {
    let inner = stream.get_mut();
    inner.write_all(line.as_bytes()).unwrap();
    inner.write_all(b"\r\n").unwrap();
    inner.flush().unwrap();
    reply(stream)
}

#[test]
fn test_starttls_upgrade_and_transaction() {
    let dir = TempDir::new().unwrap();
    let tls = tls_config(&dir);
    let server = TestServer::start(test_config(&dir), Some(tls));

    let mut client = Client::connect(server.addr);
    client.reply();
    assert!(client.command("EHLO client.test").contains("250-STARTTLS\r\n"));
    // A transaction opened before the upgrade is discarded
    assert_eq!(client.command("MAIL FROM:<early@a.test>"), "250 OK\r\n");
    assert_eq!(client.command("STARTTLS"), "220 Ready to start TLS\r\n");

    let mut tls = wrap(client.into_stream());
    let ehlo = command(&mut tls, "EHLO client.test");
    assert!(ehlo.starts_with(&format!("250-{}", HOSTNAME)));
    assert!(!ehlo.contains("STARTTLS"));
    assert!(command(&mut tls, "STARTTLS").starts_with("454 "));

    assert_eq!(command(&mut tls, "MAIL FROM:<alice@a.test>"), "250 OK\r\n");
    assert_eq!(command(&mut tls, "RCPT TO:<bob@b.test>"), "250 OK\r\n");
    assert!(command(&mut tls, "DATA").starts_with("354 "));
    assert_eq!(
        command(&mut tls, "Subject: secure\r\n\r\nover tls\r\n."),
        "250 OK Message accepted\r\n"
    );
    assert!(command(&mut tls, "QUIT").starts_with("221 "));

    let files = server.spool.pickup_files().unwrap();
    assert_eq!(files.len(), 1);
    let content = std::fs::read_to_string(&files[0]).unwrap();
    assert!(content.starts_with("X-Envelope-From: alice@a.test\r\n"));
    assert!(content.ends_with("over tls\r\n"));
    assert_eq!(server.stats.snapshot().tls_handshakes, 1);
}

#[test]
fn test_implicit_tls_listener() {
    let dir = TempDir::new().unwrap();
    let tls = tls_config(&dir);
    let mut config = test_config(&dir);
    config.server.tls_port = Some(0);
    let server = TestServer::start(config, Some(tls));
    let tls_addr = server.tls_addr.unwrap();

    let mut tls = connect_implicit(tls_addr);
    assert!(reply(&mut tls).starts_with(&format!("220 {} ", HOSTNAME)));
    let ehlo = command(&mut tls, "EHLO client.test");
    assert!(!ehlo.contains("STARTTLS"));
    assert_eq!(command(&mut tls, "NOOP"), "250 OK\r\n");
    assert!(command(&mut tls, "QUIT").starts_with("221 "));
    assert!(wait_for(|| server.stats.snapshot().tls_handshakes == 1));
}

#[test]
fn test_failed_handshake_is_counted() {
    let dir = TempDir::new().unwrap();
    let tls = tls_config(&dir);
    let server = TestServer::start(test_config(&dir), Some(tls));

    let mut client = Client::connect(server.addr);
    client.reply();
    client.command("EHLO client.test");
    assert_eq!(client.command("STARTTLS"), "220 Ready to start TLS\r\n");

    // Not a TLS record
    client.send("EHLO still-plaintext\r\n");
    assert!(wait_for(|| server.stats.snapshot().tls_errors == 1));
    assert!(wait_for(|| server.stats.active_connections() == 0));
}
