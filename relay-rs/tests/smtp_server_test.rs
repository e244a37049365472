mod common;

use common::{test_config, wait_for, Client, TestServer, HOSTNAME};
use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};
use std::io::Write;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_full_transaction_over_tcp() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir), None);

    let mut client = Client::connect(server.addr);
    assert!(client.reply().starts_with(&format!("220 {} ", HOSTNAME)));

    let ehlo = client.command("EHLO client.test");
    assert!(ehlo.starts_with(&format!("250-{}", HOSTNAME)));
    assert!(ehlo.contains("250-PIPELINING"));
    assert!(!ehlo.contains("STARTTLS"));

    assert_eq!(client.command("MAIL FROM:<alice@example.com>"), "250 OK\r\n");
    assert_eq!(client.command("RCPT TO:<bob@example.org>"), "250 OK\r\n");
    assert!(client.command("DATA").starts_with("354 "));
    client.send("Subject: hello\r\n\r\n..leading dot\r\nbody\r\n.\r\n");
    assert_eq!(client.reply(), "250 OK Message accepted\r\n");
    assert!(client
        .command("QUIT")
        .starts_with(&format!("221 {} ", HOSTNAME)));
    assert_eq!(client.reply(), "");

    let files = server.spool.pickup_files().unwrap();
    assert_eq!(files.len(), 1);
    let content = std::fs::read_to_string(&files[0]).unwrap();
    assert_eq!(
        content,
        "X-Envelope-From: alice@example.com\r\n\
         X-Envelope-To: bob@example.org\r\n\
         Subject: hello\r\n\r\n.leading dot\r\nbody\r\n"
    );

    let stats = server.stats.snapshot();
    assert_eq!(stats.emails_received, 1);
    assert_eq!(stats.emails_stored, 1);
    assert!(wait_for(|| server.stats.active_connections() == 0));
    server.stop();
}

#[test]
fn test_pipelined_transaction() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir), None);

    let mut client = Client::connect(server.addr);
    client.reply();
    client.send(
        "HELO client.test\r\nMAIL FROM:<a@b.test>\r\nRCPT TO:<c@d.test>\r\nRCPT TO:<e@f.test>\r\nDATA\r\n",
    );
    assert_eq!(client.reply(), format!("250 {}\r\n", HOSTNAME));
    assert_eq!(client.reply(), "250 OK\r\n");
    assert_eq!(client.reply(), "250 OK\r\n");
    assert_eq!(client.reply(), "250 OK\r\n");
    assert!(client.reply().starts_with("354 "));

    client.send("one line\r\n.\r\nQUIT\r\n");
    assert_eq!(client.reply(), "250 OK Message accepted\r\n");
    assert!(client.reply().starts_with("221 "));

    let files = server.spool.pickup_files().unwrap();
    assert_eq!(files.len(), 1);
    let content = std::fs::read_to_string(&files[0]).unwrap();
    assert!(content.contains("X-Envelope-To: c@d.test\r\nX-Envelope-To: e@f.test\r\n"));
}

#[test]
fn test_deep_pipelining_keeps_connection() {
    const COUNT: usize = 20_000;

    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir), None);

    let mut client = Client::connect(server.addr);
    client.reply();
    // Far more replies than the outbound buffer holds
    let mut writer = client.writer();
    let feeder = thread::spawn(move || {
        writer.write_all("NOOP\r\n".repeat(COUNT).as_bytes()).unwrap();
    });
    for _ in 0..COUNT {
        assert_eq!(client.reply(), "250 OK\r\n");
    }
    feeder.join().unwrap();

    assert_eq!(client.command("NOOP"), "250 OK\r\n");
    assert_eq!(server.stats.active_connections(), 1);
    server.stop();
}

#[test]
fn test_lettre_client_delivers() {
    let dir = TempDir::new().unwrap();
    let server = TestServer::start(test_config(&dir), None);

    let email = Message::builder()
        .from("Alice <alice@example.com>".parse().unwrap())
        .to("Bob <bob@example.org>".parse().unwrap())
        .subject("Integration")
        .header(ContentType::TEXT_PLAIN)
        .body("Sent through the relay.".to_string())
        .unwrap();

    let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
        .port(server.addr.port())
        .timeout(Some(Duration::from_secs(5)))
        .build();

    assert!(mailer.test_connection().unwrap());
    let result = mailer.send(&email);
    assert!(result.is_ok(), "send failed: {:?}", result.err());

    let files = server.spool.pickup_files().unwrap();
    assert_eq!(files.len(), 1);
    let content = std::fs::read_to_string(&files[0]).unwrap();
    assert!(content.starts_with("X-Envelope-From: alice@example.com\r\n"));
    assert!(content.contains("Subject: Integration"));
    assert!(content.contains("Sent through the relay."));
}

#[test]
fn test_connection_limit() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.server.max_connections = 1;
    let server = TestServer::start(config, None);

    let mut first = Client::connect(server.addr);
    assert!(first.reply().starts_with("220 "));
    assert!(wait_for(|| server.stats.active_connections() == 1));

    let mut second = Client::connect(server.addr);
    assert_eq!(
        second.reply(),
        format!("421 {} Too many connections\r\n", HOSTNAME)
    );
    assert_eq!(second.reply(), "");

    assert_eq!(first.command("NOOP"), "250 OK\r\n");
    assert_eq!(server.stats.snapshot().connections_rejected, 1);
}

#[test]
fn test_blocked_client_is_closed_silently() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.policy.blocked_clients = vec!["127.0.0.1".parse().unwrap()];
    let server = TestServer::start(config, None);

    let mut client = Client::connect(server.addr);
    assert_eq!(client.reply(), "");
    assert!(wait_for(|| server.stats.snapshot().connections_rejected == 1));
}

#[test]
fn test_policy_rejects_sender_and_recipient() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.policy.blocked_senders = vec!["spam@bad.test".to_string()];
    config.policy.allowed_recipient_domains = vec!["example.org".to_string()];
    let server = TestServer::start(config, None);

    let mut client = Client::connect(server.addr);
    client.reply();
    client.command("HELO client.test");
    assert!(client.command("MAIL FROM:<spam@bad.test>").starts_with("550 "));
    assert_eq!(client.command("RSET"), "250 Reset OK\r\n");
    assert_eq!(client.command("MAIL FROM:<ok@good.test>"), "250 OK\r\n");
    assert!(client.command("RCPT TO:<x@elsewhere.test>").starts_with("550 "));
    assert_eq!(client.command("RCPT TO:<bob@example.org>"), "250 OK\r\n");
}

#[test]
fn test_oversized_message_is_not_spooled() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.server.max_message_size = 64;
    let server = TestServer::start(config, None);

    let mut client = Client::connect(server.addr);
    client.reply();
    client.command("HELO client.test");
    client.command("MAIL FROM:<a@b.test>");
    client.command("RCPT TO:<c@d.test>");
    assert!(client.command("DATA").starts_with("354 "));
    for _ in 0..10 {
        client.send("0123456789012345678901234567890123456789\r\n");
    }
    client.send(".\r\n");
    assert!(client.reply().starts_with("552 "));

    // The session is usable again
    assert_eq!(client.command("NOOP"), "250 OK\r\n");
    assert!(server.spool.pickup_files().unwrap().is_empty());
}
