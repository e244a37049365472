//! Shared fixtures for the integration tests

#![allow(dead_code)]

use relay_rs::config::{Config, SharedConfig};
use relay_rs::net::StopHandle;
use relay_rs::security::TlsConfig;
use relay_rs::smtp::SmtpServer;
use relay_rs::stats::Stats;
use relay_rs::storage::Spool;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const HOSTNAME: &str = "relay.test";

/// Configuration bound to an ephemeral loopback port
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.hostname = HOSTNAME.to_string();
    config.storage.path = dir.path().join("spool");
    config.upstream.relay_threads = 1;
    config.upstream.scan_interval_ms = 20;
    config.upstream.timeout_secs = 5;
    config
}

/// A running SMTP server on its own reactor thread
pub struct TestServer {
    pub addr: SocketAddr,
    pub tls_addr: Option<SocketAddr>,
    pub shared: SharedConfig,
    pub spool: Arc<Spool>,
    pub stats: Arc<Stats>,
    stop: StopHandle,
    handle: Option<JoinHandle<relay_rs::Result<()>>>,
}

impl TestServer {
    pub fn start(config: Config, tls: Option<TlsConfig>) -> Self {
        let shared = SharedConfig::new(config);
        let spool = Arc::new(Spool::open_local(&shared.current().storage.path).unwrap());
        let stats = Arc::new(Stats::new());

        let server =
            SmtpServer::bind(shared.clone(), Arc::clone(&spool), Arc::clone(&stats), tls).unwrap();
        let addr = server.local_addr().unwrap();
        let tls_addr = server.tls_local_addr().unwrap();

        let stop = StopHandle::new();
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || server.run(stop))
        };

        Self {
            addr,
            tls_addr,
            shared,
            spool,
            stats,
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Line-oriented SMTP client over a plain socket
pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        }
    }

    pub fn send(&mut self, data: &str) {
        self.writer.write_all(data.as_bytes()).unwrap();
    }

    /// Read one reply, joining the lines of a multi-line reply
    pub fn reply(&mut self) -> String {
        let mut full = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).unwrap() == 0 {
                return full;
            }
            full.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return full;
            }
        }
    }

    pub fn command(&mut self, line: &str) -> String {
        self.send(&format!("{}\r\n", line));
        self.reply()
    }

    /// Second handle for writing from another thread
    pub fn writer(&self) -> TcpStream {
        self.writer.try_clone().unwrap()
    }

    pub fn into_stream(self) -> TcpStream {
        self.writer
    }
}

/// Scripted upstream: greeting, then one reply per command
///
/// Lines after a `354` are collected until the lone dot. Returns every line
/// received.
pub fn spawn_upstream(replies: Vec<&'static str>) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        let mut received = Vec::new();
        let mut replies = replies.into_iter();

        let Some(greeting) = replies.next() else {
            return received;
        };
        writer.write_all(format!("{}\r\n", greeting).as_bytes()).unwrap();

        let mut in_data = false;
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
            received.push(line.clone());

            if in_data {
                if line != "." {
                    continue;
                }
                in_data = false;
            }

            let Some(reply) = replies.next() else {
                break;
            };
            in_data = reply.starts_with("354");
            if writer.write_all(format!("{}\r\n", reply).as_bytes()).is_err() {
                break;
            }
        }
        received
    });

    (addr, handle)
}

/// Poll `condition` for up to five seconds
pub fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
