use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relay_rs::config::{Config, ConfigWatcher, SharedConfig};
use relay_rs::logging;
use relay_rs::net::StopHandle;
use relay_rs::relay::RelayService;
use relay_rs::security::tls::generate_self_signed_cert;
use relay_rs::security::TlsConfig;
use relay_rs::smtp::SmtpServer;
use relay_rs::stats::Stats;
use relay_rs::storage::Spool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "config/relay.toml";

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "relay-rs", version, about = "SMTP relay gateway")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override logging.level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print the effective configuration as TOML
    PrintConfig,
    /// Write a self-signed certificate and key
    GenCert {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::GenCert { domain, cert, key }) = &cli.command {
        generate_self_signed_cert(domain, cert, key).context("Failed to generate certificate")?;
        println!("Wrote {} and {}", cert.display(), key.display());
        return Ok(());
    }

    let (config, config_path) = load_config(&cli.config)?;

    match cli.command {
        Some(Command::CheckConfig) => {
            config.validate().context("Invalid configuration")?;
            println!("Configuration OK");
            Ok(())
        }
        Some(Command::PrintConfig) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        _ => {
            config.validate().context("Invalid configuration")?;
            logging::init(&config.logging, cli.log_level.as_deref())?;
            match &config_path {
                Some(path) => info!("Configuration loaded from {}", path.display()),
                None => info!("No config file found, using defaults"),
            }
            serve(config, config_path)
        }
    }
}

/// Load `path`, or the defaults when the default path does not exist
fn load_config(path: &Path) -> anyhow::Result<(Config, Option<PathBuf>)> {
    if path.exists() {
        let config = Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        return Ok((config, Some(path.to_path_buf())));
    }
    if path == Path::new(DEFAULT_CONFIG) {
        return Ok((Config::default(), None));
    }
    bail!("Configuration file {} not found", path.display())
}

fn serve(config: Config, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!("Starting relay-rs {}", env!("CARGO_PKG_VERSION"));

    let shared = SharedConfig::new(config);
    let config = shared.current();
    info!("  SMTP listening on: {}", config.listen_addr()?);
    info!("  Spool: {}", config.storage.path.display());
    info!("  Upstream: {}", config.upstream.address());

    let spool = Arc::new(
        Spool::open_local(&config.storage.path).context("Failed to initialise the spool")?,
    );
    let stats = Arc::new(Stats::new());

    let tls = match (&config.server.cert_file, &config.server.key_file) {
        (Some(cert), Some(key)) => {
            Some(TlsConfig::from_pem_files(cert, key).context("Failed to load TLS certificate")?)
        }
        _ => {
            info!("No certificate configured, STARTTLS disabled");
            None
        }
    };

    shared.on_reload(|old, new| {
        if old.server.bind_address != new.server.bind_address
            || old.server.port != new.server.port
            || old.server.tls_port != new.server.tls_port
        {
            warn!("Listener address changes take effect after a restart");
        }
        if old.server.cert_file != new.server.cert_file || old.server.key_file != new.server.key_file {
            warn!("Certificate changes take effect after a restart");
        }
        if old.upstream.relay_threads != new.upstream.relay_threads
            || old.upstream.queue_capacity != new.upstream.queue_capacity
        {
            warn!("Relay pool size changes take effect after a restart");
        }
        if old.storage.path != new.storage.path {
            warn!("Spool path changes take effect after a restart");
        }
    });

    let relay = RelayService::start(shared.clone(), Arc::clone(&spool), Arc::clone(&stats))
        .context("Failed to start the relay pipeline")?;
    let server = SmtpServer::bind(shared.clone(), spool, Arc::clone(&stats), tls)
        .context("Failed to bind SMTP listener")?;

    let stop = StopHandle::new();
    let reactor = {
        let stop = stop.clone();
        thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || {
                let result = server.run(stop.clone());
                // Lets the control loop notice an unexpected exit
                stop.stop();
                result
            })?
    };

    let watcher = match &config_path {
        Some(path) => match ConfigWatcher::spawn(path, shared.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("Config hot reload disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(control_loop(&shared, config_path.as_deref(), &stats, &stop))?;

    info!("Shutting down");
    stop.stop();
    match reactor.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("SMTP server error: {}", e),
        Err(_) => error!("Reactor thread panicked"),
    }
    relay.stop();
    if let Some(watcher) = watcher {
        watcher.stop();
    }

    info!("Final statistics:\n{}", stats.snapshot());
    Ok(())
}

/// Handle signals until shutdown is requested
async fn control_loop(
    shared: &SharedConfig,
    config_path: Option<&Path>,
    stats: &Stats,
    stop: &StopHandle,
) -> anyhow::Result<()> {
    let mut sig_term = signal(SignalKind::terminate()).context("listen for SIGTERM")?;
    let mut sig_hup = signal(SignalKind::hangup()).context("listen for SIGHUP")?;

    let mut stats_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
    let mut watchdog = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            _ = sig_term.recv() => {
                info!("SIGTERM received");
                break;
            }
            _ = sig_hup.recv() => match config_path {
                Some(path) => match shared.reload_from(path) {
                    Ok(()) => info!("Configuration reloaded from {}", path.display()),
                    Err(e) => error!("Reload failed, keeping current configuration: {}", e),
                },
                None => warn!("SIGHUP ignored: running on default configuration"),
            },
            _ = stats_tick.tick() => {
                info!("{}", stats.snapshot());
            }
            _ = watchdog.tick() => {
                if stop.is_stopped() {
                    warn!("SMTP server exited");
                    break;
                }
            }
        }
    }
    Ok(())
}
