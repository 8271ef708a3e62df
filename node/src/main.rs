use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use metronome_time::{
    ClientOptions, ClockSyncClient, MessageSink, MonotonicClock, OffsetClock, ReferenceOptions,
    Report, SharedTimeSource, SyncReference,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app_config;
mod transport;
mod version;

use app_config::AppConfig;
use transport::Connection;
use version::{git_commit_hash, METRONOME_VERSION, WIRE_REVISION};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    init_logging(&config)?;
    info!(
        "metronome-node {} (commit {}, wire revision {})",
        METRONOME_VERSION,
        git_commit_hash(),
        WIRE_REVISION
    );
    if let Some(path) = &config.config_path {
        info!("Configuration loaded from {}", path.display());
    }

    match matches.subcommand() {
        Some(("reference", _)) => run_reference(config).await,
        Some(("peer", _)) => run_peer(config).await,
        _ => anyhow::bail!("a subcommand is required (reference or peer)"),
    }
}

fn build_cli() -> Command {
    Command::new("metronome-node")
        .version(METRONOME_VERSION)
        .about("Round-trip clock synchronization node")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("namespace")
                .long("namespace")
                .value_name("NAME")
                .help("Channel namespace shared by reference and peers")
                .global(true),
        )
        .arg(
            Arg::new("clock-offset")
                .long("clock-offset")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .allow_negative_numbers(true)
                .help("Skew this node's clock by a constant offset")
                .global(true),
        )
        .subcommand(
            Command::new("reference")
                .about("Serve as the trusted time reference")
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .value_name("ADDR")
                        .help("Address to accept peers on"),
                )
                .arg(
                    Arg::new("probe-peers")
                        .long("probe-peers")
                        .action(ArgAction::SetTrue)
                        .help("Also measure each peer's clock from the reference side"),
                ),
        )
        .subcommand(
            Command::new("peer")
                .about("Synchronize this node's clock to a reference")
                .arg(
                    Arg::new("connect")
                        .long("connect")
                        .value_name("ADDR")
                        .help("Reference address to connect to"),
                ),
        )
}

fn load_config_with_overrides(matches: &ArgMatches) -> Result<AppConfig> {
    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = AppConfig::load(config_path.as_deref())?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) {
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(namespace) = matches.get_one::<String>("namespace") {
        config.namespace = namespace.clone();
    }

    if let Some(offset) = matches.get_one::<f64>("clock-offset") {
        config.clock_offset_secs = *offset;
    }

    match matches.subcommand() {
        Some(("reference", sub)) => {
            if let Some(listen) = sub.get_one::<String>("listen") {
                config.listen_addr = listen.clone();
            }
            if sub.get_flag("probe-peers") {
                config.probe_peers = true;
            }
        }
        Some(("peer", sub)) => {
            if let Some(connect) = sub.get_one::<String>("connect") {
                config.reference_addr = connect.clone();
            }
        }
        _ => {}
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn node_clock(config: &AppConfig) -> SharedTimeSource {
    if config.clock_offset_secs == 0.0 {
        MonotonicClock::shared()
    } else {
        Arc::new(OffsetClock::new(
            MonotonicClock::shared(),
            config.clock_offset_secs,
        ))
    }
}

fn log_report(label: &str, report: &Report) {
    info!(
        "{}: status={} offset={:.6}s drift={:.3e} confidence={:.3} rtt={:.6}s accepted={} rejected={} connectivity={:?}",
        label,
        report.status,
        report.offset,
        report.drift,
        report.confidence,
        report.round_trip,
        report.accepted,
        report.rejected,
        report.connectivity
    );
}

async fn run_reference(config: AppConfig) -> Result<()> {
    let addr = config.listen_socket()?;
    let options = ReferenceOptions::new(node_clock(&config)).with_config(config.reference_config());
    let reference = Arc::new(SyncReference::new(options).context("invalid reference settings")?);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Reference listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let reference = reference.clone();
                    tokio::spawn(async move {
                        serve_peer(reference, stream, remote.to_string()).await;
                    });
                }
                Err(err) => warn!("failed to accept connection: {}", err),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    reference.stop();
    Ok(())
}

async fn serve_peer(reference: Arc<SyncReference>, stream: TcpStream, peer_id: String) {
    let mut connection = Connection::spawn(stream, peer_id.clone());
    let sink: Arc<dyn MessageSink> = Arc::new(connection.outbound.clone());
    let session = match reference.on_peer_connected(&peer_id, sink.clone()) {
        Ok(session) => session,
        Err(err) => {
            warn!("rejecting peer {}: {}", peer_id, err);
            connection.close();
            return;
        }
    };
    info!("Peer {} connected", peer_id);

    let label = format!("peer {peer_id}");
    let _subscription = session.on_report(move |report| log_report(&label, report));

    while let Some(frame) = connection.inbound.recv().await {
        match reference.handle_frame(&peer_id, &frame) {
            Ok(Some(reply)) => {
                if let Err(err) = sink.send(reply).await {
                    warn!("failed to reply to {}: {}", peer_id, err);
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => debug!("dropping frame from {}: {}", peer_id, err),
        }
    }

    reference.on_peer_disconnected(&peer_id);
    connection.close();
    info!("Peer {} disconnected", peer_id);
}

async fn run_peer(config: AppConfig) -> Result<()> {
    let addr = config.reference_socket()?;
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to reference at {addr}"))?;
    info!("Connected to reference at {}", addr);

    let options = ClientOptions::new(node_clock(&config))
        .with_config(config.client_config())
        .with_on_report(|report| log_report("reference", report));
    let client = ClockSyncClient::new(options).context("invalid client settings")?;

    let connection = Connection::spawn(stream, addr.to_string());
    let Connection {
        outbound, inbound, ..
    } = connection;
    tokio::select! {
        started = client.start(Arc::new(outbound), inbound) => {
            started.context("clock sync stopped before the first sample")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            client.stop().await;
            return Ok(());
        }
    }
    info!("Clock model training against {}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    client.stop().await;

    let report = client.get_report();
    log_report("final", &report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_per_role() {
        let matches = build_cli().get_matches_from([
            "metronome-node",
            "--log-format",
            "json",
            "--clock-offset",
            "-0.25",
            "reference",
            "--listen",
            "0.0.0.0:9000",
            "--probe-peers",
        ]);
        let mut config = AppConfig::default();
        apply_overrides(&matches, &mut config);
        assert_eq!(config.log_format, "json");
        assert_eq!(config.clock_offset_secs, -0.25);
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert!(config.probe_peers);

        let matches =
            build_cli().get_matches_from(["metronome-node", "peer", "--connect", "10.0.0.1:7070"]);
        let mut config = AppConfig::default();
        apply_overrides(&matches, &mut config);
        assert_eq!(config.reference_addr, "10.0.0.1:7070");
        assert!(!config.probe_peers);
    }

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }
}
