//! Federation broker daemon.
//!
//! Usage:
//!   federation-broker --config /etc/broker/broker.toml
//!   federation-broker --config /etc/broker/broker.toml --observe

use anyhow::Result;
use broker::{BrokerConfig, FederationBroker, StatsObserver};
use clap::Parser;
use std::time::Duration;
use tracing::{debug, info, warn};
use transport::{NetConnector, TransportOptions};

#[derive(Parser, Debug)]
#[command(name = "federation-broker")]
#[command(about = "Store-and-forward bridge between a collective and a federation")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Observe the whole cluster's stats instead of running a broker
    #[arg(long)]
    observe: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = BrokerConfig::from_file(&args.config)?;
    info!(
        cluster = %config.cluster,
        instance = %config.instance,
        "loaded configuration from {}",
        args.config
    );

    if args.observe {
        return run_observe(config);
    }

    let broker = FederationBroker::new(config)?;
    broker.start()?;

    loop {
        std::thread::sleep(Duration::from_secs(10));
        if broker.ok() {
            debug!("all worker threads alive");
        } else {
            warn!(status = ?broker.thread_status(), "broker is unhealthy");
        }
    }
}

/// Passive mode: aggregate the stats of every instance in the cluster and
/// print the combined view once per second
fn run_observe(config: BrokerConfig) -> Result<()> {
    let tls = config
        .tls
        .as_ref()
        .map(|settings| settings.build_connector())
        .transpose()?;

    let mut options = TransportOptions::new("observer", config.federation.servers.clone());
    options.tls = tls;

    let observer = StatsObserver::start(&NetConnector::new(options), &config.cluster)?;
    info!(cluster = %config.cluster, "observing cluster stats");

    observer.observe(|instances| {
        match serde_json::to_string_pretty(instances) {
            Ok(rendered) => println!("{}", rendered),
            Err(e) => warn!(error = %e, "failed to render stats"),
        }
        true
    });

    Ok(())
}

fn init_logging(args: &Args) {
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::fmt().with_max_level(log_level).init();
}
