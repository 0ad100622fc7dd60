//! The `pgexporter` daemon.

use std::env;
use std::error::Error;
use std::net::TcpListener;
use std::path::Path;
use std::process;
use std::sync::Arc;

use getopts::Options;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pgexporter::bridge::PostgresBridge;
use pgexporter::config::{self, Config, MetricDefinition};
use pgexporter::{http, Exporter};

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut options = Options::new();
    options.optopt("c", "config", "configuration file", "FILE");
    options.optflag("h", "help", "print this help");

    let matches = match options.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(failure) => {
            eprintln!("{failure}");
            process::exit(1);
        }
    };
    if matches.opt_present("h") {
        print!("{}", options.usage("Usage: pgexporter [options]"));
        return;
    }

    let config_path = matches.opt_str("c").unwrap_or_else(|| "pgexporter.yaml".to_string());
    if let Err(failure) = run(Path::new(&config_path)) {
        eprintln!("pgexporter: {failure}");
        process::exit(1);
    }
}

fn run(config_path: &Path) -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::load(config_path)?;

    let mut metrics: Vec<MetricDefinition> = Vec::new();
    for path in &config.metrics_paths {
        metrics.extend(config::load_metrics(path)?);
    }

    let listener = TcpListener::bind((config.host.as_str(), config.metrics))?;
    info!(
        address = %format!("{}:{}", config.host, config.metrics),
        servers = config.servers.len(),
        metrics = metrics.len(),
        "pgexporter listening"
    );

    let bridge = Box::new(PostgresBridge::new(&config.servers));
    let exporter = Arc::new(Exporter::new(config, metrics, bridge));

    http::serve(listener, exporter)?;
    Ok(())
}
