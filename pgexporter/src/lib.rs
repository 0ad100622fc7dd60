//! A Prometheus metrics exporter for PostgreSQL.
//!
//! ## Basics
//!
//! `pgexporter` answers HTTP `GET /metrics` with a text-formatted snapshot of
//! metrics gathered by running SQL against a configured set of PostgreSQL
//! servers.  Metrics are authored as version-keyed query alternatives: each
//! metric carries a tree of SQL variants and every scrape picks, per server,
//! the variant with the highest version key the server still satisfies.
//!
//! ## Behavior
//!
//! A scrape emits the standard metrics first (exporter state and version,
//! per-server liveness, PostgreSQL version, uptime and primary status), then
//! the settings and extension collectors, then every configured custom
//! metric.  Results from all servers are re-grouped per metric family so each
//! family carries exactly one `#HELP`/`#TYPE` header, and responses are
//! streamed with chunked transfer-encoding.
//!
//! Built responses can be cached for a configurable number of seconds; the
//! cache is a process-wide single slot guarded by an atomic lock word, so
//! concurrent scrapes either serve the cached bytes or wait for the builder
//! to finish.
//!
//! ## Usage
//!
//! ```no_run
//! use std::net::TcpListener;
//! use std::sync::Arc;
//!
//! use pgexporter::bridge::PostgresBridge;
//! use pgexporter::config::Config;
//! use pgexporter::{http, Exporter};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("pgexporter.yaml".as_ref())?;
//! let metrics = config
//!     .metrics_paths
//!     .iter()
//!     .map(|path| pgexporter::config::load_metrics(path))
//!     .collect::<Result<Vec<_>, _>>()?
//!     .into_iter()
//!     .flatten()
//!     .collect();
//!
//! let bridge = Box::new(PostgresBridge::new(&config.servers));
//! let listener = TcpListener::bind((config.host.as_str(), config.metrics))?;
//! let exporter = Arc::new(Exporter::new(config, metrics, bridge));
//! http::serve(listener, exporter)?;
//! # Ok(())
//! # }
//! ```
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]

pub mod alternatives;
pub mod bridge;
pub mod cache;
pub mod collectors;
pub mod config;
pub mod formatting;
pub mod http;
pub mod server;
pub mod sql;
pub mod store;
pub mod version;

use crate::cache::ResponseCache;
use crate::config::{Config, MetricDefinition};
use crate::server::ServerState;
use crate::sql::SqlBridge;

/// Shared state handed to every connection handler: configuration, metric
/// definitions, per-server runtime state, the SQL collaborator and the
/// response cache.
pub struct Exporter {
    config: Config,
    metrics: Vec<MetricDefinition>,
    servers: Vec<ServerState>,
    bridge: Box<dyn SqlBridge>,
    cache: ResponseCache,
}

impl Exporter {
    /// Assembles the exporter from its configuration, metric definitions and
    /// SQL collaborator.
    pub fn new(
        config: Config,
        metrics: Vec<MetricDefinition>,
        bridge: Box<dyn SqlBridge>,
    ) -> Exporter {
        let servers =
            config.servers.iter().map(|server| ServerState::new(server.name.clone())).collect();
        let cache =
            ResponseCache::new(config.metrics_cache_max_age, config.metrics_cache_max_size);
        Exporter { config, metrics, servers, bridge, cache }
    }

    /// The daemon configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The configured metric definitions.
    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    /// Runtime state of the configured servers.
    pub fn servers(&self) -> &[ServerState] {
        &self.servers
    }

    /// The SQL collaborator.
    pub fn bridge(&self) -> &dyn SqlBridge {
        self.bridge.as_ref()
    }

    /// The response cache.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Drops the cached response; the next scrape rebuilds from scratch.
    pub fn reset_cache(&self) {
        self.cache.reset();
    }
}
