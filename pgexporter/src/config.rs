//! Daemon configuration and metrics-definition loading.
//!
//! The daemon reads one YAML configuration file (listen address, cache knobs,
//! collector include-list, server endpoints) plus any number of pgexporter-style
//! metrics-definition files, each holding a list of metrics with version-keyed
//! query alternatives.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::alternatives::{Column, ColumnKind, QueryVariant, VersionTree};
use crate::version::Version;

/// Default port for the metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 5002;

/// Default bound on the time spent waiting for the HTTP request, in seconds.
pub const DEFAULT_AUTHENTICATION_TIMEOUT: u64 = 5;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The file is not valid YAML for the expected shape.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying deserialization error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A query alternative carries an unparsable version key.
    #[error("metric {tag:?}: invalid version {value:?}")]
    InvalidVersion {
        /// Metric tag.
        tag: String,
        /// The rejected version string.
        value: String,
    },

    /// A query alternative has neither a server nor an extension version key.
    #[error("metric {tag:?}: query alternative without a version key")]
    MissingVersion {
        /// Metric tag.
        tag: String,
    },
}

/// Sort discipline for the value lines of a metric family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKind {
    /// Stable server order (the merge step already orders by server name).
    #[default]
    #[serde(rename = "name")]
    ByName,
    /// Group lines sharing the tuple's first-column value.
    #[serde(rename = "data")]
    ByFirstColumn,
}

/// Which servers a metric applies to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerScope {
    /// Any live server.
    #[default]
    #[serde(rename = "both")]
    Any,
    /// Primary servers only.
    Primary,
    /// Replica servers only.
    Replica,
}

/// One configured PostgreSQL endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// Server name, used as the `server` label value.
    pub name: String,
    /// Host to connect to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Role to connect as.
    #[serde(default = "default_user")]
    pub user: String,
    /// Password, if the server requires one.
    #[serde(default)]
    pub password: Option<String>,
    /// Database to connect to.
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

/// Daemon configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the metrics endpoint binds to.
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// Port the metrics endpoint binds to.
    #[serde(default = "default_metrics_port")]
    pub metrics: u16,
    /// Seconds a built response stays servable from the cache; `0` disables
    /// caching.
    #[serde(default)]
    pub metrics_cache_max_age: u64,
    /// Cache slot capacity in bytes; `0` selects the default size.
    #[serde(default)]
    pub metrics_cache_max_size: usize,
    /// Collector include-list; empty includes every collector.
    #[serde(default)]
    pub collectors: Vec<String>,
    /// Bound on the time spent reading the HTTP request, in seconds.
    #[serde(default = "default_authentication_timeout")]
    pub authentication_timeout: u64,
    /// Configured PostgreSQL endpoints.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Paths of metrics-definition files to load.
    #[serde(default)]
    pub metrics_paths: Vec<PathBuf>,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_authentication_timeout() -> u64 {
    DEFAULT_AUTHENTICATION_TIMEOUT
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: default_bind_host(),
            metrics: DEFAULT_METRICS_PORT,
            metrics_cache_max_age: 0,
            metrics_cache_max_size: 0,
            collectors: Vec::new(),
            authentication_timeout: DEFAULT_AUTHENTICATION_TIMEOUT,
            servers: Vec::new(),
            metrics_paths: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the daemon configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Whether `collector` passes the include-list filter.
    pub fn collector_pass(&self, collector: &str) -> bool {
        self.collectors.is_empty() || self.collectors.iter().any(|c| c == collector)
    }
}

/// A fully resolved metric definition.
///
/// Carries two version trees: query alternatives keyed on the PostgreSQL
/// server version, and alternatives keyed on the extension version for servers
/// with the `pgexporter_ext` extension installed.
#[derive(Clone, Debug)]
pub struct MetricDefinition {
    /// Short identifier used as the metric-name infix.
    pub tag: String,
    /// Collector-group name used for include/exclude filtering.
    pub collector: String,
    /// Sort discipline for the family's value lines.
    pub sort: SortKind,
    /// Server-scope predicate.
    pub scope: ServerScope,
    /// Alternatives keyed on the server version.
    pub server_tree: VersionTree,
    /// Alternatives keyed on the extension version.
    pub extension_tree: VersionTree,
}

#[derive(Debug, Deserialize)]
struct MetricsFile {
    metrics: Vec<RawMetric>,
}

#[derive(Debug, Deserialize)]
struct RawMetric {
    tag: String,
    #[serde(default)]
    collector: Option<String>,
    #[serde(default)]
    sort: SortKind,
    #[serde(default)]
    server: ServerScope,
    queries: Vec<RawQuery>,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    query: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    extension_version: Option<String>,
    #[serde(default)]
    columns: Vec<RawColumn>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    kind: RawColumnKind,
    #[serde(default)]
    description: String,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawColumnKind {
    Label,
    Gauge,
    Counter,
    Histogram,
}

impl From<RawColumnKind> for ColumnKind {
    fn from(kind: RawColumnKind) -> ColumnKind {
        match kind {
            RawColumnKind::Label => ColumnKind::Label,
            RawColumnKind::Gauge => ColumnKind::Gauge,
            RawColumnKind::Counter => ColumnKind::Counter,
            RawColumnKind::Histogram => ColumnKind::Histogram,
        }
    }
}

/// Loads metric definitions from a metrics-definition YAML file.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or parsed, or when a
/// query alternative carries a missing or invalid version key.
pub fn load_metrics(path: &Path) -> Result<Vec<MetricDefinition>, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: MetricsFile = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    build_definitions(file)
}

/// Parses metric definitions from an in-memory YAML document.
///
/// # Errors
///
/// As for [`load_metrics`], minus the I/O cases.
pub fn parse_metrics(raw: &str) -> Result<Vec<MetricDefinition>, ConfigError> {
    let file: MetricsFile = serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<inline>"),
        source,
    })?;
    build_definitions(file)
}

fn build_definitions(file: MetricsFile) -> Result<Vec<MetricDefinition>, ConfigError> {
    file.metrics.into_iter().map(build_definition).collect()
}

fn build_definition(raw: RawMetric) -> Result<MetricDefinition, ConfigError> {
    let mut definition = MetricDefinition {
        collector: raw.collector.unwrap_or_else(|| raw.tag.clone()),
        tag: raw.tag,
        sort: raw.sort,
        scope: raw.server,
        server_tree: VersionTree::new(),
        extension_tree: VersionTree::new(),
    };

    for query in raw.queries {
        let columns = query
            .columns
            .into_iter()
            .map(|c| Column { name: c.name, kind: c.kind.into(), description: c.description })
            .collect();
        let variant = QueryVariant::new(query.query, columns);

        let (tree, key) = match (&query.version, &query.extension_version) {
            (Some(key), _) => (&mut definition.server_tree, key),
            (None, Some(key)) => (&mut definition.extension_tree, key),
            (None, None) => {
                return Err(ConfigError::MissingVersion { tag: definition.tag });
            }
        };
        let version: Version = key.parse().map_err(|_| ConfigError::InvalidVersion {
            tag: definition.tag.clone(),
            value: key.clone(),
        })?;
        tree.insert(version, variant);
    }

    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
metrics:
  - tag: locks
    collector: locks
    sort: name
    server: both
    queries:
      - query: SELECT mode, count FROM pg_locks_summary
        version: "10"
        columns:
          - name: mode
            type: label
          - name: count
            type: gauge
            description: Lock count by mode
      - query: SELECT mode, granted, count FROM pg_locks_summary
        version: "14.2"
        columns:
          - name: mode
            type: label
          - name: granted
            type: label
          - name: count
            type: gauge
            description: Lock count by mode
  - tag: stat_io
    sort: data
    server: primary
    queries:
      - query: SELECT * FROM pgexporter_ext_io()
        extension_version: "0.2"
        columns:
          - name: elapsed
            type: histogram
            description: IO timing
"#;

    #[test]
    fn parses_metric_definitions() {
        let defs = parse_metrics(SAMPLE).expect("sample should parse");
        assert_eq!(defs.len(), 2);

        let locks = &defs[0];
        assert_eq!(locks.tag, "locks");
        assert_eq!(locks.collector, "locks");
        assert_eq!(locks.sort, SortKind::ByName);
        assert_eq!(locks.scope, ServerScope::Any);
        assert!(locks.extension_tree.is_empty());

        let old = locks
            .server_tree
            .lookup("13.1".parse().expect("version"))
            .expect("version 10 variant applies");
        assert_eq!(old.columns.len(), 2);
        let new = locks
            .server_tree
            .lookup("15".parse().expect("version"))
            .expect("version 14.2 variant applies");
        assert_eq!(new.columns.len(), 3);

        let stat_io = &defs[1];
        assert_eq!(stat_io.collector, "stat_io", "collector defaults to the tag");
        assert_eq!(stat_io.sort, SortKind::ByFirstColumn);
        assert_eq!(stat_io.scope, ServerScope::Primary);
        assert!(stat_io.server_tree.is_empty());
        let variant = stat_io
            .extension_tree
            .lookup("0.2.1".parse().expect("version"))
            .expect("extension variant applies");
        assert!(variant.is_histogram());
    }

    #[test]
    fn rejects_query_without_version_key() {
        let raw = r#"
metrics:
  - tag: broken
    queries:
      - query: SELECT 1
        columns:
          - name: one
            type: gauge
"#;
        let err = parse_metrics(raw).expect_err("missing version key must fail");
        assert!(matches!(err, ConfigError::MissingVersion { ref tag } if tag == "broken"));
    }

    #[test]
    fn rejects_bad_version_key() {
        let raw = r#"
metrics:
  - tag: broken
    queries:
      - query: SELECT 1
        version: potato
        columns:
          - name: one
            type: gauge
"#;
        let err = parse_metrics(raw).expect_err("bad version key must fail");
        assert!(matches!(err, ConfigError::InvalidVersion { ref value, .. } if value == "potato"));
    }

    #[test]
    fn collector_include_list() {
        let mut config = Config::default();
        assert!(config.collector_pass("anything"));

        config.collectors = vec!["locks".to_string(), "settings".to_string()];
        assert!(config.collector_pass("locks"));
        assert!(!config.collector_pass("stat_io"));
    }
}
