//! Metric collection: the standard collectors and the custom-metric fan-out.
//!
//! A scrape emits the standard metrics first, in fixed order, then every
//! configured metric definition.  Each collector renders one or more text
//! blocks and hands them to a [`BlockSink`]; the HTTP surface streams blocks
//! as chunks while mirroring them into the response cache.  A failed query
//! drops that (metric, server) pair only — exposition degrades by omission,
//! never wholesale.

use std::io;

use tracing::debug;

use crate::alternatives::{ColumnKind, QueryVariant};
use crate::config::{Config, MetricDefinition, ServerScope, SortKind};
use crate::formatting::{
    parse_array, render_value, safe_key, write_help_line, write_label, write_metric_name,
    write_type_line,
};
use crate::server::{ServerRole, ServerState};
use crate::sql::{merge_results, QueryResult, SqlBridge};
use crate::store::ColumnStore;

const VERSION_SQL: &str = "SELECT split_part(current_setting('server_version'), ' ', 1);";
const UPTIME_SQL: &str =
    "SELECT extract(epoch FROM (now() - pg_postmaster_start_time()))::bigint;";
const PRIMARY_SQL: &str = "SELECT NOT pg_is_in_recovery();";
const SETTINGS_SQL: &str = "SELECT name, setting, short_desc FROM pg_settings;";
const FUNCTIONS_SQL: &str = "SELECT * FROM pgexporter_get_functions();";

/// Receives rendered metric blocks in emission order.
pub trait BlockSink {
    /// Writes one rendered block.
    ///
    /// # Errors
    ///
    /// Propagates the underlying transport error; collection stops.
    fn write_block(&mut self, block: &str) -> io::Result<()>;
}

impl BlockSink for String {
    fn write_block(&mut self, block: &str) -> io::Result<()> {
        self.push_str(block);
        Ok(())
    }
}

/// Renders the full metrics page into `out`: standard metrics in fixed order,
/// then the configured custom metrics.
///
/// # Errors
///
/// Only sink errors propagate; SQL failures degrade the output instead.
pub fn write_metrics(
    out: &mut dyn BlockSink,
    config: &Config,
    metrics: &[MetricDefinition],
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    general_information(out)?;
    core_information(out)?;
    server_information(out, servers)?;
    version_information(out, servers, bridge)?;
    uptime_information(out, servers, bridge)?;
    primary_information(out, servers, bridge)?;
    settings_information(out, config, servers, bridge)?;
    extension_information(out, config, servers, bridge)?;
    custom_metrics(out, config, metrics, servers, bridge)
}

fn server_name(servers: &[ServerState], index: usize) -> &str {
    servers.get(index).map_or("", ServerState::name)
}

/// Runs `sql` on every live server and merges the results in `sort` order.
fn gather(
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
    sql: &str,
    tag: &str,
    sort: SortKind,
) -> Option<QueryResult> {
    let mut all = None;
    for (index, server) in servers.iter().enumerate() {
        if !server.is_connected() {
            continue;
        }
        match bridge.custom_query(index, sql, tag, None) {
            Ok(result) => all = Some(merge_results(all.take(), result, sort, servers)),
            Err(error) => {
                debug!(server = server.name(), %error, "standard query failed");
            }
        }
    }
    all
}

fn general_information(out: &mut dyn BlockSink) -> io::Result<()> {
    out.write_block(
        "#HELP pgexporter_state The state of pgexporter\n\
         #TYPE pgexporter_state gauge\n\
         pgexporter_state 1\n\n",
    )
}

fn core_information(out: &mut dyn BlockSink) -> io::Result<()> {
    let mut data = String::new();
    data.push_str(
        "#HELP pgexporter_version The pgexporter version\n\
         #TYPE pgexporter_version counter\n\
         pgexporter_version{pgexporter_version=\"",
    );
    data.push_str(env!("CARGO_PKG_VERSION"));
    data.push_str("\"} 1\n\n");
    out.write_block(&data)
}

fn server_information(out: &mut dyn BlockSink, servers: &[ServerState]) -> io::Result<()> {
    let mut data = String::new();
    data.push_str(
        "#HELP pgexporter_postgresql_active The state of PostgreSQL\n\
         #TYPE pgexporter_postgresql_active gauge\n",
    );
    for server in servers {
        data.push_str("pgexporter_postgresql_active{server=\"");
        data.push_str(server.name());
        data.push_str("\"} ");
        data.push_str(if server.is_connected() { "1" } else { "0" });
        data.push('\n');
    }
    data.push('\n');
    out.write_block(&data)
}

fn version_information(
    out: &mut dyn BlockSink,
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    let Some(all) = gather(servers, bridge, VERSION_SQL, "postgresql_version", SortKind::ByName)
    else {
        return Ok(());
    };
    if all.tuples.is_empty() {
        return Ok(());
    }

    let mut data = String::new();
    data.push_str(
        "#HELP pgexporter_postgresql_version The PostgreSQL version\n\
         #TYPE pgexporter_postgresql_version gauge\n",
    );
    for tuple in &all.tuples {
        data.push_str("pgexporter_postgresql_version{server=\"");
        data.push_str(server_name(servers, tuple.server));
        data.push_str("\",version=\"");
        data.push_str(tuple.cell(0));
        data.push_str("\"} 1\n");
    }
    data.push('\n');
    out.write_block(&data)
}

fn uptime_information(
    out: &mut dyn BlockSink,
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    let Some(all) = gather(servers, bridge, UPTIME_SQL, "postgresql_uptime", SortKind::ByName)
    else {
        return Ok(());
    };
    if all.tuples.is_empty() {
        return Ok(());
    }

    let mut data = String::new();
    data.push_str(
        "#HELP pgexporter_postgresql_uptime The PostgreSQL uptime in seconds\n\
         #TYPE pgexporter_postgresql_uptime counter\n",
    );
    for tuple in &all.tuples {
        data.push_str("pgexporter_postgresql_uptime{server=\"");
        data.push_str(server_name(servers, tuple.server));
        data.push_str("\"} ");
        data.push_str(render_value("postgresql_uptime", "", tuple.cell(0)));
        data.push('\n');
    }
    data.push('\n');
    out.write_block(&data)
}

fn primary_information(
    out: &mut dyn BlockSink,
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    let Some(all) = gather(servers, bridge, PRIMARY_SQL, "postgresql_primary", SortKind::ByName)
    else {
        return Ok(());
    };
    if all.tuples.is_empty() {
        return Ok(());
    }

    let mut data = String::new();
    data.push_str(
        "#HELP pgexporter_postgresql_primary Is the PostgreSQL instance the primary\n\
         #TYPE pgexporter_postgresql_primary gauge\n",
    );
    for tuple in &all.tuples {
        data.push_str("pgexporter_postgresql_primary{server=\"");
        data.push_str(server_name(servers, tuple.server));
        data.push_str("\"} ");
        data.push_str(if tuple.cell(0) == "t" { "1" } else { "0" });
        data.push('\n');
    }
    data.push('\n');
    out.write_block(&data)
}

fn settings_information(
    out: &mut dyn BlockSink,
    config: &Config,
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    if !config.collector_pass("pg_settings") {
        return Ok(());
    }
    let Some(all) =
        gather(servers, bridge, SETTINGS_SQL, "pg_settings", SortKind::ByFirstColumn)
    else {
        return Ok(());
    };

    // Tuples arrive grouped by setting name; each run becomes one family.
    let tuples = &all.tuples;
    let mut index = 0;
    while index < tuples.len() {
        let name = tuples[index].cell(0);
        let run_end = tuples[index..]
            .iter()
            .position(|tuple| tuple.cell(0) != name)
            .map_or(tuples.len(), |offset| index + offset);

        let key = safe_key(name);
        let mut data = String::new();
        write_help_line(&mut data, "pg_settings", &key, tuples[index].cell(2));
        write_type_line(&mut data, "pg_settings", &key, ColumnKind::Gauge);
        for tuple in &tuples[index..run_end] {
            write_metric_name(&mut data, "pg_settings", &key);
            data.push_str("{server=\"");
            data.push_str(server_name(servers, tuple.server));
            data.push_str("\"} ");
            data.push_str(render_value("pg_settings", &key, tuple.cell(1)));
            data.push('\n');
        }
        data.push('\n');
        out.write_block(&data)?;

        index = run_end;
    }
    Ok(())
}

fn extension_information(
    out: &mut dyn BlockSink,
    config: &Config,
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    if !config.collector_pass("extension") {
        return Ok(());
    }

    let mut functions = None;
    for (index, server) in servers.iter().enumerate() {
        if !server.has_extension() || !server.is_connected() {
            continue;
        }
        match bridge.custom_query(index, FUNCTIONS_SQL, "pgexporter_ext", None) {
            Ok(result) => {
                functions = Some(result);
                break;
            }
            Err(error) => {
                // Latches until restart; see DESIGN.md.
                debug!(server = server.name(), %error, "extension disabled after failed enumeration");
                server.set_extension(false);
            }
        }
    }

    let Some(functions) = functions else {
        return Ok(());
    };
    for tuple in &functions.tuples {
        // Only functions that take no input can be enumerated blindly.
        if !matches!(tuple.cell(1), "f" | "false") {
            continue;
        }
        if tuple.cell(0) == "pgexporter_get_functions" {
            continue;
        }
        extension_function(out, servers, bridge, tuple.cell(0), tuple.cell(2), tuple.cell(3))?;
    }
    Ok(())
}

fn extension_function(
    out: &mut dyn BlockSink,
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
    function: &str,
    description: &str,
    kind: &str,
) -> io::Result<()> {
    let sql = format!("SELECT * FROM {function}();");
    let mut data = String::new();
    let mut header = false;

    for (index, server) in servers.iter().enumerate() {
        if !server.has_extension() || !server.is_connected() {
            continue;
        }
        let result = match bridge.custom_query(index, &sql, "pgexporter_ext", None) {
            Ok(result) => result,
            Err(error) => {
                debug!(server = server.name(), function, %error, "extension disabled after failed query");
                server.set_extension(false);
                continue;
            }
        };

        if !header {
            data.push_str("#HELP ");
            data.push_str(function);
            data.push(' ');
            data.push_str(description);
            data.push_str("\n#TYPE ");
            data.push_str(function);
            data.push(' ');
            data.push_str(kind);
            data.push('\n');
            header = true;
        }

        for tuple in &result.tuples {
            data.push_str(function);
            data.push_str("{server=\"");
            data.push_str(server.name());
            data.push('"');
            for (column, name) in result.names.iter().enumerate() {
                write_label(&mut data, name, tuple.cell(column));
            }
            data.push_str("} 1\n");
        }
    }

    if header {
        data.push('\n');
        out.write_block(&data)?;
    }
    Ok(())
}

/// The per-(metric, server) record produced by the fan-out.
struct FanoutEntry<'a> {
    tag: &'a str,
    sort: SortKind,
    variant: &'a QueryVariant,
    result: QueryResult,
}

fn resolve_variant<'a>(
    metric: &'a MetricDefinition,
    server: &ServerState,
) -> Option<&'a QueryVariant> {
    if !metric.extension_tree.is_empty() {
        if !server.has_extension() {
            return None;
        }
        return metric.extension_tree.lookup(server.extension_version()?);
    }
    metric.server_tree.lookup(server.version()?)
}

fn fan_out<'a>(
    config: &Config,
    metrics: &'a [MetricDefinition],
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> Vec<FanoutEntry<'a>> {
    let mut entries = Vec::new();

    for metric in metrics {
        if !config.collector_pass(&metric.collector) {
            continue;
        }
        for (index, server) in servers.iter().enumerate() {
            if !server.is_connected() {
                continue;
            }
            match metric.scope {
                ServerScope::Primary if server.role() != ServerRole::Primary => continue,
                ServerScope::Replica if server.role() != ServerRole::Replica => continue,
                _ => {}
            }
            let Some(variant) = resolve_variant(metric, server) else {
                continue;
            };

            let names = if variant.is_histogram() { None } else { Some(variant.column_names()) };
            match bridge.custom_query(index, &variant.query, &metric.tag, names.as_deref()) {
                Ok(result) => entries.push(FanoutEntry {
                    tag: &metric.tag,
                    sort: metric.sort,
                    variant,
                    result,
                }),
                Err(error) => {
                    debug!(metric = %metric.tag, server = server.name(), %error, "custom query failed");
                }
            }
        }
    }

    entries
}

fn custom_metrics(
    out: &mut dyn BlockSink,
    config: &Config,
    metrics: &[MetricDefinition],
    servers: &[ServerState],
    bridge: &dyn SqlBridge,
) -> io::Result<()> {
    let entries = fan_out(config, metrics, servers, bridge);

    let mut store = ColumnStore::new();
    for entry in &entries {
        if entry.variant.is_histogram() {
            handle_histogram(&mut store, entry, servers);
        } else {
            handle_gauge_counter(&mut store, entry, servers);
        }
    }

    let mut data = String::new();
    store.emit(&mut data);
    if data.is_empty() {
        return Ok(());
    }
    out.write_block(&data)
}

fn handle_gauge_counter(store: &mut ColumnStore, entry: &FanoutEntry<'_>, servers: &[ServerState]) {
    if entry.result.tuples.is_empty() {
        return;
    }

    for (index, column) in entry.variant.columns.iter().enumerate() {
        if column.kind == ColumnKind::Label {
            continue;
        }
        let bucket = store.bucket(entry.tag, &column.name, column.kind, entry.sort, || {
            let mut header = String::new();
            write_help_line(&mut header, entry.tag, &column.name, &column.description);
            write_type_line(&mut header, entry.tag, &column.name, column.kind);
            header
        });

        for tuple in &entry.result.tuples {
            let mut text = String::new();
            write_metric_name(&mut text, entry.tag, &column.name);
            text.push_str("{server=\"");
            text.push_str(server_name(servers, tuple.server));
            text.push('"');
            for (label_index, label) in entry.variant.columns.iter().enumerate() {
                if label.kind != ColumnKind::Label {
                    continue;
                }
                write_label(&mut text, &label.name, &safe_key(tuple.cell(label_index)));
            }
            text.push_str("} ");
            text.push_str(render_value(entry.tag, &column.name, tuple.cell(index)));
            text.push('\n');

            bucket.push(tuple.cell(0), text);
        }
    }
}

fn handle_histogram(store: &mut ColumnStore, entry: &FanoutEntry<'_>, servers: &[ServerState]) {
    let Some(h_index) = entry.variant.histogram_column() else {
        return;
    };
    if entry.result.tuples.is_empty() {
        return;
    }
    let column = &entry.variant.columns[h_index];

    // The result carries `<X>` (bounds), `<X>_bucket` (counts) and the
    // `<X>_sum`/`<X>_count` scalars, addressed by name.
    let Some(bounds_at) = entry.result.column_index(&column.name) else {
        debug!(tag = entry.tag, column = %column.name, "histogram bounds column missing");
        return;
    };
    let counts_at = entry.result.column_index(&format!("{}_bucket", column.name));
    let sum_at = entry.result.column_index(&format!("{}_sum", column.name));
    let count_at = entry.result.column_index(&format!("{}_count", column.name));
    let (Some(counts_at), Some(sum_at), Some(count_at)) = (counts_at, sum_at, count_at) else {
        debug!(tag = entry.tag, column = %column.name, "histogram companion columns missing");
        return;
    };

    let bucket = store.bucket(entry.tag, &column.name, ColumnKind::Histogram, entry.sort, || {
        // The family is named by the tag alone.
        let mut header = String::new();
        write_help_line(&mut header, entry.tag, "", &column.description);
        write_type_line(&mut header, entry.tag, "", ColumnKind::Histogram);
        header
    });

    for tuple in &entry.result.tuples {
        let bounds = parse_array(tuple.cell(bounds_at));
        let counts = parse_array(tuple.cell(counts_at));
        if bounds.len() != counts.len() {
            debug!(
                tag = entry.tag,
                bounds = bounds.len(),
                counts = counts.len(),
                "histogram bound/bucket arrays disagree; tuple skipped"
            );
            continue;
        }

        // Shared label suffix: the server plus every column ahead of the
        // histogram column.
        let mut labels = String::new();
        labels.push_str("server=\"");
        labels.push_str(server_name(servers, tuple.server));
        labels.push('"');
        for (label_index, label) in entry.variant.columns.iter().enumerate().take(h_index) {
            write_label(&mut labels, &label.name, &safe_key(tuple.cell(label_index)));
        }

        let mut text = String::new();
        for (bound, count) in bounds.iter().zip(&counts) {
            write_metric_name(&mut text, entry.tag, "");
            text.push_str("_bucket{le=\"");
            text.push_str(bound);
            text.push_str("\",");
            text.push_str(&labels);
            text.push_str("} ");
            text.push_str(count);
            text.push('\n');
        }

        write_metric_name(&mut text, entry.tag, "");
        text.push_str("_bucket{le=\"+Inf\",");
        text.push_str(&labels);
        text.push_str("} ");
        text.push_str(tuple.cell(count_at));
        text.push('\n');

        write_metric_name(&mut text, entry.tag, "");
        text.push_str("_sum{");
        text.push_str(&labels);
        text.push_str("} ");
        text.push_str(tuple.cell(sum_at));
        text.push('\n');

        write_metric_name(&mut text, entry.tag, "");
        text.push_str("_count{");
        text.push_str(&labels);
        text.push_str("} ");
        text.push_str(tuple.cell(count_at));
        text.push('\n');

        bucket.push(tuple.cell(0), text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_metrics;
    use crate::sql::{SqlError, Tuple};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Bridge serving canned rows keyed by `(server, tag)`.
    #[derive(Default)]
    struct StubBridge {
        rows: HashMap<(usize, String), Vec<Vec<Option<String>>>>,
        names: HashMap<String, Vec<String>>,
        fail: HashSet<(usize, String)>,
        calls: AtomicUsize,
    }

    impl StubBridge {
        fn with_rows(mut self, server: usize, tag: &str, rows: &[&[&str]]) -> StubBridge {
            let rows = rows
                .iter()
                .map(|cells| cells.iter().map(|c| Some((*c).to_string())).collect())
                .collect();
            self.rows.insert((server, tag.to_string()), rows);
            self
        }

        fn with_names(mut self, tag: &str, names: &[&str]) -> StubBridge {
            self.names.insert(tag.to_string(), names.iter().map(|n| (*n).to_string()).collect());
            self
        }

        fn failing(mut self, server: usize, tag: &str) -> StubBridge {
            self.fail.insert((server, tag.to_string()));
            self
        }
    }

    impl SqlBridge for StubBridge {
        fn open_connections(&self, _servers: &[ServerState]) {}

        fn close_connections(&self, _servers: &[ServerState]) {}

        fn custom_query(
            &self,
            server: usize,
            _query: &str,
            tag: &str,
            columns: Option<&[String]>,
        ) -> Result<QueryResult, SqlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.contains(&(server, tag.to_string())) {
                return Err(SqlError::Execution { tag: tag.to_string(), message: "boom".to_string() });
            }
            let names = columns
                .map(<[String]>::to_vec)
                .or_else(|| self.names.get(tag).cloned())
                .unwrap_or_default();
            let tuples = self
                .rows
                .get(&(server, tag.to_string()))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|cells| Tuple::new(server, cells))
                .collect();
            Ok(QueryResult { tag: tag.to_string(), names, tuples })
        }
    }

    fn live_server(name: &str, role: ServerRole, version: &str) -> ServerState {
        let server = ServerState::new(name);
        server.set_connected(true);
        server.set_role(role);
        server.set_version(Some(version.parse().expect("version")));
        server
    }

    fn render(
        config: &Config,
        metrics: &[MetricDefinition],
        servers: &[ServerState],
        bridge: &StubBridge,
    ) -> String {
        let mut out = String::new();
        write_metrics(&mut out, config, metrics, servers, bridge).expect("string sink");
        out
    }

    #[test]
    fn standard_metrics_for_one_live_primary() {
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        let bridge = StubBridge::default()
            .with_rows(0, "postgresql_version", &[&["14.2"]])
            .with_rows(0, "postgresql_uptime", &[&["3600"]])
            .with_rows(0, "postgresql_primary", &[&["t"]]);

        let out = render(&Config::default(), &[], &servers, &bridge);

        assert!(out.contains("pgexporter_state 1\n"));
        assert!(out.contains("pgexporter_postgresql_active{server=\"S1\"} 1\n"));
        assert!(out.contains("pgexporter_postgresql_version{server=\"S1\",version=\"14.2\"} 1\n"));
        assert!(out.contains("pgexporter_postgresql_uptime{server=\"S1\"} 3600\n"));
        assert!(out.contains("pgexporter_postgresql_primary{server=\"S1\"} 1\n"));

        // Exactly one HELP/TYPE pair precedes each family.
        for family in [
            "pgexporter_state",
            "pgexporter_version",
            "pgexporter_postgresql_active",
            "pgexporter_postgresql_version",
            "pgexporter_postgresql_uptime",
            "pgexporter_postgresql_primary",
        ] {
            assert_eq!(out.matches(&format!("#HELP {family} ")).count(), 1, "{family}");
            assert_eq!(out.matches(&format!("#TYPE {family} ")).count(), 1, "{family}");
        }
    }

    #[test]
    fn disconnected_server_reports_inactive_and_skips_queries() {
        let s1 = live_server("S1", ServerRole::Primary, "14.2");
        let s2 = ServerState::new("S2");
        let servers = [s1, s2];
        let bridge = StubBridge::default()
            .with_rows(0, "postgresql_version", &[&["14.2"]])
            .with_rows(0, "postgresql_uptime", &[&["1"]])
            .with_rows(0, "postgresql_primary", &[&["t"]]);

        let out = render(&Config::default(), &[], &servers, &bridge);

        assert!(out.contains("pgexporter_postgresql_active{server=\"S1\"} 1\n"));
        assert!(out.contains("pgexporter_postgresql_active{server=\"S2\"} 0\n"));
        assert!(!out.contains("pgexporter_postgresql_version{server=\"S2\""));
    }

    #[test]
    fn settings_coalesce_across_servers() {
        let servers = [
            live_server("S1", ServerRole::Primary, "14.2"),
            live_server("S2", ServerRole::Replica, "14.2"),
        ];
        let bridge = StubBridge::default()
            .with_rows(0, "postgresql_version", &[&["14.2"]])
            .with_rows(1, "postgresql_version", &[&["14.2"]])
            .with_rows(0, "pg_settings", &[&["work_mem", "4096", "Sets the working memory."]])
            .with_rows(1, "pg_settings", &[&["work_mem", "4096", "Sets the working memory."]]);

        let out = render(&Config::default(), &[], &servers, &bridge);

        assert_eq!(out.matches("#HELP pgexporter_pg_settings_work_mem ").count(), 1);
        let lines: Vec<&str> =
            out.lines().filter(|l| l.starts_with("pgexporter_pg_settings_work_mem{")).collect();
        assert_eq!(
            lines,
            vec![
                "pgexporter_pg_settings_work_mem{server=\"S1\"} 4096",
                "pgexporter_pg_settings_work_mem{server=\"S2\"} 4096",
            ],
            "same setting stays adjacent"
        );
    }

    const LOCKS_YAML: &str = r#"
metrics:
  - tag: locks
    collector: locks
    queries:
      - query: SELECT mode, count FROM locks
        version: "10"
        columns:
          - name: mode
            type: label
          - name: count
            type: gauge
            description: Lock count by mode
"#;

    #[test]
    fn custom_gauge_renders_labels_and_values() {
        let metrics = parse_metrics(LOCKS_YAML).expect("yaml");
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        let bridge = StubBridge::default()
            .with_rows(0, "locks", &[&["access.share", "12"], &["exclusive", "on"]]);

        let out = render(&Config::default(), &metrics, &servers, &bridge);

        assert!(out.contains("#HELP pgexporter_locks_count Lock count by mode\n"));
        assert!(out.contains("#TYPE pgexporter_locks_count gauge\n"));
        assert!(
            out.contains("pgexporter_locks_count{server=\"S1\",mode=\"access_share\"} 12\n"),
            "label values pass through safe_key: {out}"
        );
        assert!(out.contains("pgexporter_locks_count{server=\"S1\",mode=\"exclusive\"} 1\n"));
    }

    #[test]
    fn custom_metric_respects_collector_filter_and_scope() {
        let yaml = r#"
metrics:
  - tag: replica_lag
    collector: replication
    server: replica
    queries:
      - query: SELECT lag FROM lag
        version: "10"
        columns:
          - name: lag
            type: gauge
"#;
        let metrics = parse_metrics(yaml).expect("yaml");
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        let bridge = StubBridge::default().with_rows(0, "replica_lag", &[&["5"]]);

        // Primary-only fleet: the replica-scoped metric never runs.
        let out = render(&Config::default(), &metrics, &servers, &bridge);
        assert!(!out.contains("replica_lag"));

        // And a filtered-out collector never runs either.
        let mut config = Config::default();
        config.collectors = vec!["locks".to_string()];
        let out = render(&config, &metrics, &servers, &bridge);
        assert!(!out.contains("replica_lag"));
    }

    #[test]
    fn per_server_failure_drops_only_that_server() {
        let metrics = parse_metrics(LOCKS_YAML).expect("yaml");
        let servers = [
            live_server("S1", ServerRole::Primary, "14.2"),
            live_server("S2", ServerRole::Replica, "14.2"),
        ];
        let bridge = StubBridge::default()
            .failing(0, "locks")
            .with_rows(1, "locks", &[&["exclusive", "3"]]);

        let out = render(&Config::default(), &metrics, &servers, &bridge);

        assert!(!out.contains("server=\"S1\",mode"));
        assert!(out.contains("pgexporter_locks_count{server=\"S2\",mode=\"exclusive\"} 3\n"));
    }

    #[test]
    fn variant_lookup_skips_unsupported_servers() {
        let yaml = r#"
metrics:
  - tag: stat_io
    queries:
      - query: SELECT reads FROM pg_stat_io
        version: "16"
        columns:
          - name: reads
            type: counter
"#;
        let metrics = parse_metrics(yaml).expect("yaml");
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        let bridge = StubBridge::default().with_rows(0, "stat_io", &[&["100"]]);

        let out = render(&Config::default(), &metrics, &servers, &bridge);
        assert!(!out.contains("stat_io"), "no variant applies below version 16");
    }

    #[test]
    fn histogram_emits_bucket_sum_count_triad() {
        let yaml = r#"
metrics:
  - tag: query_time
    queries:
      - query: SELECT net, duration FROM timings
        version: "10"
        columns:
          - name: net
            type: label
          - name: duration
            type: histogram
            description: Query time
"#;
        let metrics = parse_metrics(yaml).expect("yaml");
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        let bridge = StubBridge::default()
            .with_names(
                "query_time",
                &["net", "duration", "duration_bucket", "duration_sum", "duration_count"],
            )
            .with_rows(
                0,
                "query_time",
                &[&["eth0", "{10,100,1000}", "{5,7,9}", "12345", "21"]],
            );

        let out = render(&Config::default(), &metrics, &servers, &bridge);

        assert!(out.contains("#HELP pgexporter_query_time Query time\n"));
        assert!(out.contains("#TYPE pgexporter_query_time histogram\n"));
        assert!(out.contains("pgexporter_query_time_bucket{le=\"10\",server=\"S1\",net=\"eth0\"} 5\n"));
        assert!(out.contains("pgexporter_query_time_bucket{le=\"100\",server=\"S1\",net=\"eth0\"} 7\n"));
        assert!(out.contains("pgexporter_query_time_bucket{le=\"1000\",server=\"S1\",net=\"eth0\"} 9\n"));
        assert!(out.contains("pgexporter_query_time_bucket{le=\"+Inf\",server=\"S1\",net=\"eth0\"} 21\n"));
        assert!(out.contains("pgexporter_query_time_sum{server=\"S1\",net=\"eth0\"} 12345\n"));
        assert!(out.contains("pgexporter_query_time_count{server=\"S1\",net=\"eth0\"} 21\n"));
        assert_eq!(out.matches("_bucket{").count(), 4);
    }

    #[test]
    fn histogram_with_mismatched_arrays_skips_tuple() {
        let yaml = r#"
metrics:
  - tag: query_time
    queries:
      - query: SELECT duration FROM timings
        version: "10"
        columns:
          - name: duration
            type: histogram
"#;
        let metrics = parse_metrics(yaml).expect("yaml");
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        let bridge = StubBridge::default()
            .with_names(
                "query_time",
                &["duration", "duration_bucket", "duration_sum", "duration_count"],
            )
            .with_rows(0, "query_time", &[&["{10,100}", "{5}", "1", "2"]]);

        let out = render(&Config::default(), &metrics, &servers, &bridge);
        assert!(!out.contains("_bucket{"), "mismatched tuple must be skipped");
    }

    #[test]
    fn extension_failure_latches_flag_off() {
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        servers[0].set_extension(true);
        let bridge = StubBridge::default().failing(0, "pgexporter_ext");

        let out = render(&Config::default(), &[], &servers, &bridge);

        assert!(!out.contains("pgexporter_ext"));
        assert!(!servers[0].has_extension(), "flag latches off after a failed enumeration");
    }

    #[test]
    fn extension_functions_render_rows_as_labels() {
        let servers = [live_server("S1", ServerRole::Primary, "14.2")];
        servers[0].set_extension(true);
        let bridge = StubBridge::default()
            .with_names("pgexporter_ext", &["name", "location"])
            .with_rows(
                0,
                "pgexporter_ext",
                &[
                    &["pgexporter_used_space", "f", "Used disk space", "gauge"],
                    &["pgexporter_get_functions", "f", "Functions", "gauge"],
                ],
            );

        let out = render(&Config::default(), &[], &servers, &bridge);

        // Both the enumeration row and each function share the tag, so the
        // canned rows double as the function's result set here.
        assert!(out.contains("#HELP pgexporter_used_space Used disk space\n"));
        assert!(out.contains("#TYPE pgexporter_used_space gauge\n"));
        assert!(out.contains("pgexporter_used_space{server=\"S1\",name=\"pgexporter_used_space\""));
        assert!(
            !out.contains("#HELP pgexporter_get_functions"),
            "the enumeration function itself is skipped"
        );
    }
}
