//! The SQL collaborator boundary.
//!
//! The rendering core does not speak the PostgreSQL protocol itself; it asks a
//! [`SqlBridge`] to run queries and hand back rows of text cells.  The shipped
//! implementation lives in [`crate::bridge`]; tests substitute their own.

use thiserror::Error;

use crate::config::SortKind;
use crate::server::ServerState;

/// Error from the SQL collaborator.
#[derive(Debug, Error)]
pub enum SqlError {
    /// No live connection for the server index.
    #[error("server {server} is not connected")]
    NotConnected {
        /// Server index.
        server: usize,
    },

    /// The query failed server-side or on the wire.
    #[error("query {tag:?} failed: {message}")]
    Execution {
        /// Metric tag the query was issued for.
        tag: String,
        /// Driver-reported failure.
        message: String,
    },
}

/// One result row: text cells plus the originating server index.
#[derive(Clone, Debug)]
pub struct Tuple {
    /// Index of the server that produced the row.
    pub server: usize,
    cells: Vec<Option<String>>,
}

impl Tuple {
    /// Creates a row from its server index and cells (`None` = SQL NULL).
    pub fn new(server: usize, cells: Vec<Option<String>>) -> Tuple {
        Tuple { server, cells }
    }

    /// The cell at `index`; NULL and out-of-range cells read as `""`.
    pub fn cell(&self, index: usize) -> &str {
        self.cells.get(index).and_then(Option::as_deref).unwrap_or("")
    }
}

/// A query result: a shared column header plus rows.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    /// Metric tag the query was issued for.
    pub tag: String,
    /// Column names, either as declared or as reported by the server.
    pub names: Vec<String>,
    /// Result rows, each tagged with its server index.
    pub tuples: Vec<Tuple>,
}

impl QueryResult {
    /// Index of the column called `name`, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Executes SQL against the configured servers.
///
/// `open_connections` refreshes each server's liveness, role, version and
/// extension state; the core calls it at the start of a cache-miss scrape and
/// pairs it with `close_connections` at the end.
pub trait SqlBridge: Send + Sync {
    /// Establishes connections and refreshes the servers' observed state.
    fn open_connections(&self, servers: &[ServerState]);

    /// Tears down connections established by `open_connections`.
    fn close_connections(&self, servers: &[ServerState]);

    /// Executes `query` against the server at `server`, returning rows as
    /// text cells.
    ///
    /// `columns` supplies the declared column names; pass `None` for
    /// histogram variants, whose columns are addressed positionally by the
    /// names the server reports.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] when the server is not connected or the query
    /// fails; the caller drops that server's entry and carries on.
    fn custom_query(
        &self,
        server: usize,
        query: &str,
        tag: &str,
        columns: Option<&[String]>,
    ) -> Result<QueryResult, SqlError>;
}

/// Merges a per-server result into the running merged result, keeping a
/// stable order: by server name for same-named results, or by the tuples'
/// first-column key so identical settings across servers coalesce.
pub fn merge_results(
    all: Option<QueryResult>,
    incoming: QueryResult,
    sort: SortKind,
    servers: &[ServerState],
) -> QueryResult {
    let Some(mut all) = all else {
        return incoming;
    };

    let key = |tuple: &Tuple| -> String {
        match sort {
            SortKind::ByName => servers
                .get(tuple.server)
                .map(|s| s.name().to_string())
                .unwrap_or_default(),
            SortKind::ByFirstColumn => tuple.cell(0).to_string(),
        }
    };

    // Both sides are ordered already; a stable merge keeps equal keys in
    // first-operand-then-incoming order.
    let mut merged = Vec::with_capacity(all.tuples.len() + incoming.tuples.len());
    let mut left = std::mem::take(&mut all.tuples).into_iter().peekable();
    let mut right = incoming.tuples.into_iter().peekable();

    loop {
        match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => {
                if key(r) < key(l) {
                    merged.extend(right.next());
                } else {
                    merged.extend(left.next());
                }
            }
            (Some(_), None) => merged.extend(left.next()),
            (None, Some(_)) => merged.extend(right.next()),
            (None, None) => break,
        }
    }

    all.tuples = merged;
    if all.names.is_empty() {
        all.names = incoming.names;
    }
    all
}
