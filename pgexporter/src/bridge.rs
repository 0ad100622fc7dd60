//! Blocking PostgreSQL implementation of the SQL collaborator.
//!
//! One connection per configured server, opened at the start of a cache-miss
//! scrape and closed at the end.  Queries run in text mode (`simple_query`)
//! so every cell arrives as a string, which is what the rendering core wants.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use postgres::{Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::server::{ServerRole, ServerState};
use crate::sql::{QueryResult, SqlBridge, SqlError, Tuple};
use crate::version::Version;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SERVER_VERSION_SQL: &str = "SHOW server_version;";
const IN_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery();";
const EXTENSION_VERSION_SQL: &str =
    "SELECT extversion FROM pg_extension WHERE extname = 'pgexporter_ext';";

/// [`SqlBridge`] backed by one blocking connection per configured server.
pub struct PostgresBridge {
    endpoints: Vec<ServerConfig>,
    clients: Mutex<Vec<Option<Client>>>,
}

impl PostgresBridge {
    /// Creates the bridge for the configured endpoints; nothing connects
    /// until [`SqlBridge::open_connections`].
    pub fn new(endpoints: &[ServerConfig]) -> PostgresBridge {
        PostgresBridge {
            endpoints: endpoints.to_vec(),
            clients: Mutex::new(endpoints.iter().map(|_| None).collect()),
        }
    }

    fn connect(endpoint: &ServerConfig) -> Result<Client, postgres::Error> {
        let mut config = postgres::Config::new();
        config
            .host(&endpoint.host)
            .port(endpoint.port)
            .user(&endpoint.user)
            .dbname(&endpoint.database)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(password) = &endpoint.password {
            config.password(password);
        }
        config.connect(NoTls)
    }

    /// Refreshes the observed version, role and extension state over a fresh
    /// connection.  Individual probe failures leave that attribute unknown.
    fn refresh(client: &mut Client, server: &ServerState) {
        match scalar(client, SERVER_VERSION_SQL) {
            Ok(raw) => server.set_version(parse_version(raw.as_deref())),
            Err(error) => {
                debug!(server = server.name(), %error, "server version probe failed");
                server.set_version(None);
            }
        }

        match scalar(client, IN_RECOVERY_SQL) {
            Ok(raw) => server.set_role(match raw.as_deref() {
                Some("t") => ServerRole::Replica,
                Some("f") => ServerRole::Primary,
                _ => ServerRole::Unknown,
            }),
            Err(error) => {
                debug!(server = server.name(), %error, "recovery probe failed");
                server.set_role(ServerRole::Unknown);
            }
        }

        // The extension flag only latches off once set; see DESIGN.md.
        match scalar(client, EXTENSION_VERSION_SQL) {
            Ok(Some(raw)) => {
                server.set_extension_version(parse_version(Some(&raw)));
                server.set_extension(server.extension_version().is_some());
            }
            Ok(None) => server.set_extension(false),
            Err(error) => {
                debug!(server = server.name(), %error, "extension probe failed");
                server.set_extension(false);
            }
        }
    }
}

fn parse_version(raw: Option<&str>) -> Option<Version> {
    raw.and_then(|value| value.parse().ok())
}

/// Runs a single-row, single-column query; `Ok(None)` when no row came back.
fn scalar(client: &mut Client, sql: &str) -> Result<Option<String>, postgres::Error> {
    for message in client.simple_query(sql)? {
        if let SimpleQueryMessage::Row(row) = message {
            return Ok(row.try_get(0).ok().flatten().map(str::to_string));
        }
    }
    Ok(None)
}

impl SqlBridge for PostgresBridge {
    fn open_connections(&self, servers: &[ServerState]) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, endpoint) in self.endpoints.iter().enumerate() {
            let Some(server) = servers.get(index) else {
                break;
            };
            match PostgresBridge::connect(endpoint) {
                Ok(mut client) => {
                    PostgresBridge::refresh(&mut client, server);
                    server.set_connected(true);
                    clients[index] = Some(client);
                }
                Err(error) => {
                    warn!(server = %endpoint.name, %error, "connection failed");
                    server.set_connected(false);
                    clients[index] = None;
                }
            }
        }
    }

    fn close_connections(&self, servers: &[ServerState]) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, client) in clients.iter_mut().enumerate() {
            *client = None;
            if let Some(server) = servers.get(index) {
                server.set_connected(false);
            }
        }
    }

    fn custom_query(
        &self,
        server: usize,
        query: &str,
        tag: &str,
        columns: Option<&[String]>,
    ) -> Result<QueryResult, SqlError> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let client = clients
            .get_mut(server)
            .and_then(Option::as_mut)
            .ok_or(SqlError::NotConnected { server })?;

        let messages = client.simple_query(query).map_err(|error| SqlError::Execution {
            tag: tag.to_string(),
            message: error.to_string(),
        })?;

        let mut names: Vec<String> = columns.map(<[String]>::to_vec).unwrap_or_default();
        let mut tuples = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                if names.is_empty() {
                    names = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                let cells = (0..row.len())
                    .map(|index| row.try_get(index).ok().flatten().map(str::to_string))
                    .collect();
                tuples.push(Tuple::new(server, cells));
            }
        }

        Ok(QueryResult { tag: tag.to_string(), names, tuples })
    }
}
