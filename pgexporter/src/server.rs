//! Per-server runtime state.
//!
//! Liveness, role, versions and the extension flag are refreshed by the SQL
//! collaborator between scrapes.  The rendering core treats them as a stable
//! snapshot for the duration of one scrape and tolerates benign races: a
//! server observed live whose connection then drops simply fails its queries
//! and is skipped.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::version::Version;

/// Replication role of a server, as last observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerRole {
    /// Role not yet determined.
    #[default]
    Unknown,
    /// The server is a primary.
    Primary,
    /// The server is a replica.
    Replica,
}

impl ServerRole {
    fn from_u8(raw: u8) -> ServerRole {
        match raw {
            1 => ServerRole::Primary,
            2 => ServerRole::Replica,
            _ => ServerRole::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServerRole::Unknown => 0,
            ServerRole::Primary => 1,
            ServerRole::Replica => 2,
        }
    }
}

/// Runtime state of one configured server.
#[derive(Debug)]
pub struct ServerState {
    name: String,
    connected: AtomicBool,
    role: AtomicU8,
    extension: AtomicBool,
    version: RwLock<Option<Version>>,
    extension_version: RwLock<Option<Version>>,
}

impl ServerState {
    /// Creates the state for a named server; not connected, role unknown.
    pub fn new(name: impl Into<String>) -> ServerState {
        ServerState {
            name: name.into(),
            connected: AtomicBool::new(false),
            role: AtomicU8::new(ServerRole::Unknown.as_u8()),
            extension: AtomicBool::new(false),
            version: RwLock::new(None),
            extension_version: RwLock::new(None),
        }
    }

    /// The server name, used as the `server` label value.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a connection to the server is currently live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Marks the connection live or dead.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// The last observed replication role.
    pub fn role(&self) -> ServerRole {
        ServerRole::from_u8(self.role.load(Ordering::Acquire))
    }

    /// Records the replication role.
    pub fn set_role(&self, role: ServerRole) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    /// Whether the `pgexporter_ext` extension is usable on this server.
    ///
    /// The flag latches off on the first failed extension query and is not
    /// re-enabled until restart.
    pub fn has_extension(&self) -> bool {
        self.extension.load(Ordering::Acquire)
    }

    /// Sets or latches off the extension flag.
    pub fn set_extension(&self, usable: bool) {
        self.extension.store(usable, Ordering::Release);
    }

    /// The last observed server version.
    pub fn version(&self) -> Option<Version> {
        *self.version.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the server version.
    pub fn set_version(&self, version: Option<Version>) {
        *self.version.write().unwrap_or_else(PoisonError::into_inner) = version;
    }

    /// The last observed extension version.
    pub fn extension_version(&self) -> Option<Version> {
        *self.extension_version.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the extension version.
    pub fn set_extension_version(&self, version: Option<Version>) {
        *self.extension_version.write().unwrap_or_else(PoisonError::into_inner) = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected_with_unknown_role() {
        let server = ServerState::new("primary");
        assert_eq!(server.name(), "primary");
        assert!(!server.is_connected());
        assert_eq!(server.role(), ServerRole::Unknown);
        assert!(!server.has_extension());
        assert!(server.version().is_none());
    }

    #[test]
    fn tracks_observed_state() {
        let server = ServerState::new("replica-1");
        server.set_connected(true);
        server.set_role(ServerRole::Replica);
        server.set_version(Some("14.2".parse().expect("version")));

        assert!(server.is_connected());
        assert_eq!(server.role(), ServerRole::Replica);
        assert_eq!(server.version().expect("set above").to_string(), "14.2");
    }
}
