//! PostgreSQL server and extension version handling.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The version string could not be parsed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid version string: {0:?}")]
pub struct InvalidVersion(pub String);

/// A PostgreSQL server or extension version.
///
/// Query alternatives are authored against versions such as `10`, `14.2` or
/// `0.2.1`; servers report strings such as `14.2 (Debian 14.2-1.pgdg110+1)`.
/// Parsing keeps the leading numeric components and ignores any build
/// decoration, so `14beta1` compares as `14`.  Absent components compare as
/// zero, making `14` and `14.0` equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major component.
    pub major: u32,
    /// Minor component, if present.
    pub minor: Option<u32>,
    /// Patch component, if present.
    pub patch: Option<u32>,
}

impl Version {
    /// Creates a version from explicit components.
    pub fn new(major: u32, minor: Option<u32>, patch: Option<u32>) -> Version {
        Version { major, minor, patch }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Version) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.unwrap_or(0).cmp(&other.minor.unwrap_or(0)))
            .then_with(|| self.patch.unwrap_or(0).cmp(&other.patch.unwrap_or(0)))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Version) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{minor}")?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{patch}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Version, InvalidVersion> {
        // Keep the first whitespace-separated token, e.g. from
        // `14.2 (Debian 14.2-1.pgdg110+1)`.
        let token = s.trim().split_whitespace().next().unwrap_or("");

        let mut components = token.split('.').map(leading_number);
        let major = components
            .next()
            .flatten()
            .ok_or_else(|| InvalidVersion(s.to_string()))?;
        let minor = components.next().flatten();
        let patch = components.next().flatten();

        Ok(Version { major, minor, patch })
    }
}

/// Parses the leading ASCII digits of a component, so `2-1` or `24beta` yield
/// their numeric prefix.
fn leading_number(component: &str) -> Option<u32> {
    let digits: &str = component
        .split_once(|c: char| !c.is_ascii_digit())
        .map_or(component, |(digits, _)| digits);
    digits.parse().ok()
}
