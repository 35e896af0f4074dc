//! Version- and topology-aware filtering of class attributes for completion.

use semver::Version;
use serde::{Deserialize, Serialize};

use super::registry::SignatureRegistry;
use super::signature::{Topology, TypeSignature};
use crate::session::ApiVersionInfo;

/// What is known about the current connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Server version as reported by the server, e.g. `"6.0.3"`.
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub topology: Option<Topology>,
    #[serde(default)]
    pub api_version: Option<ApiVersionInfo>,
}

impl ConnectionInfo {
    pub fn new(server_version: impl Into<String>, topology: Topology) -> Self {
        Self {
            server_version: Some(server_version.into()),
            topology: Some(topology),
            api_version: None,
        }
    }

    pub fn with_api_version(mut self, version: u32, strict: bool) -> Self {
        self.api_version = Some(ApiVersionInfo { version, strict });
        self
    }
}

/// Parse a server version leniently: `"4.4"` reads as `4.4.0`, and
/// pre-release suffixes such as `"7.0.0-rc1"` are kept.
fn parse_version(raw: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let (numbers, rest) = match raw.find('-') {
        Some(i) => (&raw[..i], &raw[i..]),
        None => (raw, ""),
    };
    let mut parts: Vec<&str> = numbers.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&format!("{}{}", parts[..3].join("."), rest)).ok()
}

/// Whether one attribute is offered on this connection.
pub fn is_acceptable(sig: &TypeSignature, conn: &ConnectionInfo) -> bool {
    if sig.deprecated {
        return false;
    }
    let version_ok = match &conn.api_version {
        Some(api) if api.strict => sig.api_versions.contains(api.version),
        _ => {
            let Some(server) = conn.server_version.as_deref().and_then(parse_version) else {
                return true;
            };
            match (
                parse_version(&sig.server_versions.min),
                parse_version(&sig.server_versions.max),
            ) {
                (Some(min), Some(max)) => server >= min && server <= max,
                _ => {
                    log::warn!("unparsable server version range on {}", sig.name);
                    true
                }
            }
        }
    };
    let topology_ok = conn
        .topology
        .map_or(true, |t| sig.topologies.contains(&t));
    version_ok && topology_ok
}

impl SignatureRegistry {
    /// Attribute names of `class` starting with `prefix` (case-insensitive)
    /// that are usable on `conn`, sorted.
    pub fn completions(&self, class: &str, prefix: &str, conn: &ConnectionInfo) -> Vec<String> {
        let Some(sig) = self.resolve(class) else {
            return Vec::new();
        };
        let prefix = prefix.to_lowercase();
        sig.attributes
            .iter()
            .filter(|(name, _)| name.to_lowercase().starts_with(&prefix))
            .filter(|(_, attr)| is_acceptable(attr, conn))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::registry::signatures;

    #[test]
    fn test_prefix_is_case_insensitive() {
        let reg = signatures();
        let conn = ConnectionInfo::new("6.0.0", Topology::ReplSet);
        let hits = reg.completions("Cursor", "MAX", &conn);
        assert_eq!(hits, vec!["max", "maxAwaitTimeMS", "maxTimeMS"]);
    }

    #[test]
    fn test_server_version_gating() {
        let reg = signatures();
        let old = ConnectionInfo::new("3.0.0", Topology::Standalone);
        let hits = reg.completions("Cursor", "co", &old);
        assert_eq!(hits, vec!["count"]);

        let newer = ConnectionInfo::new("3.6", Topology::Standalone);
        let hits = reg.completions("Cursor", "co", &newer);
        assert_eq!(hits, vec!["collation", "comment", "count"]);
    }

    #[test]
    fn test_deprecated_excluded() {
        let reg = signatures();
        let conn = ConnectionInfo::default();
        assert!(reg.completions("Cursor", "oplog", &conn).is_empty());
        assert!(reg.completions("ChangeStreamCursor", "hasN", &conn).is_empty());
    }

    #[test]
    fn test_topology_gating() {
        let reg = signatures();
        let standalone = ConnectionInfo::new("6.0.0", Topology::Standalone);
        assert!(reg.completions("Collection", "wat", &standalone).is_empty());
        let sharded = ConnectionInfo::new("6.0.0", Topology::Sharded);
        assert_eq!(reg.completions("Collection", "wat", &sharded), vec!["watch"]);
    }

    #[test]
    fn test_strict_api_version_ignores_server_version() {
        let reg = signatures();
        let strict = ConnectionInfo::new("2.0.0", Topology::ReplSet).with_api_version(1, true);
        assert_eq!(
            reg.completions("Database", "runC", &strict),
            vec!["runCommand", "runCursorCommand"]
        );
        let lax = ConnectionInfo::new("2.0.0", Topology::ReplSet).with_api_version(1, false);
        assert!(reg.completions("Database", "wat", &lax).is_empty());
    }

    #[test]
    fn test_unknown_class() {
        let reg = signatures();
        assert!(reg.completions("Nope", "", &ConnectionInfo::default()).is_empty());
    }

    #[test]
    fn test_parse_version_lenient() {
        assert_eq!(parse_version("4.4"), Some(Version::new(4, 4, 0)));
        assert!(parse_version("7.0.0-rc1").is_some());
        assert!(parse_version("banana").is_none());
    }
}
