//! Mesh API types
//!
//! The request and connection shapes exchanged with local callers and with
//! the upstream mesh endpoint, and the frame codec that carries them.

pub mod codec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub use codec::{Frame, FrameStream};

/// One hop's identity and token record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathSegment {
    /// Name of the hop that added this segment
    pub name: String,
    /// Connection id as seen by this hop
    #[serde(default)]
    pub id: String,
    /// Identity-bound token proving the hop's authenticity
    pub token: String,
    /// Token expiry
    pub expires: DateTime<Utc>,
}

/// Ordered chain of path segments
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Path {
    /// Position of the current hop in `path_segments`
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub path_segments: Vec<PathSegment>,
}

impl Path {
    /// Segment at the current index
    pub fn current(&self) -> Option<&PathSegment> {
        self.path_segments.get(self.index as usize)
    }

    /// Mutable segment at the current index
    pub fn current_mut(&mut self) -> Option<&mut PathSegment> {
        self.path_segments.get_mut(self.index as usize)
    }

    pub fn len(&self) -> usize {
        self.path_segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.path_segments.is_empty()
    }

    /// Whether no two segments share a token
    pub fn has_unique_tokens(&self) -> bool {
        let mut seen = HashSet::with_capacity(self.path_segments.len());
        self.path_segments.iter().all(|s| seen.insert(s.token.as_str()))
    }

    /// Earliest expiry across all segments
    pub fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.path_segments.iter().map(|s| s.expires).min()
    }
}

/// Connection state as reported by the mesh
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Down,
    Up,
}

/// Mesh-assigned session state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub network_service: String,
    #[serde(default)]
    pub path: Path,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub state: State,
}

/// Request for a network service connection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkServiceRequest {
    /// Connection to establish or refresh; may already carry a partial path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
}

impl NetworkServiceRequest {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    /// Connection of this request, created empty if missing
    pub fn connection_mut(&mut self) -> &mut Connection {
        self.connection.get_or_insert_with(Connection::default)
    }

    /// Number of path segments supplied by the caller
    pub fn path_len(&self) -> usize {
        self.connection.as_ref().map_or(0, |c| c.path.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn segment(name: &str, token: &str) -> PathSegment {
        PathSegment {
            name: name.to_string(),
            id: String::new(),
            token: token.to_string(),
            expires: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_unique_tokens() {
        let mut path = Path {
            index: 0,
            path_segments: vec![segment("nsc", "a"), segment("proxy", "b")],
        };
        assert!(path.has_unique_tokens());

        path.path_segments.push(segment("nsmgr", "a"));
        assert!(!path.has_unique_tokens());
    }

    #[test]
    fn test_current_segment() {
        let path = Path {
            index: 1,
            path_segments: vec![segment("nsc", "a"), segment("proxy", "b")],
        };
        assert_eq!(path.current().unwrap().name, "proxy");
        assert!(Path::default().current().is_none());
    }

    #[test]
    fn test_empty_request_decodes() {
        let request: NetworkServiceRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.path_len(), 0);

        let request: NetworkServiceRequest =
            serde_json::from_str(r#"{"connection":{"id":"c1"}}"#).unwrap();
        let connection = request.connection.unwrap();
        assert_eq!(connection.id, "c1");
        assert_eq!(connection.state, State::Down);
        assert!(connection.path.is_empty());
    }
}
