//! Path extension stage

use log::debug;
use uuid::Uuid;

use super::RequestStage;
use crate::api::{NetworkServiceRequest, PathSegment};
use crate::common::{ProxyError, Result};
use crate::tls::PeerInfo;

/// Append this hop's segment to the connection path
///
/// A request whose current or next segment already carries our name is a
/// refresh of a connection we joined earlier: the index moves onto that
/// segment and the path is left as is. The token itself is filled in by
/// [`UpdateToken`](super::UpdateToken).
pub struct UpdatePath {
    name: String,
}

impl UpdatePath {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl RequestStage for UpdatePath {
    fn name(&self) -> &'static str {
        "update-path"
    }

    fn on_request(&self, request: &mut NetworkServiceRequest, _peer: &PeerInfo) -> Result<()> {
        let connection = request.connection_mut();
        if connection.id.is_empty() {
            connection.id = Uuid::new_v4().to_string();
        }

        let path = &mut connection.path;
        let current_is_ours = path
            .path_segments
            .get(path.index as usize)
            .is_some_and(|segment| segment.name == self.name);
        let next = if path.is_empty() || current_is_ours {
            path.index as usize
        } else {
            path.index as usize + 1
        };

        match path.path_segments.get(next) {
            Some(segment) if segment.name == self.name => {
                debug!("Refreshing path segment {} of {}", next, self.name);
            }
            Some(segment) => {
                return Err(ProxyError::Protocol(format!(
                    "path segment {} belongs to '{}', expected '{}'",
                    next, segment.name, self.name
                )));
            }
            None => {
                if next > path.path_segments.len() {
                    return Err(ProxyError::Protocol(format!(
                        "path index {} is out of range for {} segment(s)",
                        path.index,
                        path.path_segments.len()
                    )));
                }
                path.path_segments.push(PathSegment {
                    name: self.name.clone(),
                    id: connection.id.clone(),
                    token: String::new(),
                    expires: chrono::Utc::now(),
                });
            }
        }

        path.index = u32::try_from(next)
            .map_err(|_| ProxyError::Protocol(format!("path too long: {} segments", next)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(names: &[&str], index: u32) -> NetworkServiceRequest {
        let mut request = NetworkServiceRequest::default();
        let connection = request.connection_mut();
        connection.id = "conn-1".to_string();
        connection.path.index = index;
        for name in names {
            connection.path.path_segments.push(PathSegment {
                name: name.to_string(),
                id: String::new(),
                token: format!("token-{}", name),
                expires: chrono::Utc::now(),
            });
        }
        request
    }

    #[test]
    fn test_empty_path_gets_first_segment() {
        let mut request = NetworkServiceRequest::default();
        UpdatePath::new("proxy-nsc")
            .on_request(&mut request, &PeerInfo::default())
            .unwrap();

        let connection = request.connection.unwrap();
        assert!(!connection.id.is_empty());
        assert_eq!(connection.path.index, 0);
        assert_eq!(connection.path.len(), 1);
        assert_eq!(connection.path.path_segments[0].name, "proxy-nsc");
        assert_eq!(connection.path.path_segments[0].id, connection.id);
    }

    #[test]
    fn test_appends_after_caller() {
        let mut request = request_with(&["nsc"], 0);
        UpdatePath::new("proxy-nsc")
            .on_request(&mut request, &PeerInfo::default())
            .unwrap();

        let path = &request.connection.unwrap().path;
        assert_eq!(path.index, 1);
        assert_eq!(path.len(), 2);
        assert_eq!(path.path_segments[1].name, "proxy-nsc");
    }

    #[test]
    fn test_refresh_reuses_own_segment() {
        let mut request = request_with(&["nsc", "proxy-nsc", "nse"], 0);
        UpdatePath::new("proxy-nsc")
            .on_request(&mut request, &PeerInfo::default())
            .unwrap();

        let path = &request.connection.unwrap().path;
        assert_eq!(path.index, 1);
        assert_eq!(path.len(), 3);
        assert_eq!(path.path_segments[1].token, "token-proxy-nsc");
    }

    #[test]
    fn test_refresh_without_caller_keeps_single_segment() {
        let mut request = request_with(&["proxy-nsc"], 0);
        UpdatePath::new("proxy-nsc")
            .on_request(&mut request, &PeerInfo::default())
            .unwrap();

        let path = &request.connection.unwrap().path;
        assert_eq!(path.index, 0);
        assert_eq!(path.len(), 1);
        assert_eq!(path.path_segments[0].token, "token-proxy-nsc");
    }

    #[test]
    fn test_foreign_next_segment_is_rejected() {
        let mut request = request_with(&["nsc", "other"], 0);
        let result = UpdatePath::new("proxy-nsc").on_request(&mut request, &PeerInfo::default());
        assert!(matches!(result, Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_index_out_of_range_is_rejected() {
        let mut request = request_with(&["nsc"], 4);
        let result = UpdatePath::new("proxy-nsc").on_request(&mut request, &PeerInfo::default());
        assert!(matches!(result, Err(ProxyError::Protocol(_))));
    }
}
