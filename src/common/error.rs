//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// NSC proxy error type
///
/// The first seven variants form the taxonomy the proxy reports to its owner;
/// the rest wrap lower level failures before they are classified.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// Configuration is malformed (fatal, before start)
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// No valid workload identity could be fetched
    #[error("Workload identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// The local listen address could not be bound
    #[error("Bind error: {0}")]
    BindError(String),

    /// Transport failure towards the upstream mesh endpoint
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The upstream authorization chain rejected the request
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// A token could not be minted or renewed before use
    #[error("Token expired: {0}")]
    TokenExpired(String),

    /// Tearing down an upstream connection failed
    #[error("Close failed: {0}")]
    CloseFailed(String),

    /// Malformed frame or unexpected message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The owning context was cancelled or its deadline passed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The session is in a terminal state and refuses further requests
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Protocol(err.to_string())
    }
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Wire-level discriminant of a [`ProxyError`]
///
/// Errors cross the local and upstream transports as `{kind, message}` pairs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    IdentityUnavailable,
    BindError,
    UpstreamUnreachable,
    AuthorizationDenied,
    TokenExpired,
    CloseFailed,
    Protocol,
    Cancelled,
    SessionFailed,
    Io,
    Ssl,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigInvalid => "config_invalid",
            Self::IdentityUnavailable => "identity_unavailable",
            Self::BindError => "bind_error",
            Self::UpstreamUnreachable => "upstream_unreachable",
            Self::AuthorizationDenied => "authorization_denied",
            Self::TokenExpired => "token_expired",
            Self::CloseFailed => "close_failed",
            Self::Protocol => "protocol",
            Self::Cancelled => "cancelled",
            Self::SessionFailed => "session_failed",
            Self::Io => "io",
            Self::Ssl => "ssl",
        };
        f.write_str(name)
    }
}

impl ProxyError {
    /// Get the wire discriminant of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            Self::IdentityUnavailable(_) => ErrorKind::IdentityUnavailable,
            Self::BindError(_) => ErrorKind::BindError,
            Self::UpstreamUnreachable(_) => ErrorKind::UpstreamUnreachable,
            Self::AuthorizationDenied(_) => ErrorKind::AuthorizationDenied,
            Self::TokenExpired(_) => ErrorKind::TokenExpired,
            Self::CloseFailed(_) => ErrorKind::CloseFailed,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::SessionFailed(_) => ErrorKind::SessionFailed,
            Self::Io(_) => ErrorKind::Io,
            Self::Ssl(_) => ErrorKind::Ssl,
        }
    }

    /// Message without the display prefix, as carried on the wire
    pub fn message(&self) -> String {
        match self {
            Self::ConfigInvalid(m)
            | Self::IdentityUnavailable(m)
            | Self::BindError(m)
            | Self::UpstreamUnreachable(m)
            | Self::AuthorizationDenied(m)
            | Self::TokenExpired(m)
            | Self::CloseFailed(m)
            | Self::Protocol(m)
            | Self::Cancelled(m)
            | Self::SessionFailed(m) => m.clone(),
            Self::Io(e) => e.to_string(),
            Self::Ssl(e) => e.to_string(),
        }
    }

    /// Rebuild an error received from a peer
    ///
    /// IO and OpenSSL failures of the remote side cannot be reconstructed and
    /// are reported as protocol errors carrying the remote message.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::ConfigInvalid => Self::ConfigInvalid(message),
            ErrorKind::IdentityUnavailable => Self::IdentityUnavailable(message),
            ErrorKind::BindError => Self::BindError(message),
            ErrorKind::UpstreamUnreachable => Self::UpstreamUnreachable(message),
            ErrorKind::AuthorizationDenied => Self::AuthorizationDenied(message),
            ErrorKind::TokenExpired => Self::TokenExpired(message),
            ErrorKind::CloseFailed => Self::CloseFailed(message),
            ErrorKind::Protocol => Self::Protocol(message),
            ErrorKind::Cancelled => Self::Cancelled(message),
            ErrorKind::SessionFailed => Self::SessionFailed(message),
            ErrorKind::Io | ErrorKind::Ssl => Self::Protocol(format!("remote {} error: {}", kind, message)),
        }
    }

    /// Whether the failed operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnreachable(_) | Self::TokenExpired(_) | Self::IdentityUnavailable(_) | Self::Io(_)
        )
    }

    /// Classify a transport level failure towards the upstream
    pub(crate) fn upstream(self) -> Self {
        match self {
            Self::Io(e) => Self::UpstreamUnreachable(e.to_string()),
            Self::Ssl(e) => Self::UpstreamUnreachable(format!("TLS failure: {}", e)),
            other => other,
        }
    }
}
