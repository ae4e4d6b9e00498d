//! Error types for Redis operations

use std::io;
use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Coarse classification of a [`RedisError`].
///
/// Callers that only care about how to react (retry, reconnect, give up)
/// can match on this instead of the individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed frame; the connection that produced it is unusable
    Protocol,
    /// Socket closed, refused or timed out
    Connection,
    /// `-ERR`-class reply; the connection stays usable
    Server,
    /// `MOVED`, `ASK`, `CLUSTERDOWN` or `TRYAGAIN`
    Redirection,
    /// The server refused to run a queued transaction
    TransactionAbort,
    /// A RESP3-unstable command was invoked without opting in
    UnstableCommand,
    /// Anything raised locally: bad configuration, type conversion, closed client
    Client,
}

/// Comprehensive error type for Redis operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error
    #[error("Server error: {0}")]
    Server(String),

    /// MOVED redirect in cluster mode
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK redirect: slot {slot} to {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// The cluster cannot serve the request right now
    #[error("Cluster down: {0}")]
    ClusterDown(String),

    /// A multi-key request hit a slot that is being migrated
    #[error("Try again: {0}")]
    TryAgain(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// The connection or client was closed while the request was pending
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Cluster error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server refused to execute a queued transaction
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// A command with an unstable RESP3 reply shape was called without opting in
    #[error(
        "{0} has an unstable RESP3 reply shape; set `unstable_resp3` to use it with RESP3"
    )]
    UnstableCommand(String),

    /// Maximum retry attempts exceeded
    #[error("Maximum retry attempts ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RedisError {
    /// Build the error for a `-` reply, recognising the cluster and auth prefixes.
    #[must_use]
    pub fn from_server_message(msg: &str) -> Self {
        if let Some(redirect) = Self::parse_redirect(msg) {
            return redirect;
        }
        let code = msg.split_whitespace().next().unwrap_or_default();
        match code {
            "CLUSTERDOWN" => Self::ClusterDown(msg.to_string()),
            "TRYAGAIN" => Self::TryAgain(msg.to_string()),
            "NOAUTH" | "WRONGPASS" => Self::Auth(msg.to_string()),
            "EXECABORT" => Self::TransactionAborted(msg.to_string()),
            _ => Self::Server(msg.to_string()),
        }
    }

    /// Parse a Redis error message to check for MOVED or ASK redirects
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let (is_ask, rest) = if let Some(rest) = msg.strip_prefix("MOVED ") {
            (false, rest)
        } else if let Some(rest) = msg.strip_prefix("ASK ") {
            (true, rest)
        } else {
            return None;
        };

        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        let host = host.to_string();

        Some(if is_ask {
            Self::Ask { slot, host, port }
        } else {
            Self::Moved { slot, host, port }
        })
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Io(_) | Self::Connection(_) | Self::Timeout | Self::Closed(_) => {
                ErrorKind::Connection
            }
            Self::Server(_) | Self::Auth(_) | Self::UnexpectedResponse(_) => ErrorKind::Server,
            Self::Moved { .. } | Self::Ask { .. } | Self::ClusterDown(_) | Self::TryAgain(_) => {
                ErrorKind::Redirection
            }
            Self::TransactionAborted(_) => ErrorKind::TransactionAbort,
            Self::UnstableCommand(_) => ErrorKind::UnstableCommand,
            Self::Type(_) | Self::Config(_) | Self::Cluster(_) | Self::MaxRetriesExceeded(_) => {
                ErrorKind::Client
            }
        }
    }

    /// Check if this error is a redirect (MOVED or ASK)
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// Whether the connection that produced this error must be torn down
    #[must_use]
    pub const fn is_fatal_for_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Connection)
    }

    /// Whether a cluster client should refresh its slot map after this error
    #[must_use]
    pub const fn needs_topology_refresh(&self) -> bool {
        matches!(
            self,
            Self::Moved { .. } | Self::ClusterDown(_) | Self::Io(_) | Self::Connection(_)
        )
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    #[must_use]
    pub const fn redirect_slot(&self) -> Option<u16> {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}
