//! Errors reported by the broker/transport for a peer identity.
//!
//! The broker reports errors as a type string.  Nine of them mean the identity is dead
//! and has to be torn down and recreated; everything else is informational.
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, error::Error, fmt, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PeerErrorKind {
    InvalidId,
    InvalidKey,
    Network,
    SslUnavailable,
    ServerError,
    SocketError,
    SocketClosed,
    UnavailableId,
    Webrtc,
    /// any other type string, kept verbatim (e.g. "peer-unavailable")
    Other(String),
}

impl PeerErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            PeerErrorKind::InvalidId => "invalid-id",
            PeerErrorKind::InvalidKey => "invalid-key",
            PeerErrorKind::Network => "network",
            PeerErrorKind::SslUnavailable => "ssl-unavailable",
            PeerErrorKind::ServerError => "server-error",
            PeerErrorKind::SocketError => "socket-error",
            PeerErrorKind::SocketClosed => "socket-closed",
            PeerErrorKind::UnavailableId => "unavailable-id",
            PeerErrorKind::Webrtc => "webrtc",
            PeerErrorKind::Other(s) => s.as_str(),
        }
    }

    /// fatal errors destroy the identity
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerErrorKind::Other(_))
    }
}

impl FromStr for PeerErrorKind {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "invalid-id" => PeerErrorKind::InvalidId,
            "invalid-key" => PeerErrorKind::InvalidKey,
            "network" => PeerErrorKind::Network,
            "ssl-unavailable" => PeerErrorKind::SslUnavailable,
            "server-error" => PeerErrorKind::ServerError,
            "socket-error" => PeerErrorKind::SocketError,
            "socket-closed" => PeerErrorKind::SocketClosed,
            "unavailable-id" => PeerErrorKind::UnavailableId,
            "webrtc" => PeerErrorKind::Webrtc,
            other => PeerErrorKind::Other(other.to_string()),
        })
    }
}

impl From<&str> for PeerErrorKind {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<String> for PeerErrorKind {
    fn from(s: String) -> Self {
        PeerErrorKind::from(s.as_str())
    }
}

impl From<PeerErrorKind> for String {
    fn from(kind: PeerErrorKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for PeerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerError {
    #[serde(rename = "type")]
    pub kind: PeerErrorKind,
    pub message: String,
}

impl PeerError {
    pub fn new(kind: impl Into<PeerErrorKind>, message: impl Into<String>) -> PeerError {
        PeerError {
            kind: kind.into(),
            message: message.into(),
        }
    }
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for PeerError {}
