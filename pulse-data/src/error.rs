use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All fatal errors generated in `pulse-data`.
///
/// Everything that can go wrong while enriching a single event is expressed as a
/// [`LookupError`] label on the emitted record instead; only the feed connection
/// surfaces a [`DataError`].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    #[error("credential failure: {0}")]
    Credential(#[from] CredentialError),

    #[error("feed authentication failed and credential refresh was rejected: {0}")]
    AuthFatal(String),

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("invalid feed url: {0}")]
    Url(String),
}

impl DataError {
    /// Determine if a socket error was caused by the server rejecting our credentials.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_auth_failure(&self) -> bool {
        match self {
            DataError::AuthFatal(_) => true,
            DataError::Socket(error_msg) => {
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("401")
                    || error_lower.contains("403")
                    || error_lower.contains("unauthorized")
                    || error_lower.contains("forbidden")
            }
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DataError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;

        match value {
            Error::Http(response) => {
                Self::Socket(format!("handshake rejected with HTTP {}", response.status()))
            }
            other => Self::Socket(other.to_string()),
        }
    }
}

/// Errors loading, validating, refreshing or persisting the bearer credential pair.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CredentialError {
    #[error("failed to read credential file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("credential file is malformed: {0}")]
    Malformed(String),

    #[error("failed to persist credentials: {0}")]
    Persist(String),

    #[error("refresh endpoint answered HTTP {0}")]
    RefreshRejected(u16),

    #[error("refresh response carried no access token")]
    MissingAccessToken,

    #[error("refresh request failed: {0}")]
    Transport(#[from] TransportError),
}

/// Transport-level failure of a single HTTP attempt (no response received).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("failed to build request: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else if error.is_builder() {
            Self::Request(error.to_string())
        } else if error.is_body() || error.is_decode() {
            Self::Body(error.to_string())
        } else {
            Self::Connect(error.to_string())
        }
    }
}

/// Labelled outcome of a failed enrichment lookup.
///
/// These are never raised past the enrichment path: they end up serialised in the
/// emitted record, eg/ `{"error": "no bars"}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Error)]
pub enum LookupError {
    #[error("no response: {0}")]
    Transport(TransportError),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("rate limited")]
    RateLimited,

    #[error("auth failed")]
    AuthFailed,

    #[error("response not json")]
    NotJson,

    #[error("unexpected payload: {0}")]
    Payload(String),

    #[error("no bars")]
    NoBars,

    #[error("zero price")]
    ZeroPrice,

    #[error("no tokens")]
    NoInstruments,

    #[error("no valid tokens")]
    NoValidInstruments,

    #[error("community has no admin")]
    MissingAdmin,

    #[error("invalid social url")]
    InvalidUrl,

    #[error("timeout")]
    Timeout,

    #[error("lookup task failed: {0}")]
    Task(String),
}

impl LookupError {
    /// Map a non-success HTTP status to the matching label.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::AuthFailed,
            429 => Self::RateLimited,
            other => Self::Status(other),
        }
    }
}

impl From<TransportError> for LookupError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Timeout => Self::Timeout,
            other => Self::Transport(other),
        }
    }
}

impl From<serde_json::Error> for LookupError {
    fn from(_: serde_json::Error) -> Self {
        Self::NotJson
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_is_auth_failure() {
        struct TestCase {
            input: DataError,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: fatal auth is an auth failure
                input: DataError::AuthFatal("refresh rejected".to_string()),
                expected: true,
            },
            TestCase {
                // TC1: handshake 401 is an auth failure
                input: DataError::Socket("handshake rejected with HTTP 401 Unauthorized".to_string()),
                expected: true,
            },
            TestCase {
                // TC2: handshake 403 is an auth failure
                input: DataError::Socket("handshake rejected with HTTP 403 Forbidden".to_string()),
                expected: true,
            },
            TestCase {
                // TC3: connection reset is not an auth failure
                input: DataError::Socket("IO error: Connection reset by peer".to_string()),
                expected: false,
            },
            TestCase {
                // TC4: bad url is not an auth failure
                input: DataError::Url("relative URL without a base".to_string()),
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.is_auth_failure();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_lookup_error_from_status() {
        struct TestCase {
            input: u16,
            expected: LookupError,
        }

        let tests = vec![
            TestCase {
                // TC0: unauthorised
                input: 401,
                expected: LookupError::AuthFailed,
            },
            TestCase {
                // TC1: forbidden
                input: 403,
                expected: LookupError::AuthFailed,
            },
            TestCase {
                // TC2: rate limited
                input: 429,
                expected: LookupError::RateLimited,
            },
            TestCase {
                // TC3: not found keeps the status
                input: 404,
                expected: LookupError::Status(404),
            },
            TestCase {
                // TC4: server error keeps the status
                input: 502,
                expected: LookupError::Status(502),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = LookupError::from_status(test.input);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_lookup_error_from_transport_error() {
        assert_eq!(LookupError::from(TransportError::Timeout), LookupError::Timeout);
        assert_eq!(
            LookupError::from(TransportError::Connect("refused".to_string())),
            LookupError::Transport(TransportError::Connect("refused".to_string()))
        );
    }

    #[test]
    fn test_lookup_error_labels() {
        assert_eq!(LookupError::NoBars.to_string(), "no bars");
        assert_eq!(LookupError::NoValidInstruments.to_string(), "no valid tokens");
        assert_eq!(LookupError::Status(500).to_string(), "HTTP 500");
    }
}
