//! Uplink error reporting.

use thiserror::Error;

// Bodies repeated in logs are kept short.
const MAX_CONTENT_LEN: usize = 512;

/// Error returned by the uplink client.
///
/// One structured value covers the whole taxonomy: transport failures
/// (status code 0), unexpected HTTP statuses, authentication failures and
/// response decoding failures. Callers branch with the predicates instead
/// of matching on variants.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced an HTTP response.
    #[error("transport error: {content}")]
    Transport {
        /// Transport error text.
        content: String,
    },

    /// The response carried an unexpected HTTP status.
    #[error("unexpected response (status {status_code}): {content}")]
    Status {
        /// HTTP status code of the response.
        status_code: u16,
        /// Response body, truncated for logging.
        content: String,
    },

    /// The request failed to authenticate.
    #[error("authentication failed (status {status_code}): {content}")]
    Auth {
        /// HTTP status code of the response.
        status_code: u16,
        /// Response body, truncated for logging.
        content: String,
    },

    /// The response body could not be decoded.
    #[error("undecodable response (status {status_code}): {source}")]
    Unmarshal {
        /// HTTP status code of the response.
        status_code: u16,
        /// Response body, truncated for logging.
        content: String,
        /// The decoding failure.
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub(super) fn transport(err: &reqwest::Error) -> Self {
        Self::Transport {
            content: err.to_string(),
        }
    }

    pub(super) fn status(status_code: u16, content: impl Into<String>) -> Self {
        Self::Status {
            status_code,
            content: truncate(content.into()),
        }
    }

    pub(super) fn auth(status_code: u16, content: impl Into<String>) -> Self {
        Self::Auth {
            status_code,
            content: truncate(content.into()),
        }
    }

    pub(super) fn unmarshal(
        status_code: u16,
        content: impl Into<String>,
        source: serde_json::Error,
    ) -> Self {
        Self::Unmarshal {
            status_code,
            content: truncate(content.into()),
            source,
        }
    }

    /// HTTP status code of the response, 0 for transport failures.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Transport { .. } => 0,
            Self::Status { status_code, .. }
            | Self::Auth { status_code, .. }
            | Self::Unmarshal { status_code, .. } => *status_code,
        }
    }

    /// Response body (or transport error text).
    pub fn content(&self) -> &str {
        match self {
            Self::Transport { content }
            | Self::Status { content, .. }
            | Self::Auth { content, .. }
            | Self::Unmarshal { content, .. } => content,
        }
    }

    /// The decoding failure, when the response body was not valid JSON.
    pub fn unmarshal_error(&self) -> Option<&serde_json::Error> {
        match self {
            Self::Unmarshal { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether this error is an authentication failure.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Whether this error is an HTTP 404.
    pub fn is_not_found(&self) -> bool {
        self.status_code() == 404
    }
}

fn truncate(mut content: String) -> String {
    if content.len() > MAX_CONTENT_LEN {
        let mut cut = MAX_CONTENT_LEN;
        while !content.is_char_boundary(cut) {
            cut -= 1;
        }

        content.truncate(cut);
    }

    content
}
