// =============================================================================
// Gateway error kinds
// =============================================================================

use thiserror::Error;

/// Failure classes surfaced by the exchange gateway. Callers branch on the
/// kind, not on HTTP details.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("response parse error: {0}")]
    Parse(String),
}

impl GatewayError {
    /// Map an HTTP status plus response body onto an error kind.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth(body.to_string()),
            404 => Self::NotFound(body.to_string()),
            418 | 429 => Self::RateLimit(body.to_string()),
            _ => Self::Rejected(format!("{status}: {body}")),
        }
    }

    /// Transient failures worth retrying at a higher layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimit(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_classification() {
        assert!(matches!(
            GatewayError::from_status(StatusCode::UNAUTHORIZED, ""),
            GatewayError::Auth(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::FORBIDDEN, ""),
            GatewayError::Auth(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::RateLimit(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::NOT_FOUND, ""),
            GatewayError::NotFound(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::BAD_REQUEST, "oops"),
            GatewayError::Rejected(_)
        ));
    }

    #[test]
    fn transient_kinds() {
        assert!(GatewayError::Network("x".into()).is_transient());
        assert!(GatewayError::RateLimit("x".into()).is_transient());
        assert!(!GatewayError::Rejected("x".into()).is_transient());
    }
}
