//! Gateway error taxonomy
//!
//! Everything except `Configuration` is recovered at the session boundary:
//! one bad turn never kills the connection, one bad connection never kills
//! the server.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing local config or placeholder values left in secrets. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Bad or missing bearer token, or unknown device. Logged, never surfaced verbatim.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The management API does not know this device.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The management API wants the user to bind the device with a 6-digit code.
    #[error("device requires binding (code {bind_code})")]
    DeviceBind { bind_code: String },

    /// Network error or 408/429/5xx from a provider. Retried before escalation.
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    /// Invalid key, malformed response. Surfaces as a spoken apology.
    #[error("provider error: {0}")]
    ProviderFatal(String),

    /// Synthesis could not produce audio after all attempts.
    #[error("tts failed: {0}")]
    Tts(String),

    /// Tool lookup failed or a handler threw.
    #[error("tool error: {0}")]
    Tool(String),

    /// Barge-in or close. Propagates silently.
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Whether a retry is worthwhile (network faults and throttling statuses).
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::ProviderTransient(_))
    }

    /// Classify an HTTP status the way the management API client does.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            408 | 429 | 500 | 502 | 503 | 504 => {
                GatewayError::ProviderTransient(format!("{status}: {body}"))
            }
            _ => GatewayError::ProviderFatal(format!("{status}: {body}")),
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retryable() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            assert!(GatewayError::from_status(status, String::new()).is_transient());
        }
        let bad_key = reqwest::StatusCode::from_u16(401).unwrap();
        assert!(!GatewayError::from_status(bad_key, String::new()).is_transient());
    }
}
