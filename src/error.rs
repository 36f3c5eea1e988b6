use thiserror::Error;

/// Errors surfaced by the relay's collaborators.
///
/// None of these are fatal: every variant degrades to a visible status and the
/// next timer or movement trigger retries naturally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Could not reach the endpoint (DNS, connect, timeout, body read).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reached the endpoint but it answered with a non-success status.
    #[error("HTTP {status}")]
    Http { status: u16 },

    /// The sink answered with its explicit rejection sentinel.
    #[error("Rejected by ingestion sink")]
    Rejected,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Export error: {0}")]
    Export(String),
}

impl RelayError {
    /// True when the sink was reached and refused the record.
    pub fn is_rejection(&self) -> bool {
        matches!(self, RelayError::Rejected)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_distinct_from_transport() {
        assert!(RelayError::Rejected.is_rejection());
        assert!(!RelayError::Transport("connection refused".into()).is_rejection());
        assert!(!RelayError::Http { status: 500 }.is_rejection());
    }

    #[test]
    fn test_display() {
        assert_eq!(RelayError::Http { status: 429 }.to_string(), "HTTP 429");
        assert_eq!(
            RelayError::Transport("timed out".into()).to_string(),
            "Transport error: timed out"
        );
    }
}
