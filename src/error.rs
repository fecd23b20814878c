//! Error taxonomy shared by both connectors

use thiserror::Error;

/// Result alias used across the connector runtime
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors surfaced by sources, transforms and platform calls.
///
/// None of these stop a run controller: a failed tick or notification is
/// logged and abandoned, and the loop moves on.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The notified entity does not exist on the platform
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// A feed value could not be parsed
    #[error("failed to parse {value:?}: {reason}")]
    Parse { value: String, reason: String },

    /// Network or broker failure talking to a collaborator
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The platform answered, but with an error payload
    #[error("platform error: {0}")]
    Platform(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectorError {
    pub fn transport<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ConnectorError::Transport {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn parse(value: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        ConnectorError::Parse {
            value: value.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_keeps_context_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ConnectorError::transport("Failed to fetch feed", io);
        assert_eq!(err.to_string(), "Failed to fetch feed: refused");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn parse_error_quotes_value() {
        let err = ConnectorError::parse("garbage", "input is out of range");
        assert_eq!(
            err.to_string(),
            "failed to parse \"garbage\": input is out of range"
        );
    }
}
