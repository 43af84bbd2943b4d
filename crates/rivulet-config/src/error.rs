//! Error types for configuration loading and validation.

use std::path::PathBuf;

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading or writing the configuration file failed.
    #[error("configuration file I/O failed for {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The configuration file contained malformed JSON.
    #[error("configuration file {path} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// A field failed validation.
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_field() {
        let error = ConfigError::Invalid {
            field: "limits.max_downloads",
            reason: "must be positive",
        };
        assert_eq!(
            error.to_string(),
            "invalid configuration: limits.max_downloads must be positive"
        );
    }
}
