use thiserror::Error;

/// Mirror error types
#[derive(Error, Debug)]
pub enum MirrorError {
    /// A test step reached the resolver without a literal configuration
    #[error("got unresolved config for test {test}")]
    UnresolvedConfig { test: String },

    /// Several independent errors collected during one pass
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<MirrorError>),

    /// Malformed image reference
    #[error("Invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Step registry lookup failed
    #[error("Step registry error: {0}")]
    StepRegistryError(String),

    /// Negative or otherwise unusable record limit
    #[error("Invalid limit {0}: must be a non-negative integer")]
    InvalidLimit(i64),

    /// Cluster API call failed
    #[error("Cluster error: {0}")]
    ClusterError(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Registry credentials could not be loaded
    #[error("Credentials error: {0}")]
    CredentialsError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl MirrorError {
    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is exactly one, an `Aggregate` otherwise.
    pub fn aggregate(mut errors: Vec<MirrorError>) -> Option<MirrorError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(MirrorError::Aggregate(errors)),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::ClusterError(_)
            | MirrorError::RegistryError { .. }
            | MirrorError::TimeoutError(_)
            | MirrorError::IoError(_) => true,
            MirrorError::Aggregate(errors) => errors.iter().any(|e| e.is_transient()),
            _ => false,
        }
    }
}

fn format_aggregate(errors: &[MirrorError]) -> String {
    match errors {
        [single] => single.to_string(),
        _ => {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            format!("[{}]", messages.join(", "))
        }
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(err: serde_json::Error) -> Self {
        MirrorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for MirrorError {
    fn from(err: serde_yaml::Error) -> Self {
        MirrorError::SerializationError(err.to_string())
    }
}

/// Result type alias for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_config_display() {
        let error = MirrorError::UnresolvedConfig {
            test: "e2e".to_string(),
        };
        assert_eq!(error.to_string(), "got unresolved config for test e2e");
    }

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(MirrorError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_aggregate_single_unwraps() {
        let error = MirrorError::aggregate(vec![MirrorError::Other("boom".to_string())]).unwrap();
        assert!(matches!(error, MirrorError::Other(_)));
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn test_aggregate_many_display() {
        let error = MirrorError::aggregate(vec![
            MirrorError::UnresolvedConfig {
                test: "a".to_string(),
            },
            MirrorError::UnresolvedConfig {
                test: "b".to_string(),
            },
        ])
        .unwrap();
        assert_eq!(
            error.to_string(),
            "[got unresolved config for test a, got unresolved config for test b]"
        );
    }

    #[test]
    fn test_invalid_reference_display() {
        let error = MirrorError::InvalidReference {
            reference: "ci".to_string(),
            message: "missing name".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid image reference 'ci': missing name"
        );
    }

    #[test]
    fn test_registry_error_display() {
        let error = MirrorError::RegistryError {
            registry: "quay.io".to_string(),
            message: "Authentication failed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Registry error: quay.io - Authentication failed"
        );
    }

    #[test]
    fn test_invalid_limit_display() {
        let error = MirrorError::InvalidLimit(-3);
        assert_eq!(
            error.to_string(),
            "Invalid limit -3: must be a non-negative integer"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(MirrorError::ClusterError("conn refused".to_string()).is_transient());
        assert!(MirrorError::TimeoutError("push".to_string()).is_transient());
        assert!(MirrorError::RegistryError {
            registry: "quay.io".to_string(),
            message: "429".to_string(),
        }
        .is_transient());
        assert!(!MirrorError::ConfigError("bad".to_string()).is_transient());
        assert!(!MirrorError::InvalidLimit(-1).is_transient());
    }

    #[test]
    fn test_aggregate_transient_if_any_member_is() {
        let error = MirrorError::Aggregate(vec![
            MirrorError::ConfigError("bad".to_string()),
            MirrorError::ClusterError("down".to_string()),
        ]);
        assert!(error.is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: MirrorError = io_error.into();
        assert!(matches!(error, MirrorError::IoError(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: MirrorError = result.unwrap_err().into();
        assert!(matches!(error, MirrorError::SerializationError(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: MirrorError = result.unwrap_err().into();
        assert!(matches!(error, MirrorError::SerializationError(_)));
    }
}
