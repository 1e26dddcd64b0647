use thiserror::Error;

/// Main error type for the coarse-graining optimizer driver
#[derive(Error, Debug)]
pub enum CgError {
    #[error("State file format error: {0}")]
    Format(#[from] StateFormatError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Ways a state file can be malformed
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateFormatError {
    #[error("could not fetch state label from {source_name}")]
    MissingLabel { source_name: String },

    #[error("parameter set on line {line} ({text}) contains a non-numerical value")]
    NonNumeric { line: usize, text: String },

    #[error("line {line} ({text}) needs at least a result and a status token")]
    TooFewTokens { line: usize, text: String },

    #[error("length of parameter set {set} ({found}) mismatched previous one ({expected})")]
    RaggedParameters {
        set: usize,
        expected: usize,
        found: usize,
    },

    #[error("we can only handle parameter sets flagged with complete or try and found '{token}' on line {line}")]
    InvalidStatus { line: usize, token: String },

    #[error("{source_name} contains no parameter sets")]
    Empty { source_name: String },
}

/// Result type alias for driver operations
pub type CgResult<T> = Result<T, CgError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::CgError::Config(format!($($arg)*))
    };
}

/// Macro for creating consistency errors
#[macro_export]
macro_rules! consistency_error {
    ($($arg:tt)*) => {
        $crate::CgError::Consistency(format!($($arg)*))
    };
}

/// Macro for creating dependency errors
#[macro_export]
macro_rules! dependency_error {
    ($($arg:tt)*) => {
        $crate::CgError::Dependency(format!($($arg)*))
    };
}
