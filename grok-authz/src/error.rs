use std::path::PathBuf;

/// Errors surfaced by configuration and administration.
///
/// Evaluation never produces one of these; `is_allowed` always answers with
/// a boolean.
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("unknown role \"{0}\", expected required, requisite or sufficient")]
    UnknownRole(String),

    #[error("role \"{0}\" is not supported")]
    UnsupportedRole(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("group \"{group}\" has an invalid pattern: {source}")]
    Pattern {
        group: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid catalog: {0}")]
    Catalog(String),
}

pub type Result<T> = std::result::Result<T, AuthzError>;
