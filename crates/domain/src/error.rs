/// Shared error type used across all Bor crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("pki: {0}")]
    Pki(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    StateViolation(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid enrollment token")]
    TokenInvalid,

    #[error("enrollment token already used")]
    TokenUsed,

    #[error("enrollment token expired")]
    TokenExpired,

    #[error("transport: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] with the given entity kind.
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
