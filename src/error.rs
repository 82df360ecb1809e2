use thiserror::Error;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Fatal observer configuration problems, raised while a subscription is
/// being set up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("You cannot currently mix including and excluding fields (at \"{field}\")")]
    MixedProjection { field: String },

    #[error("You may not observe a cursor with {{fields: {{_id: 0}}}}")]
    IdExcluded,

    #[error("Invalid projection for \"{field}\": {reason}")]
    InvalidProjection { field: String, reason: String },
}

// ---------------------------------------------------------------------------
// QueryError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Invalid regex: {0}")]
    InvalidRegex(String),

    #[error("Selector must be an object, got {0}")]
    InvalidSelector(String),
}

// ---------------------------------------------------------------------------
// ModifierError
// ---------------------------------------------------------------------------

/// Failure to apply a partial-update spec to a local document copy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModifierError {
    #[error("Modifier must be an object")]
    NotAnObject,

    #[error("Unknown modifier: {0}")]
    UnknownOperator(String),

    #[error("Cannot apply {op} to field \"{field}\": {reason}")]
    InvalidTarget {
        op: String,
        field: String,
        reason: String,
    },

    #[error("Cannot mix operators and plain fields in a modifier")]
    MixedModifier,
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store \"{store}\" is unavailable: {message}")]
    Unavailable { store: String, message: String },

    #[error("Store query failed on \"{store}\"")]
    Query {
        store: String,
        #[source]
        source: QueryError,
    },

    #[error("Backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
#[error("Malformed notification on channel \"{channel}\"")]
pub struct CodecError {
    pub channel: String,
    #[source]
    pub source: serde_json::Error,
}

// ---------------------------------------------------------------------------
// LiveQueryError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LiveQueryError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Modifier(#[from] ModifierError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Convenience alias — the default error type is `LiveQueryError`.
pub type Result<T, E = LiveQueryError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
