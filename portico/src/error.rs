//! Error types
//!
//! Configuration errors surface at startup and prevent the process from
//! serving. Per-request failures (upstream transport errors, policy
//! denials) are mapped to HTTP responses at the point of failure and never
//! travel through this type.

use thiserror::Error;

/// Errors raised while compiling configuration into a serving state.
#[derive(Debug, Error)]
pub enum Error {
    /// An action string was blank after trimming.
    #[error("empty action string")]
    EmptyAction,

    /// The first token of an action string matched no registered builder.
    #[error("invalid action: {0}")]
    UnknownAction(String),

    /// An action was given the wrong number of arguments.
    #[error("{action} params count invalid")]
    ParamCount { action: &'static str },

    /// A `{...}` interpolation could not be compiled.
    #[error("invalid variable '{name}': {reason}")]
    BadVariable { name: String, reason: String },

    /// An upstream group name or entry failed to parse.
    #[error("invalid upstream: {0}")]
    BadUpstream(String),

    /// `proxy` was given a target with an unsupported scheme.
    #[error("invalid proxy scheme: {0}")]
    BadScheme(String),

    /// A response-modifier action was applied to a terminal handler that
    /// does not expose the required capability.
    #[error("underlying action does not support {action}")]
    CapabilityMissing { action: &'static str },

    /// Two sites registered certificate material for the same host.
    #[error("duplicate cert info: {0}")]
    DuplicateCertHost(String),

    /// A site declaration is inconsistent (type/port mismatch, missing
    /// certificate paths, conflicting slot type).
    #[error("invalid site config for {host}: {reason}")]
    BadSite { host: String, reason: String },

    /// A header name in an action argument is not a legal HTTP header name.
    #[error("invalid header name: {0}")]
    BadHeaderName(String),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("config: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("acme: {0}")]
    Acme(String),

    #[error("ocsp: {0}")]
    Ocsp(String),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
