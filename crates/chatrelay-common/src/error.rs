use std::time::Duration;

use crate::types::ChatId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("cryptographic error: {0}")]
    Crypto(String),

    #[error("user is not approved")]
    NotApproved,

    #[error("conversation is too long for the model")]
    ContextTooLong,

    #[error("unsupported message version: {0}")]
    UnsupportedVersion(i64),

    #[error("user {0} is missing from the store")]
    MissingUser(ChatId),

    #[error("stream stalled: no data for {0:?}")]
    StreamStalled(Duration),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("relay is shutting down")]
    ShuttingDown,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the retry loop and the top-level handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The sender is not allowed to use the relay.
    Authorization,
    /// A semantic failure that retrying cannot fix.
    Persistent,
    /// Network or upstream service failure.
    Transient,
    /// Corrupted or unreadable stored data, missing records.
    Data,
    /// The completion stream stopped producing data.
    Stall,
    /// Work rejected because the relay is draining.
    Shutdown,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotApproved => ErrorKind::Authorization,
            Error::ContextTooLong => ErrorKind::Persistent,
            Error::StreamStalled(_) => ErrorKind::Stall,
            Error::ShuttingDown => ErrorKind::Shutdown,
            Error::UnsupportedVersion(_)
            | Error::Crypto(_)
            | Error::MissingUser(_)
            | Error::Database(_)
            | Error::Config(_) => ErrorKind::Data,
            Error::Agent(_)
            | Error::Channel(_)
            | Error::Media(_)
            | Error::Timeout(_)
            | Error::Io(_) => ErrorKind::Transient,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// Strip any `Context` wrappers and return the underlying error.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Attach operation context to a fallible result.
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}
