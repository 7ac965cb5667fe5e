//! Error types for sessions, documents and the render engine

use thiserror::Error;

/// Result type alias for rfhtml operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fetching, rendering or querying a page
#[derive(Error, Debug)]
pub enum Error {
    /// The transport failed (connection, DNS, TLS or timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// The browser engine process could not be started
    #[error("Engine launch failed: {0}")]
    EngineLaunch(String),

    /// A render exceeded its deadline
    #[error("Render timed out after {0}ms")]
    RenderTimeout(u64),

    /// The engine failed while loading or serializing a page
    #[error("Rendering failed: {0}")]
    Render(String),

    /// A script could not be handed to the engine
    #[error("Script execution failed: {0}")]
    Script(String),

    /// Malformed CSS selector or XPath expression
    #[error("Invalid selector: {0}")]
    Selector(String),

    /// The render engine (or its owning session) has been closed
    #[error("Render engine is closed")]
    EngineClosed,

    /// A render was requested on a document that has no session
    #[error("Document is not bound to a session")]
    Unbound,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error came out of the render path. Callers can use this
    /// to fall back to the static document.
    pub fn is_render_failure(&self) -> bool {
        matches!(
            self,
            Error::EngineLaunch(_)
                | Error::RenderTimeout(_)
                | Error::Render(_)
                | Error::Script(_)
                | Error::EngineClosed
        )
    }
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Render(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}
