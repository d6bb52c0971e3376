use std::{error, fmt};

use crate::BoxError;

/// Errors that originate from the server core.
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<BoxError>,
}

/// The class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Malformed configuration, duplicate mount, unresolved reference.
    /// Surfaced at startup and fatal.
    Config,
    /// Socket or TLS failure while binding or serving.
    Transport,
    /// An `init`/`start`/`stop` phase failed or was called out of order.
    Lifecycle,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub(crate) fn with(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// A configuration error with a human-readable explanation.
    pub fn config(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Config).context(context)
    }

    /// A lifecycle error with a human-readable explanation.
    pub fn lifecycle(context: impl Into<String>) -> Self {
        Error::new(ErrorKind::Lifecycle).context(context)
    }

    /// A transport error wrapping its cause.
    pub fn transport(source: impl Into<BoxError>) -> Self {
        Error::new(ErrorKind::Transport).with(source)
    }

    /// The class of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn description(&self) -> &'static str {
        match self.kind {
            ErrorKind::Config => "configuration error",
            ErrorKind::Transport => "transport error",
            ErrorKind::Lifecycle => "lifecycle error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())?;
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::transport(source)
    }
}
