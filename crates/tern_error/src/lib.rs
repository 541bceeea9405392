//! Error type shared across the tern crates.

use std::fmt;

pub type Result<T, E = TernError> = std::result::Result<T, E>;

/// Coarse classification of an error.
///
/// Most errors are `Other`. The remaining kinds exist because the runtime
/// changes behavior based on them: `Eof` unwinds cleanly out of the executor,
/// `Cancelled` is substituted for transport errors when the caller's context
/// fired, and `NotSupported` marks planner constructs we refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Other,
    /// The construct is valid but unimplemented.
    NotSupported,
    /// A downstream consumer requested no more input.
    ///
    /// Not a real failure; callers must unwind without surfacing it.
    Eof,
    /// The operation was interrupted by context cancellation.
    Cancelled,
    /// The remote side violated the wire protocol.
    Protocol,
}

#[derive(Debug)]
pub struct TernError {
    /// Boxed to keep `Result<T>` small.
    inner: Box<TernErrorInner>,
}

#[derive(Debug)]
struct TernErrorInner {
    kind: ErrorKind,
    msg: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TernError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Other, msg)
    }

    pub fn with_kind(kind: ErrorKind, msg: impl Into<String>) -> Self {
        TernError {
            inner: Box::new(TernErrorInner {
                kind,
                msg: msg.into(),
                source: None,
            }),
        }
    }

    pub fn with_source(
        msg: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        TernError {
            inner: Box::new(TernErrorInner {
                kind: ErrorKind::Other,
                msg: msg.into(),
                source: Some(source),
            }),
        }
    }

    /// Canonical end-of-stream marker.
    pub fn eof() -> Self {
        Self::with_kind(ErrorKind::Eof, "EOF")
    }

    pub fn cancelled() -> Self {
        Self::with_kind(ErrorKind::Cancelled, "query canceled")
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::NotSupported, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner.kind
    }

    pub fn is_eof(&self) -> bool {
        self.inner.kind == ErrorKind::Eof
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.kind == ErrorKind::Cancelled
    }

    pub fn is_not_supported(&self) -> bool {
        self.inner.kind == ErrorKind::NotSupported
    }

    pub fn message(&self) -> &str {
        &self.inner.msg
    }
}

impl fmt::Display for TernError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            ErrorKind::NotSupported => write!(f, "not supported: {}", self.inner.msg)?,
            _ => write!(f, "{}", self.inner.msg)?,
        }
        if let Some(source) = &self.inner.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TernError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .source
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl From<std::io::Error> for TernError {
    fn from(err: std::io::Error) -> Self {
        // Unexpected EOFs from pipes carry the same meaning as our canonical
        // EOF: the other side went away and we should stop quietly.
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return TernError::eof();
        }
        TernError::with_source("io error", Box::new(err))
    }
}

impl From<std::fmt::Error> for TernError {
    fn from(err: std::fmt::Error) -> Self {
        TernError::with_source("format error", Box::new(err))
    }
}

/// Add context to an error.
pub trait ResultExt<T, E> {
    fn context(self, msg: &'static str) -> Result<T>;
    fn context_fn<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, msg: &'static str) -> Result<T> {
        self.map_err(|e| TernError::with_source(msg, Box::new(e)))
    }

    fn context_fn<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| TernError::with_source(f(), Box::new(e)))
    }
}

/// Produce a "missing field" error from a `None`.
pub trait OptionExt<T> {
    fn required(self, field: &'static str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required(self, field: &'static str) -> Result<T> {
        match self {
            Some(v) => Ok(v),
            None => Err(TernError::new(format!("missing field: {field}"))),
        }
    }
}

#[macro_export]
macro_rules! not_implemented {
    ($($arg:tt)*) => {
        return Err($crate::TernError::not_supported(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_roundtrips_through_io() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "pipe closed");
        let err = TernError::from(io);
        assert!(err.is_eof());
    }

    #[test]
    fn not_supported_display() {
        let err = TernError::not_supported("UNPIVOT");
        assert_eq!(err.to_string(), "not supported: UNPIVOT");
    }
}
