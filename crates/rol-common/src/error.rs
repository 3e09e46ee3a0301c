//! Common error types for the ROL backend.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`RolError`].
pub type RolResult<T> = Result<T, RolError>;

/// Coarse classification of a [`RolError`].
///
/// Callers use the kind to decide between a validation response, a
/// missing-resource response and an internal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Referenced link, rule, parent or slot is absent.
    NotFound,
    /// Name or rule collision.
    AlreadyExists,
    /// Malformed input or violated precondition.
    Validation,
    /// An OS call failed or timed out.
    IoFailure,
    /// Compensation failed; host state diverges from both desired and saved.
    Fatal,
    /// Anything else (serialization, configuration, bugs).
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::Validation => write!(f, "validation"),
            Self::IoFailure => write!(f, "i/o failure"),
            Self::Fatal => write!(f, "fatal"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Common errors across the ROL backend.
#[derive(Error, Diagnostic, Debug)]
pub enum RolError {
    /// A referenced resource does not exist.
    #[error("{what} not found: {name}")]
    #[diagnostic(code(rol::not_found))]
    NotFound {
        /// Resource type ("link", "vlan", "traffic rule", ...).
        what: String,
        /// The name that was looked up.
        name: String,
    },

    /// A resource with the same identity already exists.
    #[error("{what} already exists: {name}")]
    #[diagnostic(code(rol::already_exists))]
    AlreadyExists {
        /// Resource type.
        what: String,
        /// The conflicting name.
        name: String,
    },

    /// Input failed validation.
    #[error("Invalid {field}: {message}")]
    #[diagnostic(code(rol::validation))]
    Validation {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// An OS-level operation failed.
    #[error("{operation} failed: {message}")]
    #[diagnostic(
        code(rol::io_failure),
        help("Most host network operations require CAP_NET_ADMIN")
    )]
    IoFailure {
        /// The primitive that failed (e.g. "link add").
        operation: String,
        /// Error reported by the OS.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(rol::io))]
    Io(#[from] std::io::Error),

    /// An error annotated with the step that produced it.
    #[error("{context}")]
    #[diagnostic(code(rol::context))]
    Context {
        /// What was being done.
        context: String,
        /// The underlying error.
        #[source]
        source: Box<RolError>,
    },

    /// Compensation after a failed operation failed as well.
    #[error("fatal: {context}: rollback failed ({compensation}); host state is unknown")]
    #[diagnostic(
        code(rol::fatal),
        severity(Error),
        help("The host network needs operator attention: inspect links and rules, then reset or restore")
    )]
    Fatal {
        /// What was being done.
        context: String,
        /// The error that triggered compensation.
        #[source]
        original: Box<RolError>,
        /// The error returned by the compensation itself.
        compensation: Box<RolError>,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(rol::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(rol::config))]
    Config {
        /// The error message.
        message: String,
    },
}

impl RolError {
    /// Build a [`RolError::NotFound`].
    pub fn not_found(what: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            what: what.into(),
            name: name.into(),
        }
    }

    /// Build a [`RolError::AlreadyExists`].
    pub fn already_exists(what: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            what: what.into(),
            name: name.into(),
        }
    }

    /// Build a [`RolError::Validation`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Build a [`RolError::IoFailure`].
    pub fn io_failure(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::IoFailure {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Build a [`RolError::Fatal`] from the original and the compensation error.
    pub fn fatal(context: impl Into<String>, original: Self, compensation: Self) -> Self {
        Self::Fatal {
            context: context.into(),
            original: Box::new(original),
            compensation: Box::new(compensation),
        }
    }

    /// Wrap this error with a context message.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Classify this error, looking through context wrappers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::IoFailure { .. } | Self::Io(_) => ErrorKind::IoFailure,
            Self::Context { source, .. } => source.kind(),
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::Serialization(_) | Self::Config { .. } => ErrorKind::Internal,
        }
    }

    /// The innermost error, skipping context wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if this error is (or wraps) a `NotFound`.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if this error is (or wraps) a `Fatal`.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<serde_json::Error> for RolError {
    fn from(err: serde_json::Error) -> Self {
        RolError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RolError {
    fn from(err: toml::de::Error) -> Self {
        RolError::Config {
            message: err.to_string(),
        }
    }
}

/// Attach context to fallible results.
pub trait ResultExt<T> {
    /// Wrap the error, if any, with a context message.
    fn context(self, context: impl Into<String>) -> RolResult<T>;

    /// Like [`ResultExt::context`], building the message lazily.
    fn with_context<F, S>(self, f: F) -> RolResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<RolError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> RolResult<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<F, S>(self, f: F) -> RolResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RolError::not_found("vlan", "rol.br0.10");
        assert_eq!(err.to_string(), "vlan not found: rol.br0.10");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RolError = io_err.into();
        assert!(matches!(err, RolError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn context_preserves_kind() {
        let err = RolError::already_exists("link", "eth0.10")
            .context("create vlan")
            .context("provision project");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(matches!(err.root(), RolError::AlreadyExists { .. }));
        assert_eq!(err.to_string(), "provision project");
    }

    #[test]
    fn result_ext_wraps() {
        let res: Result<(), std::io::Error> =
            Err(std::io::Error::other("netlink socket closed"));
        let err = res.context("list links").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(matches!(err, RolError::Context { .. }));
    }

    #[test]
    fn fatal_keeps_both_errors() {
        let err = RolError::fatal(
            "create vlan",
            RolError::io_failure("address add", "permission denied"),
            RolError::io_failure("link del", "device busy"),
        );
        assert!(err.is_fatal());
        let text = err.to_string();
        assert!(text.contains("device busy"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("permission denied"));
    }
}
