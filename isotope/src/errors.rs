use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

use crate::common::{atomic, Atomic};

/// Error kinds for Isotope repository operations.
///
/// This enum is the complete error taxonomy of the repository contract. Every
/// failure an adapter can surface maps to exactly one kind, so callers branch
/// on categories instead of backend-specific error codes.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::errors::{IsotopeError, ErrorKind, IsotopeResult};
///
/// fn example() -> IsotopeResult<()> {
///     Err(IsotopeError::new("Document not found", ErrorKind::NotFound))
/// }
/// ```
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    /// The addressed document or collection does not exist
    NotFound,
    /// An expected version did not match the stored version
    VersionConflict,
    /// The caller supplied arguments the contract rejects
    InvalidArgument,
    /// The operation cannot be expressed on this backend
    Unsupported,
    /// A transient backend or network failure; safe to retry
    Transient,
    /// The payload or an affected constraint failed backend validation
    ValidationFailed,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::VersionConflict => write!(f, "Version conflict"),
            ErrorKind::InvalidArgument => write!(f, "Invalid argument"),
            ErrorKind::Unsupported => write!(f, "Unsupported"),
            ErrorKind::Transient => write!(f, "Transient failure"),
            ErrorKind::ValidationFailed => write!(f, "Validation failed"),
        }
    }
}

/// Custom Isotope error type.
///
/// `IsotopeError` encapsulates error information including the error message,
/// kind, and optional cause. It supports error chaining and backtraces for
/// debugging.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::errors::{IsotopeError, ErrorKind};
///
/// // Create a simple error
/// let err = IsotopeError::new("Document not found", ErrorKind::NotFound);
///
/// // Create an error with a cause
/// let cause = IsotopeError::new("Connection reset", ErrorKind::Transient);
/// let err = IsotopeError::new_with_cause("Save failed", ErrorKind::Transient, cause);
/// ```
///
/// # Type alias
///
/// The `IsotopeResult<T>` type alias is equivalent to `Result<T, IsotopeError>`
/// and is used throughout the codebase for operations that can fail.
#[derive(Clone)]
pub struct IsotopeError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<IsotopeError>>,
    backtrace: Atomic<Backtrace>,
}

impl IsotopeError {
    /// Creates a new `IsotopeError` with the specified message and error kind.
    ///
    /// # Arguments
    ///
    /// * `message` - A description of the error
    /// * `error_kind` - The category of error
    ///
    /// # Returns
    ///
    /// A new `IsotopeError` instance.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        IsotopeError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Creates a new `IsotopeError` with a cause error.
    ///
    /// This creates an error chain where the cause error is preserved for
    /// debugging.
    ///
    /// # Arguments
    ///
    /// * `message` - A description of the error
    /// * `error_kind` - The category of error
    /// * `cause` - The underlying error that caused this error
    ///
    /// # Returns
    ///
    /// A new `IsotopeError` instance with the cause error attached.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: IsotopeError) -> Self {
        IsotopeError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(message: &str) -> Self {
        IsotopeError::new(message, ErrorKind::NotFound)
    }

    /// Creates a `VersionConflict` error.
    pub fn version_conflict(message: &str) -> Self {
        IsotopeError::new(message, ErrorKind::VersionConflict)
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: &str) -> Self {
        IsotopeError::new(message, ErrorKind::InvalidArgument)
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(message: &str) -> Self {
        IsotopeError::new(message, ErrorKind::Unsupported)
    }

    /// Creates a `Transient` error.
    pub fn transient(message: &str) -> Self {
        IsotopeError::new(message, ErrorKind::Transient)
    }

    /// Creates a `ValidationFailed` error.
    pub fn validation_failed(message: &str) -> Self {
        IsotopeError::new(message, ErrorKind::ValidationFailed)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&Box<IsotopeError>> {
        self.cause.as_ref()
    }
}

impl Display for IsotopeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for IsotopeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => write!(f, "{}\n{:?}", self.message, self.backtrace.read()),
        }
    }
}

impl Error for IsotopeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for Isotope operations.
///
/// `IsotopeResult<T>` is shorthand for `Result<T, IsotopeError>`.
/// All fallible Isotope operations return this type.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::errors::IsotopeResult;
///
/// fn resolve_collection(name: &str) -> IsotopeResult<String> {
///     // Return success
///     Ok(name.to_string())
///     // Or return error
///     // Err(IsotopeError::new("Collection not found", ErrorKind::NotFound))
/// }
/// ```
pub type IsotopeResult<T> = Result<T, IsotopeError>;

// From trait implementations for automatic error conversion
impl From<std::io::Error> for IsotopeError {
    fn from(err: std::io::Error) -> Self {
        IsotopeError::new(&format!("IO error: {}", err), ErrorKind::Transient)
    }
}

impl From<serde_json::Error> for IsotopeError {
    fn from(err: serde_json::Error) -> Self {
        IsotopeError::new(
            &format!("JSON encoding error: {}", err),
            ErrorKind::ValidationFailed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_io_error() -> Box<dyn Error + Send + Sync> {
        Box::new(std::io::Error::other("IO Error"))
    }

    #[test]
    fn isotope_error_new_creates_error() {
        let error = IsotopeError::new("An error occurred", ErrorKind::Transient);
        assert_eq!(error.message, "An error occurred");
        assert_eq!(error.error_kind, ErrorKind::Transient);
        assert!(error.cause.is_none());
    }

    #[test]
    fn isotope_error_new_with_cause_creates_error() {
        let cause = create_io_error();
        let error = IsotopeError::new_with_cause(
            "An error occurred",
            ErrorKind::Transient,
            IsotopeError::new(&cause.to_string(), ErrorKind::Transient),
        );
        assert_eq!(error.message, "An error occurred");
        assert_eq!(error.error_kind, ErrorKind::Transient);
        assert!(error.cause.is_some());
    }

    #[test]
    fn isotope_error_message_returns_message() {
        let error = IsotopeError::new("An error occurred", ErrorKind::Transient);
        assert_eq!(error.message(), "An error occurred");
    }

    #[test]
    fn isotope_error_kind_returns_kind() {
        let error = IsotopeError::new("An error occurred", ErrorKind::VersionConflict);
        assert_eq!(error.kind(), &ErrorKind::VersionConflict);
    }

    #[test]
    fn isotope_error_cause_returns_cause() {
        let cause = create_io_error();
        let error = IsotopeError::new_with_cause(
            "An error occurred",
            ErrorKind::Transient,
            IsotopeError::new(&cause.to_string(), ErrorKind::Transient),
        );
        assert!(error.cause().is_some());
    }

    #[test]
    fn isotope_error_cause_returns_none_when_no_cause() {
        let error = IsotopeError::new("An error occurred", ErrorKind::Transient);
        assert!(error.cause().is_none());
    }

    #[test]
    fn isotope_error_display_formats_correctly() {
        let error = IsotopeError::new("An error occurred", ErrorKind::Transient);
        let formatted = format!("{}", error);
        assert_eq!(formatted, "An error occurred");
    }

    #[test]
    fn isotope_error_debug_formats_with_cause() {
        let cause = create_io_error();
        let error = IsotopeError::new_with_cause(
            "An error occurred",
            ErrorKind::Transient,
            IsotopeError::new(&cause.to_string(), ErrorKind::Transient),
        );
        let formatted = format!("{:?}", error);
        assert!(formatted.contains("An error occurred"));
        assert!(formatted.contains("Caused by"));
    }

    #[test]
    fn isotope_error_source_exposes_cause_chain() {
        let error = IsotopeError::new_with_cause(
            "Save failed",
            ErrorKind::Transient,
            IsotopeError::new("Connection reset", ErrorKind::Transient),
        );
        let source = error.source().unwrap();
        assert_eq!(source.to_string(), "Connection reset");
    }

    #[test]
    fn kind_constructors_set_expected_kinds() {
        assert_eq!(IsotopeError::not_found("x").kind(), &ErrorKind::NotFound);
        assert_eq!(
            IsotopeError::version_conflict("x").kind(),
            &ErrorKind::VersionConflict
        );
        assert_eq!(
            IsotopeError::invalid_argument("x").kind(),
            &ErrorKind::InvalidArgument
        );
        assert_eq!(IsotopeError::unsupported("x").kind(), &ErrorKind::Unsupported);
        assert_eq!(IsotopeError::transient("x").kind(), &ErrorKind::Transient);
        assert_eq!(
            IsotopeError::validation_failed("x").kind(),
            &ErrorKind::ValidationFailed
        );
    }

    #[test]
    fn io_error_converts_to_transient() {
        let err: IsotopeError = std::io::Error::other("boom").into();
        assert_eq!(err.kind(), &ErrorKind::Transient);
    }

    #[test]
    fn json_error_converts_to_validation_failed() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: IsotopeError = json_err.into();
        assert_eq!(err.kind(), &ErrorKind::ValidationFailed);
    }

    #[test]
    fn error_kind_display_names() {
        assert_eq!(format!("{}", ErrorKind::NotFound), "Not found");
        assert_eq!(format!("{}", ErrorKind::VersionConflict), "Version conflict");
        assert_eq!(format!("{}", ErrorKind::InvalidArgument), "Invalid argument");
        assert_eq!(format!("{}", ErrorKind::Unsupported), "Unsupported");
        assert_eq!(format!("{}", ErrorKind::Transient), "Transient failure");
        assert_eq!(format!("{}", ErrorKind::ValidationFailed), "Validation failed");
    }
}
