//! Canonical error model.
//!
//! Every error surfaced by the public API is an [`Error`] carrying one of the
//! portable [`ErrorCode`]s, the location it was created at, and an optional
//! wrapped cause (usually the native error returned by a driver).
//!
//! Use [`code`] to classify an arbitrary error chain: it understands
//! [`ContextError`](crate::ContextError) markers anywhere in the chain, so a
//! cancellation is always reported as `Canceled` / `DeadlineExceeded`, no
//! matter how many layers wrapped it.

use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

use crate::domain::{BoxError, DriverError};
use crate::retry::RetryError;
use crate::{BatchError, ContextError};

/// Shared, type-erased cause held by an [`Error`].
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// Portable error classification shared by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Returned by [`code`] when there is no error.
    Ok,
    /// The error could not be categorized.
    Unknown,
    /// The resource was not found.
    NotFound,
    /// The resource exists, but it should not.
    AlreadyExists,
    /// A value given to the API was incorrect.
    InvalidArgument,
    /// Something unexpected happened. Internal errors always indicate bugs.
    Internal,
    /// The feature is not implemented by the driver.
    Unimplemented,
    /// The system was in the wrong state.
    FailedPrecondition,
    /// The caller does not have permission to execute the operation.
    PermissionDenied,
    /// Some resource has been exhausted, typically because a service is
    /// throttling the caller.
    ResourceExhausted,
    /// The operation was canceled.
    Canceled,
    /// The operation timed out.
    DeadlineExceeded,
}

impl ErrorCode {
    /// Canonical name of the code, as rendered in error messages.
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Unknown => "Unknown",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::AlreadyExists => "AlreadyExists",
            ErrorCode::InvalidArgument => "InvalidArgument",
            ErrorCode::Internal => "Internal",
            ErrorCode::Unimplemented => "Unimplemented",
            ErrorCode::FailedPrecondition => "FailedPrecondition",
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::ResourceExhausted => "ResourceExhausted",
            ErrorCode::Canceled => "Canceled",
            ErrorCode::DeadlineExceeded => "DeadlineExceeded",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ContextError> for ErrorCode {
    fn from(err: ContextError) -> Self {
        // ---
        match err {
            ContextError::Canceled => ErrorCode::Canceled,
            ContextError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
        }
    }
}

/// A coded error with an optional wrapped cause.
///
/// `Display` renders `"<message> (code=<Code>)[: <cause>]"`. The alternate
/// form (`{:#}`) additionally renders the capture location and the cause on
/// their own lines:
///
/// ```text
/// topic send failed (code=NotFound):
///     src/topic.rs:120:17
///     - topic "orders" does not exist
/// ```
///
/// Cloning is cheap; the cause is shared.
#[derive(Clone)]
pub struct Error {
    code: ErrorCode,
    message: String,
    location: &'static Location<'static>,
    source: Option<Cause>,
}

impl Error {
    /// Create a new error.
    ///
    /// The location recorded is that of the caller. Helpers that build errors
    /// on behalf of their own caller should be `#[track_caller]` so the
    /// capture point moves up with them.
    #[track_caller]
    pub fn new(code: ErrorCode, source: Option<Cause>, message: impl Into<String>) -> Self {
        // ---
        Self {
            code,
            message: message.into(),
            location: Location::caller(),
            source,
        }
    }

    /// Wrap an arbitrary error as the cause of a new coded error.
    #[track_caller]
    pub fn wrap<E>(code: ErrorCode, source: E, message: impl Into<String>) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        // ---
        Self::new(code, Some(Arc::new(source)), message)
    }

    /// Build the error surfaced when a context is done.
    #[track_caller]
    pub fn from_context(err: ContextError) -> Self {
        // ---
        Self::wrap(err.into(), err, "")
    }

    /// The code this error was created with.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The message, without code or cause.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the error was created.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// The wrapped cause, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    fn write_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        if self.message.is_empty() {
            write!(f, "code={}", self.code)
        } else {
            write!(f, "{} (code={})", self.message, self.code)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        self.write_header(f)?;

        if f.alternate() {
            f.write_str(":")?;
            write!(
                f,
                "\n    {}:{}:{}",
                self.location.file(),
                self.location.line(),
                self.location.column()
            )?;
            if let Some(source) = &self.source {
                write!(f, "\n    - {source}")?;
            }
            return Ok(());
        }

        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("location", &format_args!("{}", self.location))
            .field("source", &self.source)
            .finish()
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        // ---
        self.source
            .as_deref()
            .map(|source| source as &(dyn StdError + 'static))
    }
}

/// Result type alias for pub/sub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classify an error chain.
///
/// - `None` is [`ErrorCode::Ok`].
/// - A [`ContextError`] anywhere in the chain wins and maps to
///   `Canceled` / `DeadlineExceeded`.
/// - Otherwise the code of the innermost [`Error`] in the chain.
/// - [`ErrorCode::Unknown`] if the chain holds no [`Error`].
pub fn code(err: Option<&(dyn StdError + 'static)>) -> ErrorCode {
    // ---
    let Some(err) = err else {
        return ErrorCode::Ok;
    };

    let mut found = None;
    let mut current = Some(err);

    while let Some(e) = current {
        if let Some(ctx_err) = e.downcast_ref::<ContextError>() {
            return (*ctx_err).into();
        }
        if let Some(coded) = e.downcast_ref::<Error>() {
            found = Some(coded.code);
        }
        current = e.source();
    }

    found.unwrap_or(ErrorCode::Unknown)
}

/// Shorthand for classifying a façade result.
pub fn code_of<T>(result: &Result<T>) -> ErrorCode {
    // ---
    match result {
        Ok(_) => ErrorCode::Ok,
        Err(err) => code(Some(err)),
    }
}

/// Wrap an error returned by a driver, classifying it with `classify`.
///
/// Context errors returned by the driver keep their context code.
#[track_caller]
pub(crate) fn from_driver<F>(err: BoxError, classify: F) -> Error
where
    F: Fn(&DriverError) -> ErrorCode,
{
    // ---
    let code = match err.downcast_ref::<ContextError>() {
        Some(ctx_err) => (*ctx_err).into(),
        None => classify(&*err),
    };
    Error::new(code, Some(Arc::from(err)), "pubsub")
}

/// Convert the outcome of a retried driver call into an [`Error`].
///
/// When the context ends the retry loop, the code is the context's and the
/// message keeps the last driver error.
#[track_caller]
pub(crate) fn from_retry<F>(err: RetryError<BoxError>, classify: F) -> Error
where
    F: Fn(&DriverError) -> ErrorCode,
{
    // ---
    match err {
        RetryError::Failed(err) => from_driver(err, classify),
        RetryError::Context { ctx_err, func_err } => {
            let message = match func_err {
                Some(last) => format!("pubsub: last error: {last}"),
                None => "pubsub".to_string(),
            };
            Error::wrap(ctx_err.into(), ctx_err, message)
        }
    }
}

/// Convert a batcher failure into an [`Error`].
///
/// `what` names the façade object in the shutdown message.
#[track_caller]
pub(crate) fn from_batch(err: BatchError<Error>, what: &str) -> Error {
    // ---
    match err {
        BatchError::Canceled(ctx_err) => Error::from_context(ctx_err),
        BatchError::Shutdown => shut_down(what),
        BatchError::NoRuntime => Error::new(
            ErrorCode::FailedPrecondition,
            None,
            format!("pubsub: {what} has no Tokio runtime to run on"),
        ),
        BatchError::Abandoned => Error::new(
            ErrorCode::Internal,
            None,
            "pubsub: batch handler exited without a result",
        ),
        BatchError::Handler(err) => err,
    }
}

/// The error returned by operations on a façade object that was shut down.
#[track_caller]
pub(crate) fn shut_down(what: &str) -> Error {
    // ---
    Error::new(
        ErrorCode::FailedPrecondition,
        None,
        format!("pubsub: {what} has been Shutdown"),
    )
}
