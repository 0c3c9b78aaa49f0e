use std::error::Error as StdError;
use std::io;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Any failure that cannot be confidently attributed to any other error
    /// category in this enum.
    ///
    /// In particular this means that use of Internal is never a guarantee
    /// the error is not, for example due to a user error - merely that it
    /// cannot be confidently determined by the code.
    Internal,

    /// The user provided invalid input or performed an action that is
    /// unsupported or impossible to complete.
    User,
}

/// Condition flags for consumers that want to branch on error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The input path does not exist.
    NotFound,
    /// Input is too short to classify, or is not a container we can parse
    /// (bad packet framing, unsupported algorithm, broken armor).
    Format,
    /// The passphrase does not unlock the container, or the modification
    /// detection code did not match (tampering or corruption).
    AuthenticationFailed,
    /// The passphrase and its confirmation differ.
    PassphraseMismatch,
    /// Passphrase could not be obtained from the configured reader.
    PassphraseUnavailable,
    /// A directory archive is truncated or contains a malformed entry.
    ArchiveCorruption,
    /// Interaction with the filesystem, stdin/stdout, or other I/O failed.
    Io,
    /// Unexpected state reached within quicrypt logic.
    InternalInvariant,
}

impl ErrorKind {
    /// Process exit status for this kind, loosely following sysexits(3).
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Format => 65,
            ErrorKind::NotFound => 66,
            ErrorKind::InternalInvariant => 70,
            ErrorKind::PassphraseMismatch => 73,
            ErrorKind::Io => 74,
            ErrorKind::PassphraseUnavailable => 75,
            ErrorKind::ArchiveCorruption => 76,
            ErrorKind::AuthenticationFailed => 77,
        }
    }
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct QuicryptError {
    /// Broad error category, always provided.
    pub category: ErrorCategory,
    /// Specific condition tag.
    pub kind: ErrorKind,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    msg: String,
}

impl QuicryptError {
    /// Creates a new error tagged with a category and kind.
    pub fn new(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            category,
            kind,
            source: None,
            msg: msg.into(),
        }
    }

    /// Creates a new error that retains the originating source error.
    pub fn with_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            category,
            kind,
            source: Some(Box::new(source)),
            msg: msg.into(),
        }
    }

    /// Shorthand for a malformed-input error.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::User, ErrorKind::Format, msg)
    }

    /// Converts an I/O error, recovering a `QuicryptError` that a reader
    /// layer tunnelled through `io::Error`. Anything else is tagged with
    /// `kind`; `NotFound` is attributed to the user.
    pub fn from_io(err: io::Error, kind: ErrorKind, msg: impl Into<String>) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<QuicryptError>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|e| e.downcast::<QuicryptError>()) {
                return *inner;
            }
            return Self::new(ErrorCategory::Internal, ErrorKind::InternalInvariant, msg);
        }
        let category = if err.kind() == io::ErrorKind::NotFound {
            ErrorCategory::User
        } else {
            ErrorCategory::Internal
        };
        Self::with_source(category, kind, msg, err)
    }

    /// Wraps this error so it can travel through `io::Read`/`io::Write`.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }

    /// The user-facing message carried by the error.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns the preserved source error if present.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    /// Wraps the current error with a higher-level message while preserving the original as source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let category = self.category;
        let kind = self.kind;
        Self {
            category,
            kind,
            source: Some(Box::new(self)),
            msg: msg.into(),
        }
    }

    /// The message followed by every cause, separated by `: `.
    pub fn report(&self) -> String {
        let mut out = self.msg.clone();
        let mut cause = StdError::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, QuicryptError>;
