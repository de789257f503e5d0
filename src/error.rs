//! Error handling for resona.
//!
//! Provides a unified error type combining a category ([`ErrorKind`]) with
//! the underlying error details, plus conversions from the library errors
//! this crate builds on.
//!
//! # Error Categories
//!
//! The playback core distinguishes the failure classes a player has to
//! react to differently:
//! * File pre-flight failures (`FileNotFound`, `FileUnreadable`, `FileEmpty`)
//! * Decoder rejection (`DecoderOpenFailed`)
//! * Output device failures (`DeviceOpenFailed`, `DeviceLost`)
//! * Non-fatal seek errors (`SeekFailed`)
//! * Generic categories for argument validation and internal faults
//!
//! # Example
//!
//! ```rust
//! use resona::error::{Error, ErrorKind, Result};
//!
//! fn open_device() -> Result<()> {
//!     Err(Error::device_open_failed("no output device available"))
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for resona operations.
///
/// Wraps the standard `Result` type with our custom [`struct@Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for the playback core.
///
/// Each variant represents a distinct failure class with its own recovery
/// strategy. The file and device variants surface through
/// [`EngineEvent::ErrorOccurred`](crate::events::EngineEvent); `SeekFailed`
/// is non-fatal and leaves the playback position unchanged.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The file does not exist at the given path.
    #[error("File not found")]
    FileNotFound,

    /// The file exists but cannot be read.
    #[error("File not readable")]
    FileUnreadable,

    /// The file exists but is empty.
    #[error("File is empty")]
    FileEmpty,

    /// The container or codec was rejected by the decoder.
    #[error("Decoder failed to open source")]
    DecoderOpenFailed,

    /// The output device could not be opened, including after fallback
    /// to the default device. Terminal for the current load.
    #[error("Audio output device failed to open")]
    DeviceOpenFailed,

    /// The output device disappeared during playback.
    #[error("Audio output device lost")]
    DeviceLost,

    /// A seek to an invalid position failed; the position is unchanged.
    #[error("Seek failed")]
    SeekFailed,

    /// An argument was outside its documented range.
    #[error("Invalid argument specified")]
    InvalidArgument,

    /// A required resource was not found.
    #[error("Not found")]
    NotFound,

    /// A resource is not available in the current state.
    #[error("Unavailable")]
    Unavailable,

    /// The operation was cancelled before completion.
    #[error("Operation was cancelled")]
    Cancelled,

    /// An internal invariant was violated.
    #[error("Internal error")]
    Internal,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// Allows accessing the original error when its concrete type is known.
    ///
    /// # Returns
    /// * `Some(&E)` - If the underlying error is of type `E`
    /// * `None` - If the underlying error is not of type `E`
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Creates an error for a missing file, surfaced from `load()`
    /// pre-flight checks.
    pub fn file_not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FileNotFound, error)
    }

    /// Creates an error for a file that exists but cannot be read.
    pub fn file_unreadable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FileUnreadable, error)
    }

    /// Creates an error for an empty file.
    pub fn file_empty<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::FileEmpty, error)
    }

    /// Creates an error for a container or codec the decoder rejected.
    pub fn decoder_open_failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DecoderOpenFailed, error)
    }

    /// Creates an error for an output device that failed to open.
    pub fn device_open_failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeviceOpenFailed, error)
    }

    /// Creates an error for a device that disappeared during playback.
    pub fn device_lost<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::DeviceLost, error)
    }

    /// Creates a non-fatal error for a failed seek.
    pub fn seek_failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::SeekFailed, error)
    }

    /// Creates an error for invalid input parameters.
    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    /// Creates an error for missing resources.
    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }

    /// Creates an error for temporarily unavailable resources.
    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    /// Creates an error for cancelled operations.
    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    /// Creates an error for internal failures and violated invariants.
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Internal, error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::FileUnreadable,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, error)
    }
}

impl From<symphonia::core::errors::Error> for Error {
    fn from(error: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error as SymphoniaError;
        let kind = match &error {
            SymphoniaError::Unsupported(_) => ErrorKind::DecoderOpenFailed,
            SymphoniaError::SeekError(_) => ErrorKind::SeekFailed,
            SymphoniaError::IoError(_) => ErrorKind::FileUnreadable,
            _ => ErrorKind::DecoderOpenFailed,
        };
        Self::new(kind, error)
    }
}

impl From<cpal::DevicesError> for Error {
    fn from(error: cpal::DevicesError) -> Self {
        Self::new(ErrorKind::DeviceOpenFailed, error)
    }
}

impl From<cpal::BuildStreamError> for Error {
    fn from(error: cpal::BuildStreamError) -> Self {
        let kind = match &error {
            cpal::BuildStreamError::DeviceNotAvailable => ErrorKind::DeviceLost,
            _ => ErrorKind::DeviceOpenFailed,
        };
        Self::new(kind, error)
    }
}

impl From<cpal::PlayStreamError> for Error {
    fn from(error: cpal::PlayStreamError) -> Self {
        let kind = match &error {
            cpal::PlayStreamError::DeviceNotAvailable => ErrorKind::DeviceLost,
            _ => ErrorKind::DeviceOpenFailed,
        };
        Self::new(kind, error)
    }
}

impl From<cpal::SupportedStreamConfigsError> for Error {
    fn from(error: cpal::SupportedStreamConfigsError) -> Self {
        Self::new(ErrorKind::DeviceOpenFailed, error)
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Self::new(ErrorKind::DecoderOpenFailed, error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Self::new(ErrorKind::InvalidArgument, error)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn helper_constructors_set_kind() {
        assert_eq!(Error::file_not_found("x").kind, ErrorKind::FileNotFound);
        assert_eq!(Error::seek_failed("x").kind, ErrorKind::SeekFailed);
        assert_eq!(
            Error::decoder_open_failed("x").kind,
            ErrorKind::DecoderOpenFailed
        );
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::from(io);
        assert_eq!(err.kind, ErrorKind::FileNotFound);
        assert!(err.downcast::<std::io::Error>().is_some());
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = Error::device_open_failed("no such device");
        let text = err.to_string();
        assert!(text.contains("open"));
        assert!(text.contains("no such device"));
    }
}
