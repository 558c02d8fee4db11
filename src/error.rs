//! # Error Handling
//!
//! Error types for the orchestration engine. Every failure carries an
//! [`ErrorContext`] with optional detail, an optional user-actionable
//! recovery suggestion and a severity that decides how it is logged.
//!
//! ## Error Classification
//!
//! - **Engine failures** ([`GenError::Engine`], [`GenError::NoImage`]) are
//!   surfaced as status text; the user can try again.
//! - **Missing assets** ([`GenError::ModelMissing`]) carry a recovery
//!   suggestion pointing at the setup screen.
//! - **Unsupported capabilities** ([`GenError::Unsupported`]) are permanent for
//!   the lifetime of the process.
//! - **Cancellation** ([`GenError::Cancelled`]) is never reported as a failure.
//!
//! ## Usage
//!
//! ```rust
//! use genai_cam::error::{ErrorSeverity, GenError, HasSeverity};
//!
//! let error = GenError::engine("description", "decoder returned no tokens")
//!     .with_context("generate short description");
//! assert_eq!(error.severity(), ErrorSeverity::Error);
//! assert_eq!(error.severity().log_level(), log::Level::Error);
//! assert!(!error.is_cancellation());
//! ```

use std::{error::Error as StdError, fmt};

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected outcomes that are reported, not failures (cancellation)
    Info,
    /// Degraded behaviour with a fallback
    Warning,
    /// Operation failed, the caller can try again
    Error,
    /// Permanent for the current process
    Critical,
}

impl ErrorSeverity {
    /// Level at which failures of this severity are logged.
    pub fn log_level(self) -> log::Level {
        match self {
            ErrorSeverity::Info => log::Level::Info,
            ErrorSeverity::Warning => log::Level::Warn,
            ErrorSeverity::Error | ErrorSeverity::Critical => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Additional context about the error
    pub context: Option<String>,
    /// Suggested recovery action, phrased for the user
    pub recovery_suggestion: Option<String>,
    pub severity: ErrorSeverity,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            context: None,
            recovery_suggestion: None,
            severity: ErrorSeverity::Error,
        }
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    fn with_recovery_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestion = Some(suggestion.into());
        self
    }
}

/// Base error type for the orchestration engine
#[derive(Debug)]
pub enum GenError {
    /// Configuration validation errors
    Config {
        field: String,
        value: String,
        reason: String,
        context: ErrorContext,
    },
    /// A model asset (weights, pipeline resources) is not on disk
    ModelMissing {
        asset: String,
        context: ErrorContext,
    },
    /// The capability does not exist on this device or OS
    Unsupported {
        capability: String,
        reason: String,
        context: ErrorContext,
    },
    /// The description or image engine failed
    Engine {
        engine: String,
        reason: String,
        context: ErrorContext,
    },
    /// The engine finished without producing an image
    NoImage {
        provider: String,
        context: ErrorContext,
    },
    /// The operation was cancelled before it finished
    Cancelled {
        operation: String,
        context: ErrorContext,
    },
    /// I/O errors
    Io {
        operation: String,
        source: std::io::Error,
        context: ErrorContext,
    },
    /// Settings or response payloads that could not be (de)serialized
    Serialization {
        reason: String,
        context: ErrorContext,
    },
    /// External library errors
    External {
        library: String,
        source: Box<dyn StdError + Send + Sync>,
        context: ErrorContext,
    },
}

impl GenError {
    /// Create a configuration error
    pub fn config(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Config {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Critical),
        }
    }

    /// Create a missing-asset error with the default recovery suggestion
    pub fn model_missing(asset: impl Into<String>) -> Self {
        let asset = asset.into();
        let suggestion = format!("Download {asset} from the setup screen");
        Self::ModelMissing {
            asset,
            context: ErrorContext::new()
                .with_severity(ErrorSeverity::Warning)
                .with_recovery_suggestion(suggestion),
        }
    }

    /// Create an unsupported-capability error
    pub fn unsupported(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            capability: capability.into(),
            reason: reason.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Critical),
        }
    }

    /// Create an engine failure
    pub fn engine(engine: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Engine {
            engine: engine.into(),
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn no_image(provider: impl Into<String>) -> Self {
        Self::NoImage {
            provider: provider.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create a cancellation marker
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            context: ErrorContext::new().with_severity(ErrorSeverity::Info),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
            context: ErrorContext::new(),
        }
    }

    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
            context: ErrorContext::new(),
        }
    }

    /// Create an external library error
    pub fn external(
        library: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            library: library.into(),
            source: Box::new(source),
            context: ErrorContext::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context_mut().context = Some(context.into());
        self
    }

    /// Get the error context
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. } => context,
            Self::ModelMissing { context, .. } => context,
            Self::Unsupported { context, .. } => context,
            Self::Engine { context, .. } => context,
            Self::NoImage { context, .. } => context,
            Self::Cancelled { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::Serialization { context, .. } => context,
            Self::External { context, .. } => context,
        }
    }

    fn context_mut(&mut self) -> &mut ErrorContext {
        match self {
            Self::Config { context, .. } => context,
            Self::ModelMissing { context, .. } => context,
            Self::Unsupported { context, .. } => context,
            Self::Engine { context, .. } => context,
            Self::NoImage { context, .. } => context,
            Self::Cancelled { context, .. } => context,
            Self::Io { context, .. } => context,
            Self::Serialization { context, .. } => context,
            Self::External { context, .. } => context,
        }
    }

    /// Get the error category as a string
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::ModelMissing { .. } => "model_missing",
            Self::Unsupported { .. } => "unsupported",
            Self::Engine { .. } => "engine",
            Self::NoImage { .. } => "no_image",
            Self::Cancelled { .. } => "cancelled",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::External { .. } => "external",
        }
    }

    /// Cancellation is an outcome, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl fmt::Display for GenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenError::Config {
                field,
                value,
                reason,
                ..
            } => write!(
                f,
                "Configuration error in '{}': {} (value: {})",
                field, reason, value
            ),
            GenError::ModelMissing { asset, .. } => write!(f, "{} model not found", asset),
            GenError::Unsupported { reason, .. } => write!(f, "{}", reason),
            GenError::Engine { engine, reason, .. } => {
                write!(f, "{} engine failed: {}", engine, reason)
            }
            GenError::NoImage { provider, .. } => {
                write!(f, "{} finished without producing an image", provider)
            }
            GenError::Cancelled { operation, .. } => write!(f, "{} was cancelled", operation),
            GenError::Io {
                operation, source, ..
            } => write!(f, "I/O error during {}: {}", operation, source),
            GenError::Serialization { reason, .. } => write!(f, "Serialization error: {}", reason),
            GenError::External {
                library, source, ..
            } => write!(f, "{} error: {}", library, source),
        }
    }
}

impl StdError for GenError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::External { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Result type alias using our error type
pub type GenResult<T> = Result<T, GenError>;

/// Trait for errors with severity levels
pub trait HasSeverity {
    fn severity(&self) -> ErrorSeverity;
}

impl HasSeverity for GenError {
    fn severity(&self) -> ErrorSeverity {
        self.context().severity
    }
}

/// Trait for errors that carry a user-facing recovery suggestion
pub trait HasRecoverySuggestion {
    fn recovery_suggestion(&self) -> Option<&str>;
}

impl HasRecoverySuggestion for GenError {
    fn recovery_suggestion(&self) -> Option<&str> {
        self.context().recovery_suggestion.as_deref()
    }
}

impl From<std::io::Error> for GenError {
    fn from(error: std::io::Error) -> Self {
        Self::io("unknown", error)
    }
}

impl From<serde_json::Error> for GenError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

impl From<image::ImageError> for GenError {
    fn from(error: image::ImageError) -> Self {
        Self::external("image", error)
    }
}

impl From<cam_scale::cpu::ScaleError> for GenError {
    fn from(error: cam_scale::cpu::ScaleError) -> Self {
        Self::external("cam-scale", error)
    }
}

impl From<reqwest::Error> for GenError {
    fn from(error: reqwest::Error) -> Self {
        Self::external("reqwest", error)
    }
}
