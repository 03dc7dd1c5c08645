// src/error.rs
//
// Unified error handling for raster-worker
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - InputValidation: Bad request data, recoverable by the caller
// - Codec: Decode/encode failures
// - ResourceLimit: Memory/dimension/size budgets
// - Protocol: Malformed or unknown messages at the worker boundary
// - Initialization: Capability self-test failure (fatal for the worker)
// - InternalBug: Library bugs (should not happen)

use std::borrow::Cow;
use thiserror::Error;

/// Error taxonomy for structured failure results.
///
/// Every error the worker surfaces falls into one of these buckets so hosts
/// can decide between retrying, shrinking the input, or giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad request data, recoverable by the caller
    InputValidation,
    /// Decode/encode failures
    Codec,
    /// Memory/dimension/size budgets
    ResourceLimit,
    /// Malformed or unknown messages
    Protocol,
    /// Capability self-test failure
    Initialization,
    /// Library bugs (should not happen)
    InternalBug,
}

/// raster-worker error types
///
/// All errors are type-safe and carry clear, actionable messages.
/// Nothing here is ever thrown across the worker boundary - public entry
/// points convert errors into failed `ProcessingResult`s.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum WorkerError {
    // Input validation
    #[error("Invalid or empty image data")]
    EmptyInput,

    #[error("Image too large: {actual_mb:.1}MB exceeds {limit_mb:.1}MB limit")]
    InputTooLarge { actual_mb: f64, limit_mb: f64 },

    #[error("Invalid image dimensions")]
    InvalidSourceDimensions,

    #[error("Invalid target dimensions {width}x{height}: must be within 1..={max}")]
    DimensionOutOfRange { width: u32, height: u32, max: u32 },

    #[error("Estimated output size {estimated_mb:.1}MB exceeds memory budget of {budget_mb:.1}MB")]
    OutputTooLarge { estimated_mb: f64, budget_mb: f64 },

    // Codec
    #[error("Failed to create image bitmap: {message}")]
    DecodeFailed { message: Cow<'static, str> },

    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Resource exhaustion
    #[error(
        "Memory pressure critical ({percentage:.0}%) after recovery - try a smaller image"
    )]
    MemoryCritical { percentage: f64 },

    // Protocol
    #[error("Unknown operation type: {kind}")]
    UnknownOperation { kind: String },

    // Initialization
    #[error("Worker initialization failed: {message}")]
    InitializationFailed { message: Cow<'static, str> },

    // Internal
    #[error("Internal error: {message}")]
    InternalPanic { message: Cow<'static, str> },
}

// Constructor Helpers
impl WorkerError {
    pub fn empty_input() -> Self {
        Self::EmptyInput
    }

    pub fn input_too_large(actual_bytes: u64, limit_bytes: u64) -> Self {
        Self::InputTooLarge {
            actual_mb: actual_bytes as f64 / (1024.0 * 1024.0),
            limit_mb: limit_bytes as f64 / (1024.0 * 1024.0),
        }
    }

    pub fn invalid_source_dimensions() -> Self {
        Self::InvalidSourceDimensions
    }

    pub fn dimension_out_of_range(width: u32, height: u32, max: u32) -> Self {
        Self::DimensionOutOfRange { width, height, max }
    }

    pub fn output_too_large(estimated_bytes: u64, budget_bytes: u64) -> Self {
        Self::OutputTooLarge {
            estimated_mb: estimated_bytes as f64 / (1024.0 * 1024.0),
            budget_mb: budget_bytes as f64 / (1024.0 * 1024.0),
        }
    }

    pub fn decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn memory_critical(percentage: f64) -> Self {
        Self::MemoryCritical { percentage }
    }

    pub fn unknown_operation(kind: impl Into<String>) -> Self {
        Self::UnknownOperation { kind: kind.into() }
    }

    pub fn initialization_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InitializationFailed {
            message: message.into(),
        }
    }

    pub fn internal_panic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalPanic {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the caller can fix it)
    ///
    /// Consistent with category():
    /// - InputValidation and ResourceLimit errors are recoverable (smaller
    ///   image, lower target dimensions, wait for pressure to drop)
    /// - Codec, Protocol, Initialization and InternalBug errors are not
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::InputValidation | ErrorCategory::ResourceLimit
        )
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EmptyInput
            | Self::InvalidSourceDimensions
            | Self::DimensionOutOfRange { .. } => ErrorCategory::InputValidation,

            Self::DecodeFailed { .. } | Self::EncodeFailed { .. } => ErrorCategory::Codec,

            Self::InputTooLarge { .. }
            | Self::OutputTooLarge { .. }
            | Self::MemoryCritical { .. } => ErrorCategory::ResourceLimit,

            Self::UnknownOperation { .. } => ErrorCategory::Protocol,

            Self::InitializationFailed { .. } => ErrorCategory::Initialization,

            Self::InternalPanic { .. } => ErrorCategory::InternalBug,
        }
    }
}

impl ErrorCategory {
    /// Get string representation of error category
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InputValidation => "InputValidation",
            ErrorCategory::Codec => "Codec",
            ErrorCategory::ResourceLimit => "ResourceLimit",
            ErrorCategory::Protocol => "Protocol",
            ErrorCategory::Initialization => "Initialization",
            ErrorCategory::InternalBug => "InternalBug",
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, WorkerError>;
