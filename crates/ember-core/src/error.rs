//! # EMBER Error Handling
//!
//! Unified error types for the submission engine stack.
//!
//! Error handling in EMBER follows these principles:
//! - Errors are typed and categorized by subsystem
//! - No panics in production code paths (contract violations excepted)
//! - A reuse-pool miss is not an error; it falls through to fresh allocation
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// EMBER Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// EMBER unified error type
///
/// Covers all error conditions across the submission engine stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation timed out
    Timeout,
    /// Resource is busy
    Busy,
    /// Operation not supported
    NotSupported,
    /// Component is in the wrong state for the operation
    InvalidState,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of device memory
    OutOfMemory,
    /// Allocator collaborator reported failure
    AllocationFailed,
    /// Invalid GPU address
    InvalidGpuAddress,
    /// Address not aligned
    MisalignedAddress,
    /// Linear heap has no room for the requested chunk
    HeapOverflow,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Command buffer has no usable backing
    CommandBufferUnavailable,
    /// Command submission failed
    SubmissionFailed,
    /// Fence wait timeout
    FenceTimeout,
    /// Engine has already been torn down
    EngineTornDown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::InvalidState => write!(f, "invalid state"),

            // Memory
            Self::OutOfMemory => write!(f, "out of device memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::InvalidGpuAddress => write!(f, "invalid GPU address"),
            Self::MisalignedAddress => write!(f, "misaligned address"),
            Self::HeapOverflow => write!(f, "linear heap overflow"),

            // Command
            Self::CommandBufferUnavailable => write!(f, "command buffer unavailable"),
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::FenceTimeout => write!(f, "fence wait timeout"),
            Self::EngineTornDown => write!(f, "engine torn down"),
        }
    }
}
