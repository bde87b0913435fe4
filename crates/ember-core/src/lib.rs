//! # EMBER Core
//!
//! Foundational traits, types, and abstractions for the EMBER GPU
//! command-submission and residency engine.
//!
//! This crate provides the type-system foundations shared by the memory
//! lifecycle layer (`ember-mem`) and the submission engine (`ember-cmd`).
//!
//! ## Design Principles
//!
//! 1. **Ownership By Container**: an allocation is a member of exactly one
//!    of {heap backing, lifecycle list, tag-pool block, caller} at any time
//! 2. **Fence-Ordered Reclamation**: fence >= recorded task count is the
//!    single source of truth for reuse safety
//! 3. **No Unsafe Leakage**: unsafe code is contained and audited
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ember-core                             │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Traits    │  │   Types     │  │  Execution Context  │  │
//! │  │ (MemoryOps, │  │ (GpuAddr,   │  │  (task counter +    │  │
//! │  │ DispatchOps)│  │  TaskCount) │  │   hardware fence)   │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod allocation;
pub mod caps;
pub mod command;
pub mod context;
pub mod error;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use allocation::{Allocation, AllocationFlags, AllocationId, AllocationKind};
pub use caps::{CapsRegistry, EngineCaps, HardwareFamily};
pub use command::{BufferRegion, SubmitBatch, SubmitFlags};
pub use context::{ContextId, ExecutionContext};
pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
