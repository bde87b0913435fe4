//! # EMBER Submission Engine
//!
//! The orchestration layer of the EMBER GPU command-submission stack:
//! assigns task counters, grows command buffers and state heaps, registers
//! residency, flushes batches to the dispatch collaborator, and waits on the
//! hardware completion fence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       SubmissionEngine                           │
//! │                                                                  │
//! │   get_command_stream ──┐                                         │
//! │   get_heap ────────────┤   ┌──────────────────────────────────┐  │
//! │   make_resident ───────┼──►│ EngineCore (spin::Mutex)         │  │
//! │   submit ──────────────┤   │   HeapSet · queued batches ·     │  │
//! │   flush_pending ───────┘   │   tag pools · fence allocation   │  │
//! │                            └───────────┬──────────────────────┘  │
//! │   flush_and_wait ──── lock-free fence poll (outside the lock)    │
//! │                                        │                         │
//! │          AllocationStorage · ResidencyTracker · TagPool          │
//! └────────────────────────────────────────┴─────────────────────────┘
//! ```
//!
//! ## Submission Lifecycle
//!
//! QUEUED (batch recorded, task count assigned, referenced allocations
//! resident) → SUBMITTED (handed to the dispatcher, latest-flushed advanced)
//! → COMPLETED (fence reaches the assigned count) → RECLAIMED (backings
//! returned to the lifecycle lists). Transitions are strictly forward.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod engine;

pub use engine::{EngineConfig, EngineCore, SubmissionEngine};
