//! # threadgate Core
//!
//! Domain types, traits, and error definitions for the threadgate
//! conversation continuation engine. This crate does no I/O; it defines
//! the model every other crate implements against.
//!
//! ## Design Philosophy
//!
//! The persistence seam is a trait here ([`KvBackend`]); backends live in
//! `threadgate-store`. This enables:
//! - Swapping the backing store via configuration
//! - Testing the engine against an in-memory backend
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod store;
pub mod thread;

// Re-export key types at crate root for ergonomics
pub use error::{Error, OffloadError, Result, StoreError, ThreadError};
pub use store::{KvBackend, Versioned};
pub use thread::{
    AttachedFile, ContinuationId, FileReference, ProviderMetadata, Role, Thread, TtlClass, Turn,
};
