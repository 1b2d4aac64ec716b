//! Context budgeting: sizing, deduplicating and fitting content into a
//! token ceiling.
//!
//! | Stage | Module | Input → Output |
//! |-------|--------|----------------|
//! | Estimate | [`token`] | text or file → token count (+ warning) |
//! | Deduplicate | [`dedup`] | thread turns → file references to re-send |
//! | Allocate | [`budget`] | sized candidates + ceiling → selected / omitted |
//!
//! All three are pure. Only the estimator touches the filesystem, and only
//! to read a file once per estimate.

pub mod budget;
pub mod dedup;
pub mod token;

pub use budget::{
    Allocation, AllocationPolicy, Allocator, Candidate, ClassShares, OmissionReason, Omitted,
    PriorityClass, Selected, allocate,
};
pub use dedup::reduce;
pub use token::{Content, Estimable, Estimate, FileWarning, estimate_file, estimate_file_async, estimate_tokens};
