//! Conversation continuation and context budgeting.
//!
//! A tool call arrives with or without a continuation id:
//!
//! 1. **Offload** oversized prompt text to a file ([`offload`])
//! 2. **Start** a thread, or **read** the existing one from the store
//! 3. **Deduplicate** the files attached across the thread ([`context::dedup`])
//! 4. **Allocate** turn text, then files, against the token ceiling ([`context::budget`])
//! 5. **Append** the incoming turn and re-arm the thread's expiry
//!
//! The model's answer is recorded separately, once it exists.

pub mod context;
pub mod continuation;
pub mod history;
pub mod offload;

pub use context::{
    Allocation, Allocator, Candidate, ClassShares, Content, Estimable, Estimate, FileWarning,
    OmissionReason, PriorityClass, allocate, estimate_file, estimate_file_async, estimate_tokens,
    reduce,
};
pub use continuation::{
    BundledTurn, ContinuationEngine, NewThreadOutcome, OmittedFile, ReconstructionRequest,
    ResumeBundle, TurnOutcome, TurnRequest,
};
pub use history::render_history;
pub use offload::{OFFLOAD_NOTE, Payload, PayloadOffloader};
