//! Pattern memory: an append-only, full-text-searchable log of past
//! failures, fixes and notes.
//!
//! Backed by SQLite with an FTS5 index. Rows are never updated or deleted;
//! triggers reject both. A correction is a new row whose `supersedes` points
//! at the old one, and superseded rows drop out of query results.

pub mod record;
pub mod store;

pub use record::{
    CheckSummary, MemoryCategory, MemoryMatch, MemoryRecord, NewMemoryRecord, RecalledFix,
    derive_terms, term_overlap,
};
pub use store::{FUZZY_OVERLAP_THRESHOLD, MemoryStore};
