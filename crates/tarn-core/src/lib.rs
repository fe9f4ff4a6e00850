//! # tarn-core
//!
//! Core building blocks shared across the Tarn data lake:
//!
//! - **Strongly-typed identifiers**: ULID-backed IDs for jobs, requests,
//!   chains, and content entries
//! - **Error types**: the core error enum wrapped by domain crates
//! - **Content store**: the collaborator trait for raw content storage,
//!   with an in-memory backend for testing
//!
//! Domain logic lives in `tarn-flow`; this crate intentionally stays small
//! so every service binary can depend on it without pulling in the
//! orchestration machinery.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod content;
pub mod error;
pub mod id;

pub use content::{ContentStore, MemoryContentStore, Provenance};
pub use error::{Error, Result};
pub use id::{ChainId, ContentId, JobId, RequestId};
