//! # granary-core
//!
//! Core abstractions for the granary staged-ingestion pipeline.
//!
//! This crate provides the foundational types and traits shared across the
//! pipeline components:
//!
//! - **Object Keys**: The `{stage}/{agency}/{filename}` naming convention that
//!   drives event routing between stages
//! - **Identifiers**: Strongly-typed, sortable IDs for job runs
//! - **Storage**: Abstract object-store interface with creation notifications
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `granary-core` is the **only** crate allowed to define shared primitives.
//! The pipeline crate (`granary-flow`) builds routing, scheduling, and the
//! stage chain on top of these contracts.
//!
//! ## Example
//!
//! ```rust
//! use granary_core::prelude::*;
//!
//! // Parse a deposited object's key into its structured form
//! let key = ObjectKey::parse("raw/cihr/2024.csv").unwrap();
//! assert_eq!(key.stage(), Stage::Raw);
//!
//! // Generate a unique run ID
//! let run_id = RunId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod key;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use granary_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::RunId;
    pub use crate::key::{ObjectKey, Stage};
    pub use crate::storage::{MemoryBackend, ObjectCreated, ObjectMeta, StorageBackend};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::RunId;
pub use key::{ObjectKey, Stage};
pub use observability::{LogFormat, init_logging};
pub use storage::{MemoryBackend, ObjectCreated, ObjectMeta, StorageBackend};
