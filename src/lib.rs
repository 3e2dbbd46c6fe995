//! photark: a provenance-first photo and video archive.
//!
//! Every payload that enters the archive is identified by its exact byte
//! hash, clustered with its derivatives by perceptual distance, enriched
//! with reconciled metadata from every source that ever presented it, and
//! mirrored into an editable sidecar. Payloads are immutable from the first
//! byte written; all interpretation lives in the database and sidecars.

pub mod config;
pub mod enrich;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod layout;
pub mod logging;
pub mod reconcile;
pub mod sidecar;
pub mod similarity;
pub mod store;
pub mod sync;
pub mod tier;

pub use error::{ArchiveError, Result};
