//! Stagecraft storage adapters.
//!
//! Implements the [`pipeline::MemoryStore`] and [`pipeline::ArtifactSink`]
//! ports:
//!
//! | Type | Port | Durability |
//! |------|------|------------|
//! | [`InMemoryMemoryStore`] | `MemoryStore` | process lifetime |
//! | [`FileMemoryStore`] | `MemoryStore` | global tiers in a JSON snapshot |
//! | [`InMemoryArtifactSink`] | `ArtifactSink` | process lifetime |
//! | [`FsArtifactSink`] | `ArtifactSink` | versioned files under a root directory |
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules. Relevance
//! ranking and version semantics are defined in [`pipeline`]; this crate only
//! stores and retrieves.

mod artifacts;
mod memory;

pub use artifacts::{FsArtifactSink, InMemoryArtifactSink};
pub use memory::{FileMemoryStore, InMemoryMemoryStore};
