//! Core orchestration domain for Stagecraft.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, error type and port trait used throughout the pipeline. Infrastructure
//! crates implement the traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`StageId`, `RunId`, `ArtifactName`, etc.) |
//! | [`types`] | Value types (`Artifact`, `TokenUsage`, `Timestamp`, etc.) |
//! | [`errors`] | Configuration, validation and run-level errors; `RetryPolicy` |
//! | [`stage`] | `StageDefinition` and the ordered `PipelineGraph` |
//! | [`router`] | Backend definitions and the `ModelRouter` |
//! | [`config`] | TOML configuration schema |
//! | [`context`] | Append-only `RunContext` |
//! | [`run`] | Run state machine, `ExecutionResult`, `RunReport` |
//! | [`memory`] | Memory tiers, `MemoryStore` port, relevance ranking |
//! | [`provider`] | `LlmProvider` port |
//! | [`sandbox`] | `CodeSandbox` port |
//! | [`sink`] | `ArtifactSink` port |

pub mod config;
pub mod context;
pub mod errors;
pub mod identifiers;
pub mod memory;
pub mod provider;
pub mod router;
pub mod run;
pub mod sandbox;
pub mod sink;
pub mod stage;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{
    LoadedPipeline, PipelineConfig, PipelineSettings, SandboxSection, DEFAULT_MAX_CONTEXT_CHARS,
    DEFAULT_MAX_TOKENS,
};
pub use context::RunContext;
pub use errors::{ConfigurationError, ErrorKind, OrchestratorError, RetryPolicy, ValidationError};
pub use identifiers::{ArtifactName, BackendId, MemoryKey, PipelineName, RunId, StageId};
pub use memory::{
    rank_relevant, tokenize, MemoryError, MemoryRecord, MemoryScope, MemoryStore, MemoryValue,
    RelevanceScorer, TermOverlapScorer,
};
pub use provider::{LlmError, LlmProvider, LlmRequest, LlmResponse};
pub use router::{
    BackendConfig, BackendDefinition, BackendKind, ModelRouter, RateLimit, RetrySettings,
    DEFAULT_BACKEND_TIMEOUT, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES,
};
pub use run::{
    ExecutionResult, RunReport, RunState, RunStatus, StageFailure, StageOutcome, TransitionError,
};
pub use sandbox::{CodeSandbox, SandboxFile, SandboxOutcome, SandboxRequest, ToolError};
pub use sink::{ArtifactError, ArtifactLocation, ArtifactSink};
pub use stage::{
    MemoryPolicy, ModelParameters, OutputSpec, PipelineGraph, SandboxBinding, StageDefinition,
    ToolBinding, DEFAULT_MAX_REPAIRS, DEFAULT_RECALL_K, DEFAULT_SANDBOX_TIMEOUT, REQUEST_KEY,
};
pub use types::{Artifact, ArtifactContent, ArtifactShape, Timestamp, TokenCount, TokenUsage};
