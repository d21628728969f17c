//! Stage execution and pipeline orchestration for Stagecraft.
//!
//! This crate drives runs: the [`LlmGateway`] wraps every backend call with
//! timeouts, shared rate limits and retries; the [`StageExecutor`] runs one
//! stage through its prompt, validate and repair loop; the [`Orchestrator`]
//! sequences stages, commits artifacts and maintains memory.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Sequences calls between business logic in the
//! [`pipeline`] crate and the port traits it defines (LLM, sandbox, memory,
//! artifact sink). Concrete adapters are injected by the composition root.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`gateway`] | `LlmGateway`: routing, timeouts, retries |
//! | [`rate_limit`] | Per-backend concurrency and request-rate limiter |
//! | [`retry`] | Exponential backoff schedule |
//! | [`prompt`] | Prompt assembly within the context budget |
//! | [`output`] | Parsing model responses into declared artifacts |
//! | [`executor`] | `StageExecutor` repair loop |
//! | [`entities`] | Named-entity extraction from generated code |
//! | [`orchestrator`] | `Orchestrator` run loop and run registry |
//! | [`engineering`] | Built-in seven-stage engineering-team pipeline |

pub mod engineering;
pub mod entities;
pub mod executor;
pub mod gateway;
pub mod orchestrator;
pub mod output;
pub mod prompt;
pub mod rate_limit;
pub mod retry;

pub use engineering::{engineering_team, ENGINEERING_TEAM};
pub use entities::{extract_entities, Entity, EntityKind};
pub use executor::StageExecutor;
pub use gateway::{GatewayError, GatewayFailure, GatewayResponse, LlmGateway};
pub use orchestrator::{Orchestrator, DEFAULT_RUN_HISTORY};
pub use rate_limit::RateLimiter;
pub use retry::Backoff;

// Cancellation tokens are part of the run API.
pub use tokio_util::sync::CancellationToken;
