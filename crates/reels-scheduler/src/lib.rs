//! Content scheduling and generation orchestrator for Reels.
//!
//! This crate owns the lifecycle of a content item:
//! - Intake as a `Draft` through the [`Orchestrator`] facade
//! - Caption and media generation on a bounded worker pool
//! - Wall-clock publish scheduling with a wake-or-wait timer
//! - Per-account serialized publishing with retry and idempotency tokens
//!
//! All coordination goes through the version-guarded compare-and-swap of
//! the [`ItemStore`]; there is no lock spanning more than one item.

mod config;
mod error;
mod generation;
mod orchestrator;
mod publish;
mod retry;
mod scheduler;
mod store;
mod types;

pub use config::{
    DEFAULT_ACCOUNT, DEFAULT_CAPTION, GenerationConfig, OrchestratorConfig, PublishConfig,
    SchedulerConfig,
};
pub use error::{BackendError, OrchestratorError, PublishError, StoreError};
pub use generation::{CaptionContext, GeneratedCaption, GenerationBackend, GenerationDispatcher};
pub use orchestrator::{IntakeRequest, MediaSource, Orchestrator};
pub use publish::{PublishDispatcher, PublishReceipt, Publisher};
pub use retry::RetryPolicy;
pub use scheduler::{PublishScheduler, SchedulerHandle};
pub use store::{ItemStore, JsonFileStore, MemoryStore, Mutator};
pub use types::{
    ContentItem, FailureReason, IdempotencyToken, ItemEvent, ItemId, ItemState, MediaRef,
    normalize_hashtags, parse_hashtags,
};
