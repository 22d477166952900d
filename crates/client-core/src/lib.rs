//! Client-side consistency and resilience core for the marketplace app.
//!
//! This crate owns the normalized entity cache and its ordered views,
//! optimistic mutations with rollback, failure classification and
//! diagnostics, retry/circuit-breaker resilience, and the conversation
//! polling subsystem. It talks to the server only through the
//! `client-transport` seam.

/// Circuit breaker guarding a downstream resource class.
pub mod breaker;
/// Injectable client context tying the pieces together.
pub mod client;
/// Environment-driven configuration.
pub mod config;
/// Conversation polling, read state, and typing indicators.
pub mod conversation;
/// Bounded error log and diagnostic report.
pub mod diagnostics;
/// Failure taxonomy and the stable client error type.
pub mod error;
/// Fallback and default-value wrappers.
pub mod fallback;
/// Optimistic mutation coordinator.
pub mod mutation;
/// Backoff policies and retry loops.
pub mod retry;
/// Normalized entity cache, views, and subscriptions.
pub mod store;
/// Entity model and typed projections.
pub mod types;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{Client, PageMode};
pub use config::{ClientConfig, ConfigError};
pub use conversation::{ConversationHub, PollPhase};
pub use diagnostics::{ERROR_LOG_CAPACITY, ErrorLog, ErrorReport};
pub use error::{ClientError, ErrorClass, ErrorRecord, classify};
pub use fallback::{with_default, with_fallback};
pub use mutation::{MutationCoordinator, MutationHandle};
pub use retry::{BackoffPolicy, retry_with_backoff, retry_with_condition};
pub use store::{
    LoadState, SharedStore, Store, StoreEvent, Subscription, ViewName, ViewSnapshot,
};
pub use types::{
    Conversation, Entity, EntityKind, EntityPage, FieldDeltas, Message, Post, UserProfile,
    field_map, page_from_body,
};
