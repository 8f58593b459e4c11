//! Change events, pipelines and subscriptions (mechanics only).
//!
//! Backends live in `changewatch-infra`; this crate defines what a change
//! event looks like, how a pipeline filters and reshapes it, and how a
//! consumer receives events from a live subscription.

pub mod document;
pub mod event;
pub mod listener;
pub mod pipeline;
pub mod source;
pub mod subscription;
pub mod write;

pub use event::{ChangeEvent, ChangeEventBuilder, OperationKind, ResumeToken, UpdateDescription};
pub use listener::{ListenerExit, ListenerHandle, ListenerSummary, StopAfter};
pub use pipeline::{CompiledPipeline, Filter, Pipeline, Projection, Stage};
pub use source::{ChangeSource, DocumentStore, FullDocument, Store, WatchOptions};
pub use subscription::{ChangeSubscription, SubscriptionFeed, SubscriptionHandle};
pub use write::{UpdateSpec, WriteResult, WriteSpec};
