//! `changewatch-core`: shared building blocks.
//!
//! This crate contains the error model, identifiers and the collection
//! namespace type (no IO, no async).

pub mod error;
pub mod id;
pub mod namespace;

pub use error::{ChangewatchError, ChangewatchResult};
pub use id::{BatchId, SubscriptionId};
pub use namespace::Namespace;
