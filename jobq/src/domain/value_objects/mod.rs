//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod related_entity;
mod retry_policy;

pub use related_entity::RelatedEntity;
pub use retry_policy::{DEFAULT_BACKOFF_BASE, ExponentialRetryPolicy, RetryPolicy};
