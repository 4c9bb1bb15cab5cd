//! Shared data model and boundaries for the diary-to-toon service.

pub mod characters;
pub mod clock;
pub mod comments;
pub mod episodes;
pub mod error;
pub mod events;
pub mod identity;
pub mod rate_limit;
pub mod stores;

pub use error::{ApiError, ApiResult, FailureKind};
