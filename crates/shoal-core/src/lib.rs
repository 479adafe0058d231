//! Shared domain models and seams for the shoal realtime backend.

pub mod env;
pub mod models;
pub mod provider;

pub use models::*;
pub use provider::{MetaError, TenantMetaProvider};
