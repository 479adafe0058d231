use async_trait::async_trait;
use thiserror::Error;

use crate::models::TenantMeta;

/// Errors a metadata lookup can surface. `NotFound` is terminal for the
/// tenant id; `Upstream` covers transport and persistence failures and is
/// retried on the next resolve (routers never cache a negative result).
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("tenant not found")]
    NotFound,
    #[error("tenant metadata fetch failed: {0}")]
    Upstream(String),
}

/// Source of tenant routing metadata. The persistence client implements
/// this; routers depend only on the trait so the tenant layer never points
/// back into persistence.
#[async_trait]
pub trait TenantMetaProvider: Send + Sync {
    async fn tenant_meta(&self, tenant_id: &str) -> Result<TenantMeta, MetaError>;
}
