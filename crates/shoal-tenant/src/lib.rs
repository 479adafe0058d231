//! Tenant routing layer: maps a tenant id to the backing resources it
//! should use (cache, database, broker, object store), caches the routing
//! metadata with a short TTL, and rebuilds bindings when tenant
//! configuration changes.

mod broker;
mod cache;
mod db;
mod object;
mod routing;

use std::sync::Arc;

use shoal_core::MetaError;
use thiserror::Error;

pub use broker::{BrokerHandle, BrokerRouter, CHAT_EVENTS_EXCHANGE};
pub use cache::{redis_url, CacheHandle, CacheRouter};
pub use db::DbRouter;
pub use object::{ObjectBinding, ObjectRouter};

/// Positive metadata cache TTL. There is no negative caching: lookup
/// failures are surfaced and retried on the next resolve.
pub const META_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TenantError {
    #[error("tenant is inactive")]
    Inactive,
    #[error("tenant not found")]
    NotFound,
    #[error("tenant metadata fetch failed: {0}")]
    Meta(String),
    #[error("tenant handle build failed: {0}")]
    Handle(String),
    #[error("broker publish failed: {0}")]
    Broker(String),
}

impl From<MetaError> for TenantError {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::NotFound => TenantError::NotFound,
            MetaError::Upstream(msg) => TenantError::Meta(msg),
        }
    }
}

/// Owns one router per resource type and fans invalidation across them,
/// the way the tenant-admin flow expects every replica to behave after a
/// tenant update.
pub struct TenantRouter {
    cache: CacheRouter,
    db: DbRouter,
    broker: Option<Arc<BrokerRouter>>,
    object: ObjectRouter,
}

impl TenantRouter {
    pub fn new(
        cache: CacheRouter,
        db: DbRouter,
        broker: Option<Arc<BrokerRouter>>,
        object: ObjectRouter,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            db,
            broker,
            object,
        })
    }

    pub fn cache(&self) -> &CacheRouter {
        &self.cache
    }

    pub fn db(&self) -> &DbRouter {
        &self.db
    }

    pub fn broker(&self) -> Option<&BrokerRouter> {
        self.broker.as_deref()
    }

    pub fn object(&self) -> &ObjectRouter {
        &self.object
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache.invalidate(tenant_id).await;
        self.db.invalidate(tenant_id).await;
        if let Some(broker) = &self.broker {
            broker.invalidate(tenant_id).await;
        }
        self.object.invalidate(tenant_id).await;
    }

    pub async fn close(&self) {
        self.cache.close().await;
        self.db.close().await;
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
        self.object.close().await;
    }
}
