use std::sync::Arc;

use redis::aio::{ConnectionManager, PubSub};
use shoal_core::TenantMetaProvider;

use crate::routing::RouterCore;
use crate::{TenantError, META_CACHE_TTL};

/// Accepts either a full `redis://` URL or a bare `host:port` address, the
/// latter being what tenant records and `REDIS_ADDR` carry.
pub fn redis_url(addr: &str) -> String {
    let addr = addr.trim();
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}

/// A tenant's cache binding. The manager is the shared multiplexed
/// connection for commands and PUBLISH; subscriptions get their own
/// connection from the client.
#[derive(Clone)]
pub struct CacheHandle {
    client: redis::Client,
    manager: ConnectionManager,
}

impl CacheHandle {
    pub async fn connect(addr: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url(addr))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn subscriber(&self) -> Result<PubSub, redis::RedisError> {
        self.client.get_async_pubsub().await
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// Resolves the cache binding for a tenant: shared client unless the tenant
/// is dedicated with its own address, in which case a handle is built
/// lazily and owned by the router.
pub struct CacheRouter {
    shared: CacheHandle,
    core: RouterCore<CacheHandle>,
}

impl CacheRouter {
    pub fn new(shared: CacheHandle, provider: Arc<dyn TenantMetaProvider>) -> Self {
        Self {
            shared,
            core: RouterCore::new(provider, META_CACHE_TTL),
        }
    }

    pub async fn resolve(&self, tenant_id: &str) -> Result<CacheHandle, TenantError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Ok(self.shared.clone());
        }

        let meta = self.core.load_meta(tenant_id).await?;
        if !meta.is_active {
            return Err(TenantError::Inactive);
        }
        if !meta.is_dedicated() || meta.dedicated_redis_addr.is_empty() {
            return Ok(self.shared.clone());
        }

        if let Some(handle) = self.core.cached_handle(tenant_id).await {
            return Ok(handle);
        }

        let mut state = self.core.state.write().await;
        if let Some(handle) = state.handles.get(tenant_id) {
            return Ok(handle.clone());
        }
        let handle = CacheHandle::connect(&meta.dedicated_redis_addr)
            .await
            .map_err(|err| TenantError::Handle(err.to_string()))?;
        state
            .handles
            .insert(tenant_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        // Dropping the handle closes its connections.
        let _ = self.core.invalidate(tenant_id).await;
    }

    pub async fn close(&self) {
        let _ = self.core.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_passes_through_schemes_and_wraps_addrs() {
        assert_eq!(redis_url("localhost:6379"), "redis://localhost:6379");
        assert_eq!(redis_url(" 10.0.0.5:6380 "), "redis://10.0.0.5:6380");
        assert_eq!(
            redis_url("rediss://cache.internal:6379"),
            "rediss://cache.internal:6379"
        );
    }
}
