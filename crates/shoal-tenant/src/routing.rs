//! Shared resolution state for the per-resource routers: a TTL'd metadata
//! cache plus the map of lazily built dedicated handles, all behind one
//! read-write lock per router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shoal_core::{TenantMeta, TenantMetaProvider};
use tokio::sync::RwLock;

use crate::TenantError;

pub(crate) struct CachedMeta {
    meta: TenantMeta,
    fetched_at: Instant,
}

pub(crate) struct RouterState<H> {
    pub(crate) meta: HashMap<String, CachedMeta>,
    pub(crate) handles: HashMap<String, H>,
}

pub(crate) struct RouterCore<H> {
    provider: Arc<dyn TenantMetaProvider>,
    cache_ttl: Duration,
    pub(crate) state: RwLock<RouterState<H>>,
}

impl<H: Clone> RouterCore<H> {
    pub(crate) fn new(provider: Arc<dyn TenantMetaProvider>, cache_ttl: Duration) -> Self {
        Self {
            provider,
            cache_ttl,
            state: RwLock::new(RouterState {
                meta: HashMap::new(),
                handles: HashMap::new(),
            }),
        }
    }

    /// Metadata with the positive TTL cache. The provider call happens with
    /// no lock held; errors are surfaced and never cached.
    pub(crate) async fn load_meta(&self, tenant_id: &str) -> Result<TenantMeta, TenantError> {
        {
            let state = self.state.read().await;
            if let Some(cached) = state.meta.get(tenant_id) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.meta.clone());
                }
            }
        }

        let meta = self.provider.tenant_meta(tenant_id).await?;

        let mut state = self.state.write().await;
        state.meta.insert(
            tenant_id.to_string(),
            CachedMeta {
                meta: meta.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(meta)
    }

    pub(crate) async fn cached_handle(&self, tenant_id: &str) -> Option<H> {
        self.state.read().await.handles.get(tenant_id).cloned()
    }

    /// Drops the cached metadata and removes the owned handle, returning it
    /// so the caller can close it. Subsequent resolves re-fetch and rebuild.
    pub(crate) async fn invalidate(&self, tenant_id: &str) -> Option<H> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return None;
        }
        let mut state = self.state.write().await;
        state.meta.remove(tenant_id);
        state.handles.remove(tenant_id)
    }

    /// Removes every owned handle, returning them for teardown.
    pub(crate) async fn drain(&self) -> Vec<H> {
        let mut state = self.state.write().await;
        state.meta.clear();
        state.handles.drain().map(|(_, handle)| handle).collect()
    }
}
