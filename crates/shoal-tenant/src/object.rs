use std::sync::Arc;
use std::time::Duration;

use shoal_core::TenantMetaProvider;

use crate::routing::RouterCore;
use crate::{TenantError, META_CACHE_TTL};

/// Object-store binding for a tenant: endpoint and credentials plus the key
/// prefix that isolates shared-bucket tenants. Consumers (the file
/// pipeline) build presigned requests from this; the routing layer only
/// decides where keys live.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectBinding {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub use_ssl: bool,
    pub key_prefix: String,
}

impl ObjectBinding {
    fn with_prefix(&self, key_prefix: String) -> Self {
        Self {
            key_prefix,
            ..self.clone()
        }
    }
}

pub struct ObjectRouter {
    shared: ObjectBinding,
    core: RouterCore<ObjectBinding>,
}

impl ObjectRouter {
    pub fn new(shared: ObjectBinding, provider: Arc<dyn TenantMetaProvider>) -> Self {
        Self::with_meta_ttl(shared, provider, META_CACHE_TTL)
    }

    pub fn with_meta_ttl(
        shared: ObjectBinding,
        provider: Arc<dyn TenantMetaProvider>,
        ttl: Duration,
    ) -> Self {
        Self {
            shared,
            core: RouterCore::new(provider, ttl),
        }
    }

    /// Shared-bucket tenants get the `tenants/{id}/` prefix so their keys
    /// stay isolated; dedicated tenants own their bucket and need none.
    pub async fn resolve(&self, tenant_id: &str) -> Result<ObjectBinding, TenantError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Ok(self.shared.clone());
        }

        let meta = self.core.load_meta(tenant_id).await?;
        if !meta.is_active {
            return Err(TenantError::Inactive);
        }
        if !meta.is_dedicated()
            || meta.dedicated_object_endpoint.is_empty()
            || meta.dedicated_object_bucket.is_empty()
        {
            return Ok(self
                .shared
                .with_prefix(format!("tenants/{tenant_id}/")));
        }

        if let Some(binding) = self.core.cached_handle(tenant_id).await {
            return Ok(binding);
        }

        let mut state = self.core.state.write().await;
        if let Some(binding) = state.handles.get(tenant_id) {
            return Ok(binding.clone());
        }
        let binding = ObjectBinding {
            endpoint: meta.dedicated_object_endpoint.clone(),
            access_key: meta.dedicated_object_access_key.clone(),
            secret_key: meta.dedicated_object_secret_key.clone(),
            bucket: meta.dedicated_object_bucket.clone(),
            use_ssl: meta.dedicated_object_use_ssl,
            key_prefix: String::new(),
        };
        state
            .handles
            .insert(tenant_id.to_string(), binding.clone());
        Ok(binding)
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        let _ = self.core.invalidate(tenant_id).await;
    }

    pub async fn close(&self) {
        let _ = self.core.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shoal_core::{MetaError, TenantMeta};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubProvider {
        metas: Mutex<HashMap<String, TenantMeta>>,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                metas: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, tenant_id: &str, meta: TenantMeta) {
            self.metas
                .lock()
                .unwrap()
                .insert(tenant_id.to_string(), meta);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TenantMetaProvider for StubProvider {
        async fn tenant_meta(&self, tenant_id: &str) -> Result<TenantMeta, MetaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.metas
                .lock()
                .unwrap()
                .get(tenant_id)
                .cloned()
                .ok_or(MetaError::NotFound)
        }
    }

    fn shared_binding() -> ObjectBinding {
        ObjectBinding {
            endpoint: "object.internal:9000".into(),
            access_key: "shared".into(),
            secret_key: "shared-secret".into(),
            bucket: "shoal".into(),
            use_ssl: false,
            key_prefix: String::new(),
        }
    }

    fn dedicated_meta() -> TenantMeta {
        TenantMeta {
            deployment_mode: "dedicated".into(),
            dedicated_object_endpoint: "t1-store:9000".into(),
            dedicated_object_access_key: "t1".into(),
            dedicated_object_secret_key: "t1-secret".into(),
            dedicated_object_bucket: "t1-bucket".into(),
            is_active: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_tenant_gets_the_shared_binding_unprefixed() {
        let router = ObjectRouter::new(shared_binding(), StubProvider::new());
        let binding = router.resolve("").await.expect("resolve");
        assert_eq!(binding, shared_binding());
    }

    #[tokio::test]
    async fn unknown_tenant_fails_not_found() {
        let router = ObjectRouter::new(shared_binding(), StubProvider::new());
        assert!(matches!(
            router.resolve("missing").await,
            Err(TenantError::NotFound)
        ));
    }

    #[tokio::test]
    async fn inactive_tenant_is_rejected() {
        let provider = StubProvider::new();
        provider.set(
            "t2",
            TenantMeta {
                is_active: false,
                ..dedicated_meta()
            },
        );
        let router = ObjectRouter::new(shared_binding(), provider);
        assert!(matches!(
            router.resolve("t2").await,
            Err(TenantError::Inactive)
        ));
    }

    #[tokio::test]
    async fn shared_mode_tenant_gets_a_key_prefix() {
        let provider = StubProvider::new();
        provider.set(
            "t1",
            TenantMeta {
                deployment_mode: "shared".into(),
                is_active: true,
                ..Default::default()
            },
        );
        let router = ObjectRouter::new(shared_binding(), provider);
        let binding = router.resolve("t1").await.expect("resolve");
        assert_eq!(binding.bucket, "shoal");
        assert_eq!(binding.key_prefix, "tenants/t1/");
    }

    #[tokio::test]
    async fn dedicated_tenant_with_blank_bucket_falls_back_to_shared() {
        let provider = StubProvider::new();
        provider.set(
            "t1",
            TenantMeta {
                dedicated_object_bucket: String::new(),
                ..dedicated_meta()
            },
        );
        let router = ObjectRouter::new(shared_binding(), provider);
        let binding = router.resolve("t1").await.expect("resolve");
        assert_eq!(binding.bucket, "shoal");
        assert_eq!(binding.key_prefix, "tenants/t1/");
    }

    #[tokio::test]
    async fn dedicated_binding_is_cached_until_invalidated() {
        let provider = StubProvider::new();
        provider.set("t1", dedicated_meta());
        let router = ObjectRouter::new(shared_binding(), provider.clone());

        let first = router.resolve("t1").await.expect("resolve");
        assert_eq!(first.bucket, "t1-bucket");
        assert_eq!(first.key_prefix, "");
        let _second = router.resolve("t1").await.expect("resolve");
        assert_eq!(provider.calls(), 1);

        // Config change plus invalidation: the next resolve re-reads.
        provider.set(
            "t1",
            TenantMeta {
                dedicated_object_bucket: "t1-new".into(),
                ..dedicated_meta()
            },
        );
        router.invalidate("t1").await;
        let third = router.resolve("t1").await.expect("resolve");
        assert_eq!(third.bucket, "t1-new");
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn expired_meta_is_refetched() {
        let provider = StubProvider::new();
        provider.set(
            "t1",
            TenantMeta {
                deployment_mode: "shared".into(),
                is_active: true,
                ..Default::default()
            },
        );
        let router = ObjectRouter::with_meta_ttl(
            shared_binding(),
            provider.clone(),
            Duration::from_millis(20),
        );

        router.resolve("t1").await.expect("resolve");
        router.resolve("t1").await.expect("resolve");
        assert_eq!(provider.calls(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        router.resolve("t1").await.expect("resolve");
        assert_eq!(provider.calls(), 2);
    }
}
