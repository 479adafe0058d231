use std::sync::Arc;

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use shoal_core::TenantMetaProvider;

use crate::routing::RouterCore;
use crate::{TenantError, META_CACHE_TTL};

pub const CHAT_EVENTS_EXCHANGE: &str = "chat.events";

/// An AMQP connection with a channel bound to the `chat.events` topic
/// exchange. Cloneable; the connection is shared.
#[derive(Clone)]
pub struct BrokerHandle {
    conn: Arc<Connection>,
    channel: Channel,
}

impl BrokerHandle {
    pub async fn connect(url: &str) -> Result<Self, lapin::Error> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        channel
            .exchange_declare(
                CHAT_EVENTS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            conn: Arc::new(conn),
            channel,
        })
    }

    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), lapin::Error> {
        self.channel
            .basic_publish(
                CHAT_EVENTS_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".to_string().into())
                    .with_timestamp(chrono::Utc::now().timestamp() as u64),
            )
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        let _ = self.conn.close(0, "shutdown").await;
    }
}

/// Resolves the broker binding for a tenant and publishes tenant-scoped
/// events. Shared routing keys are prefixed `{tenant}.{key}` so consumers
/// on the shared broker can bind per tenant.
pub struct BrokerRouter {
    shared: BrokerHandle,
    core: RouterCore<BrokerHandle>,
}

impl BrokerRouter {
    pub fn new(shared: BrokerHandle, provider: Arc<dyn TenantMetaProvider>) -> Self {
        Self {
            shared,
            core: RouterCore::new(provider, META_CACHE_TTL),
        }
    }

    pub async fn resolve(&self, tenant_id: &str) -> Result<BrokerHandle, TenantError> {
        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Ok(self.shared.clone());
        }

        let meta = self.core.load_meta(tenant_id).await?;
        if !meta.is_active {
            return Err(TenantError::Inactive);
        }
        if !meta.is_dedicated() || meta.dedicated_broker_url.is_empty() {
            return Ok(self.shared.clone());
        }

        if let Some(handle) = self.core.cached_handle(tenant_id).await {
            return Ok(handle);
        }

        let mut state = self.core.state.write().await;
        if let Some(handle) = state.handles.get(tenant_id) {
            return Ok(handle.clone());
        }
        let handle = BrokerHandle::connect(&meta.dedicated_broker_url)
            .await
            .map_err(|err| TenantError::Handle(err.to_string()))?;
        state
            .handles
            .insert(tenant_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn publish<T: Serialize>(
        &self,
        tenant_id: &str,
        key: &str,
        payload: &T,
    ) -> Result<(), TenantError> {
        let handle = self.resolve(tenant_id).await?;
        let body = serde_json::to_vec(payload)
            .map_err(|err| TenantError::Broker(err.to_string()))?;
        let routing_key = if tenant_id.trim().is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", tenant_id.trim())
        };
        handle
            .publish(&routing_key, &body)
            .await
            .map_err(|err| TenantError::Broker(err.to_string()))
    }

    pub async fn invalidate(&self, tenant_id: &str) {
        if let Some(handle) = self.core.invalidate(tenant_id).await {
            handle.close().await;
        }
    }

    pub async fn close(&self) {
        for handle in self.core.drain().await {
            handle.close().await;
        }
    }
}
