//! Best-effort client for the vector indexing sidecar. The index is a
//! derived cache; failures are logged by callers and never propagated.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vectorman request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vectorman status {0}")]
    Status(u16),
}

#[derive(Clone)]
pub struct VectorClient {
    endpoint: String,
    enabled: bool,
    http: reqwest::Client,
}

impl VectorClient {
    pub fn new(endpoint: &str, enabled: bool) -> Self {
        Self {
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            enabled,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(4))
                .build()
                .expect("build http client"),
        }
    }

    pub async fn index_message(
        &self,
        message_id: &str,
        room_id: &str,
        text: &str,
    ) -> Result<(), VectorError> {
        if !self.enabled {
            return Ok(());
        }
        let payload = json!({"message_id": message_id, "room_id": room_id, "text": text});
        let response = self
            .http
            .post(format!("{}/api/v1/vectors/messages/index", self.endpoint))
            .json(&payload)
            .send()
            .await?;
        if response.status().as_u16() >= 300 {
            return Err(VectorError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_is_a_no_op() {
        let client = VectorClient::new("http://127.0.0.1:9", false);
        client.index_message("m1", "r1", "hi").await.expect("no-op");
    }
}
