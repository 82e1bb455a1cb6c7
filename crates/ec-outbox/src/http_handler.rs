//! HTTP event handler
//!
//! Posts the validated envelope as JSON to a configured endpoint. Usable
//! both as the processor's `EventHandler` and as the publisher's
//! `BrokerPublisher` when the downstream broker has an HTTP ingest surface.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::{BrokerPublisher, EventHandler};
use ec_common::{EventContext, IntegrationEventEnvelope, OutboxRecord};

#[derive(Debug, Clone)]
pub struct HttpEventHandlerConfig {
    pub endpoint: String,
    /// Optional Bearer token for authentication
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpEventHandlerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/events".to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpEventHandler {
    config: HttpEventHandlerConfig,
    client: reqwest::Client,
}

impl HttpEventHandler {
    pub fn new(config: HttpEventHandlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    async fn post_envelope(&self, envelope: &IntegrationEventEnvelope) -> Result<()> {
        debug!(
            event_id = %envelope.event_id,
            "Posting envelope to {}", self.config.endpoint
        );

        let mut request = self.client.post(&self.config.endpoint).json(envelope);
        if let Some(ref token) = self.config.auth_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for HttpEventHandler {
    async fn handle_event(
        &self,
        _record: &OutboxRecord,
        envelope: &IntegrationEventEnvelope,
        _ctx: &EventContext,
    ) -> Result<()> {
        self.post_envelope(envelope).await
    }
}

#[async_trait]
impl BrokerPublisher for HttpEventHandler {
    async fn publish(
        &self,
        envelope: &IntegrationEventEnvelope,
        _record: &OutboxRecord,
    ) -> Result<()> {
        self.post_envelope(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_common::envelope;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_envelope() -> IntegrationEventEnvelope {
        envelope::parse(&json!({
            "eventId": "evt-1",
            "eventName": "invoice.created",
            "eventVersion": 1,
            "tenantId": "tenant-a",
            "partitionKey": "invoice-1",
            "data": {"amount": 100}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_envelope_with_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_partial_json(json!({"eventId": "evt-1"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let handler = HttpEventHandler::new(HttpEventHandlerConfig {
            endpoint: format!("{}/events", server.uri()),
            auth_token: Some("secret".to_string()),
            ..Default::default()
        })
        .unwrap();

        handler.post_envelope(&test_envelope()).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let handler = HttpEventHandler::new(HttpEventHandlerConfig {
            endpoint: format!("{}/events", server.uri()),
            ..Default::default()
        })
        .unwrap();

        let err = handler.post_envelope(&test_envelope()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
