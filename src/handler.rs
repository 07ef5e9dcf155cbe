//! Invocation entry point: event in, response out

use crate::client::{HttpTransport, ProxyClient, Transport};
use crate::config::Config;
use crate::event::{InboundEvent, OutboundResponse};
use crate::response::to_outbound;
use crate::startup::StartupCoordinator;
use crate::translate::{translate, BackendTarget};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Handles invocations for one backend.
///
/// Every invocation makes sure the backend was launched, translates the event,
/// forwards it with retry and maps the outcome. No failure escapes `handle`.
pub struct InvocationHandler<T = HttpTransport> {
    coordinator: Arc<StartupCoordinator>,
    target: BackendTarget,
    client: ProxyClient<T>,
    service_name: String,
}

impl InvocationHandler<HttpTransport> {
    pub fn from_config(config: &Config, coordinator: Arc<StartupCoordinator>) -> Self {
        Self::new(
            coordinator,
            BackendTarget::from(&config.backend),
            ProxyClient::from_config(&config.proxy),
            &config.backend.name,
        )
    }
}

impl<T: Transport> InvocationHandler<T> {
    pub fn new(
        coordinator: Arc<StartupCoordinator>,
        target: BackendTarget,
        client: ProxyClient<T>,
        service_name: &str,
    ) -> Self {
        Self {
            coordinator,
            target,
            client,
            service_name: service_name.to_string(),
        }
    }

    pub fn coordinator(&self) -> &Arc<StartupCoordinator> {
        &self.coordinator
    }

    pub fn client(&self) -> &ProxyClient<T> {
        &self.client
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Handle a single invocation
    pub async fn handle(&self, event: InboundEvent) -> OutboundResponse {
        let request_id = event
            .request_id()
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let span = info_span!(
            "invocation",
            request_id = %request_id,
            method = event.method(),
            path = event.path(),
        );

        self.forward(event).instrument(span).await
    }

    async fn forward(&self, event: InboundEvent) -> OutboundResponse {
        if self.coordinator.ensure_started() {
            debug!("Backend launch triggered by this invocation");
        }

        let request = translate(&event, &self.target);

        match self.client.send(&request).await {
            Ok(response) => {
                info!(status = response.status, bytes = response.body.len(), "Invocation forwarded");
                to_outbound(response)
            }
            Err(e) => {
                warn!(error = %e, code = e.code().as_header_value(), "Invocation failed");
                e.to_response(&self.service_name)
            }
        }
    }
}
