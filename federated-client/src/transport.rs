use async_trait::async_trait;
use reqwest::Client;
use scheduler_core::error::FederatedError;
use scheduler_core::federation::{FederatedResult, FederatedTransport};
use std::time::Duration;
use tracing::debug;
use types::{FederatedCommand, HttpMethod, ResponseEnvelope, Role};

use crate::error::{Result, RouteError};
use crate::route::RouteTable;

pub const SRC_PARTY_HEADER: &str = "src-party-id";
pub const DEST_PARTY_HEADER: &str = "dest-party-id";
pub const SRC_ROLE_HEADER: &str = "src-role";

/// Delivers federated commands over HTTP using a static route table.
///
/// Each call is a single attempt; retries and the overall deadline belong to
/// `FederatedScheduler`.
pub struct HttpTransport {
    client: Client,
    routes: RouteTable,
    local_party_id: String,
    local_role: Option<Role>,
}

impl HttpTransport {
    pub fn new(local_party_id: impl Into<String>, routes: RouteTable) -> Result<Self> {
        Self::with_connect_timeout(local_party_id, routes, Duration::from_secs(10))
    }

    pub fn with_connect_timeout(
        local_party_id: impl Into<String>,
        routes: RouteTable,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| RouteError::Client(e.to_string()))?;
        Ok(Self {
            client,
            routes,
            local_party_id: local_party_id.into(),
            local_role: None,
        })
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.local_role = Some(role);
        self
    }
}

#[async_trait]
impl FederatedTransport for HttpTransport {
    async fn send(&self, dest_party_id: &str, command: &FederatedCommand) -> FederatedResult {
        let route = self
            .routes
            .resolve(dest_party_id)
            .ok_or_else(|| FederatedError::NoRoute(dest_party_id.to_string()))?;
        let endpoint = command.endpoint();
        let url = format!("{}{}", route.base_url(), endpoint);
        let body = command
            .body()
            .map_err(|e| FederatedError::Encode(e.to_string()))?;

        let network = |message: String| FederatedError::Network {
            party_id: dest_party_id.to_string(),
            endpoint: endpoint.to_string(),
            message,
        };

        let mut request = match command.method() {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
        }
        .header(SRC_PARTY_HEADER, self.local_party_id.as_str())
        .header(DEST_PARTY_HEADER, dest_party_id)
        .json(&body);
        if let Some(role) = self.local_role {
            request = request.header(SRC_ROLE_HEADER, role.as_str());
        }

        debug!(party_id = dest_party_id, method = %command.method(), url, "Sending federated command");
        let response = request.send().await.map_err(|e| network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FederatedError::Http {
                party_id: dest_party_id.to_string(),
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await.map_err(|e| network(e.to_string()))?;
        serde_json::from_str::<ResponseEnvelope>(&text).map_err(|e| FederatedError::Http {
            party_id: dest_party_id.to_string(),
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: format!("invalid response envelope ({}): {}", e, text),
        })
    }
}
