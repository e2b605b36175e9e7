use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, RouteError};

pub const ROUTE_TABLE_ENV: &str = "FATE_FLOW_ROUTE_TABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Network address of one party's scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRoute {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PartyRoute {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Http,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// Static `party_id -> address` table.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, PartyRoute>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, party_id: impl Into<String>, route: PartyRoute) -> Self {
        self.routes.insert(party_id.into(), route);
        self
    }

    /// Parse a JSON object of the form `{"9999": {"host": "...", "port": 9380}}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let routes: HashMap<String, PartyRoute> =
            serde_json::from_str(raw).map_err(|e| RouteError::Parse(e.to_string()))?;

        for (party_id, route) in &routes {
            if route.host.trim().is_empty() {
                return Err(RouteError::InvalidRoute {
                    party_id: party_id.clone(),
                    message: "host is empty".to_string(),
                });
            }
        }

        Ok(Self { routes })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| RouteError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let table = Self::from_json(&raw)?;
        info!(path = %path.display(), parties = table.len(), "Loaded route table");
        Ok(table)
    }

    /// Load from the file named by `FATE_FLOW_ROUTE_TABLE`; empty when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ROUTE_TABLE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn resolve(&self, party_id: &str) -> Option<&PartyRoute> {
        self.routes.get(party_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
