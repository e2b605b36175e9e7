use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Host,
    Arbiter,
    Local,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::Host => "host",
            Role::Arbiter => "arbiter",
            Role::Local => "local",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Role::Guest),
            "host" => Ok(Role::Host),
            "arbiter" => Ok(Role::Arbiter),
            "local" => Ok(Role::Local),
            other => Err(format!("Unknown role: {}", other)),
        }
    }
}

/// One participant of a federated job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Party {
    pub role: Role,
    pub party_id: String,
}

impl Party {
    pub fn new(role: Role, party_id: impl Into<String>) -> Self {
        Self {
            role,
            party_id: party_id.into(),
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.role, self.party_id)
    }
}

/// Distinct party ids in first-seen order. A party id may hold several roles
/// but receives a single federated command.
pub fn distinct_party_ids(parties: &[Party]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for party in parties {
        if !ids.contains(&party.party_id) {
            ids.push(party.party_id.clone());
        }
    }
    ids
}
