//! Read-only registry of servers and the actions bound to them.
//!
//! Built once from [`Config`] and shared behind an `Arc`; nothing mutates it
//! while runs are in flight.

use crate::config::Config;
use crate::error::{Result, RunbookError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// SSH connection details for a server. Every field is optional; an empty
/// config means "use the local ssh defaults".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_file: Option<String>,
}

/// A named, pre-approved command bound to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command_path: String,
    #[serde(default)]
    pub dangerous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Public view of a server with its actions, as listed to clients.
/// Auth details are deliberately left out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListing {
    pub id: String,
    pub name: String,
    pub host: String,
    pub actions: Vec<Action>,
}

#[derive(Debug, Default)]
pub struct Registry {
    servers: Vec<Server>,
    actions: HashMap<String, Vec<Action>>,
}

impl Registry {
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Registry::default();
        for sc in &config.servers {
            registry.servers.push(Server {
                id: sc.id.clone(),
                name: sc.name.clone(),
                host: sc.host.clone(),
                auth: sc.auth.clone(),
            });
            registry.actions.insert(sc.id.clone(), sc.actions.clone());
        }
        registry
    }

    pub fn server(&self, server_id: &str) -> Result<&Server> {
        self.servers
            .iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| RunbookError::ServerNotFound(server_id.to_string()))
    }

    /// Resolve a `{server, action}` pair.
    pub fn lookup(&self, server_id: &str, action_id: &str) -> Result<(&Server, &Action)> {
        let server = self.server(server_id)?;
        let action = self
            .actions
            .get(server_id)
            .and_then(|actions| actions.iter().find(|a| a.id == action_id))
            .ok_or_else(|| RunbookError::ActionNotFound {
                server: server_id.to_string(),
                action: action_id.to_string(),
            })?;
        Ok((server, action))
    }

    pub fn listing(&self) -> Vec<ServerListing> {
        self.servers
            .iter()
            .map(|s| ServerListing {
                id: s.id.clone(),
                name: s.name.clone(),
                host: s.host.clone(),
                actions: self.actions.get(&s.id).cloned().unwrap_or_default(),
            })
            .collect()
    }
}
