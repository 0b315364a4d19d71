//! Configuration for the backup agent.
//!
//! Unlike larger layered configs (file + env + defaults), this surface is
//! three scalars with no nesting, so it stays a flat env-only read —
//! loading a TOML file for three variables would be ceremony, not design.

use std::fmt;

/// The three values the agent needs, read once at startup and never
/// re-read for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Catalog connection URL (`MONGODB`).
    pub mongodb_url: String,
    /// Catalog database name (`DATABASE`, default `backups`).
    pub database: String,
    /// This host's own catalog id (`AGENT`).
    pub agent_id: String,
}

const DEFAULT_DATABASE: &str = "backups";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingVar(&'static str),
}

impl fmt::Display for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent={} database={}", self.agent_id, self.database)
    }
}

impl AgentConfig {
    /// Load from the process environment. `MONGODB` and `AGENT` are
    /// required; `DATABASE` defaults to `backups`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mongodb_url =
            std::env::var("MONGODB").map_err(|_| ConfigError::MissingVar("MONGODB"))?;
        let agent_id = std::env::var("AGENT").map_err(|_| ConfigError::MissingVar("AGENT"))?;
        let database =
            std::env::var("DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());

        Ok(Self {
            mongodb_url,
            database,
            agent_id,
        })
    }
}
