//! The catalog adapter (C1): hosts, blueprints, last-run lookups, and the
//! append-only run log. Defined as a trait so the planner/coordinator
//! depend on an abstraction; `mongo` holds the only production
//! implementation, and tests use an in-memory fake.

mod mongo;

pub use mongo::MongoCatalog;

use async_trait::async_trait;
use cairn_common::{Blueprint, Host, Plan, Result, Snapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Load every host, marking the configured agent id and probing
    /// reachability for every peer the agent has SSH credentials for.
    async fn load_hosts(&self) -> Result<HashMap<String, Host>>;

    /// Load every blueprint.
    async fn load_blueprints(&self) -> Result<Vec<Blueprint>>;

    /// The timestamp of the most recent run of `plan_id` whose `error`
    /// field is absent or null.
    async fn find_last_successful_run(&self, plan_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Append a run record. Presence of `error` marks the run as failed.
    async fn save_run(&self, plan: &Plan, log: Vec<String>, error: Option<String>) -> Result<()>;
}

/// Assemble the read-only snapshot the coordinator and planner operate
/// against for the duration of one invocation — built fresh each call,
/// never cached in module-scope state.
pub async fn load_snapshot(catalog: &dyn Catalog, agent_id: String) -> Result<Snapshot> {
    let hosts = catalog.load_hosts().await?;
    let blueprints = catalog.load_blueprints().await?;

    let mut last_run = HashMap::new();
    for blueprint in &blueprints {
        if let Some(ts) = catalog.find_last_successful_run(&blueprint.id).await? {
            last_run.insert(blueprint.id.clone(), ts);
        }
    }

    Ok(Snapshot {
        hosts,
        blueprints,
        last_run,
        agent_id,
    })
}
