//! MongoDB-backed `Catalog`. Three collections: `hosts`, `blueprints`,
//! `run_log`, matching §6's catalog schema exactly.

use super::Catalog;
use crate::executor::{Executor, SshSession};
use async_trait::async_trait;
use cairn_common::{Blueprint, Error, Host, Plan, Reachability, Result, RunRecord};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::TryStreamExt;
use mongodb::bson::doc;
use mongodb::options::FindOneOptions;
use mongodb::{Client, Database};
use std::collections::HashMap;
use tracing::{info, warn};

pub struct MongoCatalog {
    db: Database,
    agent_id: String,
}

impl MongoCatalog {
    pub async fn connect(mongodb_url: &str, database: &str, agent_id: String) -> Result<Self> {
        let client = Client::with_uri_str(mongodb_url)
            .await
            .map_err(|e| Error::Catalog(format!("failed to connect to catalog: {e}")))?;
        Ok(Self {
            db: client.database(database),
            agent_id,
        })
    }

    /// Open and immediately close an SSH session against `config` to
    /// determine reachability. Errors are absorbed into `Unreachable` —
    /// a probe failure never aborts the catalog load. The probe is
    /// awaited here, not fired-and-forgotten (see the design notes on the
    /// source bug this corrects).
    async fn probe(config: cairn_common::SshConfig) -> Reachability {
        let mut session = SshSession::new(config);
        let result = session.ready().await;
        session.finish().await;
        match result {
            Ok(()) => Reachability::Reachable,
            Err(e) => {
                warn!(error = %e, "reachability probe failed");
                Reachability::Unreachable
            }
        }
    }
}

#[async_trait]
impl Catalog for MongoCatalog {
    async fn load_hosts(&self) -> Result<HashMap<String, Host>> {
        let collection = self.db.collection::<Host>("hosts");
        let mut cursor = collection
            .find(doc! {})
            .await
            .map_err(|e| Error::Catalog(format!("failed to load hosts: {e}")))?;

        let mut hosts: HashMap<String, Host> = HashMap::new();
        while let Some(host) = cursor
            .try_next()
            .await
            .map_err(|e| Error::Catalog(format!("failed to read host document: {e}")))?
        {
            hosts.insert(host.id.clone(), host);
        }

        if let Some(agent) = hosts.get_mut(&self.agent_id) {
            agent.agent = true;
        }

        let Some(agent) = hosts.get(&self.agent_id) else {
            info!(agent_id = %self.agent_id, "agent host not present in catalog; skipping probes");
            return Ok(hosts);
        };

        let probes: Vec<_> = agent
            .ssh
            .iter()
            .filter(|(peer_id, _)| hosts.contains_key(*peer_id))
            .map(|(peer_id, config)| {
                let peer_id = peer_id.clone();
                let config = config.clone();
                async move { (peer_id, Self::probe(config).await) }
            })
            .collect();

        for (peer_id, verdict) in join_all(probes).await {
            if let Some(host) = hosts.get_mut(&peer_id) {
                host.available = verdict;
            }
        }

        Ok(hosts)
    }

    async fn load_blueprints(&self) -> Result<Vec<Blueprint>> {
        let collection = self.db.collection::<Blueprint>("blueprints");
        let cursor = collection
            .find(doc! {})
            .await
            .map_err(|e| Error::Catalog(format!("failed to load blueprints: {e}")))?;

        cursor
            .try_collect()
            .await
            .map_err(|e| Error::Catalog(format!("failed to read blueprint document: {e}")))
    }

    async fn find_last_successful_run(&self, plan_id: &str) -> Result<Option<DateTime<Utc>>> {
        let collection = self.db.collection::<RunRecord>("run_log");
        let filter = doc! {
            "plan.id": plan_id,
            "$or": [
                { "error": { "$exists": false } },
                { "error": null },
            ],
        };
        let options = FindOneOptions::builder().sort(doc! { "timestamp": -1 }).build();

        let record = collection
            .find_one(filter)
            .with_options(options)
            .await
            .map_err(|e| Error::Catalog(format!("failed to query run log: {e}")))?;

        Ok(record.map(|r| r.timestamp))
    }

    async fn save_run(&self, plan: &Plan, log: Vec<String>, error: Option<String>) -> Result<()> {
        let record = RunRecord {
            timestamp: Utc::now(),
            plan: plan.clone(),
            log,
            error,
        };

        let collection = self.db.collection::<RunRecord>("run_log");
        collection
            .insert_one(record)
            .await
            .map_err(|e| Error::Catalog(format!("failed to append run record: {e}")))?;
        Ok(())
    }
}
