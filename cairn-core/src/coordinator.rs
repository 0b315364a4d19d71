//! The run coordinator (C4): drives the pipeline end to end for one
//! invocation — plan every blueprint, gate on operator confirmation,
//! execute accepted plans serially, persist exactly one run record per
//! plan regardless of outcome.

use crate::catalog::Catalog;
use crate::executor::{Executor, SshSession};
use crate::naming::backup_filename;
use crate::planner;
use cairn_common::{CloneStrategy, Destination, DownloadLocally, Plan, Snapshot, SshConfig};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Tallies returned by `run()` for the entrypoint to fold into a process
/// exit code and a final summary line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub plans_total: usize,
    pub plans_executed: usize,
    pub plans_failed: usize,
    /// Set when the operator was asked and answered no. Distinct from
    /// `plans_executed == 0`, which also covers the all-succeeded-as-
    /// skips case where there was nothing to ask about.
    pub declined: bool,
}

type SessionFactory = Box<dyn Fn(SshConfig) -> Box<dyn Executor> + Send + Sync>;

pub struct RunCoordinator {
    catalog: Arc<dyn Catalog>,
    confirm: Box<dyn Fn(usize) -> bool + Send + Sync>,
    new_session: SessionFactory,
}

impl RunCoordinator {
    pub fn new(catalog: Arc<dyn Catalog>, confirm: Box<dyn Fn(usize) -> bool + Send + Sync>) -> Self {
        Self::with_session_factory(
            catalog,
            confirm,
            Box::new(|config| Box::new(SshSession::new(config))),
        )
    }

    /// Construct with an injected session factory, for driving the
    /// coordinator against a fake `Executor` in tests.
    pub fn with_session_factory(
        catalog: Arc<dyn Catalog>,
        confirm: Box<dyn Fn(usize) -> bool + Send + Sync>,
        new_session: SessionFactory,
    ) -> Self {
        Self { catalog, confirm, new_session }
    }

    /// Plan every blueprint in `snapshot`, gate on confirmation, and
    /// execute serially.
    pub async fn run(&self, snapshot: &Snapshot) -> RunSummary {
        let now = Utc::now();

        let plans: Vec<Plan> = snapshot
            .blueprints
            .iter()
            .map(|bp| {
                let last_run = snapshot.last_run.get(&bp.id).copied();
                planner::plan(&snapshot.hosts, bp, last_run, &snapshot.agent_id, now)
            })
            .filter(|p| matches!(p, Plan::SshAgent { .. }))
            .collect();

        if plans.is_empty() {
            info!("no blueprints due; nothing to do");
            return RunSummary::default();
        }

        if !(self.confirm)(plans.len()) {
            info!(count = plans.len(), "operator declined to run pending plans");
            return RunSummary {
                plans_total: plans.len(),
                declined: true,
                ..RunSummary::default()
            };
        }

        let mut summary = RunSummary {
            plans_total: plans.len(),
            ..RunSummary::default()
        };

        for plan in &plans {
            let Plan::SshAgent { host, hooks, strategy, clone, .. } = plan else {
                continue;
            };

            let mut log = Vec::new();
            let outcome = self
                .execute_plan(snapshot, plan.id(), host, hooks, strategy, clone, &mut log)
                .await;

            let error = match &outcome {
                Ok(()) => {
                    summary.plans_executed += 1;
                    None
                }
                Err(e) => {
                    summary.plans_failed += 1;
                    let message = e.to_string();
                    warn!(plan_id = plan.id(), error = %message, "plan execution failed");
                    log.push(format!("error: {message}"));
                    Some(message)
                }
            };

            if let Err(e) = self.catalog.save_run(plan, log, error).await {
                warn!(plan_id = plan.id(), error = %e, "failed to persist run record");
            }
        }

        summary
    }

    /// Execute one `ssh-agent` plan end to end, per §4.4's numbered steps.
    /// Any step failing aborts only this plan; the caller records the
    /// partial `log` plus the returned error.
    async fn execute_plan(
        &self,
        snapshot: &Snapshot,
        plan_id: &str,
        source_host: &cairn_common::Host,
        hooks: &cairn_common::Hooks,
        strategy: &cairn_common::BackupStrategy,
        clone: &CloneStrategy,
        log: &mut Vec<String>,
    ) -> cairn_common::Result<()> {
        let source_config = snapshot
            .agent_ssh_credential(source_host)
            .cloned()
            .ok_or_else(|| {
                cairn_common::Error::Ssh(format!(
                    "no ssh credential from agent to source host '{}'",
                    source_host.id
                ))
            })?;

        let mut session = (self.new_session)(source_config);
        session.ready().await?;
        log.push(format!("session to {} ready", source_host.id));

        let result = self
            .run_plan_body(snapshot, plan_id, source_host, session.as_ref(), hooks, strategy, clone, log)
            .await;

        session.finish().await;
        log.push(format!("session to {} closed", source_host.id));

        result
    }

    async fn run_plan_body(
        &self,
        snapshot: &Snapshot,
        plan_id: &str,
        source_host: &cairn_common::Host,
        session: &dyn Executor,
        hooks: &cairn_common::Hooks,
        strategy: &cairn_common::BackupStrategy,
        clone: &CloneStrategy,
        log: &mut Vec<String>,
    ) -> cairn_common::Result<()> {
        let archive = session.execute(strategy, hooks).await?;
        log.push(format!("archive created at {archive}"));

        let backup_name = backup_filename(plan_id, Utc::now());

        for dest in &clone.directly_clone_to {
            let peer_config = snapshot
                .hosts
                .get(dest.host_id())
                .and_then(|h| h.ssh.get(&source_host.id))
                .ok_or_else(|| {
                    cairn_common::Error::Transfer(format!(
                        "destination '{}' has no ssh credential for source '{}'",
                        dest.host_id(),
                        source_host.id
                    ))
                })?;
            let remote_path = format!("{}{}", dest.path(), backup_name);
            session.scp_upload(&archive, peer_config, &remote_path).await?;
            log.push(format!("directly cloned to {} at {}", dest.host_id(), remote_path));
        }

        for dest in &clone.receive_clone_from {
            self.receive_from(snapshot, source_host, dest, &archive, &backup_name, log)
                .await?;
        }

        if clone.download_locally.is_truthy() {
            self.download_and_redirect(snapshot, session, clone, &archive, &backup_name, log)
                .await?;
        }

        match &clone.retain_on_host {
            cairn_common::RetainOnHost::Path { path } => {
                let dest = format!("{path}{backup_name}");
                session.move_file(&archive, &dest).await?;
                log.push(format!("retained archive on source host at {dest}"));
            }
            cairn_common::RetainOnHost::No => {
                session.delete(&archive).await?;
                log.push("deleted archive on source host".to_string());
            }
        }

        Ok(())
    }

    async fn receive_from(
        &self,
        snapshot: &Snapshot,
        source_host: &cairn_common::Host,
        dest: &Destination,
        archive: &str,
        backup_name: &str,
        log: &mut Vec<String>,
    ) -> cairn_common::Result<()> {
        let dest_host = snapshot.hosts.get(dest.host_id()).ok_or_else(|| {
            cairn_common::Error::Transfer(format!("destination host '{}' not found", dest.host_id()))
        })?;
        let agent_to_dest = snapshot
            .agent_ssh_credential(dest_host)
            .ok_or_else(|| {
                cairn_common::Error::Transfer(format!(
                    "agent has no ssh credential for destination '{}'",
                    dest.host_id()
                ))
            })?;
        let source_credential = dest_host
            .ssh
            .get(&source_host.id)
            .ok_or_else(|| {
                cairn_common::Error::Transfer(format!(
                    "destination '{}' has no ssh credential for source '{}'",
                    dest.host_id(),
                    source_host.id
                ))
            })?;

        let mut dest_session = (self.new_session)(agent_to_dest.clone());
        dest_session.ready().await?;
        let remote_path = format!("{}{}", dest.path(), backup_name);
        let result = dest_session.scp_download(archive, source_credential, &remote_path).await;
        dest_session.finish().await;
        result?;

        log.push(format!("{} received archive from source at {}", dest.host_id(), remote_path));
        Ok(())
    }

    async fn download_and_redirect(
        &self,
        snapshot: &Snapshot,
        session: &dyn Executor,
        clone: &CloneStrategy,
        archive: &str,
        backup_name: &str,
        log: &mut Vec<String>,
    ) -> cairn_common::Result<()> {
        let local_path = PathBuf::from("backups").join(backup_name);
        let local_path = std::env::current_dir()
            .map(|cwd| cwd.join(&local_path))
            .unwrap_or(local_path);

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(cairn_common::Error::Io)?;
        }

        session.download(archive, &local_path).await?;
        log.push(format!("downloaded archive to {}", local_path.display()));

        for dest in &clone.redirect_clone_to {
            let dest_host = snapshot.hosts.get(dest.host_id()).ok_or_else(|| {
                cairn_common::Error::Transfer(format!("destination host '{}' not found", dest.host_id()))
            })?;
            let agent_to_dest = snapshot.agent_ssh_credential(dest_host).ok_or_else(|| {
                cairn_common::Error::Transfer(format!(
                    "agent has no ssh credential for destination '{}'",
                    dest.host_id()
                ))
            })?;

            let mut dest_session = (self.new_session)(agent_to_dest.clone());
            dest_session.ready().await?;
            let remote_path = format!("{}{}", dest.path(), backup_name);
            let result = dest_session.upload(&local_path, &remote_path).await;
            dest_session.finish().await;
            result?;
            log.push(format!("redirected to {} at {}", dest.host_id(), remote_path));
        }

        match &clone.download_locally {
            DownloadLocally::Keep { .. } => {
                log.push(format!("kept local copy at {}", local_path.display()));
            }
            _ => {
                tokio::fs::remove_file(&local_path).await.map_err(cairn_common::Error::Io)?;
                log.push("removed forced local copy".to_string());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalog;
    use crate::executor::fake::FakeSshSession;
    use cairn_common::{
        BackupStrategy, Blueprint, BlueprintMode, Destination, Host, Hooks, Interval, Reachability,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn ssh(host: &str) -> SshConfig {
        SshConfig {
            username: "root".into(),
            host: host.into(),
            private_key_path: format!("/keys/{host}"),
            passphrase: None,
        }
    }

    /// A snapshot with exactly one due, viable plan: `B` retains its own
    /// archive, so `classify()` succeeds without needing any other host.
    fn snapshot_with_one_viable_plan() -> Snapshot {
        let mut a = Host::new("A");
        a.agent = true;
        a.available = Reachability::Reachable;
        a.ssh.insert("B".into(), ssh("B"));
        let mut b = Host::new("B");
        b.available = Reachability::Reachable;

        let hosts = HashMap::from([("A".to_string(), a), ("B".to_string(), b)]);
        let blueprints = vec![Blueprint {
            id: "bp-retain".into(),
            interval: Interval::Daily,
            mode: BlueprintMode::SshAgent {
                host: "B".into(),
                hooks: Hooks::default(),
                strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
                destinations: vec![Destination::Host { host: "B".into(), path: "/keep/".into() }],
            },
        }];

        Snapshot {
            hosts,
            blueprints,
            last_run: HashMap::new(),
            agent_id: "A".to_string(),
        }
    }

    /// A session factory that hands out `FakeSshSession`s labeled by
    /// target host, recording every call into one shared log.
    fn fake_session_factory(calls: Arc<Mutex<Vec<String>>>) -> SessionFactory {
        Box::new(move |config: SshConfig| {
            Box::new(FakeSshSession::new(config.host, calls.clone())) as Box<dyn Executor>
        })
    }

    #[tokio::test]
    async fn no_due_plans_short_circuits_without_confirmation() {
        let mut a = Host::new("A");
        a.agent = true;
        let hosts = HashMap::from([("A".to_string(), a)]);
        let snapshot = Snapshot {
            hosts,
            blueprints: vec![Blueprint {
                id: "dummy".into(),
                interval: Interval::Daily,
                mode: BlueprintMode::Dummy,
            }],
            last_run: HashMap::new(),
            agent_id: "A".to_string(),
        };

        let catalog = Arc::new(FakeCatalog {
            saved_runs: Mutex::new(Vec::new()),
            ..Default::default()
        });
        let coordinator = RunCoordinator::new(catalog, Box::new(|_| panic!("should not be asked")));
        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary, RunSummary::default());
        assert!(!summary.declined);
    }

    #[tokio::test]
    async fn declined_confirmation_records_no_runs() {
        let snapshot = snapshot_with_one_viable_plan();
        let catalog = Arc::new(FakeCatalog {
            saved_runs: Mutex::new(Vec::new()),
            ..Default::default()
        });
        let coordinator = RunCoordinator::new(catalog.clone(), Box::new(|_| false));
        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_total, 1);
        assert_eq!(summary.plans_executed, 0);
        assert!(summary.declined);
        assert!(catalog.saved_runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn plan_with_no_viable_destinations_fails_and_is_not_executed() {
        let mut snapshot = snapshot_with_one_viable_plan();
        snapshot.blueprints[0].mode = BlueprintMode::SshAgent {
            host: "B".into(),
            hooks: Hooks::default(),
            strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
            destinations: vec![Destination::Host {
                host: "unknown".into(),
                path: "/bk/".into(),
            }],
        };

        let catalog = Arc::new(FakeCatalog {
            saved_runs: Mutex::new(Vec::new()),
            ..Default::default()
        });
        let coordinator = RunCoordinator::new(catalog, Box::new(|_| true));
        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_total, 0);
        assert_eq!(summary.plans_executed, 0);
        assert!(!summary.declined);
    }

    #[tokio::test]
    async fn direct_clone_uploads_from_source_and_deletes_archive() {
        let mut a = Host::new("A");
        a.agent = true;
        a.available = Reachability::Reachable;
        a.ssh.insert("B".into(), ssh("B"));
        let mut b = Host::new("B");
        b.available = Reachability::Reachable;
        b.ssh.insert("C".into(), ssh("C"));
        let c = Host::new("C");
        let hosts = HashMap::from([
            ("A".to_string(), a),
            ("B".to_string(), b),
            ("C".to_string(), c),
        ]);

        let blueprints = vec![Blueprint {
            id: "bp1".into(),
            interval: Interval::Daily,
            mode: BlueprintMode::SshAgent {
                host: "B".into(),
                hooks: Hooks::default(),
                strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
                destinations: vec![Destination::Host { host: "C".into(), path: "/bk/".into() }],
            },
        }];
        let snapshot = Snapshot { hosts, blueprints, last_run: HashMap::new(), agent_id: "A".to_string() };

        let calls = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(FakeCatalog { saved_runs: Mutex::new(Vec::new()), ..Default::default() });
        let coordinator = RunCoordinator::with_session_factory(
            catalog.clone(),
            Box::new(|_| true),
            fake_session_factory(calls.clone()),
        );

        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_executed, 1);
        assert_eq!(summary.plans_failed, 0);

        let recorded = calls.lock().unwrap();
        assert!(recorded.iter().any(|c| c == "B:ready"));
        assert!(recorded.iter().any(|c| c.starts_with("B:scp_upload:")));
        assert!(recorded.iter().any(|c| c.starts_with("B:delete:")));
        assert!(recorded.iter().any(|c| c == "B:finish"));

        let runs = catalog.saved_runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].2.is_none());
    }

    #[tokio::test]
    async fn receive_clone_opens_a_second_session_against_the_destination() {
        let mut a = Host::new("A");
        a.agent = true;
        a.available = Reachability::Reachable;
        a.ssh.insert("B".into(), ssh("B"));
        a.ssh.insert("C".into(), ssh("C"));
        let b = Host::new("B");
        let mut c = Host::new("C");
        c.ssh.insert("B".into(), ssh("B"));
        let hosts = HashMap::from([
            ("A".to_string(), a),
            ("B".to_string(), b),
            ("C".to_string(), c),
        ]);

        let blueprints = vec![Blueprint {
            id: "bp2".into(),
            interval: Interval::Daily,
            mode: BlueprintMode::SshAgent {
                host: "B".into(),
                hooks: Hooks::default(),
                strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
                destinations: vec![Destination::Host { host: "C".into(), path: "/bk/".into() }],
            },
        }];
        let snapshot = Snapshot { hosts, blueprints, last_run: HashMap::new(), agent_id: "A".to_string() };

        let calls = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(FakeCatalog { saved_runs: Mutex::new(Vec::new()), ..Default::default() });
        let coordinator = RunCoordinator::with_session_factory(
            catalog,
            Box::new(|_| true),
            fake_session_factory(calls.clone()),
        );

        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_executed, 1);

        let recorded = calls.lock().unwrap();
        assert!(recorded.iter().any(|c| c == "C:ready"));
        assert!(recorded.iter().any(|c| c.starts_with("C:scp_download:")));
        assert!(recorded.iter().any(|c| c == "C:finish"));
    }

    #[tokio::test]
    async fn download_locally_and_redirect_uploads_then_removes_forced_copy() {
        let mut a = Host::new("A");
        a.agent = true;
        a.available = Reachability::Reachable;
        a.ssh.insert("B".into(), ssh("B"));
        a.ssh.insert("C".into(), ssh("C"));
        let b = Host::new("B");
        let c = Host::new("C");
        let hosts = HashMap::from([
            ("A".to_string(), a),
            ("B".to_string(), b),
            ("C".to_string(), c),
        ]);

        // C has no route to/from B, so it's classified as redirect,
        // which forces downloadLocally.
        let blueprints = vec![Blueprint {
            id: "bp3".into(),
            interval: Interval::Daily,
            mode: BlueprintMode::SshAgent {
                host: "B".into(),
                hooks: Hooks::default(),
                strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
                destinations: vec![Destination::Host { host: "C".into(), path: "/bk/".into() }],
            },
        }];
        let snapshot = Snapshot { hosts, blueprints, last_run: HashMap::new(), agent_id: "A".to_string() };

        let calls = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(FakeCatalog { saved_runs: Mutex::new(Vec::new()), ..Default::default() });
        let coordinator = RunCoordinator::with_session_factory(
            catalog,
            Box::new(|_| true),
            fake_session_factory(calls.clone()),
        );

        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_failed, 0, "plan should succeed against the tempdir-free fake");
        assert_eq!(summary.plans_executed, 1);

        let recorded = calls.lock().unwrap();
        assert!(recorded.iter().any(|c| c.starts_with("B:download:")));
        assert!(recorded.iter().any(|c| c == "C:ready"));
        assert!(recorded.iter().any(|c| c.starts_with("C:upload:")));
        assert!(recorded.iter().any(|c| c == "C:finish"));
    }

    #[tokio::test]
    async fn retain_on_host_moves_instead_of_deleting() {
        let mut a = Host::new("A");
        a.agent = true;
        a.available = Reachability::Reachable;
        a.ssh.insert("B".into(), ssh("B"));
        let b = Host::new("B");
        let hosts = HashMap::from([("A".to_string(), a), ("B".to_string(), b)]);

        let blueprints = vec![Blueprint {
            id: "bp4".into(),
            interval: Interval::Daily,
            mode: BlueprintMode::SshAgent {
                host: "B".into(),
                hooks: Hooks::default(),
                strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
                destinations: vec![Destination::Host { host: "B".into(), path: "/keep/".into() }],
            },
        }];
        let snapshot = Snapshot { hosts, blueprints, last_run: HashMap::new(), agent_id: "A".to_string() };

        let calls = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(FakeCatalog { saved_runs: Mutex::new(Vec::new()), ..Default::default() });
        let coordinator = RunCoordinator::with_session_factory(
            catalog,
            Box::new(|_| true),
            fake_session_factory(calls.clone()),
        );

        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_executed, 1);

        let recorded = calls.lock().unwrap();
        assert!(recorded.iter().any(|c| c.starts_with("B:move_file:")));
        assert!(!recorded.iter().any(|c| c.starts_with("B:delete:")));
    }

    #[tokio::test]
    async fn execution_failure_on_source_is_caught_and_recorded() {
        let mut a = Host::new("A");
        a.agent = true;
        a.available = Reachability::Reachable;
        a.ssh.insert("B".into(), ssh("B"));
        let b = Host::new("B");
        let hosts = HashMap::from([("A".to_string(), a), ("B".to_string(), b)]);

        let blueprints = vec![Blueprint {
            id: "bp5".into(),
            interval: Interval::Daily,
            mode: BlueprintMode::SshAgent {
                host: "B".into(),
                hooks: Hooks::default(),
                strategy: BackupStrategy::Files { paths: vec!["/etc".into()] },
                destinations: vec![Destination::Host { host: "B".into(), path: "/keep/".into() }],
            },
        }];
        let snapshot = Snapshot { hosts, blueprints, last_run: HashMap::new(), agent_id: "A".to_string() };

        let calls = Arc::new(Mutex::new(Vec::new()));
        let catalog = Arc::new(FakeCatalog { saved_runs: Mutex::new(Vec::new()), ..Default::default() });
        let calls_for_factory = calls.clone();
        let coordinator = RunCoordinator::with_session_factory(
            catalog.clone(),
            Box::new(|_| true),
            Box::new(move |config: SshConfig| {
                let mut session = FakeSshSession::new(config.host, calls_for_factory.clone());
                session.fail_on = Some("execute".to_string());
                Box::new(session) as Box<dyn Executor>
            }),
        );

        let summary = coordinator.run(&snapshot).await;
        assert_eq!(summary.plans_executed, 0);
        assert_eq!(summary.plans_failed, 1);

        let runs = catalog.saved_runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(runs[0].2.is_some());

        let recorded = calls.lock().unwrap();
        assert!(recorded.iter().any(|c| c == "B:finish"), "session must still be torn down on failure");
    }
}
