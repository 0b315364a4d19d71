//! The backup orchestrator's data model: hosts, blueprints, plans, and the
//! clone strategy that tells the executor exactly which transfers to run.
//!
//! These types are shared verbatim between the catalog adapter (which reads
//! and writes them as MongoDB documents), the planner (which is a pure
//! function from `(Host map, Blueprint, last run)` to `Plan`), and the
//! executor (which only ever accepts the `SshAgent` plan variant).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// SSH connection parameters one host holds for reaching another.
///
/// `Host.ssh` is a directional map: `hosts[h].ssh[p]` existing means *h*
/// knows how to SSH into *p*, not the other way around. The planner's
/// direct/redirect/receive classification depends entirely on this
/// asymmetry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshConfig {
    pub username: String,
    pub host: String,
    pub private_key_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

/// Reachability verdict recorded by the catalog's probe pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Reachable,
    Unreachable,
    #[default]
    NoData,
}

impl Reachability {
    /// The planner's validation step only asks "not unreachable" — a host
    /// that was never probed is still eligible, matching §4.2 step 2.
    pub fn is_usable(self) -> bool {
        !matches!(self, Reachability::Unreachable)
    }
}

/// A host in the catalog: a machine reachable by SSH (or the agent itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub agent: bool,
    #[serde(default)]
    pub available: Reachability,
    #[serde(default)]
    pub ssh: HashMap<String, SshConfig>,
}

impl Host {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: false,
            available: Reachability::NoData,
            ssh: HashMap::new(),
        }
    }
}

/// Backup interval a blueprint runs on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Daily,
    Weekly,
    Monthly,
}

impl Interval {
    /// Calendar-correct "next due" computation from a last-run timestamp.
    ///
    /// `Daily`/`Weekly` add fixed durations; `Monthly` increments the
    /// calendar month while preserving day-of-month, clamping to the last
    /// day of the target month when the source day doesn't exist there
    /// (e.g. Jan 31 + 1 month lands on the last day of February).
    pub fn next_due(self, last_run: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Interval::Daily => last_run + chrono::Duration::days(1),
            Interval::Weekly => last_run + chrono::Duration::days(7),
            Interval::Monthly => add_calendar_month(last_run),
        }
    }
}

fn add_calendar_month(dt: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, NaiveDate, TimeZone};

    let (mut year, mut month) = (dt.year(), dt.month());
    month += 1;
    if month > 12 {
        month = 1;
        year += 1;
    }

    let day = dt.day();
    let clamped_date = (1..=day)
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
        .expect("at least day 1 is valid in every month");

    Utc.from_utc_datetime(&clamped_date.and_time(dt.time()))
}

/// What the archive contains and how it's produced on the source host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackupStrategy {
    Files { paths: Vec<String> },
    Mongodb { connection_url: String },
}

/// Where an archive must end up. Only the `host` variant exists today;
/// modeling it as an enum with one variant keeps the planner's match
/// exhaustive so a second variant fails to compile everywhere it isn't
/// handled, rather than being silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    Host { host: String, path: String },
}

impl Destination {
    pub fn host_id(&self) -> &str {
        match self {
            Destination::Host { host, .. } => host,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Destination::Host { path, .. } => path,
        }
    }
}

/// A shell command to run on the source host before/after archive creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hook {
    pub cwd: String,
    pub cmd: String,
}

/// Optional pre/post hooks around archive creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<Hook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<Hook>,
}

/// Blueprint mode: either a real backup job or a catalog-shape-testing
/// no-op that the planner always skips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum BlueprintMode {
    SshAgent {
        host: String,
        #[serde(default)]
        hooks: Hooks,
        strategy: BackupStrategy,
        destinations: Vec<Destination>,
    },
    Dummy,
}

/// A declarative specification of one recurring backup job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Blueprint {
    #[serde(rename = "_id")]
    pub id: String,
    pub interval: Interval,
    #[serde(flatten)]
    pub mode: BlueprintMode,
}

/// The transport plan describing how the produced archive reaches every
/// destination. Produced once per blueprint by the planner; consumed
/// exactly once by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CloneStrategy {
    pub retain_on_host: RetainOnHost,
    pub download_locally: DownloadLocally,
    pub directly_clone_to: Vec<Destination>,
    pub redirect_clone_to: Vec<Destination>,
    pub receive_clone_from: Vec<Destination>,
}

/// Whether (and where) the archive is kept on the source host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(untagged)]
pub enum RetainOnHost {
    #[default]
    No,
    Path {
        path: String,
    },
}

impl RetainOnHost {
    pub fn is_set(&self) -> bool {
        matches!(self, RetainOnHost::Path { .. })
    }
}

/// Whether (and how) the archive is downloaded to the agent.
///
/// `Forced` means the download only happened because a redirect required
/// it — the local copy must be deleted once every redirect upload has
/// completed. `Keep` means the operator asked for the local copy to be
/// retained at `path`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(untagged)]
pub enum DownloadLocally {
    #[default]
    No,
    Forced,
    Keep {
        path: String,
    },
}

impl DownloadLocally {
    pub fn is_truthy(&self) -> bool {
        !matches!(self, DownloadLocally::No)
    }

    pub fn force(&mut self) {
        if !self.is_truthy() {
            *self = DownloadLocally::Forced;
        }
    }
}

/// The planner's verdict for a single blueprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Plan {
    Skipped {
        id: String,
    },
    Failed {
        id: String,
        reason: String,
    },
    SshAgent {
        id: String,
        host: Host,
        hooks: Hooks,
        strategy: BackupStrategy,
        clone: CloneStrategy,
    },
}

impl Plan {
    pub fn id(&self) -> &str {
        match self {
            Plan::Skipped { id } | Plan::Failed { id, .. } | Plan::SshAgent { id, .. } => id,
        }
    }
}

/// A single append-only record of one coordinator-driven run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub plan: Plan,
    pub log: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    /// Per §7: a run with no error counts as successful for scheduling
    /// purposes, regardless of what the plan actually did.
    pub fn is_successful(&self) -> bool {
        self.error.is_none()
    }
}

/// A read-only snapshot of the catalog for the duration of one invocation,
/// per the "no global mutable state" resolution in the design notes.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub hosts: HashMap<String, Host>,
    pub blueprints: Vec<Blueprint>,
    pub last_run: HashMap<String, DateTime<Utc>>,
    pub agent_id: String,
}

impl Snapshot {
    /// The agent's own credential for SSHing into `host`, if any.
    pub fn agent_ssh_credential(&self, host: &Host) -> Option<&SshConfig> {
        self.hosts.get(&self.agent_id)?.ssh.get(&host.id)
    }
}
