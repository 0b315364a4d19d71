//! The planner: a pure function from catalog snapshot + blueprint + last
//! run time to a `Plan`. No I/O happens here — every decision is made from
//! values already in memory, which is what makes the scenarios in the
//! design doc's testable-properties section exercisable without mocks.

use cairn_common::{
    Blueprint, BlueprintMode, CloneStrategy, Destination, DownloadLocally, Host, Hooks, Plan,
    Reachability, RetainOnHost,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Decide whether `blueprint` is due and, if so, compute its clone
/// strategy against `hosts`. `now` is threaded in explicitly rather than
/// read from the clock so the due-ness law is testable without time
/// mocking.
pub fn plan(
    hosts: &HashMap<String, Host>,
    blueprint: &Blueprint,
    last_run: Option<DateTime<Utc>>,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Plan {
    let id = blueprint.id.clone();

    if let Some(last_run) = last_run {
        let next_due = blueprint.interval.next_due(last_run);
        if next_due > now {
            tracing::info!(
                plan_id = %id,
                next_due = %format_relative(now, next_due),
                "blueprint not yet due"
            );
            return Plan::Skipped { id };
        }
    }

    let (host_id, hooks, strategy, destinations) = match &blueprint.mode {
        BlueprintMode::Dummy => return Plan::Skipped { id },
        BlueprintMode::SshAgent {
            host,
            hooks,
            strategy,
            destinations,
        } => (host, hooks, strategy, destinations),
    };

    let Some(host) = hosts.get(host_id) else {
        return failed(id, format!("source host '{host_id}' not found in catalog"));
    };
    if !host.available.is_usable() {
        return failed(id, format!("source host '{host_id}' is unreachable"));
    }
    let Some(agent) = hosts.get(agent_id) else {
        return failed(id, format!("agent host '{agent_id}' not found in catalog"));
    };
    if !agent.ssh.contains_key(host_id) {
        return failed(
            id,
            format!("agent cannot reach source host '{host_id}' over ssh"),
        );
    }

    let clone = match classify(hosts, host, agent_id, destinations) {
        Ok(clone) => clone,
        Err(reason) => return failed(id, reason),
    };

    Plan::SshAgent {
        id,
        host: host.clone(),
        hooks: hooks.clone(),
        strategy: strategy.clone(),
        clone,
    }
}

fn failed(id: String, reason: String) -> Plan {
    tracing::warn!(plan_id = %id, reason = %reason, "planning rejected blueprint");
    Plan::Failed { id, reason }
}

enum Bucket {
    Direct,
    Redirect,
    Receive,
}

fn classify_destination(hosts: &HashMap<String, Host>, source: &Host, dest: &Destination) -> Bucket {
    if source.ssh.contains_key(dest.host_id()) {
        return Bucket::Direct;
    }
    let dest_can_reach_source = hosts
        .get(dest.host_id())
        .map(|d| d.ssh.contains_key(&source.id))
        .unwrap_or(false);
    if dest_can_reach_source {
        Bucket::Receive
    } else {
        Bucket::Redirect
    }
}

/// Build the clone strategy for a validated `ssh-agent` blueprint.
/// Returns `Err(reason)` when no destination is viable at all.
fn classify(
    hosts: &HashMap<String, Host>,
    source: &Host,
    agent_id: &str,
    destinations: &[Destination],
) -> Result<CloneStrategy, String> {
    let retain_idx = destinations.iter().position(|d| d.host_id() == source.id);
    let local_idx = destinations.iter().position(|d| d.host_id() == agent_id);

    let mut clone = CloneStrategy::default();

    if let Some(i) = retain_idx {
        clone.retain_on_host = RetainOnHost::Path {
            path: destinations[i].path().to_string(),
        };
    }
    if let Some(i) = local_idx {
        clone.download_locally = DownloadLocally::Keep {
            path: destinations[i].path().to_string(),
        };
    }

    let mut some_destinations_skipped = false;

    for (idx, dest) in destinations.iter().enumerate() {
        if Some(idx) == retain_idx || Some(idx) == local_idx {
            continue;
        }

        let usable = hosts
            .get(dest.host_id())
            .map(|h| h.available.is_usable())
            .unwrap_or(false);
        if !usable {
            some_destinations_skipped = true;
            continue;
        }

        match classify_destination(hosts, source, dest) {
            Bucket::Direct => clone.directly_clone_to.push(dest.clone()),
            Bucket::Redirect => clone.redirect_clone_to.push(dest.clone()),
            Bucket::Receive => clone.receive_clone_from.push(dest.clone()),
        }
    }

    if some_destinations_skipped {
        tracing::warn!("some destinations were skipped: unknown or unreachable host");
    }

    if !clone.redirect_clone_to.is_empty() {
        clone.download_locally.force();
    }

    let nothing_to_do = !clone.retain_on_host.is_set()
        && !clone.download_locally.is_truthy()
        && clone.directly_clone_to.is_empty()
        && clone.redirect_clone_to.is_empty()
        && clone.receive_clone_from.is_empty();

    if nothing_to_do {
        return Err("no viable destinations".to_string());
    }

    Ok(clone)
}

/// Relative duration for operator-facing log lines, e.g. "in 3h" or "2d
/// ago". Used only for the skip path's "not yet due" log line; the
/// due-ness decision itself always works in absolute timestamps.
fn format_relative(now: DateTime<Utc>, target: DateTime<Utc>) -> String {
    let delta = target - now;
    let seconds = delta.num_seconds();
    let (prefix, suffix, magnitude) = if seconds >= 0 {
        ("in ", "", seconds)
    } else {
        ("", " ago", -seconds)
    };

    let text = if magnitude < 60 {
        format!("{magnitude}s")
    } else if magnitude < 3600 {
        format!("{}m", magnitude / 60)
    } else if magnitude < 86_400 {
        format!("{}h", magnitude / 3600)
    } else {
        format!("{}d", magnitude / 86_400)
    };

    format!("{prefix}{text}{suffix}")
}
