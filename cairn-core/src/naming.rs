//! Wire-format artifact naming (§6: "Artifact naming (on the wire)").

use chrono::{DateTime, Utc};

/// `<planId with "/" -> "-">_<ISO-8601 UTC with ms, ":" -> "-">.tar.gz`
///
/// Colons are substituted once, here, because some target filesystems
/// (notably anything FAT/exFAT-derived) reject them in filenames.
pub fn backup_filename(plan_id: &str, now: DateTime<Utc>) -> String {
    let safe_id = plan_id.replace('/', "-");
    let timestamp = now.format("%Y-%m-%dT%H-%M-%S%.3fZ");
    format!("{safe_id}_{timestamp}.tar.gz")
}
