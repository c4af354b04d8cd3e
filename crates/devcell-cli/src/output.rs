//! Formatted output helpers for CLI commands.
//!
//! Table rendering for container records plus human-readable byte and age
//! formatting.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use devcell_common::types::{ActivityEntry, ContainerRecord};

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Coarse age of a timestamp relative to `now`, e.g. "3d" or "12m".
#[must_use]
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        s if s >= 86_400 => format!("{}d", s / 86_400),
        s if s >= 3_600 => format!("{}h", s / 3_600),
        s if s >= 60 => format!("{}m", s / 60),
        s => format!("{s}s"),
    }
}

/// Renders container records as an aligned table.
#[must_use]
pub fn record_table(records: &[ContainerRecord], now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{:<24} {:<20} {:<10} {:<6} {:<14} {:<5}\n",
        "USER", "NAME", "STATUS", "PORT", "CONTAINER ID", "AGE"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:<24} {:<20} {:<10} {:<6} {:<14} {:<5}",
            r.user_id.as_str(),
            r.name,
            r.status.as_str(),
            r.ssh_port,
            r.runtime_id.as_ref().map_or("-", |id| id.short()),
            format_age(r.created_at, now),
        );
    }
    out
}

/// Renders activity entries, one per line.
#[must_use]
pub fn activity_lines(entries: &[ActivityEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let _ = writeln!(
            out,
            "  {}  {:<18} {}",
            e.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            e.kind.as_str(),
            e.description
        );
    }
    out
}
