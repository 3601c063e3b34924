//! Colored terminal output.

use chrono::Utc;
use colored::Colorize;

use crate::api::ChangeCursor;
use crate::cache::EntityKind;
use crate::storage::millis_to_datetime;
use crate::sync::realtime::ApplyStats;
use crate::sync::{OperationStatus, PendingOperation, QueueStats};

fn age(then: chrono::DateTime<Utc>) -> String {
    let age = Utc::now().signed_duration_since(then);
    if age.num_days() > 0 {
        format!("{} days ago", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{} hours ago", age.num_hours())
    } else if age.num_minutes() > 0 {
        format!("{} minutes ago", age.num_minutes())
    } else {
        "just now".to_string()
    }
}

/// Format queue status as a summary block
pub fn format_status_pretty(stats: &QueueStats, unsynced: &[(EntityKind, usize)]) -> String {
    let mut lines = Vec::new();

    lines.push("Sync Queue Status".bold().to_string());
    lines.push("─".repeat(40));

    lines.push(format!(
        "  Pending:      {} {}",
        stats.pending,
        if stats.pending > 0 {
            "operations waiting".dimmed()
        } else {
            "".dimmed()
        }
    ));
    lines.push(format!("  In progress:  {}", stats.in_progress));
    lines.push(format!(
        "  Failed:       {} {}",
        stats.failed,
        if stats.failed > 0 {
            "operations need attention".red()
        } else {
            "".normal()
        }
    ));

    if let Some(oldest) = stats.oldest_pending {
        lines.push(format!("  Oldest:       {}", age(oldest).dimmed()));
    }

    let waiting: Vec<_> = unsynced.iter().filter(|(_, count)| *count > 0).collect();
    if !waiting.is_empty() {
        lines.push(String::new());
        lines.push("Unsynced entities".bold().to_string());
        for (kind, count) in waiting {
            lines.push(format!("  {:<18} {count}", kind.to_string()));
        }
    }

    if stats.in_progress > 0 {
        lines.push(String::new());
        lines.push(
            "Run 'shelfsync recover' if no sync is running"
                .dimmed()
                .to_string(),
        );
    }
    if stats.failed > 0 {
        lines.push(
            "Run 'shelfsync list --status failed' to inspect failures"
                .dimmed()
                .to_string(),
        );
    }

    lines.join("\n")
}

/// Format queued operations, one per line
pub fn format_operations_pretty(operations: &[PendingOperation]) -> String {
    if operations.is_empty() {
        return "No operations in queue.".to_string();
    }

    let mut lines = Vec::new();
    lines.push(format!("Queued Operations ({})", operations.len()).bold().to_string());
    lines.push("─".repeat(60));

    for op in operations {
        let icon = match op.status {
            OperationStatus::Pending => "○".yellow(),
            OperationStatus::InProgress => "◐".blue(),
            OperationStatus::Failed => "✗".red(),
        };
        lines.push(format!(
            "{} {} {}  {}",
            icon,
            op.operation_type.to_string().bold(),
            op.target(),
            op.id.dimmed()
        ));

        let mut detail = format!("    queued {}", age(op.created_at));
        if op.attempt_count > 0 {
            detail.push_str(&format!(", {} attempts", op.attempt_count));
        }
        lines.push(detail.dimmed().to_string());

        if let Some(error) = &op.last_error {
            lines.push(format!("    {}", error.red()));
        }
    }

    lines.join("\n")
}

/// Format pull cursors as a table
pub fn format_cursors_pretty(cursors: &[(EntityKind, ChangeCursor)]) -> String {
    if cursors.is_empty() {
        return "No pull cursors; the next pull fetches everything.".to_string();
    }

    let mut lines = Vec::new();
    lines.push("Pull Cursors".bold().to_string());
    lines.push("─".repeat(40));
    for (kind, cursor) in cursors {
        let when = millis_to_datetime(cursor.updated_at);
        lines.push(format!(
            "  {:<18} {}  {:<12} {}",
            kind.to_string(),
            when.format("%Y-%m-%d %H:%M:%S"),
            cursor.id,
            age(when).dimmed()
        ));
    }
    lines.join("\n")
}

/// Format replay counts and any per-line errors
pub fn format_replay_pretty(stats: &ApplyStats, errors: &[String]) -> String {
    let mut lines = Vec::new();

    lines.push("Replay Results".bold().to_string());
    lines.push("─".repeat(40));
    lines.push(format!("  {} Applied:  {}", "✓".green(), stats.applied));
    lines.push(format!("  {} Ignored:  {}", "○".dimmed(), stats.ignored));
    if stats.failed > 0 {
        lines.push(format!("  {} Failed:   {}", "✗".red(), stats.failed));
        lines.push(String::new());
        lines.push("Errors:".bold().to_string());
        for error in errors {
            lines.push(format!("  {}", error.red()));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_operations() {
        assert_eq!(format_operations_pretty(&[]), "No operations in queue.");
    }

    #[test]
    fn test_status_mentions_failures() {
        let stats = QueueStats {
            failed: 2,
            ..QueueStats::default()
        };
        let output = format_status_pretty(&stats, &[(EntityKind::Book, 0)]);

        assert!(output.contains("Failed:       2"));
        assert!(output.contains("shelfsync list --status failed"));
        assert!(!output.contains("Unsynced entities"));
    }

    #[test]
    fn test_status_lists_unsynced_kinds() {
        let output = format_status_pretty(
            &QueueStats::default(),
            &[(EntityKind::Book, 3), (EntityKind::Tag, 0)],
        );

        assert!(output.contains("Unsynced entities"));
        assert!(output.contains("book"));
        assert!(!output.contains("tag "));
    }

    #[test]
    fn test_cursors_show_boundary_id() {
        let output = format_cursors_pretty(&[(EntityKind::Book, ChangeCursor::new(0, "b17"))]);

        assert!(output.contains("Pull Cursors"));
        assert!(output.contains("1970-01-01 00:00:00"));
        assert!(output.contains("b17"));
    }

    #[test]
    fn test_replay_errors_listed() {
        let stats = ApplyStats {
            applied: 4,
            failed: 1,
            ..ApplyStats::default()
        };
        let output = format_replay_pretty(&stats, &["line 3: malformed event".to_string()]);

        assert!(output.contains("Applied:  4"));
        assert!(output.contains("line 3: malformed event"));
    }
}
