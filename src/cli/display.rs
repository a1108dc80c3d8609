//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::TerminationSummary;
use crate::cloud::CallerIdentity;
use crate::cluster::{LifecycleState, NodeDescriptor, RunReport};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    let header_cells: Vec<String> = headers.iter().map(|h| h.to_uppercase()).collect();
    lines.push(join_row(&header_cells, &widths));
    for row in &rows {
        lines.push(join_row(row, &widths));
    }

    let mut output = lines.join("\n");
    output.push('\n');
    output
}

fn join_row(cells: &[String], widths: &[usize]) -> String {
    let padded: Vec<String> = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| match widths.get(i) {
            Some(w) => format!("{:width$}", cell, width = w),
            None => cell.clone(),
        })
        .collect();
    padded.join("   ").trim_end().to_string()
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

// ============================================================================
// Instances
// ============================================================================

pub fn format_instances(nodes: &[NodeDescriptor]) -> String {
    let headers = &["ID", "STATE", "PRIVATE", "PUBLIC", "NAME", "TYPE"];
    let rows = nodes
        .iter()
        .map(|n| {
            vec![
                n.id.clone(),
                n.state.to_string(),
                or_dash(n.private_address.as_deref()),
                or_dash(n.public_address.as_deref()),
                or_dash(n.name()),
                n.instance_class.clone(),
            ]
        })
        .collect();
    format_table(headers, rows)
}

pub fn format_identity(identity: &CallerIdentity) -> String {
    format!(
        "User:    {}\nAccount: {}\nARN:     {}\n",
        identity.user_id, identity.account, identity.arn
    )
}

pub fn format_termination(summary: &TerminationSummary) -> String {
    if summary.targets.is_empty() {
        return "No running instances.\n".to_string();
    }
    let mut output = String::new();
    if !summary.confirmed {
        output.push_str("Would terminate (pass --yes to proceed):\n");
        for id in &summary.targets {
            output.push_str(&format!("  {}\n", id));
        }
        return output;
    }
    for id in &summary.targets {
        match summary.failed.iter().find(|(failed, _)| failed == id) {
            Some((_, reason)) => output.push_str(&format!("{}   failed: {}\n", id, reason)),
            None => output.push_str(&format!("{}   terminated\n", id)),
        }
    }
    output
}

pub fn format_stopped(id: &str, state: LifecycleState) -> String {
    format!("{}   {}\n", id, state)
}

// ============================================================================
// Run report
// ============================================================================

/// One line per node followed by the aggregate status
pub fn format_run_report(report: &RunReport) -> String {
    let mut output = format!(
        "Run {}\nManager: {}\nNodes:   {}\nHeap:    {}\n\n",
        report.run_id,
        report.topology.manager,
        report.topology.node_count,
        report.topology.memory_budget.heap_size()
    );

    if report.dry_run {
        output.push_str(&format_rendered_artifacts(report));
    } else {
        let rows = report
            .nodes
            .iter()
            .map(|n| {
                vec![
                    n.node_id.clone(),
                    or_dash(n.address.as_deref()),
                    n.status.label().to_string(),
                    n.status.detail(),
                ]
            })
            .collect();
        output.push_str(&format_table(&["NODE", "ADDRESS", "STATUS", "DETAIL"], rows));
    }

    let elapsed = report.finished_at - report.started_at;
    output.push_str(&format!(
        "\nResult: {} ({}s)\n",
        report.overall(),
        elapsed.num_seconds()
    ));
    output
}

fn format_rendered_artifacts(report: &RunReport) -> String {
    let mut output = String::new();
    for artifact in report.artifacts.iter() {
        output.push_str(&format!("--- {} ---\n", artifact.kind.file_name()));
        output.push_str(&artifact.content_str());
        if !artifact.content.ends_with(b"\n") {
            output.push('\n');
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["A"], vec![]), "No resources found.\n");
    }

    #[test]
    fn test_format_table_aligns_columns() {
        let out = format_table(
            &["id", "state"],
            vec![
                vec!["i-1".to_string(), "running".to_string()],
                vec!["i-12345".to_string(), "stopped".to_string()],
            ],
        );
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines[0], "ID        STATE");
        assert_eq!(lines[1], "i-1       running");
        assert_eq!(lines[2], "i-12345   stopped");
    }

    #[test]
    fn test_format_instances() {
        let nodes = vec![NodeDescriptor::new("i-abc", LifecycleState::Running, "r6i.large")
            .with_private_address("10.0.0.5")
            .with_tag("Name", "opensearch-1")];
        let out = format_instances(&nodes);
        assert!(out.contains("i-abc"));
        assert!(out.contains("10.0.0.5"));
        assert!(out.contains("opensearch-1"));
        assert!(out.lines().nth(1).unwrap().contains(" - "));
    }

    #[test]
    fn test_format_termination_unconfirmed() {
        let summary = TerminationSummary {
            targets: vec!["i-1".to_string()],
            failed: vec![],
            confirmed: false,
        };
        let out = format_termination(&summary);
        assert!(out.contains("--yes"));
        assert!(out.contains("i-1"));
    }

    #[test]
    fn test_format_identity() {
        let out = format_identity(&CallerIdentity {
            user_id: "AIDA".to_string(),
            account: "123456789012".to_string(),
            arn: "arn:aws:iam::123456789012:user/alice".to_string(),
        });
        assert!(out.contains("Account: 123456789012"));
    }
}
