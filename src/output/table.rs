//! Node status table and run summary rendering.

use colored::Colorize;
use k8s_openapi::api::core::v1::Node;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::labels::{Labels, NodeState};
use crate::node::{has_taint, is_cordoned, labels_of};
use crate::phase::MigrationPhase;
use crate::sequencer::StepOutcome;

/// Row for the node status table.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "ROLLED")]
    rolled: String,
    #[tabled(rename = "CORDONED")]
    cordoned: String,
    #[tabled(rename = "TAINT")]
    taint: String,
}

fn yes_no(value: bool) -> String {
    let s = if value { "yes" } else { "-" };
    s.to_string()
}

fn build_rows(nodes: &[Node], labels: &Labels) -> Vec<NodeRow> {
    nodes
        .iter()
        .map(|node| {
            let node_labels = labels_of(node);
            let state = labels.state_of(&node_labels);
            let state = match state {
                NodeState::Migrated => state.to_string().green().to_string(),
                NodeState::Conflicting => state.to_string().red().to_string(),
                NodeState::Migrating => state.to_string().yellow().to_string(),
                _ => state.to_string(),
            };

            NodeRow {
                node: node.metadata.name.clone().unwrap_or_default(),
                state,
                rolled: yes_no(labels.is_rolled(&node_labels)),
                cordoned: yes_no(is_cordoned(node)),
                taint: yes_no(has_taint(node, &labels.new_plugin)),
            }
        })
        .collect()
}

/// Print per-node migration state.
pub fn print_status(nodes: &[Node], labels: &Labels, context_name: &str) {
    if nodes.is_empty() {
        println!("No nodes found.");
        return;
    }

    let migrated = nodes
        .iter()
        .filter(|n| labels.is_migrated(&labels_of(n)))
        .count();
    println!(
        "{} (context: {}, {}/{} migrated):",
        "Nodes".bold(),
        context_name,
        migrated,
        nodes.len()
    );

    let mut table = Table::new(build_rows(nodes, labels));
    apply_table_style(&mut table);
    println!("{}", table);
}

/// Print which steps ran and which were only verified.
pub fn print_summary(outcomes: &[(MigrationPhase, StepOutcome)], dry_run: bool) {
    if outcomes.is_empty() {
        return;
    }

    let banner = if dry_run {
        "[DRY RUN]".yellow().to_string()
    } else {
        "[APPLIED]".green().to_string()
    };
    for (phase, outcome) in outcomes {
        let action = match outcome {
            StepOutcome::Verified => "ready",
            StepOutcome::Ran if dry_run => "planned",
            StepOutcome::Ran => "completed",
        };
        println!("{} Step {} {}", banner, phase.tag().bold(), action);
    }
    if dry_run {
        println!("Re-run with --no-dry-run to apply.");
    }
}

fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}
