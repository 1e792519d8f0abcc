use std::time::Duration;

use anyhow::Result;
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::orchestrator::{PluginState, PluginSummary, ProjectSummary};

#[derive(Debug, Default, PartialEq, Eq)]
struct Totals {
    projects: usize,
    recovered: usize,
    errored: usize,
    added: usize,
}

fn totals(summaries: &[ProjectSummary]) -> Totals {
    let mut t = Totals {
        projects: summaries.len(),
        ..Default::default()
    };
    for plugin in summaries.iter().flat_map(|s| s.plugins.iter()) {
        match plugin.state {
            PluginState::Recovered => t.recovered += 1,
            PluginState::ScanError | PluginState::RecoveryError => t.errored += 1,
            _ => {}
        }
        t.added += plugin.dependencies_added;
    }
    t
}

/// Render a colored terminal report.
pub fn render(summaries: &[ProjectSummary], elapsed: Duration, quiet: bool) -> Result<()> {
    let t = totals(summaries);

    if quiet {
        println!(
            "Projects: {}  Recovered: {}  Errors: {}  Added: {}",
            t.projects,
            t.recovered.to_string().green(),
            t.errored.to_string().red(),
            t.added,
        );
        return Ok(());
    }

    println!(
        "\n {} v{}\n",
        "manifest-recoverr".bold(),
        env!("CARGO_PKG_VERSION")
    );

    for summary in summaries {
        let mut title = summary.project.display().to_string();
        if let Some(repo) = &summary.repo {
            title = format!("{} ({})", repo, title);
        }
        if let Some(product) = &summary.product {
            title = format!("[{}] {}", product, title);
        }
        println!(" {} {}\n", "▸".cyan(), title.bold());

        let detected: Vec<&PluginSummary> = summary.detected().collect();
        if detected.is_empty() {
            println!("   {}\n", "no supported ecosystem detected".dimmed());
            continue;
        }
        render_table(&detected);
        println!();
    }

    let errors = if t.errored > 0 {
        t.errored.to_string().red().bold()
    } else {
        t.errored.to_string().green()
    };
    println!(
        " Projects: {}  Manifests recovered: {}  Dependencies added: {}  Errors: {}  ({:.1}s)",
        t.projects,
        t.recovered,
        t.added,
        errors,
        elapsed.as_secs_f64()
    );

    Ok(())
}

fn render_table(plugins: &[&PluginSummary]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Plugin").add_attribute(Attribute::Bold),
            Cell::new("State").add_attribute(Attribute::Bold),
            Cell::new("Declared").add_attribute(Attribute::Bold),
            Cell::new("Total").add_attribute(Attribute::Bold),
            Cell::new("Added").add_attribute(Attribute::Bold),
            Cell::new("Manifest").add_attribute(Attribute::Bold),
            Cell::new("Error").add_attribute(Attribute::Bold),
        ]);

    for plugin in plugins {
        let state_color = match plugin.state {
            PluginState::Recovered => Color::Green,
            PluginState::Scanned => Color::Cyan,
            PluginState::ScanError | PluginState::RecoveryError => Color::Red,
            PluginState::NotDetected => Color::DarkGrey,
        };
        let manifest = plugin
            .manifest
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        table.add_row(vec![
            Cell::new(&plugin.name),
            Cell::new(plugin.state.to_string()).fg(state_color),
            Cell::new(plugin.declared).set_alignment(CellAlignment::Right),
            Cell::new(plugin.total).set_alignment(CellAlignment::Right),
            Cell::new(plugin.dependencies_added).set_alignment(CellAlignment::Right),
            Cell::new(manifest),
            Cell::new(plugin.error.as_deref().unwrap_or("")).fg(Color::Red),
        ]);
    }

    println!("{}", table);
}
