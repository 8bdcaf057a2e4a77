//! Checkpoint listing command.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use std::path::Path;
use trackforge_training::{CheckpointManager, RunConfig, RunLayout};

pub fn execute(cfg: &Path, json_output: bool) -> Result<()> {
    let config = RunConfig::load_from_file(cfg)
        .with_context(|| format!("Failed to load run config {}", cfg.display()))?;
    let architecture = config.architecture()?;
    let manager = CheckpointManager::new(RunLayout::new(config.common.output_dir.clone()), architecture, None);

    let mut rows = Vec::new();
    for entry in manager.list().context("Failed to list checkpoints")? {
        let header = CheckpointManager::peek(&entry.path)?;
        rows.push((entry, header));
    }

    if json_output {
        let out: Vec<_> = rows
            .iter()
            .map(|(entry, header)| {
                json!({
                    "epoch": entry.epoch,
                    "phase": header.phase,
                    "is_best": header.is_best,
                    "architecture": header.architecture,
                    "path": entry.path,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Checkpoints for {} ({})", architecture, rows.len()).bold().cyan());
    println!();

    if rows.is_empty() {
        println!("  {}", "No checkpoints found.".dimmed());
        println!();
        return Ok(());
    }

    println!("{:<8} {:<6} {:<5} {}", "Epoch", "Phase", "Best", "Path");
    println!("{}", "─".repeat(90));
    for (entry, header) in rows {
        let best = if header.is_best { "*" } else { "" };
        println!(
            "{:<8} {:<6} {:<5} {}",
            entry.epoch,
            header.phase.to_string(),
            best,
            entry.path.display().to_string().dimmed()
        );
    }
    println!();
    Ok(())
}
