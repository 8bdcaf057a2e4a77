//! Training command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use trackforge_training::{
    DataPipelineAdapter, DistributedRuntime, EpochOrchestrator, JsonlProgressSink, LoaderOptions,
    ProgressFanout, RegressionStep, RunConfig, RunLayout, SyntheticAssembly, SyntheticPairs,
    TracingProgressSink,
};

pub async fn execute(cfg: &Path, track: bool, samples: usize) -> Result<()> {
    let config = RunConfig::load_from_file(cfg)
        .with_context(|| format!("Failed to load run config {}", cfg.display()))?;
    // Unknown architectures fail here, before any file or socket is opened.
    let architecture = config.architecture()?;
    config.validate()?;
    let devices = config.devices()?;

    let mut progress = ProgressFanout::new().with(Arc::new(TracingProgressSink));
    if track {
        let events = RunLayout::new(config.common.output_dir.clone()).events_path(architecture);
        let sink = JsonlProgressSink::create(&events)
            .with_context(|| format!("Failed to open event log {}", events.display()))?;
        info!(path = %sink.path().display(), "tracking progress events");
        progress.push(Arc::new(sink));
    }

    let options = LoaderOptions {
        batch_per_device: config.train.batch as usize,
        workers: config.train.workers as usize,
        seed: config.common.seed,
    };
    let runtime = DistributedRuntime::new(config.train.ddp.clone(), config.common.seed, devices);
    let config = Arc::new(config);

    let mut orchestrator =
        EpochOrchestrator::prepare(config.clone(), &SyntheticAssembly::default(), &runtime, Arc::new(progress))
            .await?;
    let mut pipeline = DataPipelineAdapter::new(SyntheticPairs::new(samples, config.common.seed), options)?;
    let summary = orchestrator.run(&mut pipeline, &mut RegressionStep).await?;

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run:          {}", summary.run_id.to_string().cyan());
    println!("  Architecture: {}", architecture.tag().cyan());
    println!("  Epochs run:   {}", summary.epochs_run);
    if let Some(epoch) = summary.final_epoch {
        println!("  Final epoch:  {epoch}");
    }
    println!("  Checkpoints:  {}", summary.checkpoints.len());
    if let Some(manifest) = summary.manifest.as_ref().and_then(|m| m.final_checkpoint()) {
        println!("  Final model:  {}", manifest.path.display().to_string().dimmed());
    }
    println!();
    Ok(())
}
