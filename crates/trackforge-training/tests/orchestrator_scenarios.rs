use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use trackforge_training::artifacts::sha256_file;
use trackforge_training::config::DdpConfig;
use trackforge_training::{
    Architecture, CheckpointManager, DataPipelineAdapter, DeviceList, DistributedRuntime, EpochContext,
    EpochOrchestrator, EpochOutcome, ErrorKind, JsonlProgressSink, LoaderOptions, Model, ModelAssembly,
    OrchestratorState, PairBatch, ProgressEvent, ProgressFanout, ProgressSink, RunConfig, RunLayout, SyntheticAssembly,
    SyntheticPairs, TrainerStep, TrainingError, TrainingPhase, TrainingResult,
};

#[derive(Default)]
struct RecordingSink(Mutex<Vec<ProgressEvent>>);

impl RecordingSink {
    fn events(&self) -> Vec<ProgressEvent> {
        self.0.lock().unwrap().clone()
    }

    fn transitions(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::PhaseTransition { epoch, .. } => Some(epoch),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[derive(Default)]
struct CountingAssembly {
    builds: AtomicUsize,
}

impl ModelAssembly for CountingAssembly {
    fn build(&self, config: &RunConfig, architecture: Architecture, devices: &DeviceList) -> TrainingResult<Model> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        SyntheticAssembly::new(4).build(config, architecture, devices)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EpochRecord {
    epoch: u32,
    phase: TrainingPhase,
    lr: f64,
    groups: Vec<String>,
    batches: usize,
    indices: Vec<usize>,
}

#[derive(Default)]
struct RecordingStep {
    records: Vec<EpochRecord>,
    fail_at: Option<u32>,
}

#[async_trait]
impl TrainerStep<PairBatch> for RecordingStep {
    fn id(&self) -> &'static str {
        "recording"
    }

    async fn run_epoch(&mut self, ctx: EpochContext<'_, PairBatch>) -> TrainingResult<EpochOutcome> {
        if self.fail_at == Some(ctx.epoch) {
            return Err(TrainingError::step(anyhow::anyhow!("loss diverged at epoch {}", ctx.epoch)));
        }
        let mut logging = ctx.logging;
        let mut batches = 0;
        let mut indices = Vec::new();
        for batch in ctx.batches {
            indices.extend(batch?.indices);
            batches += 1;
            logging.global_step += 1;
        }
        self.records.push(EpochRecord {
            epoch: ctx.epoch,
            phase: ctx.phase,
            lr: ctx.lr,
            groups: ctx.optimizer.param_groups().iter().map(|g| g.name.clone()).collect(),
            batches,
            indices,
        });
        Ok(EpochOutcome { logging, loss: Some(1.0 / f64::from(ctx.epoch + 1)) })
    }
}

fn config(dir: &Path, name: &str, end_epoch: u32, extra: &str) -> RunConfig {
    RunConfig::from_toml_str(&format!(
        r#"
        [model]
        name = "{name}"

        [common]
        output_dir = "{}"

        [train]
        batch = 2
        end_epoch = {end_epoch}
        {extra}

        [train.lr]
        kind = "log"
        start_lr = 0.01
        end_lr = 0.0001
        "#,
        dir.display()
    ))
    .unwrap()
}

fn pipeline(config: &RunConfig) -> DataPipelineAdapter<SyntheticPairs> {
    DataPipelineAdapter::new(
        SyntheticPairs::new(8, 3),
        LoaderOptions { batch_per_device: config.train.batch as usize, workers: 0, seed: config.common.seed },
    )
    .unwrap()
}

fn runtime(config: &RunConfig) -> DistributedRuntime {
    DistributedRuntime::new(config.train.ddp.clone(), config.common.seed, config.devices().unwrap())
}

async fn prepare(config: RunConfig, sink: &Arc<RecordingSink>) -> TrainingResult<EpochOrchestrator> {
    let rt = runtime(&config);
    EpochOrchestrator::prepare(Arc::new(config), &SyntheticAssembly::new(4), &rt, sink.clone()).await
}

fn checkpoint_files(dir: &Path, arch: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir.join(arch).join("checkpoints"))
        .map(|rd| rd.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    files.sort();
    files
}

#[tokio::test]
async fn test_warm_then_full_rebuilds_exactly_once_at_boundary() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path(), "Ocean", 3, "unfix_epoch = 1");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&cfg);
    let mut orchestrator = prepare(cfg, &sink).await.unwrap();
    assert_eq!(orchestrator.optimization().phase(), TrainingPhase::Warm);

    let mut step = RecordingStep::default();
    let summary = orchestrator.run(&mut data, &mut step).await.unwrap();

    let phases: Vec<_> = step.records.iter().map(|r| r.phase).collect();
    assert_eq!(phases, vec![TrainingPhase::Warm, TrainingPhase::Full, TrainingPhase::Full]);
    assert_eq!(step.records[0].groups, vec!["head".to_string()]);
    assert_eq!(step.records[1].groups, vec!["backbone".to_string(), "head".to_string()]);
    assert_eq!(summary.rebuilds, 1);
    assert_eq!(sink.transitions(), vec![1]);
    assert_eq!(summary.epochs_run, 3);
    assert_eq!(summary.final_epoch, Some(2));
    assert_eq!(orchestrator.state(), OrchestratorState::Terminated);

    let epochs: Vec<u32> = summary
        .checkpoints
        .iter()
        .map(|p| CheckpointManager::peek(p).unwrap().epoch)
        .collect();
    assert_eq!(epochs, vec![0, 1, 2]);
    assert_eq!(checkpoint_files(temp.path(), "Ocean").len(), 3);

    let saved: Vec<u32> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::CheckpointSaved { epoch, .. } => Some(epoch),
            _ => None,
        })
        .collect();
    assert_eq!(saved, vec![0, 1, 2]);

    let manifest = summary.manifest.expect("primary rank writes a manifest");
    assert_eq!(manifest.final_checkpoint().unwrap().path, summary.checkpoints[2]);
}

#[tokio::test]
async fn test_manifest_hashes_match_files_after_tracked_run() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path(), "Ocean", 2, "unfix_epoch = 1");
    let events = RunLayout::new(temp.path().to_path_buf()).events_path(Architecture::Ocean);
    let recorder = Arc::new(RecordingSink::default());
    let progress = ProgressFanout::new()
        .with(recorder.clone())
        .with(Arc::new(JsonlProgressSink::create(&events).unwrap()));

    let rt = runtime(&cfg);
    let mut data = pipeline(&cfg);
    let mut orchestrator =
        EpochOrchestrator::prepare(Arc::new(cfg), &SyntheticAssembly::new(4), &rt, Arc::new(progress)).await.unwrap();
    let summary = orchestrator.run(&mut data, &mut RecordingStep::default()).await.unwrap();

    let last_line = std::fs::read_to_string(&events).unwrap().lines().last().unwrap().to_string();
    assert!(last_line.contains("\"type\":\"run_finished\""));

    let manifest = summary.manifest.unwrap();
    assert!(manifest.artifacts.iter().any(|a| a.path == events));
    for artifact in &manifest.artifacts {
        assert_eq!(artifact.sha256, sha256_file(&artifact.path).unwrap(), "{}", artifact.path.display());
    }
    assert!(matches!(recorder.events().last(), Some(ProgressEvent::RunFinished { .. })));
}

#[tokio::test]
async fn test_applied_lr_matches_resolved_lr_every_epoch() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path(), "AutoMatch", 4, "unfix_epoch = 2");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&cfg);
    let mut orchestrator = prepare(cfg, &sink).await.unwrap();
    let mut step = RecordingStep::default();
    orchestrator.run(&mut data, &mut step).await.unwrap();

    let lrs: Vec<f64> = step.records.iter().map(|r| r.lr).collect();
    for (epoch, lr) in lrs.iter().enumerate() {
        let resolved = orchestrator.optimization().resolve_lr(epoch as u32);
        assert!((lr - resolved).abs() < 1e-12, "epoch {epoch}: {lr} vs {resolved}");
    }
    assert!(lrs.windows(2).all(|w| w[1] < w[0]));
    assert!(step.records.iter().all(|r| r.batches == 4));
}

#[tokio::test]
async fn test_resume_after_boundary_starts_in_full_without_transition() {
    let temp = TempDir::new().unwrap();

    let first = config(temp.path(), "Ocean", 2, "unfix_epoch = 1");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&first);
    let mut orchestrator = prepare(first, &sink).await.unwrap();
    let summary = orchestrator.run(&mut data, &mut RecordingStep::default()).await.unwrap();
    let saved_e1 = summary.checkpoints[1].clone();
    let trained = orchestrator.model().parameters.clone();

    let resume = format!("unfix_epoch = 1\nresume = \"{}\"", saved_e1.display());
    let second = config(temp.path(), "Ocean", 4, &resume);
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&second);
    let mut orchestrator = prepare(second, &sink).await.unwrap();

    assert_eq!(orchestrator.next_epoch(), 2);
    assert_eq!(orchestrator.optimization().phase(), TrainingPhase::Full);
    let restored: Vec<_> = orchestrator.model().parameters.iter().map(|(n, p)| (n.clone(), p.values.clone())).collect();
    let expected: Vec<_> = trained.iter().map(|(n, p)| (n.clone(), p.values.clone())).collect();
    assert_eq!(restored, expected);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ProgressEvent::Resumed { next_epoch: 2, optimizer_restored: true, .. }
    )));

    let mut step = RecordingStep::default();
    let summary = orchestrator.run(&mut data, &mut step).await.unwrap();
    assert_eq!(step.records.iter().map(|r| r.epoch).collect::<Vec<_>>(), vec![2, 3]);
    assert!(step.records.iter().all(|r| r.phase == TrainingPhase::Full));
    assert_eq!(summary.rebuilds, 0);
    assert!(sink.transitions().is_empty());
}

#[tokio::test]
async fn test_resume_before_boundary_drops_warm_optimizer_state() {
    let temp = TempDir::new().unwrap();
    let first = config(temp.path(), "OceanPlus", 1, "unfix_epoch = 1");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&first);
    let summary = prepare(first, &sink)
        .await
        .unwrap()
        .run(&mut data, &mut RecordingStep::default())
        .await
        .unwrap();
    assert_eq!(CheckpointManager::peek(&summary.checkpoints[0]).unwrap().phase, TrainingPhase::Warm);

    let resume = format!("unfix_epoch = 1\nresume = \"{}\"", summary.checkpoints[0].display());
    let second = config(temp.path(), "OceanPlus", 3, &resume);
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = prepare(second, &sink).await.unwrap();
    assert_eq!(orchestrator.next_epoch(), 1);
    assert_eq!(orchestrator.optimization().phase(), TrainingPhase::Full);
    assert!(sink.events().iter().any(|e| matches!(
        e,
        ProgressEvent::Resumed { next_epoch: 1, optimizer_restored: false, .. }
    )));
}

#[tokio::test]
async fn test_resume_with_other_architecture_is_rejected() {
    let temp = TempDir::new().unwrap();
    let first = config(temp.path(), "Ocean", 1, "");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&first);
    let summary = prepare(first, &sink)
        .await
        .unwrap()
        .run(&mut data, &mut RecordingStep::default())
        .await
        .unwrap();

    let resume = format!("resume = \"{}\"", summary.checkpoints[0].display());
    let err = prepare(config(temp.path(), "TransT", 2, &resume), &sink).await.unwrap_err();
    assert!(matches!(err, TrainingError::IncompatibleCheckpoint { .. }));
    assert_eq!(err.kind(), ErrorKind::Checkpoint);

    let missing = "resume = \"does/not/exist.json\"";
    let err = prepare(config(temp.path(), "Ocean", 2, missing), &sink).await.unwrap_err();
    assert!(matches!(err, TrainingError::CheckpointNotFound(_)));
}

#[tokio::test]
async fn test_unsupported_architecture_fails_before_allocation() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("runs");
    let cfg = config(&output, "SiamRPN", 3, "");
    let rt = runtime(&cfg);
    let assembly = CountingAssembly::default();
    let sink = Arc::new(RecordingSink::default());

    let err = EpochOrchestrator::prepare(Arc::new(cfg), &assembly, &rt, sink.clone()).await.unwrap_err();

    assert!(matches!(err, TrainingError::UnsupportedArchitecture(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(assembly.builds.load(Ordering::SeqCst), 0);
    assert!(rt.context().is_none());
    assert!(sink.events().is_empty());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_table_architecture_never_enters_warm_phase() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path(), "SiamDW", 3, "unfix_epoch = 1");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&cfg);
    let mut orchestrator = prepare(cfg, &sink).await.unwrap();
    let mut step = RecordingStep::default();
    let summary = orchestrator.run(&mut data, &mut step).await.unwrap();

    assert!(step.records.iter().all(|r| r.phase == TrainingPhase::Full));
    assert!(step.records.iter().all(|r| r.groups == vec!["all".to_string()]));
    assert_eq!(summary.rebuilds, 0);
    assert_eq!(summary.checkpoints.len(), 3);
}

#[tokio::test]
async fn test_step_failure_propagates_and_keeps_last_checkpoint() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path(), "Ocean", 4, "unfix_epoch = 2");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&cfg);
    let mut orchestrator = prepare(cfg, &sink).await.unwrap();
    let mut step = RecordingStep { fail_at: Some(1), ..RecordingStep::default() };

    let err = orchestrator.run(&mut data, &mut step).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TrainingStep);
    assert!(err.to_string().contains("training step failed"));
    assert_eq!(step.records.len(), 1);

    let files = checkpoint_files(temp.path(), "Ocean");
    assert_eq!(files.len(), 1);
    assert_eq!(CheckpointManager::peek(&files[0]).unwrap().epoch, 0);
    assert!(!sink.events().iter().any(|e| matches!(e, ProgressEvent::RunFinished { .. })));
}

#[tokio::test]
async fn test_retention_keeps_most_recent_checkpoints() {
    let temp = TempDir::new().unwrap();
    let cfg = config(temp.path(), "TransT", 5, "keep_last = 2");
    let sink = Arc::new(RecordingSink::default());
    let mut data = pipeline(&cfg);
    let summary = prepare(cfg, &sink).await.unwrap().run(&mut data, &mut RecordingStep::default()).await.unwrap();

    assert_eq!(summary.checkpoints.len(), 5);
    let remaining: Vec<u32> = checkpoint_files(temp.path(), "TransT")
        .iter()
        .map(|p| CheckpointManager::peek(p).unwrap().epoch)
        .collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&3) && remaining.contains(&4));
    let pruned = sink.events().iter().filter(|e| matches!(e, ProgressEvent::CheckpointPruned { .. })).count();
    assert_eq!(pruned, 3);
}

#[tokio::test]
async fn test_two_ranks_train_disjoint_shards_and_only_primary_writes() {
    let temp = TempDir::new().unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let with_ddp = |rank: u32| {
        let mut cfg = config(temp.path(), "Ocean", 2, "");
        cfg.train.ddp = DdpConfig {
            enabled: true,
            rank,
            world_size: 2,
            backend: "tcp".to_string(),
            master_addr: format!("127.0.0.1:{port}"),
            timeout_secs: 10,
        };
        cfg
    };
    let cfg0 = with_ddp(0);
    let cfg1 = with_ddp(1);

    let sink = Arc::new(RecordingSink::default());
    let (r0, r1) = tokio::join!(prepare(cfg0.clone(), &sink), prepare(cfg1.clone(), &sink));
    let (mut rank0, mut rank1) = (r0.unwrap(), r1.unwrap());
    assert_eq!(rank1.context().rank, 1);
    assert!(rank0.context().is_distributed());

    let mut step0 = RecordingStep::default();
    let mut step1 = RecordingStep::default();
    let s0 = rank0.run(&mut pipeline(&cfg0), &mut step0).await.unwrap();
    let s1 = rank1.run(&mut pipeline(&cfg1), &mut step1).await.unwrap();

    // 8 samples over 2 ranks in batches of 2
    assert!(step0.records.iter().chain(&step1.records).all(|r| r.batches == 2));
    for (a, b) in step0.records.iter().zip(&step1.records) {
        assert_eq!(a.epoch, b.epoch);
        let shard0: BTreeSet<usize> = a.indices.iter().copied().collect();
        let shard1: BTreeSet<usize> = b.indices.iter().copied().collect();
        assert_eq!(shard0.len(), 4);
        assert!(shard0.is_disjoint(&shard1), "epoch {}: {shard0:?} overlaps {shard1:?}", a.epoch);
        assert_eq!(shard0.union(&shard1).copied().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
    }
    assert_eq!(s0.checkpoints.len(), 2);
    assert!(s1.checkpoints.is_empty());
    assert!(s1.manifest.is_none());
    assert_eq!(checkpoint_files(temp.path(), "Ocean").len(), 2);
}
