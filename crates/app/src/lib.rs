//! Fallwatch application wiring
//!
//! Compiles the stage models into the artifact cache, starts one engine per
//! stage and streams an image sequence through the pipeline.

pub mod config;

pub use config::AppConfig;

use std::net::SocketAddr;

use anyhow::Context;
use artifact_compiler::{ArtifactCompiler, FsArtifactStore};
use frame_io::ImageSequenceSource;
use metrics_exporter_prometheus::PrometheusBuilder;
use posture::{
    create_detector, create_pose_estimator, create_posture_classifier, host_arch,
    AnnotatedImageSink, FanoutSink, JsonLinesSink, PipelineOrchestrator, RunSummary, TractBuilder,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber; `RUST_LOG` overrides the `info` default
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Serve Prometheus metrics on `addr`
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing prometheus exporter")?;
    info!("Metrics available at http://{}/metrics", addr);
    Ok(())
}

/// Build the output sinks named in the configuration
pub fn build_sink(config: &AppConfig) -> anyhow::Result<FanoutSink> {
    let mut sink = FanoutSink::new();
    if let Some(dir) = &config.output.annotated_dir {
        sink.push(Box::new(AnnotatedImageSink::new(
            dir,
            config.pipeline.alert_label.clone(),
            config.pipeline.keypoint_threshold,
        )?));
    }
    if let Some(path) = &config.output.results_path {
        sink.push(Box::new(JsonLinesSink::create(path)?));
    }
    if sink.is_empty() {
        info!("No outputs configured, results are only logged");
    }
    Ok(sink)
}

/// Run the whole pipeline once over the configured input
pub async fn run(config: AppConfig) -> anyhow::Result<RunSummary> {
    if let Some(addr) = config.metrics_addr {
        install_metrics_exporter(addr)?;
    }

    let arch = config.device_arch.clone().unwrap_or_else(host_arch);
    info!("Compiling models for {} into {}", arch, config.cache_dir.display());

    let compiler = ArtifactCompiler::new(
        config.cache_dir.clone(),
        FsArtifactStore::new(),
        TractBuilder::new(arch.clone()),
    );
    let descriptors = config.descriptors();
    let artifacts = tokio::task::spawn_blocking(move || compiler.compile_all(&descriptors))
        .await
        .context("artifact compilation task")??;
    let [detector_artifact, pose_artifact, posture_artifact] = <[_; 3]>::try_from(artifacts)
        .map_err(|found| anyhow::anyhow!("expected 3 artifacts, got {}", found.len()))?;

    let detector = create_detector(
        detector_artifact.path(),
        config.detector.device,
        config.detector.engine.clone(),
        arch.clone(),
        config.detector.params.clone(),
    )
    .await
    .context("starting detector")?;
    let pose = create_pose_estimator(
        pose_artifact.path(),
        config.pose.device,
        config.pose.engine.clone(),
        arch.clone(),
        config.pose.params.clone(),
    )
    .await
    .context("starting pose estimator")?;
    let posture = create_posture_classifier(
        posture_artifact.path(),
        config.posture.device,
        config.posture.engine.clone(),
        arch,
        config.posture.params.clone(),
    )
    .await
    .context("starting posture classifier")?;

    let pipeline = PipelineOrchestrator::new(detector, pose, posture, config.pipeline.clone());

    let mut source = ImageSequenceSource::open(&config.input.frames_dir, config.input.fps)
        .with_context(|| format!("opening {}", config.input.frames_dir.display()))?;
    let mut sink = build_sink(&config)?;

    let summary = pipeline
        .run(&mut source, &mut sink, config.pipeline.max_in_flight)
        .await;
    pipeline.shutdown();
    Ok(summary?)
}
