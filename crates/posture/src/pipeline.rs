//! Per-frame orchestration across the three stage engines

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use frame_io::{FrameSource, VideoFrame};
use inference_engine::{EngineError, Pending};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::PostureClassifier;
use crate::config::PipelineConfig;
use crate::detector::Detector;
use crate::pose::PoseEstimator;
use crate::sink::FrameSink;
use crate::types::{
    Detection, PerPersonResult, PersonOutcome, PoseRequest, PoseResult, PostureRequest, Stage,
};
use crate::PipelineError;

/// Totals reported by [`PipelineOrchestrator::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub frames: u64,
    pub people: u64,
    pub person_failures: u64,
    pub frame_failures: u64,
}

type FrameTask = JoinHandle<Result<Vec<PerPersonResult>, PipelineError>>;

/// Drives detection, pose and posture for each frame. Cheap to clone.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    detector: Arc<Detector>,
    pose: Arc<PoseEstimator>,
    posture: Arc<PostureClassifier>,
    config: Arc<PipelineConfig>,
}

fn failed(stage: Stage, err: impl Display) -> PersonOutcome {
    PersonOutcome::Failed {
        stage,
        reason: err.to_string(),
        pose: None,
    }
}

/// Posture failed after pose succeeded; the keypoints are still worth reporting
fn posture_failed(pose: PoseResult, err: impl Display) -> PersonOutcome {
    PersonOutcome::Failed {
        stage: Stage::Posture,
        reason: err.to_string(),
        pose: Some(pose),
    }
}

impl PipelineOrchestrator {
    pub fn new(
        detector: Detector,
        pose: PoseEstimator,
        posture: PostureClassifier,
        config: PipelineConfig,
    ) -> Self {
        for (name, device, artifact, engine) in [
            (detector.name(), detector.device(), detector.artifact(), detector.config()),
            (pose.name(), pose.device(), pose.artifact(), pose.config()),
            (posture.name(), posture.device(), posture.artifact(), posture.config()),
        ] {
            info!(
                "Stage {} on device {}: {} (max_batch={}, queue={})",
                name,
                device,
                artifact.display(),
                engine.max_batch,
                engine.queue_capacity
            );
        }
        Self {
            detector: Arc::new(detector),
            pose: Arc::new(pose),
            posture: Arc::new(posture),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Analyse one frame. Results follow detection order.
    ///
    /// Only a detector failure fails the frame; anything going wrong for a
    /// single person becomes a failed entry for that person.
    pub async fn process(
        &self,
        frame: Arc<VideoFrame>,
    ) -> Result<Vec<PerPersonResult>, PipelineError> {
        let start = Instant::now();
        let index = frame.index;
        let detection_failed =
            move |source: EngineError| PipelineError::Detection { index, source };

        let detections = self
            .detector
            .submit(frame.clone())
            .await
            .map_err(detection_failed)?
            .await
            .map_err(detection_failed)?;

        let total = detections.len();
        let people: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.label == self.config.target_label)
            .collect();
        debug!(
            "Frame {}: {} detections, {} {}",
            index,
            total,
            people.len(),
            self.config.target_label
        );

        // Submit every crop before awaiting any, so the pose worker can batch them
        let mut poses: Vec<Result<Pending<PoseResult>, PersonOutcome>> =
            Vec::with_capacity(people.len());
        for person in &people {
            let request = person
                .bbox
                .to_pixel_rect(frame.width, frame.height)
                .map_err(|e| failed(Stage::Crop, e))
                .and_then(|rect| {
                    frame
                        .crop(rect)
                        .map(|region| PoseRequest {
                            region,
                            rect,
                            bbox: person.bbox,
                        })
                        .map_err(|e| failed(Stage::Crop, e))
                });
            let handle = match request {
                Ok(request) => self
                    .pose
                    .submit(request)
                    .await
                    .map_err(|e| failed(Stage::Pose, e)),
                Err(outcome) => Err(outcome),
            };
            poses.push(handle);
        }

        let mut postures: Vec<Result<(PoseResult, Pending<_>), PersonOutcome>> =
            Vec::with_capacity(people.len());
        for (person, handle) in people.iter().zip(poses) {
            let staged = match handle {
                Ok(pending) => match pending.await {
                    Ok(pose) => {
                        let request = PostureRequest {
                            pose: pose.clone(),
                            bbox: person.bbox,
                        };
                        match self.posture.submit(request).await {
                            Ok(pending) => Ok((pose, pending)),
                            Err(e) => Err(posture_failed(pose, e)),
                        }
                    }
                    Err(e) => Err(failed(Stage::Pose, e)),
                },
                Err(outcome) => Err(outcome),
            };
            postures.push(staged);
        }

        let mut results = Vec::with_capacity(people.len());
        for (person, staged) in people.into_iter().zip(postures) {
            let outcome = match staged {
                Ok((pose, pending)) => match pending.await {
                    Ok(posture) => PersonOutcome::Classified { pose, posture },
                    Err(e) => posture_failed(pose, e),
                },
                Err(outcome) => outcome,
            };

            match &outcome {
                PersonOutcome::Classified { posture, .. } => {
                    info!("[{}] {:.2} %", posture.label, posture.confidence * 100.0);
                }
                PersonOutcome::Failed { stage, reason, .. } => {
                    warn!(
                        "Frame {}: person at {:?} failed at {:?}: {}",
                        index, person.bbox, stage, reason
                    );
                    metrics::counter!("pipeline_person_failures_total").increment(1);
                }
            }

            results.push(PerPersonResult {
                bbox: person.bbox,
                detection_confidence: person.confidence,
                outcome,
            });
        }

        metrics::counter!("pipeline_frames_total").increment(1);
        metrics::counter!("pipeline_people_total").increment(results.len() as u64);
        metrics::histogram!("pipeline_frame_seconds").record(start.elapsed().as_secs_f64());

        Ok(results)
    }

    /// Process a whole stream, keeping up to `max_in_flight` frames in progress.
    ///
    /// Frames are emitted to `sink` strictly in source order. A frame whose
    /// detection fails is logged and emitted with no people. If the source
    /// itself fails, reading stops but frames already in flight are still
    /// emitted and the sink is finished before the error is returned.
    pub async fn run<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        max_in_flight: usize,
    ) -> Result<RunSummary, PipelineError>
    where
        S: FrameSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let max_in_flight = max_in_flight.max(1);
        let info = source.info();
        info!(
            "Pipeline started: {}x{} @ {:.1} fps, {} frame(s) in flight",
            info.width, info.height, info.fps, max_in_flight
        );

        let mut summary = RunSummary::default();
        let mut in_flight: VecDeque<(Arc<VideoFrame>, FrameTask)> =
            VecDeque::with_capacity(max_in_flight);
        let mut exhausted = false;
        let mut source_error = None;

        loop {
            while !exhausted && in_flight.len() < max_in_flight {
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        let frame = Arc::new(frame);
                        let this = self.clone();
                        let task_frame = frame.clone();
                        let task = tokio::spawn(async move { this.process(task_frame).await });
                        in_flight.push_back((frame, task));
                    }
                    Ok(None) => exhausted = true,
                    Err(e) => {
                        error!("Frame source failed, draining {} frame(s): {}", in_flight.len(), e);
                        source_error = Some(e);
                        exhausted = true;
                    }
                }
            }

            let Some((frame, task)) = in_flight.pop_front() else {
                break;
            };

            let people = match task.await {
                Ok(Ok(people)) => people,
                Ok(Err(e)) => {
                    error!("{}", e);
                    summary.frame_failures += 1;
                    Vec::new()
                }
                Err(e) => {
                    error!("Frame {} task aborted: {}", frame.index, e);
                    summary.frame_failures += 1;
                    Vec::new()
                }
            };

            summary.frames += 1;
            summary.people += people.len() as u64;
            summary.person_failures += people.iter().filter(|p| p.is_failed()).count() as u64;
            sink.emit(&frame, &people)?;
        }

        sink.finish()?;
        info!(
            "Pipeline finished: {} frames, {} people, {} person failures, {} frame failures",
            summary.frames, summary.people, summary.person_failures, summary.frame_failures
        );
        match source_error {
            Some(e) => Err(PipelineError::Source(e)),
            None => Ok(summary),
        }
    }

    /// Stop all three engines; queued work resolves as closed
    pub fn shutdown(&self) {
        self.detector.shutdown();
        self.pose.shutdown();
        self.posture.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::JsonLinesSink;
    use crate::types::{BoundingBox, FrameResult, Keypoint, PostureResult};
    use crate::SinkError;
    use frame_io::{FrameError, SourceInfo, VecSource};
    use inference_engine::{DeviceId, EngineConfig, InferenceError, PerItemBackend};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type DetectScript = fn(&VideoFrame) -> Result<Vec<Detection>, InferenceError>;

    #[derive(Default, Clone)]
    struct Calls {
        pose: Arc<AtomicUsize>,
        posture: Arc<AtomicUsize>,
    }

    fn detection(label: &str, left: f32, top: f32, right: f32, bottom: f32) -> Detection {
        Detection {
            class_id: if label == "person" { 0 } else { 16 },
            label: label.into(),
            bbox: BoundingBox::try_new(left, top, right, bottom).unwrap(),
            confidence: 0.9,
        }
    }

    async fn orchestrator(dir: &Path, detect: DetectScript) -> (PipelineOrchestrator, Calls) {
        let artifact = dir.join("stub.model");
        std::fs::write(&artifact, b"stub").unwrap();
        let calls = Calls::default();

        let detector = Detector::create(
            "detector",
            &artifact,
            DeviceId(0),
            EngineConfig::default(),
            move |_, _| Ok(PerItemBackend::new(move |frame: Arc<VideoFrame>| detect(&frame))),
        )
        .await
        .unwrap();

        let pose_calls = calls.pose.clone();
        let pose_engine = EngineConfig::batched(4, 0);
        let pose = PoseEstimator::create("pose", &artifact, DeviceId(0), pose_engine, move |_, _| {
            Ok(PerItemBackend::new(move |request: PoseRequest| {
                pose_calls.fetch_add(1, Ordering::SeqCst);
                if request.bbox.left >= 60.0 {
                    return Err(InferenceError::InferenceFailed("occluded".into()));
                }
                let (cx, cy) = (
                    request.rect.x as f32 + request.region.width as f32 / 2.0,
                    request.rect.y as f32 + request.region.height as f32 / 2.0,
                );
                Ok(PoseResult::new(vec![Keypoint::new(cx, cy, 0.9)]))
            }))
        })
        .await
        .unwrap();

        let posture_calls = calls.posture.clone();
        let posture_engine = EngineConfig::default();
        let posture = PostureClassifier::create(
            "posture",
            &artifact,
            DeviceId(0),
            posture_engine,
            move |_, _| {
                Ok(PerItemBackend::new(move |request: PostureRequest| {
                    posture_calls.fetch_add(1, Ordering::SeqCst);
                    if request.bbox.top >= 70.0 {
                        return Err(InferenceError::InferenceFailed("joints out of range".into()));
                    }
                    let label = if request.bbox.width() > request.bbox.height() {
                        "fall"
                    } else {
                        "stand"
                    };
                    Ok(PostureResult {
                        label: label.into(),
                        confidence: 0.75,
                    })
                }))
            },
        )
        .await
        .unwrap();

        (
            PipelineOrchestrator::new(detector, pose, posture, PipelineConfig::default()),
            calls,
        )
    }

    fn frame(index: u64) -> Arc<VideoFrame> {
        Arc::new(VideoFrame::filled(100, 100, [10, 20, 30], index))
    }

    #[tokio::test]
    async fn test_only_target_label_reaches_pose() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, calls) = orchestrator(dir.path(), |_| {
            Ok(vec![
                detection("dog", 0.0, 0.0, 40.0, 20.0),
                detection("person", 10.0, 10.0, 30.0, 50.0),
            ])
        })
        .await;

        let people = pipeline.process(frame(0)).await.unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(calls.pose.load(Ordering::SeqCst), 1);
        assert_eq!(calls.posture.load(Ordering::SeqCst), 1);

        let person = &people[0];
        assert_eq!(person.bbox, BoundingBox::try_new(10.0, 10.0, 30.0, 50.0).unwrap());
        assert_eq!(person.posture().unwrap().label, "stand");
        assert_eq!(person.pose().unwrap().keypoints[0], Keypoint::new(20.0, 30.0, 0.9));
    }

    #[tokio::test]
    async fn test_person_failure_does_not_affect_others() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, calls) = orchestrator(dir.path(), |_| {
            Ok(vec![
                detection("person", 0.0, 60.0, 40.0, 80.0),
                detection("person", 60.0, 0.0, 80.0, 40.0),
                detection("person", 20.0, 20.0, 30.0, 50.0),
            ])
        })
        .await;

        let people = pipeline.process(frame(3)).await.unwrap();
        assert_eq!(people.len(), 3);
        assert_eq!(people[0].posture().unwrap().label, "fall");
        assert!(matches!(
            &people[1].outcome,
            PersonOutcome::Failed { stage: Stage::Pose, reason, .. } if reason.contains("occluded")
        ));
        assert_eq!(people[2].posture().unwrap().label, "stand");
        assert_eq!(people[1].bbox.left, 60.0);

        assert_eq!(calls.pose.load(Ordering::SeqCst), 3);
        assert_eq!(calls.posture.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_posture_failure_keeps_pose() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, calls) = orchestrator(dir.path(), |_| {
            Ok(vec![
                detection("person", 10.0, 70.0, 30.0, 90.0),
                detection("person", 10.0, 10.0, 30.0, 50.0),
            ])
        })
        .await;

        let people = pipeline.process(frame(0)).await.unwrap();
        assert_eq!(calls.posture.load(Ordering::SeqCst), 2);
        match &people[0].outcome {
            PersonOutcome::Failed { stage, reason, pose } => {
                assert_eq!(*stage, Stage::Posture);
                assert!(reason.contains("joints out of range"));
                assert_eq!(pose.as_ref().unwrap().keypoints[0], Keypoint::new(20.0, 80.0, 0.9));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(people[0].pose().is_some());
        assert_eq!(people[1].posture().unwrap().label, "stand");
    }

    #[tokio::test]
    async fn test_box_outside_frame_fails_crop() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, calls) = orchestrator(dir.path(), |_| {
            Ok(vec![detection("person", 150.0, 150.0, 170.0, 190.0)])
        })
        .await;

        let people = pipeline.process(frame(0)).await.unwrap();
        assert!(matches!(
            people[0].outcome,
            PersonOutcome::Failed { stage: Stage::Crop, .. }
        ));
        assert_eq!(calls.pose.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_frame_skips_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, calls) = orchestrator(dir.path(), |_| Ok(Vec::new())).await;

        assert!(pipeline.process(frame(0)).await.unwrap().is_empty());
        assert_eq!(calls.pose.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detector_failure_is_frame_level() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = orchestrator(dir.path(), |f| {
            if f.index == 1 {
                Err(InferenceError::InferenceFailed("bad frame".into()))
            } else {
                Ok(vec![detection("person", 10.0, 10.0, 30.0, 50.0)])
            }
        })
        .await;

        assert!(matches!(
            pipeline.process(frame(1)).await,
            Err(PipelineError::Detection { index: 1, .. })
        ));

        let frames = (0..3).map(|i| VideoFrame::filled(100, 100, [0, 0, 0], i)).collect();
        let mut source = VecSource::new(frames, 25.0);
        let mut sink = JsonLinesSink::new(Vec::new());
        let summary = pipeline.run(&mut source, &mut sink, 2).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                frames: 3,
                people: 2,
                person_failures: 0,
                frame_failures: 1,
            }
        );
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let counts: Vec<(u64, usize)> = text
            .lines()
            .map(|l| serde_json::from_str::<FrameResult>(l).unwrap())
            .map(|r| (r.index, r.people.len()))
            .collect();
        assert_eq!(counts, vec![(0, 1), (1, 0), (2, 1)]);
    }

    #[derive(Default, Clone)]
    struct Recorder {
        emitted: Arc<Mutex<Vec<u64>>>,
        finished: Arc<AtomicUsize>,
    }

    impl FrameSink for Recorder {
        fn emit(
            &mut self,
            frame: &VideoFrame,
            _people: &[PerPersonResult],
        ) -> Result<(), SinkError> {
            self.emitted.lock().unwrap().push(frame.index);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), SinkError> {
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Yields frames until `fail_at`, then a decode error
    struct BrokenSource {
        inner: VecSource,
        fail_at: u64,
        next: u64,
    }

    impl FrameSource for BrokenSource {
        fn info(&self) -> SourceInfo {
            self.inner.info()
        }

        fn next_frame(&mut self) -> Result<Option<VideoFrame>, FrameError> {
            if self.next == self.fail_at {
                return Err(FrameError::Decode {
                    index: self.next,
                    reason: "truncated file".into(),
                });
            }
            self.next += 1;
            self.inner.next_frame()
        }
    }

    #[tokio::test]
    async fn test_pipelined_run_emits_in_frame_order() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, calls) = orchestrator(dir.path(), |f| {
            // Later frames finish detection sooner
            std::thread::sleep(std::time::Duration::from_millis(8u64.saturating_sub(f.index)));
            Ok(vec![
                detection("person", 10.0, 10.0, 30.0, 50.0),
                detection("person", 60.0, 10.0, 80.0, 50.0),
            ])
        })
        .await;

        let frames = (0..8).map(|i| VideoFrame::filled(100, 100, [0, 0, 0], i)).collect();
        let mut source = VecSource::new(frames, 25.0);
        let recorder = Recorder::default();
        let mut sink = recorder.clone();

        let summary = pipeline.run(&mut source, &mut sink, 4).await.unwrap();
        assert_eq!(summary.frames, 8);
        assert_eq!(summary.people, 16);
        assert_eq!(summary.person_failures, 8);
        assert_eq!(*recorder.emitted.lock().unwrap(), (0..8).collect::<Vec<u64>>());
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
        assert_eq!(calls.posture.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_source_error_drains_in_flight_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = orchestrator(dir.path(), |_| {
            Ok(vec![detection("person", 10.0, 10.0, 30.0, 50.0)])
        })
        .await;

        let frames = (0..5).map(|i| VideoFrame::filled(100, 100, [0, 0, 0], i)).collect();
        let mut source = BrokenSource {
            inner: VecSource::new(frames, 25.0),
            fail_at: 2,
            next: 0,
        };
        let recorder = Recorder::default();
        let mut sink = recorder.clone();

        let result = pipeline.run(&mut source, &mut sink, 2).await;
        assert!(matches!(
            result,
            Err(PipelineError::Source(FrameError::Decode { index: 2, .. }))
        ));
        assert_eq!(*recorder.emitted.lock().unwrap(), vec![0, 1]);
        assert_eq!(recorder.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_stages() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _) = orchestrator(dir.path(), |_| Ok(Vec::new())).await;
        pipeline.shutdown();

        assert!(matches!(
            pipeline.process(frame(0)).await,
            Err(PipelineError::Detection { source: EngineError::Closed, .. })
        ));
    }
}
