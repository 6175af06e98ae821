//! Frame sinks: annotated stills, JSON lines and fan-out

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use frame_io::VideoFrame;
use image::Rgb;
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use tracing::{debug, info};

use crate::types::{FrameResult, PerPersonResult};
use crate::SinkError;

const OK_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const ALERT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const FAILED_COLOR: Rgb<u8> = Rgb([128, 128, 128]);
const KEYPOINT_COLOR: Rgb<u8> = Rgb([0, 160, 255]);

/// Consumes each frame with its per-person results, in non-decreasing index order
pub trait FrameSink: Send {
    fn emit(&mut self, frame: &VideoFrame, people: &[PerPersonResult]) -> Result<(), SinkError>;

    /// Flush anything buffered; called once after the last frame
    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Rejects frames that go backwards
#[derive(Debug, Default)]
struct OrderGuard {
    last: Option<u64>,
}

impl OrderGuard {
    fn admit(&mut self, index: u64) -> Result<(), SinkError> {
        if let Some(last) = self.last {
            if index < last {
                return Err(SinkError::OutOfOrder { index, last });
            }
        }
        self.last = Some(index);
        Ok(())
    }
}

/// Writes `frame_<index>.png` with boxes and keypoints drawn on top
pub struct AnnotatedImageSink {
    dir: PathBuf,
    alert_label: String,
    keypoint_threshold: f32,
    order: OrderGuard,
}

impl AnnotatedImageSink {
    pub fn new(
        dir: impl AsRef<Path>,
        alert_label: impl Into<String>,
        keypoint_threshold: f32,
    ) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Writing annotated frames to {}", dir.display());
        Ok(Self {
            dir,
            alert_label: alert_label.into(),
            keypoint_threshold,
            order: OrderGuard::default(),
        })
    }

    pub fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{:06}.png", index))
    }

    fn color_for(&self, person: &PerPersonResult) -> Rgb<u8> {
        match person.posture() {
            Some(posture) if posture.label == self.alert_label => ALERT_COLOR,
            Some(_) => OK_COLOR,
            None => FAILED_COLOR,
        }
    }
}

impl FrameSink for AnnotatedImageSink {
    fn emit(&mut self, frame: &VideoFrame, people: &[PerPersonResult]) -> Result<(), SinkError> {
        self.order.admit(frame.index)?;
        let mut canvas = frame
            .to_rgb_image()
            .map_err(|e| SinkError::Image(e.to_string()))?;

        for person in people {
            let color = self.color_for(person);
            let Ok(rect) = person.bbox.to_pixel_rect(frame.width, frame.height) else {
                continue;
            };

            // Two-pixel outline
            let outer = Rect::at(rect.x as i32, rect.y as i32).of_size(rect.width, rect.height);
            draw_hollow_rect_mut(&mut canvas, outer, color);
            if rect.width > 2 && rect.height > 2 {
                let inner = Rect::at(rect.x as i32 + 1, rect.y as i32 + 1)
                    .of_size(rect.width - 2, rect.height - 2);
                draw_hollow_rect_mut(&mut canvas, inner, color);
            }

            if let Some(pose) = person.pose() {
                let visible = pose
                    .keypoints
                    .iter()
                    .filter(|k| k.score >= self.keypoint_threshold);
                for keypoint in visible {
                    draw_filled_circle_mut(
                        &mut canvas,
                        (keypoint.x.round() as i32, keypoint.y.round() as i32),
                        3,
                        KEYPOINT_COLOR,
                    );
                }
            }
        }

        let path = self.frame_path(frame.index);
        canvas
            .save(&path)
            .map_err(|e| SinkError::Image(format!("{}: {}", path.display(), e)))?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

/// One JSON `FrameResult` per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
    order: OrderGuard,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        info!("Writing frame results to {}", path.display());
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            order: OrderGuard::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> FrameSink for JsonLinesSink<W> {
    fn emit(&mut self, frame: &VideoFrame, people: &[PerPersonResult]) -> Result<(), SinkError> {
        self.order.admit(frame.index)?;
        let result = FrameResult {
            index: frame.index,
            timestamp_ns: frame.timestamp_ns,
            people: people.to_vec(),
        };
        serde_json::to_writer(&mut self.writer, &result)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every frame to each inner sink in turn
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FrameSink for FanoutSink {
    fn emit(&mut self, frame: &VideoFrame, people: &[PerPersonResult]) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            sink.emit(frame, people)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            sink.finish()?;
        }
        Ok(())
    }
}
