//! Inference Engine Implementation

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::batcher::Worker;
use crate::{Backpressure, DeviceId, EngineConfig, EngineError, InferenceBackend};

/// An input paired with its completion handle
pub(crate) struct WorkItem<I, O> {
    pub(crate) input: I,
    pub(crate) reply: oneshot::Sender<Result<O, EngineError>>,
}

/// Handle for one submitted item. Resolves once the worker has finished it.
#[must_use = "a submitted item's result is only observable through its handle"]
pub struct Pending<O> {
    receiver: oneshot::Receiver<Result<O, EngineError>>,
}

impl<O> Future for Pending<O> {
    type Output = Result<O, EngineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped reply means the worker went away without answering
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(EngineError::Closed)))
    }
}

/// Handle to one device-pinned worker
pub struct InferenceEngine<I, O> {
    name: String,
    device: DeviceId,
    artifact: PathBuf,
    config: EngineConfig,
    sender: Mutex<Option<mpsc::Sender<WorkItem<I, O>>>>,
    closed: Arc<AtomicBool>,
}

impl<I: Send + 'static, O: Send + 'static> InferenceEngine<I, O> {
    /// Start a worker bound to `device` and open the backend on it.
    ///
    /// `open` runs on the worker thread. Any failure there, or a missing or
    /// unreadable artifact, is reported as `InitFailed`.
    pub async fn create<B, F>(
        name: impl Into<String>,
        artifact: impl AsRef<Path>,
        device: DeviceId,
        config: EngineConfig,
        open: F,
    ) -> Result<Self, EngineError>
    where
        B: InferenceBackend<Input = I, Output = O>,
        F: FnOnce(&Path, DeviceId) -> Result<B, EngineError> + Send + 'static,
    {
        let name = name.into();
        config.validate()?;

        let artifact = artifact.as_ref().to_path_buf();

        info!(
            "Creating engine {} on device {} from {}",
            name,
            device,
            artifact.display()
        );

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), EngineError>>();

        let worker_name = name.clone();
        let worker_artifact = artifact.clone();
        let worker_config = config.clone();
        let worker_closed = closed.clone();

        std::thread::Builder::new()
            .name(format!("{}-dev{}", name, device))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(EngineError::InitFailed(e.to_string())));
                        return;
                    }
                };

                // Checked here so the caller's runtime never blocks on the filesystem
                if let Err(e) = std::fs::File::open(&worker_artifact) {
                    let _ = ready_tx.send(Err(EngineError::InitFailed(format!(
                        "artifact {}: {}",
                        worker_artifact.display(),
                        e
                    ))));
                    return;
                }

                let backend = match open(&worker_artifact, device) {
                    Ok(backend) => backend,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                let worker = Worker::new(
                    worker_name,
                    backend,
                    receiver,
                    &worker_config,
                    worker_closed,
                );
                runtime.block_on(worker.run());
            })
            .map_err(|e| EngineError::InitFailed(format!("spawn worker: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e @ EngineError::InitFailed(_))) => return Err(e),
            Ok(Err(other)) => return Err(EngineError::InitFailed(other.to_string())),
            Err(_) => {
                return Err(EngineError::InitFailed(
                    "worker exited during initialisation".into(),
                ))
            }
        }

        info!("Engine {} ready on device {}", name, device);

        Ok(Self {
            name,
            device,
            artifact,
            config,
            sender: Mutex::new(Some(sender)),
            closed,
        })
    }

    /// Enqueue `input` and return its handle without running inference here.
    ///
    /// Under `Backpressure::Block` this waits for queue space; under
    /// `Backpressure::Reject` a full queue fails with `QueueFull`.
    pub async fn submit(&self, input: I) -> Result<Pending<O>, EngineError> {
        if self.config.backpressure == Backpressure::Reject {
            return self.try_submit(input);
        }

        let sender = self.sender()?;
        let (reply, receiver) = oneshot::channel();
        sender
            .send(WorkItem { input, reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        Ok(Pending { receiver })
    }

    /// Enqueue without ever waiting, regardless of the configured policy
    pub fn try_submit(&self, input: I) -> Result<Pending<O>, EngineError> {
        let sender = self.sender()?;
        let (reply, receiver) = oneshot::channel();
        match sender.try_send(WorkItem { input, reply }) {
            Ok(()) => Ok(Pending { receiver }),
            Err(TrySendError::Full(_)) => {
                debug!("Engine {} queue full", self.name);
                metrics::counter!("engine_rejected_total", "engine" => self.name.clone())
                    .increment(1);
                Err(EngineError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::Closed),
        }
    }

    /// Stop accepting work. The running batch finishes; queued items resolve
    /// with `Closed`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down engine {} on device {}", self.name, self.device);
        self.sender.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items queued but not yet picked up by the worker
    pub fn queue_len(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn sender(&self) -> Result<mpsc::Sender<WorkItem<I, O>>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        self.sender.lock().clone().ok_or(EngineError::Closed)
    }
}

impl<I, O> Drop for InferenceEngine<I, O> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Engine {} dropped, closing", self.name);
        }
        self.sender.lock().take();
    }
}
