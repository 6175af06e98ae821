//! Engine worker: batch collection and execution

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Duration};
use tracing::{debug, error, info, warn};

use crate::engine::WorkItem;
use crate::{EngineConfig, EngineError, InferenceBackend, InferenceError};

type Reply<O> = oneshot::Sender<Result<O, EngineError>>;

/// Drains one engine's queue on its dedicated thread
pub(crate) struct Worker<B: InferenceBackend> {
    name: String,
    backend: B,
    receiver: mpsc::Receiver<WorkItem<B::Input, B::Output>>,
    max_batch: usize,
    window: Duration,
    closed: Arc<AtomicBool>,
}

impl<B: InferenceBackend> Worker<B> {
    pub(crate) fn new(
        name: String,
        backend: B,
        receiver: mpsc::Receiver<WorkItem<B::Input, B::Output>>,
        config: &EngineConfig,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            backend,
            receiver,
            max_batch: config.max_batch,
            window: config.batch_window(),
            closed,
        }
    }

    /// Run until every sender is gone and the queue is empty
    pub(crate) async fn run(mut self) {
        info!(
            "Engine {} worker started: max_batch={}, window={:?}",
            self.name, self.max_batch, self.window
        );

        while let Some(first) = self.receiver.recv().await {
            let mut batch = Vec::with_capacity(self.max_batch);
            batch.push(first);
            self.collect(&mut batch).await;

            // Checked right before execution: anything not yet started is cancelled
            if self.closed.load(Ordering::Acquire) {
                self.receiver.close();
                debug!("Engine {} closed, cancelling {} queued items", self.name, batch.len());
                for item in batch {
                    let _ = item.reply.send(Err(EngineError::Closed));
                }
                continue;
            }

            self.execute(batch);
        }

        info!("Engine {} worker stopped", self.name);
    }

    /// Top up the batch until it is full or the window elapses
    async fn collect(&mut self, batch: &mut Vec<WorkItem<B::Input, B::Output>>) {
        if self.max_batch <= 1 {
            return;
        }

        // The receive is polled before the deadline, so a zero window still
        // picks up items that are already queued
        let deadline = tokio::time::Instant::now() + self.window;
        while batch.len() < self.max_batch {
            match timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) => break, // Channel closed
                Err(_) => break,   // Window elapsed
            }
        }
    }

    fn execute(&mut self, batch: Vec<WorkItem<B::Input, B::Output>>) {
        let size = batch.len();
        let (inputs, replies): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|item| (item.input, item.reply))
            .unzip();

        debug!("Engine {} processing batch of {}", self.name, size);
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.backend.infer(inputs)));
        let elapsed = start.elapsed();

        metrics::counter!("engine_batches_total", "engine" => self.name.clone()).increment(1);
        metrics::counter!("engine_items_total", "engine" => self.name.clone())
            .increment(size as u64);
        metrics::histogram!("engine_batch_seconds", "engine" => self.name.clone())
            .record(elapsed.as_secs_f64());

        match outcome {
            Ok(results) if results.len() == size => {
                for (reply, result) in replies.into_iter().zip(results) {
                    if let Err(e) = &result {
                        warn!("Engine {} item failed: {}", self.name, e);
                    }
                    if reply.send(result.map_err(EngineError::from)).is_err() {
                        debug!("Engine {} result dropped by caller", self.name);
                    }
                }
            }
            Ok(results) => {
                error!(
                    "Engine {} backend returned {} results for {} inputs",
                    self.name,
                    results.len(),
                    size
                );
                fail_all(
                    replies,
                    InferenceError::InferenceFailed(format!(
                        "backend returned {} results for {} inputs",
                        results.len(),
                        size
                    )),
                );
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Engine {} backend panicked: {}", self.name, reason);
                fail_all(
                    replies,
                    InferenceError::InferenceFailed(format!("backend panicked: {}", reason)),
                );
            }
        }
    }
}

fn fail_all<O>(replies: Vec<Reply<O>>, err: InferenceError) {
    for reply in replies {
        let _ = reply.send(Err(EngineError::Inference(err.clone())));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
