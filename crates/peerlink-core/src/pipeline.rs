//! Ordered delivery of concurrently computed results.
//!
//! Each submitted future is spawned immediately, so work for frame N may
//! finish before work for frame N-1. The task handles go into a bounded
//! queue in submission order and a single drain awaits them strictly in that
//! order:
//!
//! ```text
//! submit(A) submit(B) submit(C)
//!     |         |         |
//!   spawn     spawn     spawn        work runs concurrently
//!     |         |         |
//! [ JA ] -> [ JB ] -> [ JC ]         bounded queue of handles
//!                 |
//!         drain: await JA, JB, JC    delivery in submission order
//! ```
//!
//! Only handles are queued. A result that completes early stays inside its
//! task until the drain reaches it, and the queue bound caps the number of
//! such tasks; a full queue makes `submit` wait.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Backpressure counters shared by both ends of a pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    in_flight: AtomicUsize,
    decrypting: AtomicUsize,
}

impl PipelineStats {
    /// Submitted and not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Submitted and still computing.
    pub fn decrypting(&self) -> usize {
        self.decrypting.load(Ordering::Acquire)
    }
}

/// Submitting half of an ordered pipeline.
pub struct PipelineSubmitter<T> {
    queue: mpsc::Sender<JoinHandle<Result<T>>>,
    stats: Arc<PipelineStats>,
}

/// Draining half of an ordered pipeline.
pub struct PipelineDrain<T> {
    queue: mpsc::Receiver<JoinHandle<Result<T>>>,
    stats: Arc<PipelineStats>,
}

/// Create a pipeline holding at most `depth` undelivered submissions.
///
/// # Panics
///
/// Panics if `depth` is zero.
pub fn ordered<T: Send + 'static>(depth: usize) -> (PipelineSubmitter<T>, PipelineDrain<T>) {
    let (tx, rx) = mpsc::channel(depth);
    let stats = Arc::new(PipelineStats::default());
    (
        PipelineSubmitter {
            queue: tx,
            stats: stats.clone(),
        },
        PipelineDrain { queue: rx, stats },
    )
}

impl<T: Send + 'static> PipelineSubmitter<T> {
    /// Start `work` and queue its result for in-order delivery.
    ///
    /// Waits while the pipeline is full.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Closed`] if the drain has been dropped.
    pub async fn submit<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let permit = self
            .queue
            .reserve()
            .await
            .map_err(|_| ProtocolError::Closed)?;

        self.stats.in_flight.fetch_add(1, Ordering::AcqRel);
        self.stats.decrypting.fetch_add(1, Ordering::AcqRel);
        let stats = self.stats.clone();
        let handle = tokio::spawn(async move {
            let result = work.await;
            stats.decrypting.fetch_sub(1, Ordering::AcqRel);
            result
        });
        permit.send(handle);
        Ok(())
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}

impl<T> PipelineDrain<T> {
    /// Next result in submission order; `None` once every submitter is gone
    /// and the queue is empty.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let handle = self.queue.recv().await?;
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ProtocolError::InvalidState(
                format!("pipeline task failed: {e}").into(),
            )),
        };
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(result)
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }
}

impl<T> Drop for PipelineDrain<T> {
    fn drop(&mut self) {
        self.queue.close();
        while let Ok(handle) = self.queue.try_recv() {
            handle.abort();
        }
    }
}
