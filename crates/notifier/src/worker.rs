//! Consumer worker pools.
//!
//! One pool per queue. Workers take one message at a time and observe the
//! cancellation token only between messages, so an in-flight delivery is
//! always settled before its worker exits.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use herald_common::types::Channel;

use crate::delivery::DeliverySource;
use crate::dispatch::Dispatcher;

/// A queue to consume and the number of workers draining it.
pub struct PoolSpec {
    pub channel: Channel,
    pub queue: String,
    pub workers: usize,
    pub source: Arc<dyn DeliverySource>,
}

pub struct Notifier {
    dispatcher: Arc<Dispatcher>,
    pools: Vec<PoolSpec>,
}

impl Notifier {
    pub fn new(dispatcher: Arc<Dispatcher>, pools: Vec<PoolSpec>) -> Self {
        Self { dispatcher, pools }
    }

    /// Spawn every pool; the handle resolves once all workers have exited.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut pools = JoinSet::new();
        for spec in self.pools {
            pools.spawn(run_pool(self.dispatcher.clone(), spec, cancel.clone()));
        }
        while let Some(result) = pools.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker pool task failed");
            }
        }
        tracing::info!("All notifier pools stopped");
    }
}

async fn run_pool(dispatcher: Arc<Dispatcher>, spec: PoolSpec, cancel: CancellationToken) {
    let queue: Arc<str> = spec.queue.into();
    tracing::info!(queue = %queue, channel = %spec.channel, workers = spec.workers, "Starting worker pool");

    let mut workers = JoinSet::new();
    for worker_id in 0..spec.workers {
        workers.spawn(run_worker(
            worker_id,
            spec.channel,
            queue.clone(),
            spec.source.clone(),
            dispatcher.clone(),
            cancel.clone(),
        ));
    }

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(queue = %queue, error = %e, "Worker task failed");
        }
    }
    tracing::info!(queue = %queue, "All workers stopped");
}

async fn run_worker(
    worker_id: usize,
    channel: Channel,
    queue: Arc<str>,
    source: Arc<dyn DeliverySource>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(queue = %queue, worker_id, "Worker cancelled");
                break;
            }
            next = source.next() => next,
        };

        let Some(msg) = next else {
            tracing::info!(queue = %queue, worker_id, "Delivery stream closed");
            break;
        };

        let disposition = dispatcher.handle(channel, msg.as_ref()).await;
        if let Err(e) = msg.settle(disposition).await {
            tracing::warn!(queue = %queue, ?disposition, error = %e, "Failed to settle message");
        }
    }
}
