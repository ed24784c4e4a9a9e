//! The subprocess side of the demonstration binary: wires `stdin`/`stdout`
//! into a `Transport` and runs a [`sies_core::Worker`] over them, the same
//! role `ahma_core`'s shell worker plays for `ahma_http_bridge`.

use crate::evaluator::ToyEvaluator;
use sies_core::{InMemoryNamespace, Transport, TransportConfig, Worker, WorkerConfig};
use std::sync::Arc;

/// Runs to completion: announces `ready`, then serves `execute` requests
/// against a fresh, process-lifetime [`InMemoryNamespace`] until the
/// controller sends `shutdown` or a force-restarting `interrupt`.
pub async fn run() -> anyhow::Result<()> {
    let transport = Transport::open(tokio::io::stdin(), tokio::io::stdout(), TransportConfig::default());
    let namespace = Arc::new(InMemoryNamespace::new());
    let evaluator = Arc::new(ToyEvaluator);

    let worker = Worker::new(transport, namespace, evaluator, WorkerConfig::default());
    let exit = worker.run().await?;
    tracing::info!(?exit, "worker loop exited");
    Ok(())
}
