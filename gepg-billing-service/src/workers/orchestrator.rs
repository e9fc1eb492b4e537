//! Delivery worker pool: a bounded queue feeding a fixed set of workers,
//! shut down cooperatively via a cancellation token.

use crate::config::DeliveryConfig;
use crate::services::database::Database;
use crate::services::notifications::DeliveryJob;
use crate::workers::sender::DeliverySender;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct DeliveryOrchestrator {
    config: DeliveryConfig,
    sender: Arc<DeliverySender>,
    job_tx: mpsc::Sender<DeliveryJob>,
    job_rx: Option<mpsc::Receiver<DeliveryJob>>,
    shutdown_token: CancellationToken,
}

impl DeliveryOrchestrator {
    pub fn new(
        config: DeliveryConfig,
        sender: Arc<DeliverySender>,
    ) -> (Self, mpsc::Sender<DeliveryJob>) {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size);
        let shutdown_token = CancellationToken::new();

        let orchestrator = Self {
            config,
            sender,
            job_tx: job_tx.clone(),
            job_rx: Some(job_rx),
            shutdown_token,
        };

        (orchestrator, job_tx)
    }

    pub async fn start(mut self) {
        let mut job_rx = self.job_rx.take().expect("start() can only be called once");

        info!(
            worker_count = self.config.worker_count,
            queue_size = self.config.queue_size,
            "Starting delivery worker pool"
        );

        let shutdown = self.shutdown_token.clone();
        let sender = self.sender.clone();
        let requeue = self.job_tx.clone();
        let worker_count = self.config.worker_count.max(1);

        tokio::spawn(async move {
            // Workers are spawned per job up to the configured parallelism;
            // the semaphore bounds concurrent sends.
            let permits = Arc::new(tokio::sync::Semaphore::new(worker_count));

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Delivery dispatcher shutting down");
                        break;
                    }
                    job = job_rx.recv() => {
                        match job {
                            Some(job) => {
                                let permit = match permits.clone().acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(_) => break,
                                };
                                let sender = sender.clone();
                                let requeue = requeue.clone();
                                tokio::spawn(async move {
                                    sender.handle_job(job, requeue).await;
                                    drop(permit);
                                });
                            }
                            None => {
                                info!("Delivery queue closed, dispatcher exiting");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    pub fn shutdown(&self) {
        info!("Initiating delivery worker pool shutdown");
        self.shutdown_token.cancel();
    }
}

/// Requeue deliveries that were in flight when the previous process died:
/// pending rows, and failed rows with retry budget remaining.
pub async fn run_recovery_sweep(
    db: &Database,
    queue: &mpsc::Sender<DeliveryJob>,
    max_attempts: i32,
) -> Result<usize, AppError> {
    let records = db.deliveries_for_recovery(max_attempts).await?;
    let count = records.len();
    for record in records {
        if queue
            .send(DeliveryJob {
                delivery_id: record.delivery_id,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    if count > 0 {
        info!(count = count, "Recovered unfinished deliveries onto the queue");
    }
    Ok(count)
}
