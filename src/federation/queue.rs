//! Delivery worker pool
//!
//! Jobs are sharded by destination inbox onto a fixed set of workers, each
//! fed by a bounded channel, so deliveries to one inbox leave in submission
//! order. Transient failures are retried in place with exponential backoff;
//! permanent failures and exhausted jobs are written to the dead-letter table.

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::transport::Transport;
use crate::config::DeliveryConfig;
use crate::data::{Database, DeadLetter, EntityId, SigningIdentity};
use crate::error::AppError;
use crate::metrics::{
    ACTIVITIES_SENT_TOTAL, DELIVERY_DEAD_LETTERS_TOTAL, DELIVERY_QUEUE_DEPTH,
    DELIVERY_RETRIES_TOTAL,
};

/// One signed POST of an activity to an inbox
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub inbox: String,
    pub activity: Value,
    pub identity: SigningIdentity,
}

impl DeliveryJob {
    fn activity_type(&self) -> &str {
        self.activity["type"].as_str().unwrap_or("unknown")
    }

    fn activity_id(&self) -> Option<String> {
        self.activity["id"].as_str().map(str::to_string)
    }
}

/// Retry schedule shared by all workers
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base_backoff_ms: u64,
    max_backoff: Duration,
}

impl RetryPolicy {
    fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff_ms: config.base_backoff_ms,
            max_backoff: Duration::from_secs(config.max_backoff_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based), with up to one base
    /// interval of jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(20);
        let delay = Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << pow));
        let jitter = rand::thread_rng().gen_range(0..=self.base_backoff_ms);
        delay.min(self.max_backoff) + Duration::from_millis(jitter)
    }
}

pub struct DeliveryQueue {
    senders: Mutex<Vec<mpsc::Sender<DeliveryJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shard_count: usize,
}

impl DeliveryQueue {
    /// Spawn `config.workers` workers; they stop when `shutdown` is cancelled
    /// or after [`close`](Self::close) once their channel is drained.
    pub fn start(
        config: &DeliveryConfig,
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let shard_count = config.workers.max(1);
        let policy = RetryPolicy::from_config(config);

        let mut senders = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
            let worker = Worker {
                shard,
                db: db.clone(),
                transport: transport.clone(),
                policy,
                shutdown: shutdown.clone(),
            };
            senders.push(tx);
            workers.push(tokio::spawn(worker.run(rx)));
        }

        tracing::info!(workers = shard_count, "Delivery queue started");

        Self {
            senders: Mutex::new(senders),
            workers: Mutex::new(workers),
            shard_count,
        }
    }

    /// Hand a job to the worker that owns its inbox.
    ///
    /// Waits while that worker's channel is full. Fails with `Cancelled` once
    /// the queue is closed or stopped.
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<(), AppError> {
        let shard = self.shard_for(&job.inbox);
        let sender = {
            let senders = self
                .senders
                .lock()
                .map_err(|_| AppError::Internal(anyhow::anyhow!("delivery queue lock poisoned")))?;
            senders.get(shard).cloned()
        };
        let sender = sender.ok_or(AppError::Cancelled)?;

        DELIVERY_QUEUE_DEPTH.inc();
        if sender.send(job).await.is_err() {
            DELIVERY_QUEUE_DEPTH.dec();
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    /// Stop accepting jobs, let workers finish what is queued, and wait for
    /// them to exit.
    pub async fn close(&self) {
        let handles = {
            if let Ok(mut senders) = self.senders.lock() {
                senders.clear();
            }
            match self.workers.lock() {
                Ok(mut workers) => std::mem::take(&mut *workers),
                Err(_) => Vec::new(),
            }
        };

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Delivery worker panicked");
            }
        }
        tracing::info!("Delivery queue stopped");
    }

    fn shard_for(&self, inbox: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        inbox.hash(&mut hasher);
        (hasher.finish() % self.shard_count as u64) as usize
    }
}

struct Worker {
    shard: usize,
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<DeliveryJob>) {
        loop {
            let job = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
            DELIVERY_QUEUE_DEPTH.dec();
        }

        // Anything still buffered is dropped with the receiver
        let mut dropped = 0usize;
        while rx.try_recv().is_ok() {
            dropped += 1;
            DELIVERY_QUEUE_DEPTH.dec();
        }
        if dropped > 0 {
            tracing::warn!(shard = self.shard, dropped, "Delivery worker stopped with queued jobs");
        }
        tracing::debug!(shard = self.shard, "Delivery worker exited");
    }

    async fn process(&self, job: DeliveryJob) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let cancel = self.shutdown.child_token();

            let error = match self
                .transport
                .post(&job.inbox, &job.activity, &job.identity, &cancel)
                .await
            {
                Ok(()) => {
                    ACTIVITIES_SENT_TOTAL
                        .with_label_values(&[job.activity_type()])
                        .inc();
                    tracing::info!(
                        inbox = %job.inbox,
                        activity_type = job.activity_type(),
                        attempt,
                        "Delivered activity"
                    );
                    return;
                }
                Err(AppError::Cancelled) => {
                    tracing::warn!(inbox = %job.inbox, "Delivery cancelled by shutdown");
                    return;
                }
                Err(error) => error,
            };

            if error.is_transient() && attempt < self.policy.max_attempts {
                let delay = self.policy.backoff(attempt);
                DELIVERY_RETRIES_TOTAL.inc();
                tracing::warn!(
                    inbox = %job.inbox,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Delivery failed, retrying"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }

            self.dead_letter(&job, attempt, &error).await;
            return;
        }
    }

    async fn dead_letter(&self, job: &DeliveryJob, attempts: u32, error: &AppError) {
        DELIVERY_DEAD_LETTERS_TOTAL.inc();
        tracing::error!(
            inbox = %job.inbox,
            attempts,
            error = %error,
            "Giving up on delivery"
        );

        let letter = DeadLetter {
            id: EntityId::new().0,
            inbox: job.inbox.clone(),
            activity_id: job.activity_id(),
            activity_json: job.activity.to_string(),
            attempts: i64::from(attempts),
            last_error: error.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.insert_dead_letter(&letter).await {
            tracing::error!(error = %e, inbox = %job.inbox, "Failed to record dead letter");
        }
    }
}
