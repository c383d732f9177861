//! The generic `StreamWorker` loop.
//!
//! Entries are processed one at a time in read order. After a failure the
//! entry is either redriven with an incremented receive count or moved to
//! the DLQ (see [`redrive_decision`]); in both cases the original entry is
//! acknowledged. A redriven message waits out its category's backoff in the
//! delayed set and is re-added to the stream once due. A
//! [`StreamError::Fatal`] stops the batch and leaves the remaining entries
//! pending so they are read again on the next pass.

use crate::config::WorkerConfig;
use crate::consumer::{RawEntry, StreamConsumer};
use crate::dlq::DlqManager;
use crate::error::StreamError;
use crate::event::StreamEvent;
use crate::metrics::StreamMetrics;
use crate::registry::{StreamJob, StreamProcessor};
use redis::aio::ConnectionManager;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// What happens to an entry whose processing failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redrive {
    DeadLetter,
    Requeue { next_receive_count: u32, delay_ms: u64 },
}

/// Permanent errors are dead-lettered at once; anything else is requeued
/// until `max_receive_count` deliveries have been spent. The delay grows
/// with each redrive of the same message.
pub fn redrive_decision(error: &StreamError, receive_count: u32, max_receive_count: u32) -> Redrive {
    let category = error.category();
    if !category.should_redrive() || receive_count >= max_receive_count {
        Redrive::DeadLetter
    } else {
        Redrive::Requeue {
            next_receive_count: receive_count + 1,
            delay_ms: category.backoff_delay_ms(receive_count.saturating_sub(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Continue,
    AbortBatch,
}

pub struct StreamWorker<J, P>
where
    J: StreamJob,
    P: StreamProcessor<J>,
{
    consumer: StreamConsumer,
    dlq: DlqManager,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: StreamMetrics,
    _phantom: PhantomData<J>,
}

impl<J, P> StreamWorker<J, P>
where
    J: StreamJob + 'static,
    P: StreamProcessor<J> + 'static,
{
    pub fn new(redis: ConnectionManager, processor: P, config: WorkerConfig) -> Self {
        Self::with_arc_processor(redis, Arc::new(processor), config)
    }

    pub fn with_arc_processor(
        redis: ConnectionManager,
        processor: Arc<P>,
        config: WorkerConfig,
    ) -> Self {
        let dlq = DlqManager::new(redis.clone(), &config.stream_name, &config.dlq_stream)
            .with_max_length(config.max_length);
        let metrics = StreamMetrics::new(&config.stream_name, processor.name());

        Self {
            consumer: StreamConsumer::new(redis, config.clone()),
            dlq,
            processor,
            config,
            metrics,
            _phantom: PhantomData,
        }
    }

    pub fn consumer(&self) -> &StreamConsumer {
        &self.consumer
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), StreamError> {
        info!(
            consumer_id = %self.config.consumer_id,
            stream = %self.config.stream_name,
            group = %self.config.consumer_group,
            processor = %self.processor.name(),
            batch_size = self.config.batch_size,
            max_receive_count = self.config.max_receive_count,
            block_timeout_ms = ?self.config.block_timeout_ms,
            "Starting stream worker"
        );

        self.consumer.init_consumer_group().await?;

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let claim_interval = Duration::from_millis(self.config.claim_idle_ms.max(1000));
        let mut last_claim = Instant::now();
        let mut consecutive_errors: u32 = 0;
        const MAX_BACKOFF_SECS: u64 = 30;

        loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping worker");
                break;
            }

            match self.process_batch().await {
                Ok(processed) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Stream connection recovered");
                        consecutive_errors = 0;
                    }
                    if processed > 0 {
                        // more may be waiting, skip the poll sleep
                        continue;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;

                    let backoff = if e.is_nogroup() {
                        warn!("Consumer group missing, recreating");
                        if let Err(create_err) = self.consumer.init_consumer_group().await {
                            error!(error = %create_err, "Failed to recreate consumer group");
                        }
                        Duration::from_secs(1)
                    } else if e.is_connection_error() {
                        let secs = 2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS);
                        warn!(
                            error = %e,
                            consecutive_errors,
                            backoff_secs = secs,
                            "Redis connection error, backing off"
                        );
                        Duration::from_secs(secs)
                    } else {
                        error!(error = %e, "Error processing batch");
                        Duration::from_secs(1)
                    };

                    if wait_or_shutdown(&mut shutdown, backoff).await {
                        info!("Received shutdown signal, stopping worker");
                        break;
                    }
                    continue;
                }
            }

            if last_claim.elapsed() >= claim_interval {
                match self.consumer.claim_abandoned(self.config.batch_size).await {
                    Ok(claimed) if !claimed.is_empty() => {
                        self.metrics.message_claimed(claimed.len());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Error claiming abandoned entries"),
                }
                if let Ok(info) = self.consumer.stream_info().await {
                    self.metrics.pending_count(info.pending_count);
                    self.metrics.delayed_count(info.delayed_count);
                }
                last_claim = Instant::now();
            }

            // BLOCK already waited inside XREADGROUP
            if !self.config.is_blocking() && wait_or_shutdown(&mut shutdown, poll_interval).await {
                info!("Received shutdown signal, stopping worker");
                break;
            }
        }

        info!("Stream worker stopped");
        Ok(())
    }

    /// Process one batch, returning how many entries were read.
    ///
    /// Due delayed messages are re-added first. Entries left pending by an
    /// earlier pass are drained before new ones are read.
    pub async fn process_batch(&self) -> Result<usize, StreamError> {
        let promoted = self.consumer.promote_due(self.config.batch_size).await?;
        if promoted > 0 {
            self.metrics.jobs_promoted(promoted);
        }

        let mut entries = self.consumer.read_pending(self.config.batch_size).await?;
        if entries.is_empty() {
            entries = self.consumer.read_new(self.config.batch_size).await?;
        }

        let total = entries.len();
        if total == 0 {
            return Ok(0);
        }
        self.metrics.batch_size(total);

        for (index, entry) in entries.iter().enumerate() {
            if self.handle_entry(entry).await? == EntryOutcome::AbortBatch {
                let remaining = total - index - 1;
                warn!(
                    stream_id = %entry.id,
                    remaining,
                    "Fatal error, leaving rest of batch pending"
                );
                self.metrics.batch_aborted(remaining);
                break;
            }
        }

        Ok(total)
    }

    #[instrument(skip(self, entry), fields(stream_id = %entry.id))]
    async fn handle_entry(&self, entry: &RawEntry) -> Result<EntryOutcome, StreamError> {
        if entry.fields.is_empty() {
            // deleted or trimmed while pending
            debug!("Entry has no fields, acknowledging");
            self.consumer.ack(&entry.id).await?;
            return Ok(EntryOutcome::Continue);
        }

        let event = match StreamEvent::<J>::decode(entry.id.clone(), &entry.fields) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Undecodable entry, dead-lettering");
                self.metrics.job_failed(e.category());
                self.dead_letter(entry, &e).await?;
                return Ok(EntryOutcome::Continue);
            }
        };

        self.metrics.job_received();
        debug!(
            job_id = %event.job_id(),
            delivery_count = event.delivery_count,
            "Processing job"
        );

        let start = Instant::now();
        match self.processor.process(&event.job).await {
            Ok(()) => {
                self.metrics.job_processed(start.elapsed());
                self.consumer.ack(&entry.id).await?;
                Ok(EntryOutcome::Continue)
            }
            Err(e) => self.handle_failure(entry, &event, e).await,
        }
    }

    async fn handle_failure(
        &self,
        entry: &RawEntry,
        event: &StreamEvent<J>,
        error: StreamError,
    ) -> Result<EntryOutcome, StreamError> {
        let category = error.category();
        self.metrics.job_failed(category);

        match redrive_decision(&error, event.delivery_count, self.config.max_receive_count) {
            Redrive::DeadLetter => {
                warn!(
                    job_id = %event.job_id(),
                    delivery_count = event.delivery_count,
                    error = %error,
                    error_category = ?category,
                    "Job failed, dead-lettering"
                );
                self.dead_letter(entry, &error).await?;
            }
            Redrive::Requeue {
                next_receive_count,
                delay_ms,
            } => {
                let delay_ms = if self.config.retry_backoff { delay_ms } else { 0 };
                warn!(
                    job_id = %event.job_id(),
                    delivery_count = event.delivery_count,
                    error = %error,
                    error_category = ?category,
                    delay_ms,
                    "Job failed, requeueing"
                );
                if delay_ms > 0 {
                    self.consumer
                        .schedule(&event.message, next_receive_count, delay_ms)
                        .await?;
                } else {
                    self.consumer.requeue(&event.message, next_receive_count).await?;
                }
                self.metrics.job_requeued();
                self.consumer.ack(&entry.id).await?;
            }
        }

        if error.aborts_batch() {
            Ok(EntryOutcome::AbortBatch)
        } else {
            Ok(EntryOutcome::Continue)
        }
    }

    async fn dead_letter(&self, entry: &RawEntry, error: &StreamError) -> Result<(), StreamError> {
        if self.config.enable_dlq {
            self.dlq
                .move_to_dlq(entry, &error.to_string(), error.category())
                .await?;
            self.metrics.job_moved_to_dlq();
        } else {
            warn!(stream_id = %entry.id, "DLQ disabled, dropping entry");
        }
        self.consumer.ack(&entry.id).await
    }
}

/// Sleep for `delay` unless shutdown is signalled first; `true` means shut down
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}
