//! Pipeline Orchestrator
//!
//! One pipeline per source. A producer moves change events from the source
//! into the durable buffer; a single consumer drains the buffer in batches
//! and runs write -> checkpoint -> mark-processed for each batch before it
//! looks at the next one.

pub mod state;

pub use state::{PipelineState, PipelineStatus, StateCell};

use crate::buffer::EventBuffer;
use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::error::{CdcError, ErrorKind, Result};
use crate::monitoring::{MetricsCollectorTrait, NoopMetrics, ProcessingTimer};
use crate::retry::{retry_transient, RetryConfig};
use crate::schema::TypeHints;
use crate::source::{ChangeSource, LsnFeedback, SourceMessage};
use crate::types::{BufferedEvent, Position};
use crate::writer::EventWriter;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_id: String,
    pub flush_interval: Duration,
    /// Buffer depth at which the producer stops consuming the source
    pub buffer_max_depth: usize,
    pub buffer_retention: Duration,
    pub cleanup_interval: Duration,
    /// Failed batch attempts an event may take part in before it is isolated
    pub max_event_retries: u32,
    pub dead_letter_ttl: Duration,
    pub retry: RetryConfig,
}

impl From<&Config> for PipelineConfig {
    fn from(config: &Config) -> Self {
        Self {
            source_id: config.source_id.clone(),
            flush_interval: config.flush_interval,
            buffer_max_depth: config.buffer_max_depth,
            buffer_retention: config.buffer_retention,
            cleanup_interval: config.cleanup_interval,
            max_event_retries: config.max_event_retries,
            dead_letter_ttl: config.dead_letter_ttl,
            retry: RetryConfig::from(config),
        }
    }
}

impl PipelineConfig {
    fn backpressure_poll(&self) -> Duration {
        (self.flush_interval / 4).max(Duration::from_millis(10))
    }
}

/// Cloneable view on a running pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    pub fn status(&self) -> PipelineStatus {
        self.state.status()
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Ask the pipeline to drain and stop
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `(healthy, detail)` for health endpoints
    pub fn health(&self) -> (bool, String) {
        let status = self.status();
        match status.state {
            PipelineState::Failed => (
                false,
                format!(
                    "failed: {}",
                    status.last_error.unwrap_or_else(|| "unknown error".to_string())
                ),
            ),
            state => (true, state.to_string()),
        }
    }
}

pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<Box<dyn ChangeSource>>,
    buffer: Option<Arc<dyn EventBuffer>>,
    checkpoints: Option<CheckpointManager>,
    writer: Option<Arc<dyn EventWriter>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    metrics: Option<Arc<dyn MetricsCollectorTrait>>,
    hints: Option<Arc<TypeHints>>,
    feedback: Option<Arc<LsnFeedback>>,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            buffer: None,
            checkpoints: None,
            writer: None,
            dead_letters: None,
            metrics: None,
            hints: None,
            feedback: None,
            cancel: None,
        }
    }

    pub fn source(mut self, source: Box<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn buffer(mut self, buffer: Arc<dyn EventBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn checkpoints(mut self, checkpoints: CheckpointManager) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn EventWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsCollectorTrait>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Type hints shared with the writer's schema builder
    pub fn type_hints(mut self, hints: Arc<TypeHints>) -> Self {
        self.hints = Some(hints);
        self
    }

    /// Flushed-position feedback shared with the source
    pub fn feedback(mut self, feedback: Arc<LsnFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let source = self
            .source
            .ok_or_else(|| CdcError::config("Pipeline requires a change source"))?;
        let buffer = self
            .buffer
            .ok_or_else(|| CdcError::config("Pipeline requires an event buffer"))?;
        let checkpoints = self
            .checkpoints
            .ok_or_else(|| CdcError::config("Pipeline requires a checkpoint manager"))?;
        let writer = self
            .writer
            .ok_or_else(|| CdcError::config("Pipeline requires a table writer"))?;
        if checkpoints.source_id() != self.config.source_id {
            return Err(CdcError::config(format!(
                "Checkpoint manager is bound to source {}, pipeline runs source {}",
                checkpoints.source_id(),
                self.config.source_id
            )));
        }

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let state = Arc::new(StateCell::new(self.config.source_id.clone(), metrics.clone()));
        Ok(Pipeline {
            config: self.config,
            source,
            buffer,
            checkpoints,
            writer,
            dead_letters: self.dead_letters,
            metrics,
            hints: self.hints.unwrap_or_default(),
            feedback: self.feedback.unwrap_or_default(),
            state,
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Box<dyn ChangeSource>,
    buffer: Arc<dyn EventBuffer>,
    checkpoints: CheckpointManager,
    writer: Arc<dyn EventWriter>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    metrics: Arc<dyn MetricsCollectorTrait>,
    hints: Arc<TypeHints>,
    feedback: Arc<LsnFeedback>,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

/// Everything the batch loop needs, borrowed while the producer holds the source
struct Consumer<'a> {
    config: &'a PipelineConfig,
    buffer: &'a Arc<dyn EventBuffer>,
    checkpoints: &'a CheckpointManager,
    writer: &'a Arc<dyn EventWriter>,
    dead_letters: Option<&'a Arc<dyn DeadLetterSink>>,
    metrics: &'a Arc<dyn MetricsCollectorTrait>,
    feedback: &'a LsnFeedback,
    state: &'a StateCell,
    last_checkpoint: Option<Position>,
    attempts: HashMap<i64, u32>,
    malformed_seen: u64,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run until cancelled or failed.
    ///
    /// Cancellation lets the batch in progress finish (write, checkpoint,
    /// mark processed) and then stops. Unrecoverable errors leave the
    /// pipeline in `Failed` and are returned.
    pub async fn run(self) -> Result<()> {
        let Pipeline {
            config,
            mut source,
            buffer,
            checkpoints,
            writer,
            dead_letters,
            metrics,
            hints,
            feedback,
            state,
            cancel,
        } = self;

        state.transition(PipelineState::Starting)?;

        let start = match checkpoints.load().await {
            Ok(checkpoint) => checkpoint.map(|c| c.position),
            Err(e) => {
                state.fail(&e);
                return Err(e);
            }
        };
        if let Some(position) = start {
            feedback.update(&position);
            state.set_checkpoint(position);
            metrics.record_checkpoint_lsn(position.commit_lsn);
        }

        if let Err(e) = source.start(start).await {
            metrics.record_error(e.kind().as_str(), "source");
            metrics.update_source_connection_status(false);
            state.fail(&e);
            return Err(e);
        }
        metrics.update_source_connection_status(true);

        if cancel.is_cancelled() {
            state.transition(PipelineState::Draining)?;
        } else {
            state.transition(PipelineState::Running)?;
        }

        // Failures on either side stop both through this child token
        let internal = cancel.child_token();
        let wake = Notify::new();

        let mut consumer = Consumer {
            config: &config,
            buffer: &buffer,
            checkpoints: &checkpoints,
            writer: &writer,
            dead_letters: dead_letters.as_ref(),
            metrics: &metrics,
            feedback: &feedback,
            state: &state,
            last_checkpoint: start,
            attempts: HashMap::new(),
            malformed_seen: buffer.malformed_count(),
        };

        let watcher = async {
            internal.cancelled().await;
            if cancel.is_cancelled() && state.get() == PipelineState::Running {
                info!("Shutdown requested for {}, draining", config.source_id);
                let _ = state.transition(PipelineState::Draining);
            }
        };
        let producer = async {
            let result = produce(
                &config,
                source.as_mut(),
                &buffer,
                &hints,
                &metrics,
                start,
                &wake,
                &internal,
            )
            .await;
            if result.is_err() {
                internal.cancel();
            }
            result
        };
        let batches = async {
            let result = consumer.run(&wake, &internal).await;
            if result.is_err() {
                internal.cancel();
            }
            result
        };

        let (produced, consumed, _) = tokio::join!(producer, batches, watcher);

        if let Err(e) = source.stop().await {
            warn!("Failed to stop source {}: {}", config.source_id, e);
        }
        metrics.update_source_connection_status(false);

        let outcome = produced.and(consumed);
        if let Err(e) = outcome {
            metrics.record_error(e.kind().as_str(), "pipeline");
            state.fail(&e);
            if let Err(close) = writer.close().await {
                warn!("Failed to close writer: {}", close);
            }
            return Err(e);
        }

        if state.get() == PipelineState::Running {
            state.transition(PipelineState::Draining)?;
        }
        writer.close().await?;
        state.transition(PipelineState::Stopped)?;
        info!("Pipeline {} stopped", config.source_id);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn produce(
    config: &PipelineConfig,
    source: &mut dyn ChangeSource,
    buffer: &Arc<dyn EventBuffer>,
    hints: &TypeHints,
    metrics: &Arc<dyn MetricsCollectorTrait>,
    checkpoint: Option<Position>,
    wake: &Notify,
    stop: &CancellationToken,
) -> Result<()> {
    info!("Starting change producer for {}", config.source_id);
    let mut paused = false;
    let mut replayed: u64 = 0;

    while !stop.is_cancelled() {
        let depth = buffer.depth();
        if depth >= config.buffer_max_depth {
            if !paused {
                warn!(
                    "Buffer depth {} reached ceiling {}, pausing source consumption",
                    depth, config.buffer_max_depth
                );
                paused = true;
            }
            metrics.update_buffer_depth(depth);
            wake.notify_one();
            match source.keepalive().await {
                Ok(()) => {}
                Err(e) if e.is_transient() => debug!("Keepalive failed while paused: {}", e),
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(config.backpressure_poll()) => {}
            }
            continue;
        }
        if paused {
            info!("Buffer depth {} below ceiling, resuming source consumption", depth);
            paused = false;
        }

        match source.next_message(stop).await {
            Ok(None) => continue,
            Ok(Some(SourceMessage::SchemaChange(notice))) => {
                info!(
                    "Schema change on {:?}: {:?} ({} columns)",
                    notice.table.as_ref().map(|t| t.to_string()),
                    notice.change,
                    notice.columns.len()
                );
                hints.apply_notice(&notice);
            }
            Ok(Some(SourceMessage::Change(event))) => {
                if checkpoint.is_some_and(|c| event.position <= c) {
                    replayed += 1;
                    debug!("Dropping replayed event at {}", event.position);
                    continue;
                }
                let table = event.qualified_table();
                retry_transient(&config.retry, "buffer write", || buffer.write(&event))
                    .await
                    .inspect_err(|e| metrics.record_error(e.kind().as_str(), "buffer"))?;
                metrics.record_events_read(&table, event.operation.as_str(), 1);
                if buffer.ready() {
                    wake.notify_one();
                }
            }
            Err(e) if e.kind() == ErrorKind::Cancelled => break,
            Err(e) if e.kind() == ErrorKind::MalformedEvent => {
                warn!("Skipping malformed change: {}", e);
                metrics.record_events_skipped(1);
            }
            Err(e) => {
                metrics.record_error(e.kind().as_str(), "source");
                return Err(e);
            }
        }
    }

    if replayed > 0 {
        info!("Dropped {} replayed events at or below the checkpoint", replayed);
    }
    info!("Change producer for {} stopped", config.source_id);
    Ok(())
}

impl Consumer<'_> {
    async fn run(&mut self, wake: &Notify, stop: &CancellationToken) -> Result<()> {
        info!("Starting batch loop for {}", self.config.source_id);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick of an interval completes immediately
        cleanup.tick().await;
        ticker.tick().await;

        let mut due = false;
        loop {
            self.metrics.update_buffer_depth(self.buffer.depth());
            // a flush tick takes whatever is buffered, full batch or not
            let mut forced = std::mem::take(&mut due);
            while !stop.is_cancelled() && (forced || self.buffer.ready()) {
                forced = false;
                if self.process_batch().await? == 0 {
                    break;
                }
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = cleanup.tick() => self.cleanup().await,
                _ = ticker.tick() => due = self.buffer.depth() > 0,
                _ = wake.notified() => {}
            }
        }

        info!("Batch loop for {} stopped", self.config.source_id);
        Ok(())
    }

    /// Drain, write and commit one batch; returns how many events were completed
    async fn process_batch(&mut self) -> Result<usize> {
        let batch = retry_transient(&self.config.retry, "buffer flush", || self.buffer.flush()).await?;
        self.report_malformed();
        if batch.is_empty() {
            return Ok(0);
        }
        debug!("Processing batch of {} events", batch.len());

        let timer = ProcessingTimer::start();
        let written = retry_transient(&self.config.retry, "table write", || {
            self.writer.write_events(&batch)
        })
        .await;
        match written {
            Ok(summary) => {
                timer.finish(self.metrics.as_ref());
                if summary.events_skipped > 0 {
                    info!(
                        "{} events were already committed to their tables",
                        summary.events_skipped
                    );
                }
                self.complete(&batch).await?;
                Ok(batch.len())
            }
            Err(e) => self.handle_failure(batch, e).await,
        }
    }

    /// Checkpoint, mark processed and report a written batch
    async fn complete(&mut self, done: &[BufferedEvent]) -> Result<()> {
        let Some(newest) = done.iter().max_by_key(|b| b.event.position) else {
            return Ok(());
        };
        let position = newest.event.position;

        if self.last_checkpoint.is_some_and(|c| position <= c) {
            debug!("Batch ends at {}, checkpoint already covers it", position);
        } else {
            let metadata = serde_json::json!({ "batch_events": done.len() });
            let transaction_id = newest.event.transaction_id;
            retry_transient(&self.config.retry, "checkpoint save", || {
                self.checkpoints.save(position, transaction_id, metadata.clone())
            })
            .await
            .inspect_err(|e| self.metrics.record_error(e.kind().as_str(), "checkpoint"))?;
            self.last_checkpoint = Some(position);
            self.feedback.update(&position);
            self.state.set_checkpoint(position);
            self.metrics.record_checkpoint_lsn(position.commit_lsn);
        }

        let ids: Vec<i64> = done.iter().map(|b| b.id).collect();
        retry_transient(&self.config.retry, "mark processed", || {
            self.buffer.mark_processed(&ids)
        })
        .await?;
        for id in &ids {
            self.attempts.remove(id);
        }

        self.metrics.record_events_processed(done.len() as u64);
        self.metrics.update_buffer_depth(self.buffer.depth());
        if let Some(newest_time) = done.iter().map(|b| b.event.event_time).max() {
            let lag = (Utc::now() - newest_time).to_std().unwrap_or_default();
            self.metrics.update_replication_lag(lag);
        }
        info!("Committed {} events through {}", done.len(), position);
        Ok(())
    }

    async fn handle_failure(&mut self, batch: Vec<BufferedEvent>, err: CdcError) -> Result<usize> {
        self.metrics.record_error(err.kind().as_str(), "writer");
        if !matches!(err.kind(), ErrorKind::Encoding | ErrorKind::MalformedEvent) {
            return Err(err);
        }

        let mut highest = 0;
        for buffered in &batch {
            let count = self.attempts.entry(buffered.id).or_insert(0);
            *count += 1;
            highest = highest.max(*count);
        }
        if highest < self.config.max_event_retries {
            warn!(
                "Batch of {} events failed (attempt {}/{}), leaving it for retry: {}",
                batch.len(),
                highest,
                self.config.max_event_retries,
                err
            );
            return Ok(0);
        }

        warn!(
            "Batch exhausted its retry budget ({}), retrying events one by one: {}",
            self.config.max_event_retries, err
        );
        self.isolate(batch).await
    }

    /// Write events individually; the ones that still fail go to the dead-letter sink
    async fn isolate(&mut self, batch: Vec<BufferedEvent>) -> Result<usize> {
        let mut done: Vec<BufferedEvent> = Vec::with_capacity(batch.len());
        let mut dead = 0u64;

        for buffered in batch {
            let single = std::slice::from_ref(&buffered);
            match self.writer.write_events(single).await {
                Ok(_) => done.push(buffered),
                Err(e) if matches!(e.kind(), ErrorKind::Encoding | ErrorKind::MalformedEvent) => {
                    let Some(sink) = self.dead_letters else {
                        return Err(CdcError::retry_exhausted(format!(
                            "event {} of {} failed {} times and no dead-letter sink is configured: {}",
                            buffered.event.position,
                            buffered.event.qualified_table(),
                            self.config.max_event_retries,
                            e
                        )));
                    };
                    let retries = self.attempts.get(&buffered.id).copied().unwrap_or(0);
                    let record = DeadLetterRecord::new(
                        Some(buffered.id),
                        buffered.event.clone(),
                        &e,
                        retries,
                        self.config.dead_letter_ttl,
                    );
                    retry_transient(&self.config.retry, "dead-letter write", || {
                        sink.record(record.clone())
                    })
                    .await?;
                    dead += 1;
                    done.push(buffered);
                }
                Err(e) => return Err(e),
            }
        }

        if dead > 0 {
            self.metrics.record_dead_letters(dead);
        }
        let count = done.len();
        self.complete(&done).await?;
        Ok(count)
    }

    fn report_malformed(&mut self) {
        let total = self.buffer.malformed_count();
        if total > self.malformed_seen {
            self.metrics.record_events_skipped(total - self.malformed_seen);
            self.malformed_seen = total;
        }
    }

    async fn cleanup(&self) {
        match self.buffer.cleanup(self.config.buffer_retention).await {
            Ok(0) => {}
            Ok(removed) => info!("Removed {} processed events from the buffer", removed),
            Err(e) => warn!("Buffer cleanup failed: {}", e),
        }
        if let Some(sink) = self.dead_letters {
            if let Err(e) = sink.purge_expired().await {
                warn!("Dead-letter purge failed: {}", e);
            }
        }
    }
}
