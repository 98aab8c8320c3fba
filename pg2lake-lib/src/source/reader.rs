//! Logical replication reader
//!
//! Drives a [`ReplicationTransport`]: parses CopyData frames, decodes pgoutput
//! messages into [`SourceMessage`]s, answers keepalives and reports the flushed
//! position upstream. Transient transport failures are healed by reconnecting
//! from the last flushed position; changes already handed out are filtered
//! on replay.

use super::protocol::{LogicalReplicationParser, ReplicationFrame, StandbyStatus};
use super::transport::ReplicationTransport;
use super::{ChangeSource, EventDecoder, LsnFeedback, SourceMessage};
use crate::config::Config;
use crate::error::{CdcError, ErrorKind, Result};
use crate::retry::RetryConfig;
use crate::types::{format_lsn, Lsn, Position};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings of the replication session
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source_id: String,
    pub slot_name: String,
    pub publication_name: String,
    pub protocol_version: u32,
    pub ddl_message_prefix: String,
    pub heartbeat_interval: Duration,
    pub retry: RetryConfig,
}

impl From<&Config> for SourceConfig {
    fn from(config: &Config) -> Self {
        Self {
            source_id: config.source_id.clone(),
            slot_name: config.replication_slot_name.clone(),
            publication_name: config.publication_name.clone(),
            protocol_version: config.protocol_version,
            ddl_message_prefix: config.ddl_message_prefix.clone(),
            heartbeat_interval: config.heartbeat_interval,
            retry: RetryConfig::from(config),
        }
    }
}

impl SourceConfig {
    /// pgoutput plugin options for `START_REPLICATION`
    pub fn replication_options(&self) -> Vec<(String, String)> {
        vec![
            ("proto_version".to_string(), self.protocol_version.to_string()),
            (
                "publication_names".to_string(),
                format!("\"{}\"", self.publication_name),
            ),
            ("messages".to_string(), "true".to_string()),
        ]
    }
}

/// [`ChangeSource`] over PostgreSQL logical replication
pub struct PostgresSource<T: ReplicationTransport> {
    transport: T,
    config: SourceConfig,
    parser: LogicalReplicationParser,
    decoder: EventDecoder,
    feedback: Arc<LsnFeedback>,
    pending: VecDeque<SourceMessage>,
    /// Highest WAL position seen on the wire
    received_lsn: Lsn,
    start_lsn: Lsn,
    /// Highest change position handed out; replays at or below are dropped
    last_emitted: Option<Position>,
    last_status: Instant,
    started: bool,
}

impl<T: ReplicationTransport> PostgresSource<T> {
    pub fn new(transport: T, config: SourceConfig, feedback: Arc<LsnFeedback>) -> Self {
        let parser = LogicalReplicationParser::with_protocol_version(config.protocol_version);
        let decoder = EventDecoder::new(config.source_id.clone(), config.ddl_message_prefix.clone());
        Self {
            transport,
            config,
            parser,
            decoder,
            feedback,
            pending: VecDeque::new(),
            received_lsn: 0,
            start_lsn: 0,
            last_emitted: None,
            last_status: Instant::now(),
            started: false,
        }
    }

    pub fn feedback(&self) -> Arc<LsnFeedback> {
        Arc::clone(&self.feedback)
    }

    pub fn received_lsn(&self) -> Lsn {
        self.received_lsn
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Position replication resumes from after a reconnect
    fn resume_lsn(&self) -> Lsn {
        self.start_lsn.max(self.feedback.flushed_lsn())
    }

    async fn open_stream(&mut self) -> Result<()> {
        let start_lsn = self.resume_lsn();
        self.transport.connect().await?;
        self.transport
            .create_slot_if_missing(&self.config.slot_name)
            .await?;
        let options = self.config.replication_options();
        self.transport
            .start_replication(&self.config.slot_name, start_lsn, &options)
            .await?;
        self.received_lsn = self.received_lsn.max(start_lsn);
        self.last_status = Instant::now();
        info!(
            "Started replication on slot {} from LSN {}",
            self.config.slot_name,
            format_lsn(start_lsn)
        );
        Ok(())
    }

    /// Open the stream, retrying transient failures with exponential backoff
    async fn open_stream_with_retry(&mut self, cancel: Option<&CancellationToken>) -> Result<()> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.open_stream().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Replication stream restored after {} attempts", attempt);
                    }
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        "Opening replication stream failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    let _ = self.transport.close().await;
                    match cancel {
                        Some(token) => tokio::select! {
                            _ = token.cancelled() => return Err(CdcError::cancelled("Reconnect cancelled")),
                            _ = tokio::time::sleep(delay) => {}
                        },
                        None => tokio::time::sleep(delay).await,
                    }
                }
                Err(e) if e.is_transient() => {
                    error!("Giving up on replication stream after {} attempts: {}", attempt, e);
                    return Err(CdcError::retry_exhausted(format!(
                        "Replication stream failed after {} attempts: {}",
                        attempt, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reconnect(&mut self, cause: &CdcError, cancel: &CancellationToken) -> Result<()> {
        warn!(
            "Replication stream interrupted: {}. Reconnecting from LSN {}",
            cause,
            format_lsn(self.resume_lsn())
        );
        let _ = self.transport.close().await;
        self.decoder.reset();
        self.pending.clear();
        self.open_stream_with_retry(Some(cancel)).await
    }

    async fn send_status(&mut self, reply_requested: bool) -> Result<()> {
        let flushed = self.feedback.flushed_lsn().min(self.received_lsn.max(self.start_lsn));
        let status = StandbyStatus {
            received_lsn: self.received_lsn,
            flushed_lsn: flushed,
            applied_lsn: flushed,
            reply_requested,
        };
        self.transport.send_status(status).await?;
        self.last_status = Instant::now();
        debug!(
            "Sent standby status: received {}, flushed {}",
            format_lsn(status.received_lsn),
            format_lsn(status.flushed_lsn)
        );
        Ok(())
    }

    async fn maybe_send_status(&mut self) -> Result<()> {
        if self.last_status.elapsed() >= self.config.heartbeat_interval {
            self.send_status(false).await?;
        }
        Ok(())
    }

    /// Decode one CopyData frame into the pending queue
    async fn handle_frame(&mut self, frame: Bytes) -> Result<()> {
        match ReplicationFrame::parse(frame)? {
            ReplicationFrame::XLogData(data) => {
                self.received_lsn = self.received_lsn.max(data.wal_end);
                let message = match self.parser.parse(data.payload) {
                    Ok(message) => message,
                    Err(e) if e.kind() == ErrorKind::MalformedEvent => {
                        warn!(
                            "Skipping malformed message at WAL {}: {}",
                            format_lsn(data.wal_start),
                            e
                        );
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                match self.decoder.decode(message) {
                    Ok(messages) => self.pending.extend(messages),
                    Err(e) if e.kind() == ErrorKind::MalformedEvent => {
                        warn!(
                            "Skipping undecodable change at WAL {}: {}",
                            format_lsn(data.wal_start),
                            e
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            ReplicationFrame::Keepalive(keepalive) => {
                self.received_lsn = self.received_lsn.max(keepalive.wal_end);
                if keepalive.reply_requested {
                    self.send_status(false).await?;
                }
            }
        }
        Ok(())
    }

    /// Next queued message, skipping changes at or below the last one handed out
    fn pop_pending(&mut self) -> Option<SourceMessage> {
        while let Some(message) = self.pending.pop_front() {
            if let SourceMessage::Change(event) = &message {
                if matches!(self.last_emitted, Some(last) if event.position <= last) {
                    debug!("Dropping replayed change at {}", event.position);
                    continue;
                }
                self.last_emitted = Some(event.position);
            }
            return Some(message);
        }
        None
    }
}

#[async_trait]
impl<T: ReplicationTransport> ChangeSource for PostgresSource<T> {
    async fn start(&mut self, start: Option<Position>) -> Result<()> {
        if let Some(position) = start {
            self.start_lsn = position.flush_lsn();
            self.last_emitted = Some(position);
            self.feedback.update(&position);
        }
        self.open_stream_with_retry(None).await?;
        self.started = true;
        Ok(())
    }

    async fn next_message(&mut self, cancel: &CancellationToken) -> Result<Option<SourceMessage>> {
        if !self.started {
            return Err(CdcError::generic("Source has not been started"));
        }
        if let Some(message) = self.pop_pending() {
            return Ok(Some(message));
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let outcome = match self.maybe_send_status().await {
            Ok(()) => match self.transport.recv(cancel).await {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Ok(self.pop_pending()),
            Err(e) if e.is_transient() => {
                self.reconnect(&e, cancel).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn keepalive(&mut self) -> Result<()> {
        match self.maybe_send_status().await {
            Err(e) if e.is_transient() => {
                debug!("Keepalive failed: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        if self.transport.is_alive() {
            if let Err(e) = self.send_status(false).await {
                warn!("Failed to send final standby status: {}", e);
            }
        }
        self.transport.close().await?;
        self.started = false;
        info!(
            "Replication stopped, last flushed LSN {}",
            format_lsn(self.feedback.flushed_lsn())
        );
        Ok(())
    }
}
