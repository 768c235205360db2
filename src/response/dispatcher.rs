//! Poll loop matching response records to pending handlers.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::ResponseDecoder;
use super::handler::PendingResponses;
use crate::broker::{BrokerError, BrokerRecord, ConnectorState, RecordConsumer};
use crate::model::ResultEntry;
use crate::telemetry;

/// Reads one response topic and completes the matching handlers.
///
/// While the consumer is connected the loop polls; while it is not, it
/// marks the connector RECONNECTING, waits `retry_backoff` and asks the
/// consumer to reconnect. On exit the consumer is closed and every pending
/// handler is dropped.
pub struct ResponseDispatcher<D: ResponseDecoder> {
    consumer: Box<dyn RecordConsumer>,
    decoder: D,
    pending: PendingResponses<D::Value>,
    retry_backoff: Duration,
    cancel: CancellationToken,
}

impl<D: ResponseDecoder> ResponseDispatcher<D> {
    pub fn new(
        consumer: Box<dyn RecordConsumer>,
        decoder: D,
        pending: PendingResponses<D::Value>,
        retry_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            consumer,
            decoder,
            pending,
            retry_backoff,
            cancel,
        }
    }

    pub async fn run(mut self) {
        let topic = self.consumer.topic().to_string();
        let progress = self.consumer.progress();
        let cancel = self.cancel.clone();
        info!(topic = %topic, "Starting response polling loop");

        loop {
            if self.consumer.is_connected() {
                let polled = tokio::select! {
                    _ = cancel.cancelled() => break,
                    polled = self.consumer.poll() => polled,
                };
                match polled {
                    Ok(records) if records.is_empty() => {}
                    Ok(records) => {
                        debug!(topic = %topic, count = records.len(), "Received response records");
                        self.process_records(&topic, &records);
                    }
                    Err(BrokerError::Closed) => break,
                    Err(e) => warn!(topic = %topic, error = %e, "Response poll failed"),
                }
            } else {
                progress.set_progress_with(
                    ConnectorState::Reconnecting,
                    ResultEntry::warn(format!(
                        "Retry after {} ms",
                        self.retry_backoff.as_millis()
                    )),
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
                if let Err(e) = self.consumer.reconnect().await {
                    debug!(topic = %topic, error = %e, "Reconnect attempt failed");
                }
            }
        }

        progress.set_progress(ConnectorState::Stopping);
        self.consumer.close().await;
        let dropped = self.pending.clear();
        info!(topic = %topic, dropped_handlers = dropped, "Stopped response polling loop");
    }

    fn process_records(&self, topic: &str, records: &[BrokerRecord]) {
        for record in records {
            let (key, value) = match self.decoder.decode(record) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(topic = %topic, offset = record.offset, error = %e, "Skipping undecodable response");
                    continue;
                }
            };
            debug!(topic = %topic, key = %key, "Processing response");
            if !self.pending.complete(&key, value) {
                info!(
                    topic = %topic,
                    key = %key,
                    pending = ?self.pending.keys(),
                    "No handler found for key"
                );
                telemetry::record_orphan_response(topic);
            }
        }
    }
}
