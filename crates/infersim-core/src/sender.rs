use std::time::Duration;

use infersim_common::Result;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::events::{unix_now, EventBatch, KvEvent};
use crate::publisher::Publisher;

pub const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Topic the cache events are published under.
pub fn event_topic(port: u16, model: &str) -> String {
    format!("kv@$localhost:{}@{}", port, model)
}

/// Drains the cache's event channel, batches events by size or time, and
/// publishes each batch with a monotone sequence number starting at 1.
///
/// Delivery is at-most-once: on cancellation or channel close any buffered
/// events are logged and discarded, since the subscriber may already be gone.
pub struct EventSender {
    rx: mpsc::Receiver<KvEvent>,
    publisher: Box<dyn Publisher>,
    topic: String,
    max_batch: usize,
    flush_period: Duration,
    seq: u64,
    pending: Vec<Vec<u8>>,
}

impl EventSender {
    pub fn new(
        rx: mpsc::Receiver<KvEvent>,
        publisher: Box<dyn Publisher>,
        topic: String,
        max_batch: usize,
    ) -> Self {
        Self {
            rx,
            publisher,
            topic,
            max_batch,
            flush_period: DEFAULT_FLUSH_PERIOD,
            seq: 0,
            pending: Vec::new(),
        }
    }

    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    /// Runs until cancellation or until every event producer is gone.
    /// A transport failure is returned to the caller; the process decides
    /// whether to continue degraded.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.flush_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.discard_pending();
                    return Ok(());
                }
                event = self.rx.recv() => match event {
                    Some(event) => {
                        self.pending.push(event.encode()?);
                        if self.pending.len() >= self.max_batch {
                            self.flush().await?;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.discard_pending();
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await?;
                        ticker.reset();
                    }
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.seq += 1;
        let batch = EventBatch {
            ts: unix_now(),
            events: std::mem::take(&mut self.pending),
            data_parallel_rank: Some(0),
        };
        let count = batch.events.len();
        let payload = batch.encode()?;
        self.publisher.publish(&self.topic, self.seq, payload).await?;
        tracing::debug!(target: "kv_events", seq = self.seq, events = count, "published batch");
        Ok(())
    }

    fn discard_pending(&self) {
        if !self.pending.is_empty() {
            tracing::warn!(
                target: "kv_events",
                dropped = self.pending.len(),
                "discarding buffered kv events on shutdown"
            );
        }
    }
}
