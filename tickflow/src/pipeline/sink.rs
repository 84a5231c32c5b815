use crate::{
    bar::{BarKey, ClosedBar},
    error::{PipelineError, SinkError},
    signal::SignalEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::MissedTickBehavior,
};
use tracing::{debug, error, warn};

/// Destination for closed bars, keyed by (timestamp, instrument, interval).
///
/// Writing a bar whose key already exists replaces it (eg/ a `partial` bar flushed at shutdown).
#[async_trait]
pub trait BarSink: Send {
    async fn upsert(&mut self, bars: &[ClosedBar]) -> Result<(), SinkError>;
}

/// Append-only destination for ENTRY / EXIT events.
#[async_trait]
pub trait SignalSink: Send {
    async fn append(&mut self, events: &[SignalEvent]) -> Result<(), SinkError>;
}

#[derive(Debug, Default)]
struct MemoryStore {
    bars: BTreeMap<BarKey, ClosedBar>,
    bar_log: Vec<ClosedBar>,
    signals: Vec<SignalEvent>,
    failures_remaining: u32,
}

impl MemoryStore {
    fn check_available(&mut self) -> Result<(), SinkError> {
        if self.failures_remaining > 0 {
            self.failures_remaining -= 1;
            return Err(SinkError::Unavailable("memory sink offline".to_string()));
        }
        Ok(())
    }
}

/// In-memory bar and signal store. Clones share the same buffers.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `writes` upsert/append calls with [`SinkError::Unavailable`].
    pub fn fail_next_writes(&self, writes: u32) {
        self.store.lock().failures_remaining = writes;
    }

    /// Upserted bars in key order.
    pub fn bars(&self) -> Vec<ClosedBar> {
        self.store.lock().bars.values().cloned().collect()
    }

    /// Every bar write in arrival order, including superseded ones.
    pub fn bar_log(&self) -> Vec<ClosedBar> {
        self.store.lock().bar_log.clone()
    }

    pub fn signals(&self) -> Vec<SignalEvent> {
        self.store.lock().signals.clone()
    }
}

#[async_trait]
impl BarSink for MemorySink {
    async fn upsert(&mut self, bars: &[ClosedBar]) -> Result<(), SinkError> {
        let mut store = self.store.lock();
        store.check_available()?;
        for bar in bars {
            store.bars.insert(bar.key(), bar.clone());
            store.bar_log.push(bar.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl SignalSink for MemorySink {
    async fn append(&mut self, events: &[SignalEvent]) -> Result<(), SinkError> {
        let mut store = self.store.lock();
        store.check_available()?;
        store.signals.extend_from_slice(events);
        Ok(())
    }
}

/// Append-only JSON-lines file writer. As a [`BarSink`] the last line per key wins.
#[derive(Debug)]
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    async fn write_lines<T: Serialize>(&mut self, records: &[T]) -> Result<(), SinkError> {
        for record in records {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            self.writer.write_all(&line).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl BarSink for JsonLinesSink {
    async fn upsert(&mut self, bars: &[ClosedBar]) -> Result<(), SinkError> {
        self.write_lines(bars).await
    }
}

#[async_trait]
impl SignalSink for JsonLinesSink {
    async fn append(&mut self, events: &[SignalEvent]) -> Result<(), SinkError> {
        self.write_lines(events).await
    }
}

/// Uniform batch write over both sink kinds.
#[async_trait]
pub(crate) trait WriteBatch<T: Sync>: Send {
    async fn write_batch(&mut self, batch: &[T]) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: BarSink> WriteBatch<ClosedBar> for S {
    async fn write_batch(&mut self, batch: &[ClosedBar]) -> Result<(), SinkError> {
        self.upsert(batch).await
    }
}

#[async_trait]
impl<S: SignalSink> WriteBatch<SignalEvent> for S {
    async fn write_batch(&mut self, batch: &[SignalEvent]) -> Result<(), SinkError> {
        self.append(batch).await
    }
}

/// Batching writer stage: flushes every `batch_size` records or `flush_interval`, retrying a
/// failed write with linear backoff until the retry budget is spent.
#[derive(Debug)]
pub(crate) struct BatchWriter<T, W> {
    name: &'static str,
    sink: W,
    batch: Vec<T>,
    batch_size: usize,
    flush_interval: Duration,
    retry_budget: u32,
    retry_backoff: Duration,
    written: u64,
}

impl<T, W> BatchWriter<T, W>
where
    T: Send + Sync,
    W: WriteBatch<T>,
{
    pub(crate) fn new(
        name: &'static str,
        sink: W,
        batch_size: usize,
        flush_interval: Duration,
        retry_budget: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            name,
            sink,
            batch: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            flush_interval: flush_interval.max(Duration::from_millis(1)),
            retry_budget,
            retry_backoff,
            written: 0,
        }
    }

    /// Consume `rx` until every sender is dropped, then flush the final batch.
    ///
    /// Returns the number of records written.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<T>) -> Result<u64, PipelineError> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => {
                        self.batch.push(record);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await?;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.flush().await?,
            }
        }

        self.flush().await?;
        debug!(sink = self.name, written = self.written, "writer drained");
        Ok(self.written)
    }

    async fn flush(&mut self) -> Result<(), PipelineError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.sink.write_batch(&self.batch).await {
                Ok(()) => {
                    self.written += self.batch.len() as u64;
                    self.batch.clear();
                    return Ok(());
                }
                Err(error) if error.is_transient() && attempts <= self.retry_budget => {
                    warn!(
                        sink = self.name,
                        attempt = attempts,
                        budget = self.retry_budget,
                        %error,
                        "sink write failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempts).await;
                }
                Err(error) => {
                    error!(
                        sink = self.name,
                        attempts,
                        records = self.batch.len(),
                        %error,
                        "sink unavailable, halting pipeline"
                    );
                    return Err(PipelineError::SinkUnavailable {
                        sink: self.name,
                        attempts,
                        source: error,
                    });
                }
            }
        }
    }
}
