//! Pipeline orchestration.
//!
//! ```text
//! TickSource -> [partition 0..N workers] -> bar writer    -> BarSink
//!                                        -> signal writer -> SignalSink
//! ```
//!
//! Instruments are assigned to partitions by FNV hash, so every piece of per-instrument state is
//! owned by exactly one worker. Stages are linked by bounded channels: a full channel suspends its
//! producer. Shutdown stops the source, then each stage drains its queue, flushes and exits once
//! its upstream senders are dropped.

use crate::{
    bar::{BarAggregator, ClosedBar},
    config::{PipelineConfig, PipelineMode},
    enrich::{
        FeatureEnricher,
        threshold::{BacktestThresholds, ThresholdHandle, ThresholdProvider},
    },
    error::{DataError, PipelineError},
    model::{InstrumentId, RawTick},
    pipeline::{
        sink::{BarSink, BatchWriter, SignalSink},
        source::TickSource,
    },
    signal::{SignalEvent, SignalStateMachine},
};
use chrono::TimeDelta;
use fnv::{FnvHashMap, FnvHashSet, FnvHasher};
use serde::{Deserialize, Serialize};
use std::{
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Abstract tick source with live and replay implementations.
pub mod source;

/// Bar and signal sinks plus the batching writer stage.
pub mod sink;

/// Counters reported when [`Pipeline::run`] completes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct PipelineSummary {
    pub ticks_processed: u64,
    pub unknown_dropped: u64,
    pub gaps_skipped: u64,
    pub bars_written: u64,
    pub signals_written: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks_processed: AtomicU64,
    unknown_dropped: AtomicU64,
    gaps_skipped: AtomicU64,
}

/// Cloneable handle that asks a running [`Pipeline`] to drain and stop.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Partition index of `instrument`.
pub fn partition_of(instrument: &InstrumentId, partitions: usize) -> usize {
    let mut hasher = FnvHasher::default();
    instrument.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

/// Live threshold cache seeded from each instrument's configured large trade threshold.
pub fn live_thresholds(config: &PipelineConfig) -> ThresholdHandle {
    ThresholdHandle::new(config.instruments.iter().filter_map(|instrument| {
        instrument
            .large_trade_threshold
            .map(|threshold| (instrument.id.clone(), threshold))
    }))
}

/// Threshold provider for `config.mode`. Backtest thresholds are derived from `history`, which
/// may safely include the ticks being replayed: each day only sees the days before it.
pub fn thresholds_for_mode<'a>(
    config: &PipelineConfig,
    history: impl IntoIterator<Item = &'a RawTick>,
) -> Arc<dyn ThresholdProvider> {
    match config.mode {
        PipelineMode::Realtime => Arc::new(live_thresholds(config)),
        PipelineMode::Backtest => Arc::new(BacktestThresholds::from_history(
            history,
            config.thresholds,
            TimeDelta::minutes(i64::from(config.session_utc_offset_minutes)),
        )),
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    thresholds: Arc<dyn ThresholdProvider>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig, thresholds: Arc<dyn ThresholdProvider>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            thresholds,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Run until the source is exhausted or shutdown is triggered, then drain every stage.
    pub async fn run<S, B, G>(
        self,
        mut source: S,
        bar_sink: B,
        signal_sink: G,
    ) -> Result<PipelineSummary, PipelineError>
    where
        S: TickSource,
        B: BarSink + 'static,
        G: SignalSink + 'static,
    {
        let Self {
            config,
            thresholds,
            shutdown_tx: _shutdown_tx,
            mut shutdown_rx,
        } = self;

        if config.channel_capacity == 0 {
            return Err(PipelineError::ChannelConstruction {
                stage: "partition",
                reason: "channel capacity must be > 0".to_string(),
            });
        }
        config.validate()?;

        info!(
            mode = ?config.mode,
            instruments = config.instruments.len(),
            partitions = config.partitions,
            capacity = config.channel_capacity,
            "starting pipeline"
        );

        let counters = Arc::new(Counters::default());
        let (bar_tx, bar_rx) = mpsc::channel::<ClosedBar>(config.channel_capacity);
        let (signal_tx, signal_rx) = mpsc::channel::<SignalEvent>(config.channel_capacity);

        let bar_writer = tokio::spawn(
            BatchWriter::new(
                "bar",
                bar_sink,
                config.bar_batch_size,
                config.flush_interval(),
                config.sink_retry_budget,
                config.sink_retry_backoff(),
            )
            .run(bar_rx),
        );
        let signal_writer = tokio::spawn(
            BatchWriter::new(
                "signal",
                signal_sink,
                config.bar_batch_size,
                config.flush_interval(),
                config.sink_retry_budget,
                config.sink_retry_backoff(),
            )
            .run(signal_rx),
        );

        let mut partition_txs = Vec::with_capacity(config.partitions);
        let mut workers = Vec::with_capacity(config.partitions);
        for partition in 0..config.partitions {
            let (tx, rx) = mpsc::channel::<RawTick>(config.channel_capacity);
            let worker = PartitionWorker::new(partition, &config, Arc::clone(&thresholds));
            workers.push(tokio::spawn(worker.run(
                rx,
                bar_tx.clone(),
                signal_tx.clone(),
                Arc::clone(&counters),
            )));
            partition_txs.push(tx);
        }
        drop(bar_tx);
        drop(signal_tx);

        let known = config
            .instruments
            .iter()
            .map(|instrument| instrument.id.clone())
            .collect::<FnvHashSet<_>>();

        loop {
            if *shutdown_rx.borrow_and_update() {
                info!("shutdown requested, draining pipeline");
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => continue,
                next = source.next_tick() => next,
            };

            let tick = match next {
                Ok(Some(tick)) => tick,
                Ok(None) => {
                    info!("tick source exhausted");
                    break;
                }
                Err(error) => {
                    warn!(%error, "skipping tick");
                    continue;
                }
            };

            if !known.contains(&tick.instrument) {
                counters.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %DataError::UnknownInstrument(tick.instrument), "dropped tick");
                continue;
            }

            let partition = partition_of(&tick.instrument, partition_txs.len());
            if partition_txs[partition].send(tick).await.is_err() {
                warn!(partition, "partition worker stopped, halting ingestion");
                break;
            }
        }

        drop(partition_txs);
        let worker_result = join_all("partition worker", workers).await;
        let bars_written = join_writer("bar writer", bar_writer).await;
        let signals_written = join_writer("signal writer", signal_writer).await;

        let summary = PipelineSummary {
            ticks_processed: counters.ticks_processed.load(Ordering::Relaxed),
            unknown_dropped: counters.unknown_dropped.load(Ordering::Relaxed),
            gaps_skipped: counters.gaps_skipped.load(Ordering::Relaxed),
            bars_written: bars_written?,
            signals_written: signals_written?,
        };
        worker_result?;

        info!(?summary, "pipeline stopped");
        Ok(summary)
    }
}

async fn join_all(stage: &str, handles: Vec<JoinHandle<()>>) -> Result<(), PipelineError> {
    let mut result = Ok(());
    for join_error in futures::future::join_all(handles)
        .await
        .into_iter()
        .filter_map(Result::err)
    {
        error!(%stage, %join_error, "task failed");
        result = Err(PipelineError::WorkerPanicked(stage.to_string()));
    }
    result
}

async fn join_writer(
    stage: &str,
    handle: JoinHandle<Result<u64, PipelineError>>,
) -> Result<u64, PipelineError> {
    handle.await.map_err(|join_error| {
        error!(%stage, %join_error, "task failed");
        PipelineError::WorkerPanicked(stage.to_string())
    })?
}

/// Per-instrument analytics owned by one partition worker.
#[derive(Debug)]
struct InstrumentPipeline {
    aggregators: Vec<BarAggregator>,
    signal: SignalStateMachine,
}

/// Runs enrichment, aggregation and the signal machine for the instruments of one partition.
#[derive(Debug)]
struct PartitionWorker {
    partition: usize,
    enricher: FeatureEnricher,
    instruments: Vec<InstrumentPipeline>,
    index: FnvHashMap<InstrumentId, usize>,
}

impl PartitionWorker {
    fn new(
        partition: usize,
        config: &PipelineConfig,
        thresholds: Arc<dyn ThresholdProvider>,
    ) -> Self {
        let owned = config
            .instruments
            .iter()
            .filter(|instrument| partition_of(&instrument.id, config.partitions) == partition)
            .collect::<Vec<_>>();

        let enricher = FeatureEnricher::new(
            owned.iter().copied(),
            thresholds,
            &config.thresholds,
            config.absorption_policy,
        );

        let instruments = owned
            .iter()
            .map(|instrument| InstrumentPipeline {
                aggregators: instrument
                    .intervals
                    .iter()
                    .map(|interval| BarAggregator::new(instrument.id.clone(), *interval, config))
                    .collect(),
                signal: SignalStateMachine::new(
                    instrument.id.clone(),
                    instrument.signal_interval,
                    instrument.thresholds,
                    config.signal,
                ),
            })
            .collect();

        let index = owned
            .iter()
            .enumerate()
            .map(|(position, instrument)| (instrument.id.clone(), position))
            .collect();

        Self {
            partition,
            enricher,
            instruments,
            index,
        }
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<RawTick>,
        bar_tx: mpsc::Sender<ClosedBar>,
        signal_tx: mpsc::Sender<SignalEvent>,
        counters: Arc<Counters>,
    ) {
        debug!(
            partition = self.partition,
            instruments = self.instruments.len(),
            "partition worker started"
        );

        'ticks: while let Some(tick) = rx.recv().await {
            let (bars, signals) = self.process(tick, &counters);
            for bar in bars {
                if bar_tx.send(bar).await.is_err() {
                    break 'ticks;
                }
            }
            for signal in signals {
                if signal_tx.send(signal).await.is_err() {
                    break 'ticks;
                }
            }
        }

        // Open bars go downstream as partial bars; open positions stay open.
        let partials = self
            .instruments
            .iter_mut()
            .flat_map(|instrument| instrument.aggregators.iter_mut())
            .filter_map(BarAggregator::flush)
            .collect::<Vec<_>>();
        for bar in partials {
            if bar_tx.send(bar).await.is_err() {
                break;
            }
        }

        debug!(partition = self.partition, "partition worker stopped");
    }

    fn process(&mut self, tick: RawTick, counters: &Counters) -> (Vec<ClosedBar>, Vec<SignalEvent>) {
        let enriched = match self.enricher.enrich(tick) {
            Ok(enriched) => enriched,
            Err(error @ DataError::DataGap { .. }) => {
                counters.gaps_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(%error, "skipping out-of-order tick");
                return (Vec::new(), Vec::new());
            }
            Err(error @ DataError::UnknownInstrument(_)) => {
                counters.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%error, "dropped tick");
                return (Vec::new(), Vec::new());
            }
            Err(error) => {
                warn!(%error, "skipping tick");
                return (Vec::new(), Vec::new());
            }
        };
        counters.ticks_processed.fetch_add(1, Ordering::Relaxed);

        let Some(instrument) = self
            .index
            .get(enriched.instrument())
            .and_then(|position| self.instruments.get_mut(*position))
        else {
            return (Vec::new(), Vec::new());
        };

        let mut bars = Vec::new();
        let mut signals = Vec::new();
        for aggregator in &mut instrument.aggregators {
            for bar in aggregator.ingest(&enriched) {
                if let Some(event) = instrument.signal.on_bar(&bar) {
                    signals.push(event);
                }
                bars.push(bar);
            }
        }
        (bars, signals)
    }
}
