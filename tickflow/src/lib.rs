//! # Tickflow
//! Causal streaming order-flow analytics. Tickflow turns an ordered stream of trade ticks and
//! order book snapshots into closed bars carrying incrementally maintained indicators, divergence
//! scores, and ENTRY / EXIT confirmation signals.
//!
//! Every computation only reads state at or before the tick being processed, so a live feed and a
//! historical replay of the same ticks produce identical bars and signals.
//!
//! ## Stages
//! * [`enrich::FeatureEnricher`]: trade sign, large trade flag and absorption flags per tick.
//! * [`bar::BarAggregator`]: grid-aligned bars per (instrument, interval) with RSI, MFI, OBV,
//!   CVD, VWAP, market structure and smoothed variants.
//! * [`divergence::DivergenceEngine`]: price-vs-feature and LVC-vs-feature agreement scores.
//! * [`signal::SignalStateMachine`]: PATH / COST (/ PRESSURE) regime confirmation and exits.
//! * [`pipeline::Pipeline`]: partitioned workers linked by bounded channels, mode-agnostic
//!   [`pipeline::source::TickSource`]s and retrying sinks.
//!
//! ## Example
//! ```rust,no_run
//! use tickflow::{
//!     config::{InstrumentConfig, PipelineConfig},
//!     pipeline::{Pipeline, sink::MemorySink, source::ReplayTickSource, thresholds_for_mode},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PipelineConfig::new([InstrumentConfig::new("DIXON")]);
//!     let source = ReplayTickSource::from_json_lines(["ticks/DIXON.jsonl"]).await.unwrap();
//!     let thresholds = thresholds_for_mode(&config, source.ticks());
//!
//!     let sink = MemorySink::new();
//!     let summary = Pipeline::new(config, thresholds)
//!         .run(source, sink.clone(), sink.clone())
//!         .await
//!         .unwrap();
//!
//!     println!("{summary:?}: {} signals", sink.signals().len());
//! }
//! ```

/// Closed bars, incremental indicators and market structure.
pub mod bar;

/// Injected pipeline configuration.
pub mod config;

/// Divergence scoring over closed bars.
pub mod divergence;

/// Per-tick feature enrichment.
pub mod enrich;

/// All [`Error`](std::error::Error)s generated in Tickflow.
pub mod error;

/// Core tick data model.
pub mod model;

/// Stage wiring, tick sources and sinks.
pub mod pipeline;

/// Composite sensors and the entry / exit state machine.
pub mod signal;

// Re-export the types most callers need
pub use bar::{BarKey, ClosedBar};
pub use config::{
    AbsorptionPolicy, InstrumentConfig, PipelineConfig, PipelineMode, SensorModel,
    SignalThresholds, ThresholdMethod,
};
pub use error::{DataError, PipelineError, SinkError};
pub use model::{EnrichedTick, InstrumentId, Interval, RawTick, TradeSign};
pub use pipeline::{Pipeline, PipelineSummary, ShutdownTrigger};
pub use signal::{Direction, SignalEvent, SignalKind, SignalReason};
