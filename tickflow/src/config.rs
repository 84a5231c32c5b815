//! Injected pipeline configuration.
//!
//! Every field is defaulted so a config file only needs to name what it changes. Per-instrument
//! tuning values (R/C/T thresholds, large trade overrides) are produced offline and consumed here.

use crate::{
    error::PipelineError,
    model::{InstrumentId, Interval},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, str::FromStr, time::Duration};
use tracing::warn;

/// Selects the tick source only; every downstream stage is identical in both modes.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    #[default]
    Realtime,
    #[serde(alias = "backtesting")]
    Backtest,
}

impl FromStr for PipelineMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "realtime" | "live" => Ok(PipelineMode::Realtime),
            "backtest" | "backtesting" | "replay" => Ok(PipelineMode::Backtest),
            other => Err(PipelineError::Config(format!(
                "invalid PIPELINE_MODE '{other}', expected 'realtime' or 'backtest'"
            ))),
        }
    }
}

/// Composite sensor set consumed by the signal state machine.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorModel {
    /// PATH + COST.
    #[default]
    TwoSensor,
    /// PATH + COST + PRESSURE (pullback entry, structural stop and scaled exits).
    ThreeSensor,
}

/// Re-fire policy for absorption flags.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsorptionPolicy {
    /// Fire once per unbroken refill streak.
    #[default]
    EdgeTriggered,
    /// Fire on every tick while the streak exceeds the refill threshold.
    EveryTick,
}

/// Statistic used to derive the large trade volume threshold.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum ThresholdMethod {
    Percentile { quantile: f64 },
    ModifiedZScore { cutoff: f64 },
}

impl Default for ThresholdMethod {
    fn default() -> Self {
        Self::Percentile { quantile: 0.99 }
    }
}

/// Per-instrument signal thresholds produced by the offline optimiser.
#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalThresholds {
    /// R: PATH neutral band half-width.
    pub regime: f64,
    /// C: COST neutral band half-width.
    pub cost: f64,
    /// T: PRESSURE entry veto level.
    pub timing: f64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            regime: 0.25,
            cost: 0.25,
            timing: 0.35,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub id: InstrumentId,
    pub intervals: Vec<Interval>,
    /// Interval whose closed bars drive the signal state machine.
    pub signal_interval: Interval,
    pub thresholds: SignalThresholds,
    /// Live mode large trade threshold, refreshed out-of-band at runtime.
    pub large_trade_threshold: Option<f64>,
    /// Absorption fires once the refill count exceeds this value.
    pub absorption_refill_threshold: u32,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            id: InstrumentId::new(""),
            intervals: vec![Interval(1), Interval(3), Interval(5), Interval(15)],
            signal_interval: Interval(5),
            thresholds: SignalThresholds::default(),
            large_trade_threshold: None,
            absorption_refill_threshold: 2,
        }
    }
}

impl InstrumentConfig {
    pub fn new(id: impl Into<InstrumentId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_intervals(mut self, intervals: impl IntoIterator<Item = u32>) -> Self {
        self.intervals = intervals.into_iter().map(Interval).collect();
        self
    }

    pub fn with_signal_interval(mut self, minutes: u32) -> Self {
        self.signal_interval = Interval(minutes);
        self
    }

    pub fn with_thresholds(mut self, thresholds: SignalThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_large_trade_threshold(mut self, threshold: f64) -> Self {
        self.large_trade_threshold = Some(threshold);
        self
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub method: ThresholdMethod,
    /// Trailing days of history used in backtest mode.
    pub history_days: i64,
    pub min_history_samples: usize,
    /// Size of the causal in-stream fallback window.
    pub fallback_window: usize,
    /// The fallback window must hold more than this many trades before it yields a threshold.
    pub fallback_min_samples: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            method: ThresholdMethod::default(),
            history_days: 7,
            min_history_samples: 50,
            fallback_window: 1000,
            fallback_min_samples: 200,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// RSI / MFI period in bars.
    pub period: usize,
    /// CVD trailing windows in minutes (eg/ [5, 10, 30] or [30]).
    pub cvd_lookbacks: Vec<u32>,
    /// EMA span of the smoothed indicator variants.
    pub smoothing_span: usize,
    /// Divergence lookback in minutes, converted to bars per interval.
    pub divergence_lookback: u32,
    /// Closed bars retained per (instrument, interval).
    pub history_capacity: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            period: 14,
            cvd_lookbacks: vec![5, 10, 30],
            smoothing_span: 3,
            divergence_lookback: 30,
            history_capacity: 200,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalConfig {
    pub sensor_model: SensorModel,
    /// Bars in the PATH structure ratio.
    pub structure_window: usize,
    /// Bars in the acceptance breakout range.
    pub breakout_window: usize,
    /// Consecutive same-sign bars required to arm.
    pub regime_bars: u32,
    /// ThreeSensor exit when direction-aligned PRESSURE exceeds this value.
    pub pressure_exhaustion: f64,
    /// ThreeSensor PATH chop band half-width: a trend break inside it, a stop veto outside it.
    pub path_chop: f64,
    /// ThreeSensor stop distance from the entry price, in percent.
    pub stop_loss_pct: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            sensor_model: SensorModel::default(),
            structure_window: 12,
            breakout_window: 5,
            regime_bars: 3,
            pressure_exhaustion: 0.75,
            path_chop: 0.15,
            stop_loss_pct: 0.30,
        }
    }
}

#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    pub instruments: Vec<InstrumentConfig>,
    /// Number of instrument partitions (one worker each).
    pub partitions: usize,
    /// Capacity of every bounded stage channel.
    pub channel_capacity: usize,
    pub bar_batch_size: usize,
    pub flush_interval_ms: u64,
    pub sink_retry_budget: u32,
    pub sink_retry_backoff_ms: u64,
    pub absorption_policy: AbsorptionPolicy,
    /// Offset applied to UTC timestamps before deriving the session day.
    pub session_utc_offset_minutes: i32,
    pub thresholds: ThresholdConfig,
    pub indicators: IndicatorConfig,
    pub signal: SignalConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            instruments: Vec::new(),
            partitions: 4,
            channel_capacity: 10_000,
            bar_batch_size: 100,
            flush_interval_ms: 2_000,
            sink_retry_budget: 5,
            sink_retry_backoff_ms: 250,
            absorption_policy: AbsorptionPolicy::default(),
            session_utc_offset_minutes: 0,
            thresholds: ThresholdConfig::default(),
            indicators: IndicatorConfig::default(),
            signal: SignalConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(instruments: impl IntoIterator<Item = InstrumentConfig>) -> Self {
        Self {
            instruments: instruments.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(json).map_err(|error| PipelineError::Config(error.to_string()))
    }

    pub fn with_mode(mut self, mode: PipelineMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_sensor_model(mut self, sensor_model: SensorModel) -> Self {
        self.signal.sensor_model = sensor_model;
        self
    }

    pub fn with_absorption_policy(mut self, policy: AbsorptionPolicy) -> Self {
        self.absorption_policy = policy;
        self
    }

    pub fn with_cvd_lookbacks(mut self, lookbacks: impl IntoIterator<Item = u32>) -> Self {
        self.indicators.cvd_lookbacks = lookbacks.into_iter().collect();
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn sink_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.sink_retry_backoff_ms)
    }

    pub fn instrument(&self, id: &InstrumentId) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|instrument| &instrument.id == id)
    }

    /// Apply environment overrides (`PIPELINE_MODE`, `TICKFLOW_CHANNEL_CAPACITY`,
    /// `TICKFLOW_PARTITIONS`).
    pub fn with_env_overrides(mut self) -> Result<Self, PipelineError> {
        if let Ok(mode) = std::env::var("PIPELINE_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(capacity) = env_parse("TICKFLOW_CHANNEL_CAPACITY") {
            self.channel_capacity = capacity;
        }
        if let Some(partitions) = env_parse("TICKFLOW_PARTITIONS") {
            self.partitions = partitions;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.partitions == 0 {
            return Err(PipelineError::Config("partitions must be > 0".to_string()));
        }
        if self.channel_capacity == 0 {
            return Err(PipelineError::Config(
                "channel_capacity must be > 0".to_string(),
            ));
        }
        if self.bar_batch_size == 0 {
            return Err(PipelineError::Config("bar_batch_size must be > 0".to_string()));
        }
        if self.instruments.is_empty() {
            return Err(PipelineError::Config("no instruments configured".to_string()));
        }
        if self.indicators.cvd_lookbacks.is_empty() || self.indicators.period == 0 {
            return Err(PipelineError::Config(
                "indicator period and cvd_lookbacks must be non-empty".to_string(),
            ));
        }
        if !(self.signal.stop_loss_pct > 0.0 && self.signal.stop_loss_pct < 100.0)
            || self.signal.path_chop < 0.0
        {
            return Err(PipelineError::Config(format!(
                "stop_loss_pct {} must be in (0, 100) and path_chop {} non-negative",
                self.signal.stop_loss_pct, self.signal.path_chop
            )));
        }
        if let ThresholdMethod::Percentile { quantile } = self.thresholds.method {
            if !(0.0..=1.0).contains(&quantile) {
                return Err(PipelineError::Config(format!(
                    "threshold quantile {quantile} outside [0, 1]"
                )));
            }
        }

        let mut seen = HashSet::with_capacity(self.instruments.len());
        for instrument in &self.instruments {
            if !seen.insert(&instrument.id) {
                return Err(PipelineError::Config(format!(
                    "duplicate instrument {}",
                    instrument.id
                )));
            }
            if instrument.intervals.is_empty() {
                return Err(PipelineError::Config(format!(
                    "{} has no bar intervals",
                    instrument.id
                )));
            }
            if let Some(interval) = instrument
                .intervals
                .iter()
                .find(|interval| interval.0 == 0 || Interval::MINUTES_PER_DAY % interval.0 != 0)
            {
                return Err(PipelineError::Config(format!(
                    "{} interval {interval} does not divide a day",
                    instrument.id
                )));
            }
            if !instrument.intervals.contains(&instrument.signal_interval) {
                warn!(
                    instrument = %instrument.id,
                    signal_interval = %instrument.signal_interval,
                    "signal interval is not an aggregated interval, no signals will fire"
                );
            }
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
