//! Large trade volume thresholds.
//!
//! Two [`ThresholdProvider`]s share one contract: [`ThresholdHandle`] serves a live cache that is
//! refreshed out-of-band, [`BacktestThresholds`] derives each trading day's figure from history
//! strictly before that day. Both may answer `None`, in which case the caller consults its
//! in-stream [`RollingThreshold`] and, failing that, treats the trade as not large.

use crate::{
    config::{ThresholdConfig, ThresholdMethod},
    model::{InstrumentId, RawTick},
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use fnv::FnvHashMap;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::{collections::VecDeque, sync::Arc};
use tracing::debug;

/// Scale factor relating the median absolute deviation to a normal standard deviation.
const MAD_SCALE: f64 = 0.6745;

/// Mode-aware source of the large trade volume threshold.
pub trait ThresholdProvider: Send + Sync {
    fn threshold(&self, instrument: &InstrumentId, as_of: DateTime<Utc>) -> Option<f64>;
}

/// Compute the threshold statistic over `samples`, returning `None` if it is undefined.
pub fn compute_threshold(method: ThresholdMethod, samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let sorted = samples
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .sorted_by(f64::total_cmp)
        .collect::<Vec<_>>();

    match method {
        ThresholdMethod::Percentile { quantile } => percentile(&sorted, quantile),
        ThresholdMethod::ModifiedZScore { cutoff } => {
            let median = percentile(&sorted, 0.5)?;
            let deviations = sorted
                .iter()
                .map(|value| (value - median).abs())
                .sorted_by(f64::total_cmp)
                .collect::<Vec<_>>();
            let mad = percentile(&deviations, 0.5)?;
            if mad <= 0.0 {
                return None;
            }
            Some(median + cutoff * mad / MAD_SCALE)
        }
    }
}

/// Linearly interpolated percentile of an ascending slice.
pub fn percentile(sorted: &[f64], quantile: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = quantile.clamp(0.0, 1.0) * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}

/// Live threshold cache shared between partition workers and an out-of-band refresher.
#[derive(Clone, Debug, Default)]
pub struct ThresholdHandle {
    cache: Arc<RwLock<FnvHashMap<InstrumentId, f64>>>,
}

impl ThresholdHandle {
    pub fn new(initial: impl IntoIterator<Item = (InstrumentId, f64)>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(initial.into_iter().collect())),
        }
    }

    pub fn set(&self, instrument: InstrumentId, threshold: f64) {
        self.cache.write().insert(instrument, threshold);
    }

    pub fn remove(&self, instrument: &InstrumentId) -> Option<f64> {
        self.cache.write().remove(instrument)
    }

    /// Atomically swap the whole cache, eg/ after a nightly recomputation.
    pub fn replace_all(&self, thresholds: impl IntoIterator<Item = (InstrumentId, f64)>) {
        let next = thresholds.into_iter().collect();
        *self.cache.write() = next;
    }
}

impl ThresholdProvider for ThresholdHandle {
    fn threshold(&self, instrument: &InstrumentId, _: DateTime<Utc>) -> Option<f64> {
        self.cache.read().get(instrument).copied()
    }
}

/// Backtest thresholds, computed once per (instrument, trading day) from the trade volume deltas
/// in `[day_start - history_days, day_start)`.
#[derive(Debug)]
pub struct BacktestThresholds {
    config: ThresholdConfig,
    utc_offset: TimeDelta,
    /// Ascending (time, tick volume) trade samples per instrument.
    history: FnvHashMap<InstrumentId, Vec<(DateTime<Utc>, f64)>>,
    cache: Mutex<FnvHashMap<(InstrumentId, NaiveDate), Option<f64>>>,
}

impl BacktestThresholds {
    /// Build from historical ticks of any instrument in any order.
    ///
    /// Volume deltas restart on each session day, so the first tick of a day never yields a sample.
    pub fn from_history<'a>(
        ticks: impl IntoIterator<Item = &'a RawTick>,
        config: ThresholdConfig,
        utc_offset: TimeDelta,
    ) -> Self {
        let mut by_instrument = FnvHashMap::<InstrumentId, Vec<&RawTick>>::default();
        for tick in ticks {
            by_instrument
                .entry(tick.instrument.clone())
                .or_default()
                .push(tick);
        }

        let history = by_instrument
            .into_iter()
            .map(|(instrument, mut ticks)| {
                ticks.sort_by_key(|tick| tick.time);
                let samples = ticks
                    .iter()
                    .tuple_windows()
                    .filter(|(prev, next)| {
                        session_day(prev.time, utc_offset) == session_day(next.time, utc_offset)
                    })
                    .map(|(prev, next)| (next.time, next.volume_traded - prev.volume_traded))
                    .filter(|(_, volume)| *volume > 0.0)
                    .collect::<Vec<_>>();
                (instrument, samples)
            })
            .collect();

        Self {
            config,
            utc_offset,
            history,
            cache: Mutex::new(FnvHashMap::default()),
        }
    }

    fn compute(&self, instrument: &InstrumentId, day: NaiveDate) -> Option<f64> {
        let day_start = day.and_hms_opt(0, 0, 0)?.and_utc() - self.utc_offset;
        let window_start = day_start - TimeDelta::days(self.config.history_days);

        let samples = self
            .history
            .get(instrument)?
            .iter()
            .filter(|(time, _)| *time >= window_start && *time < day_start)
            .map(|(_, volume)| *volume)
            .collect::<Vec<_>>();

        if samples.len() < self.config.min_history_samples {
            debug!(
                %instrument,
                %day,
                samples = samples.len(),
                required = self.config.min_history_samples,
                "insufficient trailing history for backtest threshold, using in-stream fallback"
            );
            return None;
        }

        compute_threshold(self.config.method, &samples)
    }
}

impl ThresholdProvider for BacktestThresholds {
    fn threshold(&self, instrument: &InstrumentId, as_of: DateTime<Utc>) -> Option<f64> {
        let day = session_day(as_of, self.utc_offset);
        let key = (instrument.clone(), day);

        if let Some(cached) = self.cache.lock().get(&key) {
            return *cached;
        }

        let threshold = self.compute(instrument, day);
        self.cache.lock().insert(key, threshold);
        threshold
    }
}

/// Session calendar day of `time` after applying the venue offset.
pub fn session_day(time: DateTime<Utc>, utc_offset: TimeDelta) -> NaiveDate {
    (time + utc_offset).date_naive()
}

/// Causal rolling threshold over the most recent trades seen in-stream.
#[derive(Clone, Debug)]
pub struct RollingThreshold {
    method: ThresholdMethod,
    capacity: usize,
    min_samples: usize,
    volumes: VecDeque<f64>,
}

impl RollingThreshold {
    pub fn new(config: &ThresholdConfig) -> Self {
        Self {
            method: config.method,
            capacity: config.fallback_window.max(1),
            min_samples: config.fallback_min_samples,
            volumes: VecDeque::with_capacity(config.fallback_window.max(1)),
        }
    }

    /// Threshold over the trades seen so far, excluding any not yet pushed.
    pub fn threshold(&self) -> Option<f64> {
        if self.volumes.len() <= self.min_samples {
            return None;
        }
        let (front, back) = self.volumes.as_slices();
        compute_threshold(self.method, &[front, back].concat())
    }

    pub fn push(&mut self, volume: f64) {
        if self.volumes.len() == self.capacity {
            self.volumes.pop_front();
        }
        self.volumes.push_back(volume);
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::tick;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0)
            .single()
            .unwrap()
    }

    /// One tick per minute from 09:00 with a constant `step` volume per trade.
    fn session(instrument: &str, day: u32, trades: u32, step: f64) -> Vec<RawTick> {
        (0..=trades)
            .map(|index| {
                tick(
                    instrument,
                    at(day, 9, 0) + TimeDelta::minutes(i64::from(index)),
                    100.0,
                    f64::from(index) * step,
                    None,
                )
            })
            .collect()
    }

    #[test]
    fn test_compute_threshold() {
        struct TestCase {
            method: ThresholdMethod,
            samples: Vec<f64>,
            expected: Option<f64>,
        }

        let tests = vec![
            TestCase {
                // TC0: median by linear interpolation
                method: ThresholdMethod::Percentile { quantile: 0.5 },
                samples: vec![4.0, 1.0, 3.0, 2.0],
                expected: Some(2.5),
            },
            TestCase {
                // TC1: 99th percentile of 1..=101
                method: ThresholdMethod::Percentile { quantile: 0.99 },
                samples: (1..=101).map(f64::from).collect(),
                expected: Some(100.0),
            },
            TestCase {
                // TC2: empty sample set
                method: ThresholdMethod::Percentile { quantile: 0.99 },
                samples: vec![],
                expected: None,
            },
            TestCase {
                // TC3: modified z-score, median 3, MAD 1
                method: ThresholdMethod::ModifiedZScore { cutoff: 0.6745 },
                samples: vec![1.0, 2.0, 3.0, 4.0, 5.0],
                expected: Some(4.0),
            },
            TestCase {
                // TC4: zero MAD is undefined
                method: ThresholdMethod::ModifiedZScore { cutoff: 3.5 },
                samples: vec![10.0, 10.0, 10.0, 50.0],
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = compute_threshold(test.method, &test.samples);
            match (actual, test.expected) {
                (Some(actual), Some(expected)) => {
                    assert!((actual - expected).abs() < 1e-9, "TC{} failed", index)
                }
                (actual, expected) => assert_eq!(actual, expected, "TC{} failed", index),
            }
        }
    }

    #[test]
    fn test_backtest_threshold_ignores_same_day_and_future_ticks() {
        let config = ThresholdConfig {
            method: ThresholdMethod::Percentile { quantile: 1.0 },
            min_history_samples: 10,
            ..Default::default()
        };

        let prior = session("DIXON", 2, 60, 10.0);
        let baseline =
            BacktestThresholds::from_history(prior.iter(), config, TimeDelta::zero());

        // Same history plus huge trades on the processed day and the day after
        let mut polluted = prior.clone();
        polluted.extend(session("DIXON", 3, 60, 5_000.0));
        polluted.extend(session("DIXON", 4, 60, 9_000.0));
        let polluted =
            BacktestThresholds::from_history(polluted.iter(), config, TimeDelta::zero());

        let instrument = InstrumentId::new("DIXON");
        let as_of = at(3, 15, 0);
        assert_eq!(baseline.threshold(&instrument, as_of), Some(10.0));
        assert_eq!(polluted.threshold(&instrument, as_of), Some(10.0));
    }

    #[test]
    fn test_backtest_threshold_window_and_fallback() {
        let config = ThresholdConfig {
            method: ThresholdMethod::Percentile { quantile: 1.0 },
            history_days: 7,
            min_history_samples: 50,
            ..Default::default()
        };

        let mut history = session("DIXON", 2, 60, 10.0);
        history.extend(session("DIXON", 10, 20, 30.0));
        let thresholds =
            BacktestThresholds::from_history(history.iter(), config, TimeDelta::zero());
        let instrument = InstrumentId::new("DIXON");

        // Day 3 sees the 60 trades of day 2
        assert_eq!(thresholds.threshold(&instrument, at(3, 10, 0)), Some(10.0));
        // Day 11 only sees day 10 (day 2 is outside the 7 day window), too few samples
        assert_eq!(thresholds.threshold(&instrument, at(11, 10, 0)), None);
        // Unknown instruments are unavailable
        assert_eq!(
            thresholds.threshold(&InstrumentId::new("OTHER"), at(3, 10, 0)),
            None
        );
    }

    #[test]
    fn test_threshold_handle_refresh() {
        let handle = ThresholdHandle::new([(InstrumentId::new("A"), 500.0)]);
        let reader = handle.clone();
        let now = at(2, 10, 0);

        assert_eq!(reader.threshold(&InstrumentId::new("A"), now), Some(500.0));

        handle.set(InstrumentId::new("B"), 42.0);
        assert_eq!(reader.threshold(&InstrumentId::new("B"), now), Some(42.0));

        handle.replace_all([(InstrumentId::new("A"), 750.0)]);
        assert_eq!(reader.threshold(&InstrumentId::new("A"), now), Some(750.0));
        assert_eq!(reader.threshold(&InstrumentId::new("B"), now), None);
    }

    #[test]
    fn test_rolling_threshold_requires_min_samples() {
        let config = ThresholdConfig {
            method: ThresholdMethod::Percentile { quantile: 1.0 },
            fallback_window: 5,
            fallback_min_samples: 3,
            ..Default::default()
        };
        let mut rolling = RollingThreshold::new(&config);

        for volume in [1.0, 2.0, 3.0] {
            rolling.push(volume);
        }
        assert_eq!(rolling.threshold(), None);

        rolling.push(4.0);
        assert_eq!(rolling.threshold(), Some(4.0));

        // Oldest volumes roll out of the window
        for volume in [1.0, 1.0, 1.0, 1.0, 1.0] {
            rolling.push(volume);
        }
        assert_eq!(rolling.len(), 5);
        assert_eq!(rolling.threshold(), Some(1.0));
    }
}
