//! Multi-interval bar aggregation.
//!
//! One [`BarAggregator`] per (instrument, interval) folds [`EnrichedTick`]s into bars aligned to a
//! fixed epoch grid. Crossing a bucket boundary closes the open bar, computes its indicators from
//! closed bars only, scores divergence, and opens the next bar. Empty buckets inside a session are
//! emitted as flat zero-volume bars so the time axis has no holes.

use crate::{
    bar::{
        indicator::{Ema, Mfi, RollingSum, Rsi, SessionTotals, close_location_value},
        structure::{StructureSnapshot, StructureTracker},
    },
    config::PipelineConfig,
    divergence::{DivergenceEngine, DivergenceScores, FeaturePoint},
    enrich::threshold::session_day,
    model::{EnrichedTick, InstrumentId, Interval, TradeSign},
};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Incremental indicator accumulators.
pub mod indicator;

/// Market structure labels, structure ratio and breakout acceptance.
pub mod structure;

/// Identity of a bar in the bar sink.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct BarKey {
    pub time: DateTime<Utc>,
    pub instrument: InstrumentId,
    pub interval: Interval,
}

/// Flow scores accumulated tick by tick while the bar is open.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct BarScores {
    pub trade_count: u32,
    /// Σ sign × volume.
    pub bar_delta: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    pub large_buy_volume: f64,
    pub large_sell_volume: f64,
    /// Volume of trades absorbed by a refilling bid.
    pub passive_buy_volume: f64,
    /// Volume of trades absorbed by a refilling ask.
    pub passive_sell_volume: f64,
    pub buy_absorptions: u32,
    pub sell_absorptions: u32,
}

impl BarScores {
    fn add(&mut self, tick: &EnrichedTick) {
        if tick.tick_volume <= 0.0 {
            return;
        }
        let volume = tick.tick_volume;

        self.trade_count += 1;
        self.bar_delta += tick.signed_volume();
        match tick.trade_sign {
            TradeSign::Buy => {
                self.buy_volume += volume;
                if tick.is_large_trade {
                    self.large_buy_volume += volume;
                }
            }
            TradeSign::Sell => {
                self.sell_volume += volume;
                if tick.is_large_trade {
                    self.large_sell_volume += volume;
                }
            }
            TradeSign::Unknown => {}
        }
        if tick.is_buy_absorption {
            self.buy_absorptions += 1;
            self.passive_buy_volume += volume;
        }
        if tick.is_sell_absorption {
            self.sell_absorptions += 1;
            self.passive_sell_volume += volume;
        }
    }

    pub fn large_volume(&self) -> f64 {
        self.large_buy_volume + self.large_sell_volume
    }

    /// Net aggressive large flow plus net passive (absorbed) flow.
    pub fn institutional_flow(&self) -> f64 {
        self.large_buy_volume - self.large_sell_volume + self.passive_buy_volume
            - self.passive_sell_volume
    }
}

/// Short-window EMA variants consumed by divergence scoring.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Smoothed {
    pub rsi: f64,
    pub mfi: f64,
    /// Smoothed CVD of the shortest configured lookback.
    pub cvd: f64,
    pub institutional_flow: f64,
    pub clv: f64,
}

#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct BarIndicators {
    pub rsi: f64,
    pub mfi: f64,
    /// Cumulative signed volume since the session start.
    pub obv: f64,
    /// Rolling signed volume keyed by lookback minutes.
    pub cvd: BTreeMap<u32, f64>,
    /// Running large buy minus large sell volume (LVC).
    pub lvc_delta: f64,
    pub institutional_flow: f64,
    pub clv: f64,
    pub structure: StructureSnapshot,
    pub smoothed: Smoothed,
}

/// Bar emitted on bucket close (or flushed as `partial` at shutdown).
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct ClosedBar {
    pub instrument: InstrumentId,
    pub interval: Interval,
    /// Bucket start.
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub session_vwap: f64,
    /// Flushed before its bucket closed.
    pub partial: bool,
    /// Flat zero-volume bar filling an empty bucket.
    pub carried: bool,
    pub scores: BarScores,
    pub indicators: BarIndicators,
    pub divergence: DivergenceScores,
}

impl ClosedBar {
    pub fn key(&self) -> BarKey {
        BarKey {
            time: self.time,
            instrument: self.instrument.clone(),
            interval: self.interval,
        }
    }

    /// Rolling CVD over `minutes`, if that lookback is configured.
    pub fn cvd(&self, minutes: u32) -> Option<f64> {
        self.indicators.cvd.get(&minutes).copied()
    }

    fn feature_point(&self) -> FeaturePoint {
        FeaturePoint {
            close: self.close,
            volume: self.volume,
            large_volume: self.scores.large_volume(),
            lvc: self.indicators.lvc_delta,
            cvd: self.indicators.smoothed.cvd,
            obv: self.indicators.obv,
            rsi: self.indicators.smoothed.rsi,
            mfi: self.indicators.smoothed.mfi,
            clv: self.indicators.smoothed.clv,
            vwap: self.session_vwap,
        }
    }
}

#[derive(Clone, Debug)]
struct OpenBar {
    time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    price_volume: f64,
    carried: bool,
    scores: BarScores,
}

impl OpenBar {
    fn new(time: DateTime<Utc>, tick: &EnrichedTick) -> Self {
        let mut bar = Self::carried(time, tick.price());
        bar.carried = false;
        bar.extend(tick);
        bar
    }

    fn carried(time: DateTime<Utc>, close: f64) -> Self {
        Self {
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            price_volume: 0.0,
            carried: true,
            scores: BarScores::default(),
        }
    }

    fn extend(&mut self, tick: &EnrichedTick) {
        let price = tick.price();
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        if tick.tick_volume > 0.0 {
            self.volume += tick.tick_volume;
            self.price_volume += price * tick.tick_volume;
        }
        self.scores.add(tick);
    }

    fn vwap(&self) -> f64 {
        if self.volume > 0.0 {
            self.price_volume / self.volume
        } else {
            self.close
        }
    }
}

#[derive(Clone, Debug)]
struct SmoothedEmas {
    rsi: Ema,
    mfi: Ema,
    cvd: Ema,
    institutional_flow: Ema,
    clv: Ema,
}

impl SmoothedEmas {
    fn new(span: usize) -> Self {
        Self {
            rsi: Ema::new(span),
            mfi: Ema::new(span),
            cvd: Ema::new(span),
            institutional_flow: Ema::new(span),
            clv: Ema::new(span),
        }
    }
}

/// Folds one instrument's enriched ticks into bars of one interval.
#[derive(Clone, Debug)]
pub struct BarAggregator {
    instrument: InstrumentId,
    interval: Interval,
    utc_offset: TimeDelta,
    open: Option<OpenBar>,
    rsi: Rsi,
    mfi: Mfi,
    session: SessionTotals,
    /// (lookback minutes, rolling sum over the matching number of bars), ascending.
    cvd: Vec<(u32, RollingSum)>,
    lvc_delta: f64,
    structure: StructureTracker,
    smoothed: SmoothedEmas,
    divergence: DivergenceEngine,
    history: VecDeque<FeaturePoint>,
    history_capacity: usize,
}

impl BarAggregator {
    pub fn new(instrument: InstrumentId, interval: Interval, config: &PipelineConfig) -> Self {
        let indicators = &config.indicators;

        let mut lookbacks = indicators.cvd_lookbacks.clone();
        lookbacks.sort_unstable();
        lookbacks.dedup();
        let cvd = lookbacks
            .into_iter()
            .map(|minutes| (minutes, RollingSum::new(interval.bars_for_minutes(minutes))))
            .collect();

        Self {
            instrument,
            interval,
            utc_offset: TimeDelta::minutes(i64::from(config.session_utc_offset_minutes)),
            open: None,
            rsi: Rsi::new(indicators.period),
            mfi: Mfi::new(indicators.period),
            session: SessionTotals::default(),
            cvd,
            lvc_delta: 0.0,
            structure: StructureTracker::new(
                config.signal.structure_window,
                config.signal.breakout_window,
            ),
            smoothed: SmoothedEmas::new(indicators.smoothing_span),
            divergence: DivergenceEngine::new(indicators.divergence_lookback),
            history: VecDeque::with_capacity(indicators.history_capacity.max(1)),
            history_capacity: indicators.history_capacity.max(1),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Fold `tick` into the open bar, returning any bars closed by crossing a bucket boundary.
    ///
    /// Ticks with a non-positive price never extend a bar.
    pub fn ingest(&mut self, tick: &EnrichedTick) -> Vec<ClosedBar> {
        if tick.price() <= 0.0 {
            return Vec::new();
        }

        let bucket = self.interval.bucket_start(tick.time());
        if let Some(open) = &mut self.open {
            if bucket == open.time {
                open.extend(tick);
                return Vec::new();
            }
            if bucket < open.time {
                debug!(
                    instrument = %self.instrument,
                    interval = %self.interval,
                    time = %tick.time(),
                    "ignoring tick older than the open bar"
                );
                return Vec::new();
            }
        }

        let mut closed = Vec::new();
        if let Some(open) = self.open.take() {
            let (start, close) = (open.time, open.close);
            closed.push(self.close_bar(open));

            // A new session opens its bar directly
            if session_day(start, self.utc_offset) == session_day(bucket, self.utc_offset) {
                let mut next = start + self.interval.duration();
                while next < bucket {
                    closed.push(self.close_bar(OpenBar::carried(next, close)));
                    next += self.interval.duration();
                }
            }
        }

        self.open = Some(OpenBar::new(bucket, tick));
        closed
    }

    /// Provisional bar for the in-progress bucket, computed on a scratch copy of the state.
    pub fn partial_bar(&self) -> Option<ClosedBar> {
        let open = self.open.clone()?;
        let mut scratch = self.clone();
        let mut bar = scratch.close_bar(open);
        bar.partial = true;
        Some(bar)
    }

    /// Take the in-progress bar as a `partial` [`ClosedBar`], leaving no bar open.
    pub fn flush(&mut self) -> Option<ClosedBar> {
        let bar = self.partial_bar();
        self.open = None;
        bar
    }

    fn close_bar(&mut self, bar: OpenBar) -> ClosedBar {
        let scores = bar.scores;
        let day = session_day(bar.time, self.utc_offset);
        let (session_vwap, obv) = self.session.update(
            day,
            bar.price_volume,
            bar.volume,
            scores.bar_delta,
            bar.close,
        );

        let rsi = self.rsi.update(bar.close);
        let typical_price = (bar.high + bar.low + bar.close) / 3.0;
        let mfi = self.mfi.update(typical_price, bar.volume);

        let cvd = self
            .cvd
            .iter_mut()
            .map(|(minutes, sum)| (*minutes, sum.update(scores.bar_delta)))
            .collect::<BTreeMap<_, _>>();
        let shortest_cvd = cvd.values().next().copied().unwrap_or_default();

        self.lvc_delta += scores.large_buy_volume - scores.large_sell_volume;
        let institutional_flow = scores.institutional_flow();
        let clv = close_location_value(bar.high, bar.low, bar.close);
        let structure = self.structure.update(bar.high, bar.low, bar.close);

        let smoothed = Smoothed {
            rsi: self.smoothed.rsi.update(rsi),
            mfi: self.smoothed.mfi.update(mfi),
            cvd: self.smoothed.cvd.update(shortest_cvd),
            institutional_flow: self.smoothed.institutional_flow.update(institutional_flow),
            clv: self.smoothed.clv.update(clv),
        };

        let mut closed = ClosedBar {
            instrument: self.instrument.clone(),
            interval: self.interval,
            time: bar.time,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            vwap: bar.vwap(),
            session_vwap,
            partial: false,
            carried: bar.carried,
            scores,
            indicators: BarIndicators {
                rsi,
                mfi,
                obv,
                cvd,
                lvc_delta: self.lvc_delta,
                institutional_flow,
                clv,
                structure,
                smoothed,
            },
            divergence: DivergenceScores::default(),
        };

        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(closed.feature_point());
        closed.divergence = self
            .divergence
            .score_window(self.interval, self.history.make_contiguous());

        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::InstrumentConfig,
        model::test_utils::{enriched, time},
    };

    fn aggregator(interval: u32) -> BarAggregator {
        let config = PipelineConfig::new([InstrumentConfig::new("A")]);
        BarAggregator::new(InstrumentId::new("A"), Interval(interval), &config)
    }

    #[test]
    fn test_cvd_and_obv_match_for_all_buy_flow() {
        let mut aggregator = aggregator(1);
        let closes = [100.0, 101.0, 102.0, 101.5, 103.0];
        let volumes = [1_000.0, 1_200.0, 900.0, 800.0, 1_500.0];

        let mut closed = closes
            .iter()
            .zip(volumes)
            .enumerate()
            .flat_map(|(minute, (close, volume))| {
                let tick = enriched("A", time(10, minute as u32, 30), *close, volume, TradeSign::Buy);
                aggregator.ingest(&tick)
            })
            .collect::<Vec<_>>();
        closed.extend(aggregator.ingest(&enriched("A", time(10, 5, 0), 103.0, 0.0, TradeSign::Unknown)));

        assert_eq!(closed.len(), 5);
        let last = closed.last().unwrap();
        assert_eq!(last.time, time(10, 4, 0));
        assert_eq!(last.cvd(5), Some(5_400.0));
        assert_eq!(last.indicators.obv, 5_400.0);
        assert_eq!(last.cvd(10), Some(5_400.0));
        assert_eq!(
            closed.iter().map(|bar| bar.close).collect::<Vec<_>>(),
            closes.to_vec()
        );
    }

    #[test]
    fn test_bar_ohlcv_and_scores() {
        let mut aggregator = aggregator(5);
        let ticks = [
            (time(10, 0, 5), 100.0, 10.0, TradeSign::Buy, false, false),
            (time(10, 1, 0), 102.0, 30.0, TradeSign::Buy, true, false),
            (time(10, 2, 0), 99.0, 20.0, TradeSign::Sell, true, true),
            (time(10, 4, 59), 101.0, 40.0, TradeSign::Sell, false, false),
        ];

        for (time, price, volume, sign, large, absorbed) in ticks {
            let mut tick = enriched("A", time, price, volume, sign);
            tick.is_large_trade = large;
            tick.is_buy_absorption = absorbed;
            assert!(aggregator.ingest(&tick).is_empty());
        }

        let closed = aggregator.ingest(&enriched("A", time(10, 5, 0), 101.0, 0.0, TradeSign::Unknown));
        assert_eq!(closed.len(), 1);
        let bar = &closed[0];

        assert_eq!((bar.open, bar.high, bar.low, bar.close), (100.0, 102.0, 99.0, 101.0));
        assert_eq!(bar.volume, 100.0);
        assert!((bar.vwap - 100.8).abs() < 1e-9);
        assert_eq!(bar.scores.trade_count, 4);
        assert_eq!(bar.scores.bar_delta, -20.0);
        assert_eq!(bar.scores.large_buy_volume, 30.0);
        assert_eq!(bar.scores.large_sell_volume, 20.0);
        assert_eq!(bar.scores.passive_buy_volume, 20.0);
        assert_eq!(bar.indicators.lvc_delta, 10.0);
        assert_eq!(bar.indicators.institutional_flow, 30.0);
        assert_eq!(bar.indicators.rsi, 50.0);
        assert!(!bar.divergence.available);
    }

    #[test]
    fn test_gap_buckets_are_carried_forward() {
        let mut aggregator = aggregator(1);
        aggregator.ingest(&enriched("A", time(10, 0, 10), 100.0, 5.0, TradeSign::Buy));

        let closed = aggregator.ingest(&enriched("A", time(10, 3, 10), 104.0, 5.0, TradeSign::Buy));

        assert_eq!(
            closed.iter().map(|bar| bar.time).collect::<Vec<_>>(),
            vec![time(10, 0, 0), time(10, 1, 0), time(10, 2, 0)]
        );
        assert!(!closed[0].carried);
        for bar in &closed[1..] {
            assert!(bar.carried);
            assert_eq!(bar.volume, 0.0);
            assert_eq!((bar.open, bar.high, bar.low, bar.close), (100.0, 100.0, 100.0, 100.0));
        }
    }

    #[test]
    fn test_new_session_opens_without_carried_bars() {
        let mut aggregator = aggregator(1);
        aggregator.ingest(&enriched("A", time(9, 59, 0), 100.0, 5.0, TradeSign::Buy));

        let next_session = time(3, 45, 0) + TimeDelta::days(1);
        let closed = aggregator.ingest(&enriched("A", next_session, 102.0, 5.0, TradeSign::Buy));

        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].time, time(9, 59, 0));
        assert!(!closed[0].carried);

        let open = aggregator.partial_bar().unwrap();
        assert_eq!(open.time, next_session);
        assert_eq!(open.open, 102.0);
    }

    #[test]
    fn test_single_cvd_lookback() {
        let config = PipelineConfig::new([InstrumentConfig::new("A")]).with_cvd_lookbacks([30]);
        let mut aggregator = BarAggregator::new(InstrumentId::new("A"), Interval(5), &config);

        // 30 minutes on 5 minute bars is a six bar window
        let closed = (0..9u32)
            .flat_map(|step| {
                let tick = enriched("A", time(10, step * 5, 0), 100.0, 10.0, TradeSign::Buy);
                aggregator.ingest(&tick)
            })
            .collect::<Vec<_>>();

        assert_eq!(closed.len(), 8);
        let last = closed.last().unwrap();
        assert_eq!(last.cvd(30), Some(60.0));
        assert_eq!(last.cvd(5), None);
        assert_eq!(last.indicators.cvd.len(), 1);
        assert_eq!(closed[2].cvd(30), Some(30.0));
    }

    #[test]
    fn test_non_positive_price_never_extends_bar() {
        let mut aggregator = aggregator(1);
        aggregator.ingest(&enriched("A", time(10, 0, 0), 100.0, 5.0, TradeSign::Buy));
        assert!(aggregator.ingest(&enriched("A", time(10, 0, 30), 0.0, 5.0, TradeSign::Buy)).is_empty());

        let bar = aggregator.flush().unwrap();
        assert_eq!(bar.low, 100.0);
        assert_eq!(bar.volume, 5.0);
    }

    #[test]
    fn test_partial_bar_does_not_disturb_state() {
        let mut aggregator = aggregator(1);
        let mut reference = aggregator.clone();

        for minute in 0..20u32 {
            let price = 100.0 + f64::from(minute % 4);
            let tick = enriched("A", time(10, minute, 0), price, 10.0, TradeSign::Buy);
            aggregator.ingest(&tick);
            reference.ingest(&tick);

            // Peeking must leave the aggregator bit-identical to one that never peeked
            let partial = aggregator.partial_bar().unwrap();
            assert!(partial.partial);
            assert_eq!(partial.time, time(10, minute, 0));
        }

        let next = enriched("A", time(10, 20, 0), 101.0, 10.0, TradeSign::Buy);
        assert_eq!(aggregator.ingest(&next), reference.ingest(&next));

        let flushed = aggregator.flush().unwrap();
        assert!(flushed.partial);
        assert!(aggregator.flush().is_none());
    }

    #[test]
    fn test_divergence_available_after_lookback() {
        let mut aggregator = aggregator(15);
        // 30 minute lookback on 15 minute bars = 2 bars, so the third closed bar is scored
        let closed = (0..4u32)
            .flat_map(|step| {
                let tick = enriched("A", time(10, step * 15, 0), 100.0 + f64::from(step), 10.0, TradeSign::Buy);
                aggregator.ingest(&tick)
            })
            .collect::<Vec<_>>();

        assert_eq!(closed.len(), 3);
        assert!(!closed[1].divergence.available);
        assert!(closed[2].divergence.available);
        assert!((closed[2].divergence.price_obv - 1.0).abs() < 1e-9);
    }
}
