//! Incremental indicator accumulators, each updated once per closed bar in O(1) amortised time.
//!
//! Every accumulator is `Clone` so a provisional value can be computed on a scratch copy without
//! disturbing the live state.

use crate::error::DataError;
use chrono::NaiveDate;
use std::collections::VecDeque;

/// Neutral RSI / MFI value returned until enough bars exist.
pub const NEUTRAL_OSCILLATOR: f64 = 50.0;

/// Relative Strength Index with Wilder smoothing.
///
/// The first `period` close-to-close changes seed the averages with a simple mean, after which
/// `avg = (avg * (period - 1) + change) / period`.
#[derive(Clone, Debug)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    changes: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            changes: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    pub fn update(&mut self, close: f64) -> f64 {
        let Some(prev_close) = self.prev_close.replace(close) else {
            return NEUTRAL_OSCILLATOR;
        };

        let change = close - prev_close;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let period = self.period as f64;

        self.changes += 1;
        if self.changes <= self.period {
            self.avg_gain += gain / period;
            self.avg_loss += loss / period;
        } else {
            self.avg_gain = (self.avg_gain * (period - 1.0) + gain) / period;
            self.avg_loss = (self.avg_loss * (period - 1.0) + loss) / period;
        }

        self.value()
    }

    /// Current RSI, or [`NEUTRAL_OSCILLATOR`] while the history is insufficient.
    pub fn value(&self) -> f64 {
        self.try_value().unwrap_or(NEUTRAL_OSCILLATOR)
    }

    pub fn try_value(&self) -> Result<f64, DataError> {
        if self.changes < self.period {
            return Err(DataError::InsufficientHistory {
                indicator: "rsi",
                required: self.period + 1,
                available: self.changes + usize::from(self.prev_close.is_some()),
            });
        }
        Ok(match (self.avg_gain > 0.0, self.avg_loss > 0.0) {
            (_, true) => {
                let rs = self.avg_gain / self.avg_loss;
                (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
            }
            (true, false) => 100.0,
            (false, false) => NEUTRAL_OSCILLATOR,
        })
    }
}

/// Money Flow Index over rolling `period` sums of typical price × volume, signed by the change in
/// typical price. Unchanged typical price contributes no flow.
#[derive(Clone, Debug)]
pub struct Mfi {
    period: usize,
    prev_typical: Option<f64>,
    flows: VecDeque<f64>,
}

impl Mfi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_typical: None,
            flows: VecDeque::with_capacity(period.max(1)),
        }
    }

    pub fn update(&mut self, typical_price: f64, volume: f64) -> f64 {
        if let Some(prev) = self.prev_typical.replace(typical_price) {
            let raw_flow = typical_price * volume;
            let flow = if typical_price > prev {
                raw_flow
            } else if typical_price < prev {
                -raw_flow
            } else {
                0.0
            };

            if self.flows.len() == self.period {
                self.flows.pop_front();
            }
            self.flows.push_back(flow);
        }

        self.value()
    }

    pub fn value(&self) -> f64 {
        self.try_value().unwrap_or(NEUTRAL_OSCILLATOR)
    }

    pub fn try_value(&self) -> Result<f64, DataError> {
        if self.flows.len() < self.period {
            return Err(DataError::InsufficientHistory {
                indicator: "mfi",
                required: self.period + 1,
                available: self.flows.len() + usize::from(self.prev_typical.is_some()),
            });
        }

        let (positive, negative) = self.flows.iter().fold((0.0, 0.0), |(pos, neg), flow| {
            if *flow > 0.0 {
                (pos + flow, neg)
            } else {
                (pos, neg - flow)
            }
        });

        if positive + negative <= 0.0 {
            return Ok(NEUTRAL_OSCILLATOR);
        }
        Ok((100.0 * positive / (positive + negative)).clamp(0.0, 100.0))
    }
}

/// Sum of the most recent `window` values.
#[derive(Clone, Debug)]
pub struct RollingSum {
    window: usize,
    values: VecDeque<f64>,
}

impl RollingSum {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            values: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        if self.values.len() == self.window {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.sum()
    }

    /// Summed afresh each time so long runs never accumulate floating point drift.
    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// Exponential moving average with `alpha = 2 / (span + 1)`, seeded with the first value.
#[derive(Clone, Debug)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(span: usize) -> Self {
        Self {
            alpha: 2.0 / (span.max(1) as f64 + 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        let next = match self.value {
            Some(prev) => prev + self.alpha * (value - prev),
            None => value,
        };
        self.value = Some(next);
        next
    }
}

/// Session-scoped running totals: VWAP and OBV, reset when the session day changes.
#[derive(Clone, Debug, Default)]
pub struct SessionTotals {
    day: Option<NaiveDate>,
    price_volume: f64,
    volume: f64,
    obv: f64,
}

impl SessionTotals {
    /// Fold one closed bar into the session. Returns `(session_vwap, obv)`.
    pub fn update(
        &mut self,
        day: NaiveDate,
        price_volume: f64,
        volume: f64,
        signed_volume: f64,
        close: f64,
    ) -> (f64, f64) {
        if self.day != Some(day) {
            *self = Self {
                day: Some(day),
                ..Default::default()
            };
        }

        self.price_volume += price_volume;
        self.volume += volume;
        self.obv += signed_volume;

        let vwap = if self.volume > 0.0 {
            self.price_volume / self.volume
        } else {
            close
        };
        (vwap, self.obv)
    }
}

/// Close location value in [-1, 1], 0 for a zero range bar.
pub fn close_location_value(high: f64, low: f64, close: f64) -> f64 {
    let range = high - low;
    if range <= 0.0 {
        return 0.0;
    }
    (((close - low) - (high - close)) / range).clamp(-1.0, 1.0)
}
