//! Core data types flowing through the pipeline.
//!
//! [`RawTick`]s arrive from a [`TickSource`](crate::pipeline::source::TickSource) in the same
//! shape regardless of origin, get enriched into [`EnrichedTick`]s, and are folded into bars.

use chrono::{DateTime, TimeDelta, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Instrument identifier (eg/ "MARUTI", "BTCUSDT").
#[derive(
    Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, From, Deserialize, Serialize,
)]
pub struct InstrumentId(pub SmolStr);

impl InstrumentId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for InstrumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Bar interval in whole minutes.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Deserialize, Serialize,
)]
#[display("{_0}m")]
#[serde(transparent)]
pub struct Interval(pub u32);

impl Interval {
    pub const MINUTES_PER_DAY: u32 = 24 * 60;

    pub fn minutes(&self) -> u32 {
        self.0
    }

    pub fn millis(&self) -> i64 {
        i64::from(self.0) * 60_000
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.0))
    }

    /// Start of the bucket containing `time`, aligned to a fixed epoch grid so live and
    /// replayed streams bucket identically.
    pub fn bucket_start(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let millis = self.millis();
        let aligned = time.timestamp_millis().div_euclid(millis) * millis;
        DateTime::from_timestamp_millis(aligned).unwrap_or(time)
    }

    /// Whole bars of this interval within `minutes`, at least one.
    ///
    /// Floors, so a window that is not a multiple of the interval is shortened: 5 minutes on 3m
    /// bars covers 3 minutes, and on 15m bars a single 15 minute bar.
    pub fn bars_for_minutes(&self, minutes: u32) -> usize {
        (minutes / self.0.max(1)).max(1) as usize
    }
}

/// Single order book price level.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
    #[serde(default)]
    pub orders: u32,
}

impl DepthLevel {
    pub fn new(price: f64, quantity: f64, orders: u32) -> Self {
        Self {
            price,
            quantity,
            orders,
        }
    }
}

/// Top-N order book depth, best level first on each side.
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct OrderDepth {
    #[serde(default)]
    pub bids: Vec<DepthLevel>,
    #[serde(default)]
    pub asks: Vec<DepthLevel>,
}

impl OrderDepth {
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.first()
    }
}

/// Normalised market update for one instrument. Immutable once produced.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct RawTick {
    pub instrument: InstrumentId,
    pub time: DateTime<Utc>,
    pub last_price: f64,
    #[serde(default)]
    pub last_quantity: f64,
    /// Cumulative traded volume for the session.
    #[serde(default)]
    pub volume_traded: f64,
    #[serde(default)]
    pub total_buy_quantity: f64,
    #[serde(default)]
    pub total_sell_quantity: f64,
    #[serde(default)]
    pub depth: Option<OrderDepth>,
}

/// Aggressor side inferred for a trade.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Deserialize, Serialize)]
pub enum TradeSign {
    Sell,
    #[default]
    Unknown,
    Buy,
}

impl TradeSign {
    pub fn value(&self) -> i8 {
        match self {
            TradeSign::Sell => -1,
            TradeSign::Unknown => 0,
            TradeSign::Buy => 1,
        }
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.value())
    }
}

/// [`RawTick`] plus features derived only from state at or before its own timestamp.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct EnrichedTick {
    pub tick: RawTick,
    /// Volume traded since the previous tick of this instrument.
    pub tick_volume: f64,
    pub trade_sign: TradeSign,
    pub is_large_trade: bool,
    pub is_buy_absorption: bool,
    pub is_sell_absorption: bool,
}

impl EnrichedTick {
    pub fn instrument(&self) -> &InstrumentId {
        &self.tick.instrument
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.tick.time
    }

    pub fn price(&self) -> f64 {
        self.tick.last_price
    }

    /// Signed volume contribution of this tick (0 for unclassified trades).
    pub fn signed_volume(&self) -> f64 {
        self.tick_volume * self.trade_sign.as_f64()
    }
}
