//! Tick enrichment: trade sign, large trade flag and absorption flags.

use crate::{
    config::{AbsorptionPolicy, InstrumentConfig, ThresholdConfig},
    enrich::{
        book::OrderBookState,
        classifier::TradeClassifier,
        threshold::{RollingThreshold, ThresholdProvider},
    },
    error::DataError,
    model::{EnrichedTick, InstrumentId, RawTick, TradeSign},
};
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;
use std::sync::Arc;
use tracing::debug;

/// Aggressor side inference.
pub mod classifier;

/// Large trade thresholds.
pub mod threshold;

/// Order book absorption detection.
pub mod book;

/// Everything the enricher owns for one instrument.
#[derive(Debug)]
struct InstrumentFeatures {
    classifier: TradeClassifier,
    book: OrderBookState,
    fallback: RollingThreshold,
    last_volume_traded: Option<f64>,
    last_time: Option<DateTime<Utc>>,
}

/// Composes the classifier, threshold provider and order book tracker against per-instrument
/// state. Output depends only on prior state and the input tick.
pub struct FeatureEnricher {
    thresholds: Arc<dyn ThresholdProvider>,
    instruments: FnvHashMap<InstrumentId, InstrumentFeatures>,
}

impl std::fmt::Debug for FeatureEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureEnricher")
            .field("instruments", &self.instruments)
            .finish_non_exhaustive()
    }
}

impl FeatureEnricher {
    pub fn new<'a>(
        instruments: impl IntoIterator<Item = &'a InstrumentConfig>,
        thresholds: Arc<dyn ThresholdProvider>,
        threshold_config: &ThresholdConfig,
        policy: AbsorptionPolicy,
    ) -> Self {
        let instruments = instruments
            .into_iter()
            .map(|instrument| {
                (
                    instrument.id.clone(),
                    InstrumentFeatures {
                        classifier: TradeClassifier::default(),
                        book: OrderBookState::new(instrument.absorption_refill_threshold, policy),
                        fallback: RollingThreshold::new(threshold_config),
                        last_volume_traded: None,
                        last_time: None,
                    },
                )
            })
            .collect();

        Self {
            thresholds,
            instruments,
        }
    }

    pub fn enrich(&mut self, tick: RawTick) -> Result<EnrichedTick, DataError> {
        let Some(state) = self.instruments.get_mut(&tick.instrument) else {
            return Err(DataError::UnknownInstrument(tick.instrument));
        };

        if let Some(last) = state.last_time {
            if tick.time < last {
                return Err(DataError::DataGap {
                    instrument: tick.instrument,
                    last,
                    received: tick.time,
                });
            }
        }
        state.last_time = Some(tick.time);

        let tick_volume = state
            .last_volume_traded
            .map(|prev| (tick.volume_traded - prev).max(0.0))
            .unwrap_or(0.0);
        state.last_volume_traded = Some(tick.volume_traded);

        let best_bid = tick
            .depth
            .as_ref()
            .and_then(|depth| depth.best_bid())
            .map(|level| level.price)
            .or(state.book.best_bid());
        let best_ask = tick
            .depth
            .as_ref()
            .and_then(|depth| depth.best_ask())
            .map(|level| level.price)
            .or(state.book.best_ask());

        let trade_sign = if tick.last_price > 0.0 {
            state.classifier.classify(tick.last_price, best_bid, best_ask)
        } else {
            TradeSign::Unknown
        };

        let is_large_trade = if tick_volume > 0.0 {
            let threshold = self
                .thresholds
                .threshold(&tick.instrument, tick.time)
                .or_else(|| state.fallback.threshold());
            state.fallback.push(tick_volume);

            match threshold {
                Some(threshold) => tick_volume >= threshold,
                None => {
                    debug!(
                        error = %DataError::ThresholdUnavailable(tick.instrument.clone()),
                        "treating trade as not large"
                    );
                    false
                }
            }
        } else {
            false
        };

        let absorption = state.book.update(&tick, tick_volume, trade_sign);

        Ok(EnrichedTick {
            tick,
            tick_volume,
            trade_sign,
            is_large_trade,
            is_buy_absorption: absorption.buy,
            is_sell_absorption: absorption.sell,
        })
    }
}
