//! Divergence scoring over a rolling window of closed bars.
//!
//! A score compares the net change of a reference series (price, or LVC) with the normalised net
//! change of a feature over the same window. Changes of the same sign score positive
//! (confirmation), opposite signs score negative (divergence). The magnitude is the geometric mean
//! of the two normalised moves scaled by [`SCORE_GAIN`] and capped at 1.

use crate::model::Interval;
use serde::{Deserialize, Serialize};

/// Normalised change below which a series is considered flat.
const FLAT_CHANGE: f64 = 1e-12;

/// A joint normalised move of 0.1 (eg/ price +1% against 10% of window volume) scores 1.
pub const SCORE_GAIN: f64 = 10.0;

/// Feature values of one closed bar consumed by the [`DivergenceEngine`].
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct FeaturePoint {
    pub close: f64,
    pub volume: f64,
    pub large_volume: f64,
    pub lvc: f64,
    pub cvd: f64,
    pub obv: f64,
    pub rsi: f64,
    pub mfi: f64,
    pub clv: f64,
    pub vwap: f64,
}

/// Divergence scores attached to a closed bar, each in [-1, 1].
///
/// `available` is false until the window holds `lookback + 1` closed bars, in which case every
/// score is the neutral 0.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct DivergenceScores {
    pub available: bool,
    /// Fractional price change over the window.
    pub price_change: f64,
    pub price_lvc: f64,
    pub price_cvd: f64,
    pub price_obv: f64,
    pub price_rsi: f64,
    pub price_mfi: f64,
    pub price_clv: f64,
    pub price_vwap: f64,
    pub lvc_cvd: f64,
    pub lvc_obv: f64,
    pub lvc_rsi: f64,
    pub lvc_mfi: f64,
}

impl DivergenceScores {
    /// +1 / -1 when price rose / fell over the window, else 0.
    pub fn price_direction(&self) -> f64 {
        if self.price_change > 0.0 {
            1.0
        } else if self.price_change < 0.0 {
            -1.0
        } else {
            0.0
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DivergenceEngine {
    lookback_minutes: u32,
}

impl DivergenceEngine {
    pub fn new(lookback_minutes: u32) -> Self {
        Self { lookback_minutes }
    }

    /// Lookback in bars for `interval`, never fewer than two.
    pub fn lookback_bars(&self, interval: Interval) -> usize {
        interval.bars_for_minutes(self.lookback_minutes).max(2)
    }

    /// Score every pair over the trailing window of `history` (oldest first, closed bars only).
    pub fn score_window(&self, interval: Interval, history: &[FeaturePoint]) -> DivergenceScores {
        let lookback = self.lookback_bars(interval);
        if history.len() < lookback + 1 {
            return DivergenceScores::default();
        }
        let window = &history[history.len() - (lookback + 1)..];

        let (first, last) = (&window[0], &window[window.len() - 1]);
        let window_volume = window.iter().map(|point| point.volume).sum::<f64>();
        let window_large_volume = window.iter().map(|point| point.large_volume).sum::<f64>();

        let change = |feature: fn(&FeaturePoint) -> f64, normaliser: f64| {
            normalised_change(feature(first), feature(last), normaliser)
        };
        let price = change(|point| point.close, first.close);
        let lvc = change(|point| point.lvc, window_large_volume);
        let cvd = change(|point| point.cvd, window_volume);
        let obv = change(|point| point.obv, window_volume);
        let rsi = change(|point| point.rsi, 100.0);
        let mfi = change(|point| point.mfi, 100.0);
        let clv = change(|point| point.clv, 1.0);
        let vwap = change(|point| point.vwap, first.close);

        DivergenceScores {
            available: true,
            price_change: price,
            price_lvc: agreement(price, lvc),
            price_cvd: agreement(price, cvd),
            price_obv: agreement(price, obv),
            price_rsi: agreement(price, rsi),
            price_mfi: agreement(price, mfi),
            price_clv: agreement(price, clv),
            price_vwap: agreement(price, vwap),
            lvc_cvd: agreement(lvc, cvd),
            lvc_obv: agreement(lvc, obv),
            lvc_rsi: agreement(lvc, rsi),
            lvc_mfi: agreement(lvc, mfi),
        }
    }
}

/// Score one reference series against one feature series over the last `lookback` bars.
///
/// Each series contributes its change from `lookback` bars ago to the latest value, divided by its
/// normaliser. Returns `None` if fewer than `lookback + 1` values exist.
pub fn score(
    reference: &[f64],
    feature: &[f64],
    lookback: usize,
    reference_normaliser: f64,
    feature_normaliser: f64,
) -> Option<f64> {
    let len = lookback + 1;
    if reference.len() < len || feature.len() < len {
        return None;
    }
    let net = |series: &[f64], normaliser: f64| {
        normalised_change(series[series.len() - len], series[series.len() - 1], normaliser)
    };
    Some(agreement(
        net(reference, reference_normaliser),
        net(feature, feature_normaliser),
    ))
}

/// `(end - start) / normaliser`, or 0 if the normaliser is not usable.
fn normalised_change(start: f64, end: f64, normaliser: f64) -> f64 {
    if !normaliser.is_finite() || normaliser.abs() < f64::EPSILON {
        return 0.0;
    }
    let change = (end - start) / normaliser;
    if change.is_finite() { change } else { 0.0 }
}

/// Signed agreement of two normalised changes in [-1, 1]; a flat change agrees with nothing.
fn agreement(reference: f64, feature: f64) -> f64 {
    if reference.abs() < FLAT_CHANGE || feature.abs() < FLAT_CHANGE {
        return 0.0;
    }
    let strength = ((reference * feature).abs().sqrt() * SCORE_GAIN).min(1.0);
    strength * (reference * feature).signum()
}
