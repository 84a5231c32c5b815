use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Market structure labels of a bar relative to the bar before it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct StructureLabel {
    pub higher_high: bool,
    pub higher_low: bool,
    pub lower_high: bool,
    pub lower_low: bool,
    pub inside: bool,
    pub outside: bool,
}

impl StructureLabel {
    pub fn compare(prev_high: f64, prev_low: f64, high: f64, low: f64) -> Self {
        Self {
            higher_high: high > prev_high,
            higher_low: low > prev_low,
            lower_high: high < prev_high,
            lower_low: low < prev_low,
            inside: high <= prev_high && low >= prev_low,
            outside: high > prev_high && low < prev_low,
        }
    }

    /// Count of bullish labels (HH, HL).
    pub fn bullish(&self) -> u32 {
        u32::from(self.higher_high) + u32::from(self.higher_low)
    }

    /// Count of bearish labels (LH, LL).
    pub fn bearish(&self) -> u32 {
        u32::from(self.lower_high) + u32::from(self.lower_low)
    }
}

/// Structure derived for one closed bar.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct StructureSnapshot {
    pub label: StructureLabel,
    /// `(bullish - bearish) / (bullish + bearish)` over the structure window, in [-1, 1].
    pub structure_ratio: f64,
    /// +1 / -1 when the close breaks above / below the preceding breakout range, else 0.
    pub price_acceptance: i8,
    /// High of the preceding breakout range, if complete.
    pub range_high: Option<f64>,
    /// Low of the preceding breakout range, if complete.
    pub range_low: Option<f64>,
}

/// Rolling structure state for one (instrument, interval).
#[derive(Clone, Debug)]
pub struct StructureTracker {
    structure_window: usize,
    breakout_window: usize,
    labels: VecDeque<StructureLabel>,
    ranges: VecDeque<(f64, f64)>,
}

impl StructureTracker {
    pub fn new(structure_window: usize, breakout_window: usize) -> Self {
        Self {
            structure_window: structure_window.max(1),
            breakout_window: breakout_window.max(1),
            labels: VecDeque::with_capacity(structure_window.max(1)),
            ranges: VecDeque::with_capacity(breakout_window.max(1) + 1),
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> StructureSnapshot {
        let label = self
            .ranges
            .back()
            .map(|(prev_high, prev_low)| StructureLabel::compare(*prev_high, *prev_low, high, low))
            .unwrap_or_default();

        let (range_high, range_low) = if self.ranges.len() == self.breakout_window {
            let range_high = self.ranges.iter().map(|(high, _)| *high).fold(f64::MIN, f64::max);
            let range_low = self.ranges.iter().map(|(_, low)| *low).fold(f64::MAX, f64::min);
            (Some(range_high), Some(range_low))
        } else {
            (None, None)
        };

        let price_acceptance = match (range_high, range_low) {
            (Some(range_high), _) if close > range_high => 1,
            (_, Some(range_low)) if close < range_low => -1,
            _ => 0,
        };

        if self.ranges.len() == self.breakout_window {
            self.ranges.pop_front();
        }
        self.ranges.push_back((high, low));

        if self.labels.len() == self.structure_window {
            self.labels.pop_front();
        }
        self.labels.push_back(label);

        StructureSnapshot {
            label,
            structure_ratio: self.ratio(),
            price_acceptance,
            range_high,
            range_low,
        }
    }

    fn ratio(&self) -> f64 {
        let (bullish, bearish) = self
            .labels
            .iter()
            .fold((0, 0), |(bull, bear), label| {
                (bull + label.bullish(), bear + label.bearish())
            });

        if bullish + bearish == 0 {
            return 0.0;
        }
        (f64::from(bullish) - f64::from(bearish)) / f64::from(bullish + bearish)
    }
}
