//! Composite sensors and the multi-bar entry/exit state machine.
//!
//! ```text
//! IDLE -> REGIME_BUILDING -> ARMED -> IN_POSITION -> IDLE
//! ```
//!
//! PATH is the bar's structure ratio, COST averages the price-vs-VWAP and price-vs-OBV divergence
//! scores and PRESSURE is the price-vs-CLV score. COST and PRESSURE are signed by the direction of
//! the window's price move, so a confirmed decline reads negative like its PATH. A regime needs PATH and COST to hold the same
//! non-neutral sign for consecutive closed bars; an armed regime enters on a breakout of the
//! preceding range. Exits are immediate.
//!
//! The three sensor model only enters a breakout that comes with a tape pullback (PRESSURE against
//! the regime beyond T). It adds a price stop that trending structure can veto, a trend break exit
//! inside the PATH chop band, a single partial exit once the pullback resolves, and a full exit on
//! extreme PRESSURE.

use crate::{
    bar::ClosedBar,
    config::{SensorModel, SignalConfig, SignalThresholds},
    divergence::DivergenceScores,
    model::{InstrumentId, Interval},
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    fn from_sign(sign: i8) -> Option<Self> {
        match sign {
            1 => Some(Self::Long),
            -1 => Some(Self::Short),
            _ => None,
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPhase {
    #[default]
    Idle,
    RegimeBuilding,
    Armed,
    InPosition,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Entry,
    /// Scale out of part of the position; the position stays open.
    PartialExit,
    Exit,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    Breakout,
    /// Breakout during a tape pullback against the regime.
    Pullback,
    CostFlip,
    PathFlip,
    /// PATH fell inside the chop band.
    TrendBreak,
    /// Close through the stop price with no trending structure to veto it.
    StructuralStopLoss,
    /// Tape turned with the position while COST still lags it.
    DivergenceResolved,
    PressureExhaustion,
}

/// Composite sensors of one closed bar.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Sensors {
    pub path: f64,
    pub cost: f64,
    pub pressure: f64,
}

impl Sensors {
    pub fn new(path: f64, divergence: &DivergenceScores) -> Self {
        let direction = divergence.price_direction();
        Self {
            path,
            cost: direction * (divergence.price_vwap + divergence.price_obv) / 2.0,
            pressure: direction * divergence.price_clv,
        }
    }
}

impl From<&ClosedBar> for Sensors {
    fn from(bar: &ClosedBar) -> Self {
        Self::new(bar.indicators.structure.structure_ratio, &bar.divergence)
    }
}

/// The slice of a closed bar the state machine consumes.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SignalInput {
    pub time: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// +1 / -1 when the close broke above / below the preceding range.
    pub price_acceptance: i8,
    pub sensors: Sensors,
    /// COST components, signed like COST.
    pub price_vwap: f64,
    pub price_obv: f64,
}

impl From<&ClosedBar> for SignalInput {
    fn from(bar: &ClosedBar) -> Self {
        Self {
            time: bar.time,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            price_acceptance: bar.indicators.structure.price_acceptance,
            sensors: Sensors::from(bar),
            price_vwap: bar.divergence.price_direction() * bar.divergence.price_vwap,
            price_obv: bar.divergence.price_direction() * bar.divergence.price_obv,
        }
    }
}

/// Append-only ENTRY / EXIT record.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SignalEvent {
    pub instrument: InstrumentId,
    pub interval: Interval,
    pub time: DateTime<Utc>,
    pub kind: SignalKind,
    pub reason: SignalReason,
    pub direction: Direction,
    pub price: f64,
    pub sensors: Sensors,
    pub thresholds: SignalThresholds,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Three sensor model stop price.
    pub stop_price: Option<f64>,
    /// Realised PnL %, exits only.
    pub pnl_pct: Option<f64>,
    /// Maximum favourable excursion %, exits only.
    pub mfe_pct: Option<f64>,
    /// Maximum adverse excursion %, exits only.
    pub mae_pct: Option<f64>,
}

#[derive(Copy, Clone, PartialEq, Debug)]
struct Position {
    direction: Direction,
    entry_price: f64,
    entry_time: DateTime<Utc>,
    thresholds: SignalThresholds,
    stop_price: Option<f64>,
    scaled_out: bool,
    highest: f64,
    lowest: f64,
}

impl Position {
    fn pct(&self, price: f64) -> f64 {
        self.direction.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    fn excursions(&self) -> (f64, f64) {
        match self.direction {
            Direction::Long => (self.pct(self.highest), self.pct(self.lowest)),
            Direction::Short => (self.pct(self.lowest), self.pct(self.highest)),
        }
    }

    fn stop_hit(&self, close: f64) -> bool {
        match (self.stop_price, self.direction) {
            (Some(stop), Direction::Long) => close <= stop,
            (Some(stop), Direction::Short) => close >= stop,
            (None, _) => false,
        }
    }
}

/// Per-instrument signal state, advanced only on closed bars.
#[derive(Clone, Debug)]
pub struct SignalStateMachine {
    instrument: InstrumentId,
    interval: Interval,
    thresholds: SignalThresholds,
    config: SignalConfig,
    phase: SignalPhase,
    regime_sign: i8,
    regime_count: u32,
    position: Option<Position>,
}

impl SignalStateMachine {
    pub fn new(
        instrument: InstrumentId,
        interval: Interval,
        thresholds: SignalThresholds,
        config: SignalConfig,
    ) -> Self {
        Self {
            instrument,
            interval,
            thresholds,
            config,
            phase: SignalPhase::Idle,
            regime_sign: 0,
            regime_count: 0,
            position: None,
        }
    }

    pub fn phase(&self) -> SignalPhase {
        self.phase
    }

    pub fn regime_count(&self) -> u32 {
        self.regime_count
    }

    pub fn direction(&self) -> Option<Direction> {
        self.position.map(|position| position.direction)
    }

    /// Advance on a closed bar of the signal interval. Partial bars are ignored.
    pub fn on_bar(&mut self, bar: &ClosedBar) -> Option<SignalEvent> {
        if bar.partial || bar.interval != self.interval {
            return None;
        }
        self.step(SignalInput::from(bar))
    }

    pub fn step(&mut self, input: SignalInput) -> Option<SignalEvent> {
        match self.phase {
            SignalPhase::InPosition => self.manage_position(input),
            SignalPhase::Armed => {
                self.track_regime(input.sensors);
                if self.phase == SignalPhase::Armed {
                    self.try_enter(input)
                } else {
                    None
                }
            }
            SignalPhase::Idle | SignalPhase::RegimeBuilding => {
                self.track_regime(input.sensors);
                None
            }
        }
    }

    /// Sign shared by PATH and COST outside their neutral bands, else 0.
    fn regime(&self, sensors: Sensors) -> i8 {
        let band_sign = |value: f64, band: f64| -> i8 {
            if value.abs() <= band {
                0
            } else if value > 0.0 {
                1
            } else {
                -1
            }
        };

        let path = band_sign(sensors.path, self.thresholds.regime);
        let cost = band_sign(sensors.cost, self.thresholds.cost);
        if path != 0 && path == cost { path } else { 0 }
    }

    fn track_regime(&mut self, sensors: Sensors) {
        let regime = self.regime(sensors);

        if regime == 0 {
            self.regime_sign = 0;
            self.regime_count = 0;
            self.phase = SignalPhase::Idle;
            return;
        }

        if regime == self.regime_sign {
            self.regime_count = self.regime_count.saturating_add(1);
        } else {
            self.regime_sign = regime;
            self.regime_count = 1;
        }

        self.phase = if self.regime_count >= self.config.regime_bars {
            SignalPhase::Armed
        } else {
            SignalPhase::RegimeBuilding
        };
    }

    fn try_enter(&mut self, input: SignalInput) -> Option<SignalEvent> {
        if input.price_acceptance != self.regime_sign {
            return None;
        }
        let direction = Direction::from_sign(self.regime_sign)?;

        let (reason, stop_price) = match self.config.sensor_model {
            SensorModel::TwoSensor => (SignalReason::Breakout, None),
            SensorModel::ThreeSensor => {
                if direction.sign() * input.sensors.pressure >= -self.thresholds.timing {
                    debug!(
                        instrument = %self.instrument,
                        %direction,
                        pressure = input.sensors.pressure,
                        "breakout without a pullback"
                    );
                    return None;
                }
                let stop = input.close * (1.0 - direction.sign() * self.config.stop_loss_pct / 100.0);
                (SignalReason::Pullback, Some(stop))
            }
        };

        let position = Position {
            direction,
            entry_price: input.close,
            entry_time: input.time,
            thresholds: self.thresholds,
            stop_price,
            scaled_out: false,
            highest: input.close,
            lowest: input.close,
        };
        self.position = Some(position);
        self.phase = SignalPhase::InPosition;

        info!(
            instrument = %self.instrument,
            interval = %self.interval,
            %direction,
            price = input.close,
            path = input.sensors.path,
            cost = input.sensors.cost,
            "ENTRY"
        );

        Some(SignalEvent {
            instrument: self.instrument.clone(),
            interval: self.interval,
            time: input.time,
            kind: SignalKind::Entry,
            reason,
            direction,
            price: input.close,
            sensors: input.sensors,
            thresholds: position.thresholds,
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            stop_price: position.stop_price,
            pnl_pct: None,
            mfe_pct: None,
            mae_pct: None,
        })
    }

    fn manage_position(&mut self, input: SignalInput) -> Option<SignalEvent> {
        let position = self.position.as_mut()?;
        position.highest = position.highest.max(input.high);
        position.lowest = position.lowest.min(input.low);
        let position = *position;

        let reason = match self.config.sensor_model {
            SensorModel::TwoSensor => self.two_sensor_exit(&position, input.sensors),
            SensorModel::ThreeSensor => self.three_sensor_exit(&position, input),
        }?;

        if reason == SignalReason::DivergenceResolved {
            if let Some(position) = self.position.as_mut() {
                position.scaled_out = true;
            }
            info!(
                instrument = %self.instrument,
                interval = %self.interval,
                direction = %position.direction,
                %reason,
                price = input.close,
                "PARTIAL_EXIT"
            );
            return Some(self.exit_event(&position, input, SignalKind::PartialExit, reason));
        }

        self.position = None;
        self.phase = SignalPhase::Idle;
        self.regime_sign = 0;
        self.regime_count = 0;

        info!(
            instrument = %self.instrument,
            interval = %self.interval,
            direction = %position.direction,
            %reason,
            price = input.close,
            pnl_pct = position.pct(input.close),
            "EXIT"
        );
        Some(self.exit_event(&position, input, SignalKind::Exit, reason))
    }

    fn two_sensor_exit(&self, position: &Position, sensors: Sensors) -> Option<SignalReason> {
        let direction = position.direction.sign();
        if direction * sensors.cost < 0.0 {
            Some(SignalReason::CostFlip)
        } else if direction * sensors.path < 0.0 {
            Some(SignalReason::PathFlip)
        } else {
            None
        }
    }

    /// Stop first, then structural exits, then tape driven scaling and exhaustion.
    fn three_sensor_exit(&self, position: &Position, input: SignalInput) -> Option<SignalReason> {
        let direction = position.direction.sign();
        let sensors = input.sensors;
        let chop = self.config.path_chop;

        if position.stop_hit(input.close) {
            if direction * sensors.path > chop {
                debug!(
                    instrument = %self.instrument,
                    close = input.close,
                    stop_price = ?position.stop_price,
                    path = sensors.path,
                    "stop vetoed by trending structure"
                );
            } else {
                return Some(SignalReason::StructuralStopLoss);
            }
        }

        if direction * sensors.cost < 0.0 {
            return Some(SignalReason::CostFlip);
        }
        if direction * sensors.path <= -chop {
            return Some(SignalReason::PathFlip);
        }
        if sensors.path.abs() < chop {
            return Some(SignalReason::TrendBreak);
        }

        let tape_turned = direction * sensors.pressure > 0.0;
        let cost_lagging = direction * input.price_obv < 0.0 || direction * input.price_vwap < 0.0;
        if !position.scaled_out && tape_turned && cost_lagging {
            return Some(SignalReason::DivergenceResolved);
        }

        if direction * sensors.pressure > self.config.pressure_exhaustion {
            return Some(SignalReason::PressureExhaustion);
        }
        None
    }

    fn exit_event(
        &self,
        position: &Position,
        input: SignalInput,
        kind: SignalKind,
        reason: SignalReason,
    ) -> SignalEvent {
        let (mfe_pct, mae_pct) = position.excursions();
        SignalEvent {
            instrument: self.instrument.clone(),
            interval: self.interval,
            time: input.time,
            kind,
            reason,
            direction: position.direction,
            price: input.close,
            sensors: input.sensors,
            thresholds: position.thresholds,
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            stop_price: position.stop_price,
            pnl_pct: Some(position.pct(input.close)),
            mfe_pct: Some(mfe_pct),
            mae_pct: Some(mae_pct),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PipelineConfig, model::test_utils::time};

    fn state_machine(sensor_model: SensorModel) -> SignalStateMachine {
        let config = PipelineConfig::default().with_sensor_model(sensor_model);
        SignalStateMachine::new(
            InstrumentId::new("A"),
            Interval(5),
            SignalThresholds::default(),
            config.signal,
        )
    }

    fn bar(minute: u32, close: f64, acceptance: i8, path: f64, cost: f64) -> SignalInput {
        SignalInput {
            time: time(10, minute, 0),
            high: close + 0.5,
            low: close - 0.5,
            close,
            price_acceptance: acceptance,
            sensors: Sensors {
                path,
                cost,
                pressure: 0.0,
            },
            price_vwap: cost,
            price_obv: cost,
        }
    }

    fn with_pressure(mut input: SignalInput, pressure: f64) -> SignalInput {
        input.sensors.pressure = pressure;
        input
    }

    /// Three sensor long entered at 100.0, stop at 99.7.
    fn three_sensor_long() -> SignalStateMachine {
        let mut machine = state_machine(SensorModel::ThreeSensor);
        for minute in 0..3 {
            machine.step(bar(minute, 100.0, 0, 0.5, 0.5));
        }
        let entry = machine.step(with_pressure(bar(3, 100.0, 1, 0.5, 0.5), -0.5)).unwrap();
        assert_eq!(entry.reason, SignalReason::Pullback);
        machine
    }

    #[test]
    fn test_sensors_follow_price_direction() {
        let falling = DivergenceScores {
            available: true,
            price_change: -0.01,
            price_vwap: 0.4,
            price_obv: 0.8,
            price_clv: -0.5,
            ..Default::default()
        };
        let sensors = Sensors::new(-0.5, &falling);
        // Confirmed decline: negative COST like PATH
        assert!((sensors.cost + 0.6).abs() < 1e-9);
        // CLV rising against the decline
        assert!((sensors.pressure - 0.5).abs() < 1e-9);

        let rising = DivergenceScores {
            price_change: 0.01,
            ..falling
        };
        let sensors = Sensors::new(0.5, &rising);
        assert!((sensors.cost - 0.6).abs() < 1e-9);
        assert!((sensors.pressure + 0.5).abs() < 1e-9);

        assert_eq!(Sensors::new(0.0, &DivergenceScores::default()), Sensors::default());
    }

    #[test]
    fn test_neutral_bar_resets_regime() {
        let mut machine = state_machine(SensorModel::TwoSensor);

        for minute in 0..3 {
            assert!(machine.step(bar(minute, 100.0, 0, 0.4, 0.5)).is_none());
        }
        assert_eq!(machine.phase(), SignalPhase::Armed);
        assert_eq!(machine.regime_count(), 3);

        assert!(machine.step(bar(3, 100.0, 1, 0.4, 0.05)).is_none());
        assert_eq!(machine.phase(), SignalPhase::Idle);
        assert_eq!(machine.regime_count(), 0);
    }

    #[test]
    fn test_regime_transitions() {
        struct TestCase {
            bars: Vec<SignalInput>,
            expected_phase: SignalPhase,
            expected_count: u32,
            expected_events: usize,
        }

        let tests = vec![
            TestCase {
                // TC0: two aligned bars are still building
                bars: vec![bar(0, 100.0, 0, 0.4, 0.5), bar(1, 100.0, 1, 0.4, 0.5)],
                expected_phase: SignalPhase::RegimeBuilding,
                expected_count: 2,
                expected_events: 0,
            },
            TestCase {
                // TC1: breakout on the arming bar itself does not enter
                bars: vec![
                    bar(0, 100.0, 1, 0.4, 0.5),
                    bar(1, 100.0, 1, 0.4, 0.5),
                    bar(2, 100.0, 1, 0.4, 0.5),
                ],
                expected_phase: SignalPhase::Armed,
                expected_count: 3,
                expected_events: 0,
            },
            TestCase {
                // TC2: PATH and COST disagree in sign
                bars: vec![bar(0, 100.0, 0, 0.4, -0.5), bar(1, 100.0, 0, 0.4, -0.5)],
                expected_phase: SignalPhase::Idle,
                expected_count: 0,
                expected_events: 0,
            },
            TestCase {
                // TC3: opposite sign restarts building at one
                bars: vec![
                    bar(0, 100.0, 0, 0.4, 0.5),
                    bar(1, 100.0, 0, 0.4, 0.5),
                    bar(2, 100.0, 0, -0.4, -0.5),
                ],
                expected_phase: SignalPhase::RegimeBuilding,
                expected_count: 1,
                expected_events: 0,
            },
            TestCase {
                // TC4: armed, then opposite sign bar disarms into building
                bars: vec![
                    bar(0, 100.0, 0, -0.4, -0.5),
                    bar(1, 100.0, 0, -0.4, -0.5),
                    bar(2, 100.0, 0, -0.4, -0.5),
                    bar(3, 100.0, 1, 0.4, 0.5),
                ],
                expected_phase: SignalPhase::RegimeBuilding,
                expected_count: 1,
                expected_events: 0,
            },
            TestCase {
                // TC5: three aligned bars then a breakout enters
                bars: vec![
                    bar(0, 100.0, 0, 0.4, 0.5),
                    bar(1, 100.0, 0, 0.4, 0.5),
                    bar(2, 100.0, 0, 0.4, 0.5),
                    bar(3, 101.0, 1, 0.4, 0.5),
                ],
                expected_phase: SignalPhase::InPosition,
                expected_count: 4,
                expected_events: 1,
            },
            TestCase {
                // TC6: breakout against the regime direction does not enter
                bars: vec![
                    bar(0, 100.0, 0, 0.4, 0.5),
                    bar(1, 100.0, 0, 0.4, 0.5),
                    bar(2, 100.0, 0, 0.4, 0.5),
                    bar(3, 99.0, -1, 0.4, 0.5),
                ],
                expected_phase: SignalPhase::Armed,
                expected_count: 4,
                expected_events: 0,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut machine = state_machine(SensorModel::TwoSensor);
            let events = test
                .bars
                .into_iter()
                .filter_map(|input| machine.step(input))
                .count();
            assert_eq!(machine.phase(), test.expected_phase, "TC{} failed", index);
            assert_eq!(machine.regime_count(), test.expected_count, "TC{} failed", index);
            assert_eq!(events, test.expected_events, "TC{} failed", index);
        }
    }

    #[test]
    fn test_entry_then_cost_flip_exit() {
        let mut machine = state_machine(SensorModel::TwoSensor);
        for minute in 0..3 {
            machine.step(bar(minute, 100.0, 0, -0.5, -0.6));
        }

        let entry = machine.step(bar(3, 100.0, -1, -0.5, -0.6)).unwrap();
        assert_eq!(entry.kind, SignalKind::Entry);
        assert_eq!(entry.reason, SignalReason::Breakout);
        assert_eq!(entry.direction, Direction::Short);
        assert_eq!(entry.thresholds, SignalThresholds::default());
        assert_eq!(machine.direction(), Some(Direction::Short));

        // Still aligned with the short, even though inside the neutral band
        assert!(machine.step(bar(4, 98.0, 0, -0.1, -0.1)).is_none());

        // COST crosses to the long side: exit immediately
        let exit = machine.step(bar(5, 97.0, 0, -0.5, 0.01)).unwrap();
        assert_eq!(exit.kind, SignalKind::Exit);
        assert_eq!(exit.reason, SignalReason::CostFlip);
        assert_eq!(exit.entry_price, 100.0);
        assert!((exit.pnl_pct.unwrap() - 3.0).abs() < 1e-9);
        // Lowest low since entry 96.5 => +3.5% favourable, never traded above the entry
        assert!((exit.mfe_pct.unwrap() - 3.5).abs() < 1e-9);
        assert_eq!(exit.mae_pct, Some(0.0));
        assert_eq!(machine.phase(), SignalPhase::Idle);
        assert_eq!(machine.regime_count(), 0);
    }

    #[test]
    fn test_path_flip_exit() {
        let mut machine = state_machine(SensorModel::TwoSensor);
        for minute in 0..3 {
            machine.step(bar(minute, 100.0, 0, 0.5, 0.5));
        }
        machine.step(bar(3, 102.0, 1, 0.5, 0.5)).unwrap();

        let exit = machine.step(bar(4, 101.0, 0, -0.05, 0.5)).unwrap();
        assert_eq!(exit.reason, SignalReason::PathFlip);
        assert!(exit.pnl_pct.unwrap() < 0.0);
    }

    #[test]
    fn test_three_sensor_enters_on_pullback_only() {
        let mut machine = state_machine(SensorModel::ThreeSensor);
        for minute in 0..3 {
            machine.step(bar(minute, 100.0, 0, 0.5, 0.5));
        }

        // Breakout with the tape running in the regime direction waits
        assert!(machine.step(with_pressure(bar(3, 101.0, 1, 0.5, 0.5), 0.2)).is_none());
        // A shallow pullback is not enough
        assert!(machine.step(with_pressure(bar(4, 101.0, 1, 0.5, 0.5), -0.35)).is_none());
        assert_eq!(machine.phase(), SignalPhase::Armed);

        let entry = machine.step(with_pressure(bar(5, 102.0, 1, 0.5, 0.5), -0.5)).unwrap();
        assert_eq!(entry.kind, SignalKind::Entry);
        assert_eq!(entry.reason, SignalReason::Pullback);
        assert_eq!(entry.direction, Direction::Long);
        assert!((entry.stop_price.unwrap() - 101.694).abs() < 1e-9);
        assert_eq!(machine.phase(), SignalPhase::InPosition);

        // Short regimes need the tape pulling back upwards
        let mut machine = state_machine(SensorModel::ThreeSensor);
        for minute in 0..3 {
            machine.step(bar(minute, 100.0, 0, -0.5, -0.5));
        }
        let entry = machine.step(with_pressure(bar(3, 100.0, -1, -0.5, -0.5), 0.5)).unwrap();
        assert_eq!(entry.direction, Direction::Short);
        assert!((entry.stop_price.unwrap() - 100.3).abs() < 1e-9);

        // Two sensor model ignores pressure entirely
        let mut machine = state_machine(SensorModel::TwoSensor);
        for minute in 0..3 {
            machine.step(bar(minute, 100.0, 0, 0.5, 0.5));
        }
        let entry = machine.step(with_pressure(bar(3, 101.0, 1, 0.5, 0.5), 0.2)).unwrap();
        assert_eq!(entry.reason, SignalReason::Breakout);
        assert_eq!(entry.stop_price, None);
    }

    #[test]
    fn test_three_sensor_exits() {
        struct TestCase {
            input: SignalInput,
            expected: Option<SignalReason>,
        }

        let tests = vec![
            TestCase {
                // TC0: close through the stop while structure is choppy
                input: bar(4, 99.6, 0, 0.1, 0.5),
                expected: Some(SignalReason::StructuralStopLoss),
            },
            TestCase {
                // TC1: close through the stop is vetoed by trending structure
                input: bar(4, 99.6, 0, 0.5, 0.5),
                expected: None,
            },
            TestCase {
                // TC2: PATH inside the chop band
                input: bar(4, 100.5, 0, 0.1, 0.5),
                expected: Some(SignalReason::TrendBreak),
            },
            TestCase {
                // TC3: PATH flipped beyond the chop band
                input: bar(4, 100.5, 0, -0.4, 0.5),
                expected: Some(SignalReason::PathFlip),
            },
            TestCase {
                // TC4: COST against the position
                input: bar(4, 100.5, 0, 0.5, -0.1),
                expected: Some(SignalReason::CostFlip),
            },
            TestCase {
                // TC5: extreme tape move with the position
                input: with_pressure(bar(4, 101.0, 0, 0.5, 0.5), 0.9),
                expected: Some(SignalReason::PressureExhaustion),
            },
            TestCase {
                // TC6: stop vetoed, but COST flipped as well
                input: bar(4, 99.6, 0, 0.5, -0.2),
                expected: Some(SignalReason::CostFlip),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut machine = three_sensor_long();
            let actual = machine.step(test.input);
            assert_eq!(actual.as_ref().map(|event| event.reason), test.expected, "TC{} failed", index);

            let expected_phase = if test.expected.is_some() {
                SignalPhase::Idle
            } else {
                SignalPhase::InPosition
            };
            assert_eq!(machine.phase(), expected_phase, "TC{} failed", index);
        }
    }

    #[test]
    fn test_three_sensor_partial_exit_once() {
        let mut machine = three_sensor_long();

        // Tape turned up while OBV still disagrees with price: scale out, keep the position
        let mut resolved = with_pressure(bar(4, 101.0, 0, 0.5, 0.5), 0.3);
        resolved.price_obv = -0.2;
        resolved.price_vwap = 1.2;

        let partial = machine.step(resolved).unwrap();
        assert_eq!(partial.kind, SignalKind::PartialExit);
        assert_eq!(partial.reason, SignalReason::DivergenceResolved);
        assert!((partial.pnl_pct.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(machine.phase(), SignalPhase::InPosition);
        assert_eq!(machine.direction(), Some(Direction::Long));

        // Scaling happens once per position
        resolved.time = time(10, 5, 0);
        assert!(machine.step(resolved).is_none());

        let exit = machine.step(with_pressure(bar(6, 102.0, 0, 0.5, 0.5), 0.9)).unwrap();
        assert_eq!(exit.kind, SignalKind::Exit);
        assert_eq!(exit.reason, SignalReason::PressureExhaustion);
        assert_eq!(exit.entry_price, 100.0);
        assert!((exit.pnl_pct.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(machine.phase(), SignalPhase::Idle);
    }
}
