use crate::{
    config::AbsorptionPolicy,
    model::{DepthLevel, RawTick, TradeSign},
};
use chrono::{DateTime, Utc};

/// Absorption flags produced by a single [`OrderBookState::update`].
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct AbsorptionFlags {
    pub buy: bool,
    pub sell: bool,
}

/// Context of the most recent trade seen for an instrument.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct LastTrade {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
    pub sign: TradeSign,
}

/// Refill streak at one side's best level.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
struct RefillCounter {
    count: u32,
    fired: bool,
}

impl RefillCounter {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn refill(&mut self) {
        self.count += 1;
    }

    fn fire(&mut self, threshold: u32, policy: AbsorptionPolicy) -> bool {
        if self.count <= threshold {
            return false;
        }
        match policy {
            AbsorptionPolicy::EveryTick => true,
            AbsorptionPolicy::EdgeTriggered if self.fired => false,
            AbsorptionPolicy::EdgeTriggered => {
                self.fired = true;
                true
            }
        }
    }
}

/// Per-instrument top-of-book monitor detecting hidden orders from refill patterns at the best
/// bid (buy absorption, resting buyer soaking up sells) and best ask (sell absorption).
#[derive(Clone, Debug)]
pub struct OrderBookState {
    refill_threshold: u32,
    policy: AbsorptionPolicy,
    best_bid: Option<DepthLevel>,
    best_ask: Option<DepthLevel>,
    bid_refills: RefillCounter,
    ask_refills: RefillCounter,
    last_trade: Option<LastTrade>,
}

impl OrderBookState {
    pub fn new(refill_threshold: u32, policy: AbsorptionPolicy) -> Self {
        Self {
            refill_threshold,
            policy,
            best_bid: None,
            best_ask: None,
            bid_refills: RefillCounter::default(),
            ask_refills: RefillCounter::default(),
            last_trade: None,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.best_bid.map(|level| level.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.best_ask.map(|level| level.price)
    }

    pub fn last_trade(&self) -> Option<&LastTrade> {
        self.last_trade.as_ref()
    }

    /// Apply `tick` (already classified) and report absorption.
    ///
    /// Ticks without depth leave the book untouched. A trade only counts against a side when it
    /// hits that side's best level, so `trade_volume` must be the volume since the previous tick.
    pub fn update(
        &mut self,
        tick: &RawTick,
        trade_volume: f64,
        trade_sign: TradeSign,
    ) -> AbsorptionFlags {
        let is_trade = trade_volume > 0.0;
        if is_trade {
            self.last_trade = Some(LastTrade {
                time: tick.time,
                price: tick.last_price,
                volume: trade_volume,
                sign: trade_sign,
            });
        }

        let Some(depth) = tick.depth.as_ref() else {
            return AbsorptionFlags::default();
        };

        let sell_hits_bid = is_trade && trade_sign == TradeSign::Sell;
        let buy_hits_ask = is_trade && trade_sign == TradeSign::Buy;

        let flags = AbsorptionFlags {
            buy: Self::track_level(
                &mut self.bid_refills,
                self.best_bid,
                depth.best_bid().copied(),
                sell_hits_bid && self.best_bid.is_some_and(|bid| tick.last_price <= bid.price),
                self.refill_threshold,
                self.policy,
            ),
            sell: Self::track_level(
                &mut self.ask_refills,
                self.best_ask,
                depth.best_ask().copied(),
                buy_hits_ask && self.best_ask.is_some_and(|ask| tick.last_price >= ask.price),
                self.refill_threshold,
                self.policy,
            ),
        };

        if let Some(bid) = depth.best_bid() {
            self.best_bid = Some(*bid);
        }
        if let Some(ask) = depth.best_ask() {
            self.best_ask = Some(*ask);
        }

        flags
    }

    fn track_level(
        counter: &mut RefillCounter,
        prev: Option<DepthLevel>,
        next: Option<DepthLevel>,
        traded_against: bool,
        threshold: u32,
        policy: AbsorptionPolicy,
    ) -> bool {
        let (Some(prev), Some(next)) = (prev, next) else {
            return false;
        };

        if next.price != prev.price {
            counter.reset();
            return false;
        }

        if traded_against {
            if next.quantity >= prev.quantity {
                counter.refill();
            } else {
                counter.reset();
                return false;
            }
        }

        counter.fire(threshold, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::{depth, tick, time};

    #[derive(Copy, Clone)]
    struct Step {
        price: f64,
        volume: f64,
        sign: TradeSign,
        bid: (f64, f64),
    }

    fn sell_at_bid(quantity: f64) -> Step {
        Step {
            price: 100.0,
            volume: 50.0,
            sign: TradeSign::Sell,
            bid: (100.0, quantity),
        }
    }

    fn run(policy: AbsorptionPolicy, steps: &[Step]) -> Vec<bool> {
        let mut book = OrderBookState::new(2, policy);
        // Seed the book with a resting bid of 500 at 100.0
        book.update(
            &tick("A", time(10, 0, 0), 100.5, 0.0, Some(depth((100.0, 500.0), (100.5, 300.0)))),
            0.0,
            TradeSign::Unknown,
        );

        steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let raw = tick(
                    "A",
                    time(10, 0, 1 + index as u32),
                    step.price,
                    0.0,
                    Some(depth(step.bid, (100.5, 300.0))),
                );
                book.update(&raw, step.volume, step.sign).buy
            })
            .collect()
    }

    #[test]
    fn test_buy_absorption() {
        struct TestCase {
            policy: AbsorptionPolicy,
            steps: Vec<Step>,
            expected: Vec<bool>,
        }

        let tests = vec![
            TestCase {
                // TC0: third refill fires once, later refills in the same streak do not
                policy: AbsorptionPolicy::EdgeTriggered,
                steps: vec![sell_at_bid(500.0); 5],
                expected: vec![false, false, true, false, false],
            },
            TestCase {
                // TC1: every tick policy keeps firing while the streak lasts
                policy: AbsorptionPolicy::EveryTick,
                steps: vec![sell_at_bid(500.0); 4],
                expected: vec![false, false, true, true],
            },
            TestCase {
                // TC2: bid price move resets the counter
                policy: AbsorptionPolicy::EdgeTriggered,
                steps: vec![
                    sell_at_bid(500.0),
                    sell_at_bid(500.0),
                    Step {
                        price: 99.5,
                        volume: 50.0,
                        sign: TradeSign::Sell,
                        bid: (99.5, 500.0),
                    },
                    Step {
                        price: 100.0,
                        volume: 0.0,
                        sign: TradeSign::Sell,
                        bid: (100.0, 500.0),
                    },
                    sell_at_bid(500.0),
                    sell_at_bid(500.0),
                    sell_at_bid(500.0),
                ],
                expected: vec![false, false, false, false, false, false, true],
            },
            TestCase {
                // TC3: a depleting trade breaks the streak, a new streak can fire again
                policy: AbsorptionPolicy::EdgeTriggered,
                steps: vec![
                    sell_at_bid(500.0),
                    sell_at_bid(500.0),
                    sell_at_bid(500.0),
                    sell_at_bid(400.0),
                    sell_at_bid(450.0),
                    sell_at_bid(450.0),
                    sell_at_bid(450.0),
                ],
                expected: vec![false, false, true, false, false, false, true],
            },
            TestCase {
                // TC4: buy-side trades at the ask never count as bid refills
                policy: AbsorptionPolicy::EdgeTriggered,
                steps: vec![
                    Step {
                        price: 100.5,
                        volume: 50.0,
                        sign: TradeSign::Buy,
                        bid: (100.0, 500.0),
                    };
                    4
                ],
                expected: vec![false; 4],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = run(test.policy, &test.steps);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_sell_absorption_at_ask() {
        let mut book = OrderBookState::new(2, AbsorptionPolicy::EdgeTriggered);
        let book_depth = depth((99.5, 200.0), (100.0, 800.0));
        book.update(&tick("A", time(10, 0, 0), 100.0, 0.0, Some(book_depth.clone())), 0.0, TradeSign::Unknown);

        let fired = (1..=4)
            .map(|second| {
                let raw = tick("A", time(10, 0, second), 100.0, 0.0, Some(book_depth.clone()));
                book.update(&raw, 25.0, TradeSign::Buy)
            })
            .collect::<Vec<_>>();

        assert_eq!(
            fired.iter().map(|flags| flags.sell).collect::<Vec<_>>(),
            vec![false, false, true, false]
        );
        assert!(fired.iter().all(|flags| !flags.buy));
        assert_eq!(book.best_ask(), Some(100.0));
        assert_eq!(book.last_trade().map(|trade| trade.sign), Some(TradeSign::Buy));
    }

    #[test]
    fn test_tick_without_depth_keeps_book() {
        let mut book = OrderBookState::new(2, AbsorptionPolicy::EdgeTriggered);
        book.update(
            &tick("A", time(10, 0, 0), 100.0, 0.0, Some(depth((99.5, 10.0), (100.0, 10.0)))),
            0.0,
            TradeSign::Unknown,
        );

        let flags = book.update(&tick("A", time(10, 0, 1), 100.0, 0.0, None), 5.0, TradeSign::Buy);

        assert_eq!(flags, AbsorptionFlags::default());
        assert_eq!(book.best_bid(), Some(99.5));
        assert_eq!(book.best_ask(), Some(100.0));
    }
}
