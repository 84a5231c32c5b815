use crate::model::TradeSign;

/// Infer the aggressor side of a trade.
///
/// Quote rule first (price at/through the ask is a buy, at/through the bid is a sell), then the
/// tick rule against the previous trade price, carrying `prev_sign` when the price is unchanged.
/// Without a previous price the trade cannot be classified.
pub fn classify(
    price: f64,
    prev_price: Option<f64>,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
    prev_sign: TradeSign,
) -> TradeSign {
    let Some(prev_price) = prev_price else {
        return TradeSign::Unknown;
    };

    if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
        // Locked or crossed books carry no side information
        if bid > 0.0 && ask > 0.0 && ask > bid {
            if price >= ask {
                return TradeSign::Buy;
            }
            if price <= bid {
                return TradeSign::Sell;
            }
        }
    }

    if price > prev_price {
        TradeSign::Buy
    } else if price < prev_price {
        TradeSign::Sell
    } else {
        prev_sign
    }
}

/// Per-instrument classifier memory: the previous trade price and the last assigned sign.
#[derive(Clone, Debug, Default)]
pub struct TradeClassifier {
    prev_price: Option<f64>,
    last_sign: TradeSign,
}

impl TradeClassifier {
    /// Classify `price` against the current quotes and remember the outcome.
    pub fn classify(
        &mut self,
        price: f64,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
    ) -> TradeSign {
        let sign = classify(price, self.prev_price, best_bid, best_ask, self.last_sign);
        self.prev_price = Some(price);
        self.last_sign = sign;
        sign
    }

    pub fn last_sign(&self) -> TradeSign {
        self.last_sign
    }
}
