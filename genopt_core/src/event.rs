// genopt_core/src/event.rs

//! Order model shared by the strategy core and transports.
//! An order starts `Pending` and becomes `Executed` once a transport fills it.

pub type OrderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    pub fn inverse(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum OrderState {
    Pending,
    Executed {
        fill_price: f64,
        executed_lots: f64,
        fee: f64,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub side: Side,
    /// Requested price.
    pub price: f64,
    /// Requested lots.
    pub lots: f64,
    /// Open order this one closes, if it is a close order.
    pub closes: Option<OrderId>,
    /// Created while warming up on history.
    pub learning: bool,
    /// A close of this order is in flight.
    #[serde(skip)]
    pub processing: bool,
    pub state: OrderState,
}

impl Order {
    pub fn pending(
        id: OrderId,
        timestamp: chrono::DateTime<chrono::Utc>,
        side: Side,
        price: f64,
        lots: f64,
    ) -> Self {
        Self {
            id,
            timestamp,
            side,
            price,
            lots,
            closes: None,
            learning: false,
            processing: false,
            state: OrderState::Pending,
        }
    }

    pub fn with_closes(mut self, open_order: OrderId) -> Self {
        self.closes = Some(open_order);
        self
    }

    pub fn with_learning(mut self, learning: bool) -> Self {
        self.learning = learning;
        self
    }

    /// Turns a pending order into its executed form.
    pub fn executed(mut self, fill_price: f64, executed_lots: f64, fee: f64) -> Self {
        self.state = OrderState::Executed {
            fill_price,
            executed_lots,
            fee,
        };
        self
    }

    pub fn is_executed(&self) -> bool {
        matches!(self.state, OrderState::Executed { .. })
    }

    pub fn is_close(&self) -> bool {
        self.closes.is_some()
    }

    // --- Getters ---
    pub fn get_fill_price(&self) -> Option<f64> {
        match self.state {
            OrderState::Executed { fill_price, .. } => Some(fill_price),
            OrderState::Pending => None,
        }
    }

    pub fn get_executed_lots(&self) -> Option<f64> {
        match self.state {
            OrderState::Executed { executed_lots, .. } => Some(executed_lots),
            OrderState::Pending => None,
        }
    }

    pub fn get_fee(&self) -> f64 {
        match self.state {
            OrderState::Executed { fee, .. } => fee,
            OrderState::Pending => 0.0,
        }
    }

    /// Signed cash flow of the fill, fees included: negative for buys.
    pub fn cash_flow(&self, lot: f64) -> f64 {
        match self.state {
            OrderState::Executed { fill_price, executed_lots, fee } => {
                -self.side.sign() * fill_price * executed_lots * lot - fee
            }
            OrderState::Pending => 0.0,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executed_order_reports_fill_and_cash_flow() {
        let ts = chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap();
        let order = Order::pending(1, ts, Side::Buy, 100.0, 2.0);
        assert!(!order.is_executed());
        assert_eq!(order.cash_flow(1.0), 0.0);

        let order = order.executed(100.5, 2.0, 0.2);
        assert!(order.is_executed());
        assert_eq!(order.get_fill_price(), Some(100.5));
        assert!((order.cash_flow(1.0) - (-201.2)).abs() < 1e-9);

        let close = Order::pending(2, ts, Side::Buy.inverse(), 101.0, 2.0)
            .with_closes(1)
            .executed(101.0, 2.0, 0.0);
        assert!(close.is_close());
        assert_eq!(close.cash_flow(1.0), 202.0);
    }
}
