// genopt_core/src/execution.rs

//! Interface between a strategy and whatever executes its orders.
//! Allows swapping the backtest simulator for a live broker transport.

use crate::event;
use crate::data_handler;
use crate::instruments_info;

/// Receives ticks from a transport.
#[async_trait::async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self, tick: &data_handler::Candle) -> anyhow::Result<()>;
}

/// Handle returned by `Transport::subscribe_to_tick`. Dropping it keeps the
/// subscription alive; call `unsubscribe` to detach the handler.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to detach.
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Detaches the handler. Later calls do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Defines the contract for tick delivery and order execution.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Metadata of the traded instrument.
    async fn get_instrument(&self) -> anyhow::Result<instruments_info::Instrument>;

    /// Starts delivering ticks to `handler`.
    async fn subscribe_to_tick(
        &self,
        handler: std::sync::Arc<dyn TickHandler>,
    ) -> anyhow::Result<Subscription>;

    /// Executes a pending order and returns it in executed form.
    async fn place_order(&self, order: event::Order) -> anyhow::Result<event::Order>;

    /// Rounds a raw lot count to what the venue accepts.
    fn prepare_lots(&self, raw_lots: f64) -> f64;

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsubscribe_runs_cancel_once() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let mut subscription = Subscription::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
