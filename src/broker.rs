//! Broker adapter contract (external collaborator, spec.md §6).
//!
//! Generalizes the teacher's `adapter.rs` `ExchangeAdapter` trait from a
//! crypto-exchange REST surface to the CTP-style place/cancel + async event
//! callback shape the pipeline actually drives. `CloseTodayRejected` is a
//! distinguished rejection subclass (Chinese-futures closeToday semantics):
//! its caller is authorized to retry as a plain `CLOSE`.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::ctp_mapping::{Offset, Side};

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrderRejected {
    #[error("broker rejected order: {reason}")]
    Generic { reason: String },
    /// CTP-specific: a CLOSE order against today's position was rejected
    /// because the exchange requires CLOSETODAY for same-day positions.
    /// The caller may retry with `Offset::CloseToday`.
    #[error("closeToday required: {reason}")]
    CloseTodayRejected { reason: String },
}

impl OrderRejected {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Generic { .. } => "BROKER_REJECTED",
            Self::CloseTodayRejected { .. } => "CLOSETODAY",
        }
    }
}

/// Broker-side adapter the pipeline drives; implementations own the actual
/// wire connection (CTP gateway, simulator, paper broker). `place_order`
/// must preserve `client_order_id` end to end so `OrderEvent`s can be
/// demultiplexed back onto the right plan/slice.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn place_order(
        &self,
        client_order_id: &str,
        instrument: &str,
        side: Side,
        offset: Offset,
        price: Option<Decimal>,
        qty: u64,
    ) -> Result<OrderAck, OrderRejected>;

    async fn cancel_order(&self, client_order_id: &str, exchange_order_id: &str) -> Result<(), OrderRejected>;
}

/// Logs every call and acknowledges with a synthetic exchange order id.
/// The real CTP wire gateway is out of scope for this crate (spec.md
/// Non-goals); this adapter is the explicit no-op default that lets the
/// pipeline run end to end against a simulator or in a paper-trading
/// deployment until a real gateway adapter is plugged in.
pub struct LoggingBroker;

#[async_trait]
impl BrokerAdapter for LoggingBroker {
    async fn place_order(
        &self,
        client_order_id: &str,
        instrument: &str,
        side: Side,
        offset: Offset,
        price: Option<Decimal>,
        qty: u64,
    ) -> Result<OrderAck, OrderRejected> {
        tracing::info!(
            client_order_id,
            instrument,
            ?side,
            ?offset,
            ?price,
            qty,
            "logging broker: place_order"
        );
        Ok(OrderAck {
            exchange_order_id: format!("SIM-{}", uuid::Uuid::new_v4()),
        })
    }

    async fn cancel_order(&self, client_order_id: &str, exchange_order_id: &str) -> Result<(), OrderRejected> {
        tracing::info!(client_order_id, exchange_order_id, "logging broker: cancel_order");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysCloseTodayBroker;

    #[async_trait]
    impl BrokerAdapter for AlwaysCloseTodayBroker {
        async fn place_order(
            &self,
            _client_order_id: &str,
            _instrument: &str,
            _side: Side,
            offset: Offset,
            _price: Option<Decimal>,
            _qty: u64,
        ) -> Result<OrderAck, OrderRejected> {
            if offset == Offset::Close {
                return Err(OrderRejected::CloseTodayRejected {
                    reason: "position opened today".to_string(),
                });
            }
            Ok(OrderAck {
                exchange_order_id: "X1".to_string(),
            })
        }

        async fn cancel_order(&self, _client_order_id: &str, _exchange_order_id: &str) -> Result<(), OrderRejected> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_today_rejection_carries_distinguished_error_code() {
        let broker = AlwaysCloseTodayBroker;
        let result = broker
            .place_order("c1", "rb2501", Side::Sell, Offset::Close, None, 10)
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.error_code(), "CLOSETODAY");
    }
}
