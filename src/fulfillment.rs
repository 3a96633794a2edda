use crate::models::{DeliveryStatus, Order, OrderDetail};
use crate::store::{MarketplaceStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Fallback estimate shown to buyers while no carrier tracking exists. Not a
/// contractual promise.
const ESTIMATED_TRANSIT_DAYS: i64 = 14;

/// Result of a state-machine transition. A disallowed transition is a value,
/// not an error: callers are expected to inspect it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied { status: DeliveryStatus },
    Rejected { current: DeliveryStatus, reason: &'static str },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Notification fan-out for observers (seller notification senders, UI
/// counters). Derived state belongs behind these events, never in a second
/// in-process source of truth.
#[derive(Debug, Clone)]
pub enum FulfillmentEvent {
    OrderPlaced { order_id: Uuid },
    OrderCancelled { order_id: Uuid },
}

/// Owns the delivery state machine:
/// `processing → placed → shipped → delivered`, with `cancelled` reachable
/// from every pre-delivered state. Carrier-driven `placed → shipped →
/// delivered` updates arrive out of band.
pub struct OrderFulfillmentEngine<S> {
    store: S,
    events: broadcast::Sender<FulfillmentEvent>,
}

impl<S: MarketplaceStore> OrderFulfillmentEngine<S> {
    pub fn new(store: S) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FulfillmentEvent> {
        self.events.subscribe()
    }

    /// Advances `processing → placed`. A no-op with an explicit reason when
    /// the order is anywhere else in the machine, so a courier-advanced order
    /// is never pushed backwards.
    pub async fn mark_placed(&self, order_id: Uuid) -> Result<TransitionOutcome, StoreError> {
        let order = self.store.order_by_id(order_id).await?;
        let delivery = self.store.delivery_for_order(order_id).await?;
        let current = delivery
            .as_ref()
            .map(|d| d.delivery_status)
            .unwrap_or_default();
        if current != DeliveryStatus::Processing {
            return Ok(TransitionOutcome::Rejected {
                current,
                reason: "only a processing order can be marked placed",
            });
        }

        let has_tracking = delivery
            .as_ref()
            .and_then(|d| d.tracking_number.as_deref())
            .is_some();
        let estimated = if has_tracking {
            None
        } else {
            Some(estimated_delivery_date(order.placed_at))
        };
        self.store
            .upsert_delivery_status(order_id, DeliveryStatus::Placed, estimated)
            .await?;
        info!(target = "relove.fulfillment", order_id = %order_id, "order marked placed");
        let _ = self
            .events
            .send(FulfillmentEvent::OrderPlaced { order_id });
        Ok(TransitionOutcome::Applied {
            status: DeliveryStatus::Placed,
        })
    }

    /// Cancels from any pre-delivered state. `delivered` and `cancelled` are
    /// terminal.
    pub async fn cancel(&self, order_id: Uuid) -> Result<TransitionOutcome, StoreError> {
        self.store.order_by_id(order_id).await?;
        let current = self
            .store
            .delivery_for_order(order_id)
            .await?
            .map(|d| d.delivery_status)
            .unwrap_or_default();
        if current.is_terminal() {
            let reason = match current {
                DeliveryStatus::Delivered => "a delivered order cannot be cancelled",
                _ => "order is already cancelled",
            };
            return Ok(TransitionOutcome::Rejected { current, reason });
        }

        self.store
            .upsert_delivery_status(order_id, DeliveryStatus::Cancelled, None)
            .await?;
        info!(target = "relove.fulfillment", order_id = %order_id, from = current.as_str(), "order cancelled");
        let _ = self
            .events
            .send(FulfillmentEvent::OrderCancelled { order_id });
        Ok(TransitionOutcome::Applied {
            status: DeliveryStatus::Cancelled,
        })
    }

    pub async fn orders_for_user(&self, user_id: Uuid) -> Result<Vec<Order>, StoreError> {
        self.store.orders_for_user(user_id).await
    }

    /// One named-field join instead of ad-hoc object spreading.
    pub async fn order_detail(&self, order_id: Uuid) -> Result<OrderDetail, StoreError> {
        let order = self.store.order_by_id(order_id).await?;
        let delivery = self.store.delivery_for_order(order_id).await?;
        let payment = self.store.payment_for_order(order_id).await?;
        let items = self.store.items_for_order(order_id).await?;
        Ok(OrderDetail {
            order,
            delivery,
            payment,
            items,
        })
    }
}

/// Pure estimate used when no tracking number exists yet.
pub fn estimated_delivery_date(placed_at: DateTime<Utc>) -> DateTime<Utc> {
    placed_at + Duration::days(ESTIMATED_TRANSIT_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Delivery, Payment};
    use crate::store::testing::MemStore;

    fn seed_order(store: &MemStore) -> Uuid {
        let order_id = Uuid::new_v4();
        store.with(|s| {
            s.orders.push(Order {
                order_id,
                user_id: Uuid::new_v4(),
                shipping_address: "12 Rue de la Mode, Paris".into(),
                total_amount: 100.0,
                placed_at: Utc::now(),
                order_status: None,
            })
        });
        order_id
    }

    fn seed_delivery(store: &MemStore, order_id: Uuid, status: DeliveryStatus) {
        store.with(|s| {
            s.deliveries.push(Delivery {
                delivery_id: Uuid::new_v4(),
                order_id,
                tracking_number: None,
                carrier_name: None,
                delivery_status: status,
                estimated_delivery_date: None,
                updated_at: Utc::now(),
            })
        });
    }

    #[tokio::test]
    async fn mark_placed_advances_a_processing_order() {
        let store = MemStore::default();
        let order_id = seed_order(&store);
        let engine = OrderFulfillmentEngine::new(store.clone());

        let outcome = engine.mark_placed(order_id).await.unwrap();
        assert!(outcome.is_applied());
        let delivery = store
            .with(|s| s.deliveries.first().cloned())
            .expect("delivery row created");
        assert_eq!(delivery.delivery_status, DeliveryStatus::Placed);
        assert!(delivery.estimated_delivery_date.is_some());
    }

    #[tokio::test]
    async fn mark_placed_is_a_noop_outside_processing() {
        let store = MemStore::default();
        let order_id = seed_order(&store);
        seed_delivery(&store, order_id, DeliveryStatus::Shipped);
        let engine = OrderFulfillmentEngine::new(store.clone());

        let outcome = engine.mark_placed(order_id).await.unwrap();
        match outcome {
            TransitionOutcome::Rejected { current, .. } => {
                assert_eq!(current, DeliveryStatus::Shipped)
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        let status = store.with(|s| s.deliveries[0].delivery_status);
        assert_eq!(status, DeliveryStatus::Shipped, "status left unchanged");
    }

    #[tokio::test]
    async fn cancel_allowed_from_every_pre_delivered_state() {
        for from in [
            DeliveryStatus::Processing,
            DeliveryStatus::Placed,
            DeliveryStatus::Shipped,
        ] {
            let store = MemStore::default();
            let order_id = seed_order(&store);
            seed_delivery(&store, order_id, from);
            let engine = OrderFulfillmentEngine::new(store.clone());
            let outcome = engine.cancel(order_id).await.unwrap();
            assert!(outcome.is_applied(), "cancel from {from:?} should apply");
            let status = store.with(|s| s.deliveries[0].delivery_status);
            assert_eq!(status, DeliveryStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn cancel_rejected_once_terminal() {
        for terminal in [DeliveryStatus::Delivered, DeliveryStatus::Cancelled] {
            let store = MemStore::default();
            let order_id = seed_order(&store);
            seed_delivery(&store, order_id, terminal);
            let engine = OrderFulfillmentEngine::new(store.clone());
            let outcome = engine.cancel(order_id).await.unwrap();
            assert!(!outcome.is_applied());
            let status = store.with(|s| s.deliveries[0].delivery_status);
            assert_eq!(status, terminal, "terminal status left untouched");
        }
    }

    #[tokio::test]
    async fn transitions_emit_notification_events() {
        let store = MemStore::default();
        let order_id = seed_order(&store);
        let engine = OrderFulfillmentEngine::new(store);
        let mut events = engine.subscribe();

        engine.mark_placed(order_id).await.unwrap();
        match events.recv().await.unwrap() {
            FulfillmentEvent::OrderPlaced { order_id: id } => assert_eq!(id, order_id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn order_detail_joins_all_child_rows() {
        let store = MemStore::default();
        let order_id = seed_order(&store);
        seed_delivery(&store, order_id, DeliveryStatus::Placed);
        store.with(|s| {
            s.payments.push(Payment {
                payment_id: Uuid::new_v4(),
                order_id,
                payment_method: "card".into(),
                amount: 100.0,
                currency: "EUR".into(),
                status: "captured".into(),
            })
        });
        let engine = OrderFulfillmentEngine::new(store);

        let detail = engine.order_detail(order_id).await.unwrap();
        assert_eq!(detail.delivery_status(), DeliveryStatus::Placed);
        assert!(detail.payment.is_some());
        assert!(detail.items.is_empty());
    }

    #[tokio::test]
    async fn missing_delivery_row_reads_as_processing() {
        let store = MemStore::default();
        let order_id = seed_order(&store);
        let engine = OrderFulfillmentEngine::new(store);
        let detail = engine.order_detail(order_id).await.unwrap();
        assert_eq!(detail.delivery_status(), DeliveryStatus::Processing);
    }

    #[test]
    fn estimate_is_fourteen_days_out() {
        let placed = Utc::now();
        assert_eq!(estimated_delivery_date(placed) - placed, Duration::days(14));
    }
}
