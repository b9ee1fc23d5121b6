//! Order Intake
//!
//! Entry point used by the request layer when a user uploads an order number.

use std::sync::Arc;

use tracing::{info, warn};

use super::error::{IntakeError, QueueError};
use super::ledger::{OrderLedgerStore, Registration};
use super::queue::QueueStore;
use crate::order_number::OrderNumber;

/// Result of a successful submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// New order, queued for accrual polling (HTTP 202)
    Accepted(OrderNumber),
    /// The same user already uploaded this number (HTTP 200)
    AlreadySubmitted(OrderNumber),
}

impl Enqueued {
    pub fn http_status(&self) -> u16 {
        match self {
            Enqueued::Accepted(_) => 202,
            Enqueued::AlreadySubmitted(_) => 200,
        }
    }
}

pub struct OrderIntake {
    ledger: Arc<dyn OrderLedgerStore>,
    queue: Arc<dyn QueueStore>,
}

impl OrderIntake {
    pub fn new(ledger: Arc<dyn OrderLedgerStore>, queue: Arc<dyn QueueStore>) -> Self {
        Self { ledger, queue }
    }

    /// Validate, register and queue an uploaded order number.
    ///
    /// Resubmitting an owned, unfinished order re-creates its queue entry if
    /// an earlier `add` failed after registration.
    pub async fn enqueue(&self, raw: &str, user_id: i64) -> Result<Enqueued, IntakeError> {
        let number = OrderNumber::parse(raw)
            .map_err(|reason| IntakeError::InvalidNumber(reason.to_string()))?;

        match self.ledger.register_order(number.as_str(), user_id).await? {
            Registration::Registered => {
                self.queue.add(number.as_str()).await?;
                info!(order_id = %number, user_id, "Order accepted for accrual");
                Ok(Enqueued::Accepted(number))
            }
            Registration::AlreadyOwned => {
                self.ensure_queued(&number).await?;
                Ok(Enqueued::AlreadySubmitted(number))
            }
            Registration::OwnedByOther => Err(IntakeError::OwnedByAnotherUser(number.to_string())),
        }
    }

    async fn ensure_queued(&self, number: &OrderNumber) -> Result<(), IntakeError> {
        let order = self.ledger.find_order(number.as_str()).await?;
        if order.is_some_and(|order| order.status.is_terminal()) {
            return Ok(());
        }

        match self.queue.add(number.as_str()).await {
            Ok(()) => {
                warn!(order_id = %number, "Queue entry was missing, order re-queued");
                Ok(())
            }
            Err(QueueError::DuplicateKey(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::memory::{InMemoryOrderLedger, InMemoryQueueStore};
    use crate::reconcile::state::OrderStatus;

    fn intake() -> (OrderIntake, InMemoryOrderLedger, InMemoryQueueStore) {
        let ledger = InMemoryOrderLedger::new();
        let queue = InMemoryQueueStore::new();
        let intake = OrderIntake::new(Arc::new(ledger.clone()), Arc::new(queue.clone()));
        (intake, ledger, queue)
    }

    #[tokio::test]
    async fn test_accepts_valid_number() {
        let (intake, ledger, queue) = intake();

        let result = intake.enqueue("12345678903", 7).await.unwrap();
        assert!(matches!(result, Enqueued::Accepted(_)));
        assert_eq!(result.http_status(), 202);

        let order = ledger.find_order("12345678903").await.unwrap().unwrap();
        assert_eq!(order.user_id, 7);
        assert_eq!(order.status, OrderStatus::New);

        let entry = queue.entry("12345678903").await.unwrap();
        assert_eq!(entry.status, OrderStatus::New);
        assert!(!entry.locked);
    }

    #[tokio::test]
    async fn test_rejects_bad_checksum_without_side_effects() {
        let (intake, ledger, queue) = intake();

        let err = intake.enqueue("12345678901", 7).await.unwrap_err();
        assert!(matches!(err, IntakeError::InvalidNumber(_)));
        assert_eq!(err.http_status(), 422);

        assert!(ledger.find_order("12345678901").await.unwrap().is_none());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resubmission_by_owner_is_idempotent() {
        let (intake, _ledger, queue) = intake();

        intake.enqueue("79927398713", 7).await.unwrap();
        let again = intake.enqueue("79927398713", 7).await.unwrap();

        assert!(matches!(again, Enqueued::AlreadySubmitted(_)));
        assert_eq!(again.http_status(), 200);
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_number_owned_by_another_user_conflicts() {
        let (intake, _ledger, _queue) = intake();

        intake.enqueue("79927398713", 7).await.unwrap();
        let err = intake.enqueue("79927398713", 8).await.unwrap_err();

        assert_eq!(err, IntakeError::OwnedByAnotherUser("79927398713".into()));
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn test_duplicate_queue_key_surfaces() {
        let (intake, _ledger, queue) = intake();
        queue.add("79927398713").await.unwrap();

        let err = intake.enqueue("79927398713", 7).await.unwrap_err();
        assert_eq!(
            err,
            IntakeError::Queue(QueueError::DuplicateKey("79927398713".into()))
        );
    }

    #[tokio::test]
    async fn test_resubmission_requeues_after_failed_add() {
        let (intake, ledger, queue) = intake();
        queue.set_fail_add(true);

        let err = intake.enqueue("79927398713", 7).await.unwrap_err();
        assert_eq!(
            err,
            IntakeError::Queue(QueueError::Database("injected add failure".into()))
        );
        let order = ledger.find_order("79927398713").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert!(queue.entry("79927398713").await.is_none());

        queue.set_fail_add(false);
        let again = intake.enqueue("79927398713", 7).await.unwrap();
        assert!(matches!(again, Enqueued::AlreadySubmitted(_)));

        let entry = queue.entry("79927398713").await.expect("order must be queued");
        assert_eq!(entry.status, OrderStatus::New);
        assert!(!entry.locked);
    }

    #[tokio::test]
    async fn test_resubmission_of_finished_order_is_not_requeued() {
        let (intake, ledger, queue) = intake();

        intake.enqueue("79927398713", 7).await.unwrap();
        ledger
            .update_order_status("79927398713", OrderStatus::Processed)
            .await
            .unwrap();
        queue.delete("79927398713").await.unwrap();

        let again = intake.enqueue("79927398713", 7).await.unwrap();
        assert!(matches!(again, Enqueued::AlreadySubmitted(_)));
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}
