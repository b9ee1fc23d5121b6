//! In-Memory Stores
//!
//! Deterministic stand-ins for the PostgreSQL stores and the accrual service.
//! Claim order uses a logical clock instead of wall time so tests see a stable
//! oldest-first order, and lease expiry uses `tokio::time::Instant` so it
//! follows a paused test clock.
//!
//! Each store keeps its state behind one `tokio::sync::Mutex`, which makes
//! every operation, `acquire` included, linearizable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::{LedgerError, QueueError};
use super::ledger::{OrderLedgerStore, OrderRecord, Registration};
use super::queue::{ClaimedTask, QueueEntry, QueueStore};
use super::state::OrderStatus;
use crate::accrual::{AccrualClient, AccrualError, AccrualOrder};

fn injected(what: &str) -> String {
    format!("injected {} failure", what)
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
    entry: QueueEntry,
    /// Logical `updated_at`
    seq: u64,
    claimed_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    slots: HashMap<String, Slot>,
    clock: u64,
    acquire_log: Vec<Instant>,
}

impl QueueState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// [`QueueStore`] kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<QueueState>>,
    fail_add: Arc<AtomicBool>,
    fail_acquire: Arc<AtomicBool>,
    fail_release: Arc<AtomicBool>,
    fail_delete: Arc<AtomicBool>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub async fn entry(&self, order_id: &str) -> Option<QueueEntry> {
        let state = self.state.lock().await;
        state.slots.get(order_id).map(|slot| slot.entry.clone())
    }

    /// All entries, oldest first
    pub async fn entries(&self) -> Vec<QueueEntry> {
        let state = self.state.lock().await;
        let mut slots: Vec<&Slot> = state.slots.values().collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.entry.clone()).collect()
    }

    /// When each `acquire` call happened, failed ones included
    pub async fn acquire_times(&self) -> Vec<Instant> {
        self.state.lock().await.acquire_log.clone()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn add(&self, order_id: &str) -> Result<(), QueueError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(QueueError::Database(injected("add")));
        }

        let mut state = self.state.lock().await;
        if state.slots.contains_key(order_id) {
            return Err(QueueError::DuplicateKey(order_id.to_string()));
        }

        let seq = state.tick();
        state.slots.insert(
            order_id.to_string(),
            Slot {
                entry: QueueEntry {
                    order_id: order_id.to_string(),
                    status: OrderStatus::New,
                    locked: false,
                    locked_at: None,
                    updated_at: Utc::now(),
                },
                seq,
                claimed_at: None,
            },
        );
        Ok(())
    }

    async fn acquire(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let mut state = self.state.lock().await;
        state.acquire_log.push(Instant::now());

        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(QueueError::Database(injected("acquire")));
        }

        let Some(slot) = state
            .slots
            .values_mut()
            .filter(|slot| !slot.entry.locked && slot.entry.status.is_claimable())
            .min_by_key(|slot| slot.seq)
        else {
            return Ok(None);
        };

        slot.entry.locked = true;
        slot.entry.locked_at = Some(Utc::now());
        slot.claimed_at = Some(Instant::now());

        Ok(Some(ClaimedTask {
            order_id: slot.entry.order_id.clone(),
            status: slot.entry.status,
        }))
    }

    async fn update_status_and_release(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), QueueError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(QueueError::Database(injected("release")));
        }

        let mut state = self.state.lock().await;
        let seq = state.tick();
        if let Some(slot) = state.slots.get_mut(order_id) {
            slot.entry.locked = false;
            slot.entry.locked_at = None;
            slot.entry.status = status;
            slot.entry.updated_at = Utc::now();
            slot.claimed_at = None;
            slot.seq = seq;
        }
        Ok(())
    }

    async fn delete(&self, order_id: &str) -> Result<(), QueueError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(QueueError::Database(injected("delete")));
        }

        self.state.lock().await.slots.remove(order_id);
        Ok(())
    }

    async fn release_expired(&self, lease: Duration) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut released = 0;

        for slot in state.slots.values_mut() {
            let expired = slot
                .claimed_at
                .is_some_and(|claimed| now.duration_since(claimed) > lease);
            if slot.entry.locked && expired {
                slot.entry.locked = false;
                slot.entry.locked_at = None;
                slot.claimed_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().await.slots.len() as u64)
    }
}

// ============================================================================
// Orders and ledger
// ============================================================================

/// One credited accrual
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualRecord {
    pub order_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Default)]
struct LedgerState {
    orders: HashMap<String, OrderRecord>,
    records: Vec<AccrualRecord>,
    status_writes: Vec<(String, OrderStatus)>,
}

/// [`OrderLedgerStore`] kept in process memory
#[derive(Clone, Default)]
pub struct InMemoryOrderLedger {
    state: Arc<Mutex<LedgerState>>,
    fail_status_updates: Arc<AtomicBool>,
    fail_accrual_records: Arc<AtomicBool>,
}

impl InMemoryOrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_status_updates(&self, fail: bool) {
        self.fail_status_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_accrual_records(&self, fail: bool) {
        self.fail_accrual_records.store(fail, Ordering::SeqCst);
    }

    pub async fn accrual_records(&self) -> Vec<AccrualRecord> {
        self.state.lock().await.records.clone()
    }

    /// Every successful `update_order_status` call, in order
    pub async fn status_writes(&self) -> Vec<(String, OrderStatus)> {
        self.state.lock().await.status_writes.clone()
    }
}

#[async_trait]
impl OrderLedgerStore for InMemoryOrderLedger {
    async fn register_order(
        &self,
        order_id: &str,
        user_id: i64,
    ) -> Result<Registration, LedgerError> {
        let mut state = self.state.lock().await;
        match state.orders.get(order_id) {
            Some(order) if order.user_id == user_id => Ok(Registration::AlreadyOwned),
            Some(_) => Ok(Registration::OwnedByOther),
            None => {
                state.orders.insert(
                    order_id.to_string(),
                    OrderRecord {
                        id: order_id.to_string(),
                        user_id,
                        status: OrderStatus::New,
                        accrual: None,
                        uploaded_at: Utc::now(),
                    },
                );
                Ok(Registration::Registered)
            }
        }
    }

    async fn find_order(&self, order_id: &str) -> Result<Option<OrderRecord>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.orders.get(order_id).map(|order| {
            let accrual = state
                .records
                .iter()
                .find(|record| record.order_id == order_id)
                .map(|record| record.amount);
            OrderRecord {
                accrual,
                ..order.clone()
            }
        }))
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), LedgerError> {
        if self.fail_status_updates.load(Ordering::SeqCst) {
            return Err(LedgerError::Database(injected("status update")));
        }

        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| LedgerError::OrderNotFound(order_id.to_string()))?;
        order.status = status;
        state.status_writes.push((order_id.to_string(), status));
        Ok(())
    }

    async fn add_accrual_record(
        &self,
        order_id: &str,
        amount: Decimal,
    ) -> Result<(), LedgerError> {
        if self.fail_accrual_records.load(Ordering::SeqCst) {
            return Err(LedgerError::Database(injected("accrual record")));
        }

        let mut state = self.state.lock().await;
        if !state.orders.contains_key(order_id) {
            return Err(LedgerError::OrderNotFound(order_id.to_string()));
        }
        if state.records.iter().any(|record| record.order_id == order_id) {
            return Ok(());
        }
        state.records.push(AccrualRecord {
            order_id: order_id.to_string(),
            amount,
        });
        Ok(())
    }
}

// ============================================================================
// Accrual service
// ============================================================================

pub type AccrualReply = Result<Option<AccrualOrder>, AccrualError>;

#[derive(Debug, Default)]
struct ScriptState {
    replies: HashMap<String, VecDeque<AccrualReply>>,
    calls: Vec<(String, Instant)>,
    latency: Duration,
}

/// [`AccrualClient`] that plays back queued replies per order.
///
/// Once an order's script runs out it answers `Ok(None)`, the same as an
/// accrual service that has not seen the order.
#[derive(Clone, Default)]
pub struct ScriptedAccrualClient {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedAccrualClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, order_id: &str, reply: AccrualReply) {
        let mut state = self.state.lock().await;
        state
            .replies
            .entry(order_id.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue a 200 reply carrying `status`
    pub async fn push_status(&self, order_id: &str, status: &str, accrual: Option<Decimal>) {
        let order = AccrualOrder {
            order: order_id.to_string(),
            status: status.to_string(),
            accrual,
        };
        self.push(order_id, Ok(Some(order))).await;
    }

    /// Delay every reply by `latency`
    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    /// Order ids in call order
    pub async fn calls(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.calls.iter().map(|(order_id, _)| order_id.clone()).collect()
    }

    pub async fn call_times(&self) -> Vec<Instant> {
        let state = self.state.lock().await;
        state.calls.iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl AccrualClient for ScriptedAccrualClient {
    async fn get_order_info(&self, order_id: &str) -> AccrualReply {
        let (reply, latency) = {
            let mut state = self.state.lock().await;
            state.calls.push((order_id.to_string(), Instant::now()));
            let reply = state
                .replies
                .get_mut(order_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(None));
            (reply, state.latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        reply
    }
}
