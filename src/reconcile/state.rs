//! Order Status State Definitions
//!
//! Status IDs match the `status_id` SMALLINT columns of `user_order` and
//! `accrual_queue`. The label returned by [`OrderStatus::as_str`] is the only
//! textual form: it is what the accrual service sends and what gets logged.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Order status
///
/// ```text
/// NEW → REGISTERED → PROCESSING → PROCESSED
///                              ↘ INVALID
/// ```
///
/// Terminal states: PROCESSED (5), INVALID (4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum OrderStatus {
    /// Submitted, not yet seen by the accrual service
    New = 1,

    /// Accepted by the accrual service, calculation not started
    Registered = 2,

    /// Accrual calculation in progress
    Processing = 3,

    /// Terminal: the accrual service refused the order
    Invalid = 4,

    /// Terminal: accrual calculated and credited
    Processed = 5,
}

/// Statuses eligible for [`QueueStore::acquire`](super::queue::QueueStore::acquire).
pub const CLAIMABLE: [OrderStatus; 3] = [
    OrderStatus::New,
    OrderStatus::Registered,
    OrderStatus::Processing,
];

/// Label that does not name any [`OrderStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown order status: {0:?}")]
pub struct UnknownStatus(pub String);

impl OrderStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }

    /// Check if a queue entry in this state may be claimed by a worker
    #[inline]
    pub fn is_claimable(&self) -> bool {
        !self.is_terminal()
    }

    /// Get the numeric status ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL status ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(OrderStatus::New),
            2 => Some(OrderStatus::Registered),
            3 => Some(OrderStatus::Processing),
            4 => Some(OrderStatus::Invalid),
            5 => Some(OrderStatus::Processed),
            _ => None,
        }
    }

    /// IDs of the claimable statuses, for binding as `SMALLINT[]`
    pub fn claimable_ids() -> Vec<i16> {
        CLAIMABLE.iter().map(OrderStatus::id).collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Registered => "REGISTERED",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    fn stage(&self) -> u8 {
        match self {
            OrderStatus::New => 0,
            OrderStatus::Registered => 1,
            OrderStatus::Processing => 2,
            OrderStatus::Invalid | OrderStatus::Processed => 3,
        }
    }

    /// Whether moving from `self` to `next` follows the forward-only order.
    ///
    /// Stages may be skipped (a first poll can already report PROCESSED) and a
    /// non-terminal status may repeat; terminal statuses never move.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        !self.is_terminal() && next.stage() >= self.stage()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "REGISTERED" => Ok(OrderStatus::Registered),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<i16> for OrderStatus {
    type Error = i16;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        OrderStatus::from_id(value).ok_or(value)
    }
}
