//! Accrual Service Client
//!
//! Thin HTTP client over the external accrual calculation service.
//!
//! ```text
//! GET {base}/api/orders/{number}
//!   200 → {"order": "...", "status": "REGISTERED|PROCESSING|INVALID|PROCESSED", "accrual": 42.0}
//!   204 → order not registered with the accrual service (yet)
//!   429 → rate limited, optional Retry-After seconds
//! ```

pub mod client;
pub mod error;

pub use client::{AccrualClient, AccrualOrder, HttpAccrualClient};
pub use error::AccrualError;
