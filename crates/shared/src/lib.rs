//! Clipmeter Shared Library
//!
//! Domain enums and database plumbing used by every Clipmeter crate.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    BillingInterval, ParseEnumError, SubscriptionStatus, SubscriptionTier, TransactionKind,
};
