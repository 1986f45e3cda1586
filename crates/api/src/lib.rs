#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Clipmeter API Library
//!
//! HTTP surface over the credit ledger, job admission and subscription
//! lifecycle, plus the payment provider webhook endpoint.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
