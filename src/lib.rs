//! Shutterpay - payment settlement and secure download access for a photo marketplace
//!
//! This library turns payment gateway events into exactly-once order state changes
//! and grants time-boxed, attempt-limited access to purchased photos through signed
//! capability tokens.

pub mod checkout;
pub mod config;
pub mod crypto;
pub mod db;
pub mod downloads;
pub mod email;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod jobs;
pub mod maintenance;
pub mod models;
pub mod orders;
pub mod payments;
pub mod preorders;
pub mod rate_limit;
pub mod refunds;
pub mod settlement;
pub mod storage;
pub mod token;
pub mod util;
