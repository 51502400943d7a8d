//! Herald library exports for integration tests.

pub mod api;
pub mod auth;
pub mod bridge;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod crypto;
pub mod feed_reader;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod social;
pub mod source_key;
pub mod token;
