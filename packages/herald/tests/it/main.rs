//! Integration tests for the Herald API.
//!
//! These tests run a Herald server against an in-process fake bridge and talk
//! to it with the `clients` library, the way the feed reader and its frontend
//! would.

mod discovery;
mod helpers;
mod proxy;

pub use helpers::*;
