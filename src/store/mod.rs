//! Shared KeyDB connectivity for the verdict cache and the rate ledger.

pub mod redis;
