//! Enhanced TP/SL Monitoring Engine
//!
//! Watches every open leveraged position across a primary and a mirror
//! Bybit account, maintains its four-rung take-profit ladder and stop-loss,
//! detects fills by position-size delta, moves the stop to breakeven after
//! TP1, and tears everything down when the position closes.

pub mod bybit;
pub mod cache;
pub mod common;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod events;
pub mod linkid;
pub mod mirror;
pub mod monitor;
pub mod persistence;
pub mod phase;
pub mod rebalance;
pub mod scheduler;
pub mod types;

pub use config::Config;
pub use types::*;
