//! Utility Module
//!
//! - [`time`]: the interval timer that paces eviction, plus the platform
//!   `Instant`/`Duration` (`web_time` on wasm32)

pub mod time;

pub use time::{Duration, EvictionTimer, Instant};
