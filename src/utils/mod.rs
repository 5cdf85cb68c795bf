//! # Utility Modules
//!
//! Supporting utilities shared by the connection and service layers.
//!
//! ## Components
//! - **Logging**: tracing subscriber setup from configuration
//! - **Metrics**: per-connection atomic counters
//! - **Pending**: condition-variable one-shot results with deadlines
//! - **Time**: injectable millisecond clocks
//! - **Timeout**: default durations and an async timeout wrapper

pub mod logging;
pub mod metrics;
pub mod pending;
pub mod time;
pub mod timeout;

pub use pending::{Pending, WaitOutcome};
pub use time::{Clock, ManualClock, SystemClock};
