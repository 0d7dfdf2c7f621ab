//! flowgrid-metrics — observability for the dispatch engine.
//!
//! Counts claims, dispatch outcomes, failure handling, and reaper actions,
//! tracks dispatch latency, and renders everything in the Prometheus text
//! exposition format.
//!
//! # Architecture
//!
//! ```text
//! DispatchMetrics
//!   ├── record_*() ← called by the queue processor, dispatcher, and reaper
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for the /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{DispatchMetrics, MetricsSnapshot};
pub use prometheus::render_prometheus;
