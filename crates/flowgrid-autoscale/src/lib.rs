//! flowgrid-autoscale — sizing hints from vertical autoscaler objects.
//!
//! Each flow gets one autoscaler object in the orchestrator, created in
//! observe-only mode the first time the flow is dispatched. Once the object
//! is old enough and has published a target for the flow container, that
//! target (scaled by the configured multipliers) replaces the static
//! default request.

pub mod error;
pub mod recommender;

pub use error::{AutoscaleError, AutoscaleResult};
pub use recommender::{autoscaler_name, VpaRecommender};
