//! Flowgrid container rollout — which executions go to containers, and
//! which image versions they get.
//!
//! # Components
//!
//! - **`criteria`** — the ordered dispatch criteria chain (flow-param
//!   overrides, ramp-up, job-type allow-list, proxy-user and
//!   project-version deny-lists)
//! - **`lists`** — hot-reloadable allow/deny lists held as immutable
//!   snapshots behind an atomic pointer
//! - **`ramp`** — ramp-up percentage and the stable flow-name hash
//! - **`image_rampup`** — per image type version selection from rampup plans

pub mod criteria;
pub mod error;
pub mod image_rampup;
pub mod lists;
pub mod ramp;

pub use criteria::{Decision, DispatchCriteria, Rule};
pub use error::{RolloutError, RolloutResult};
pub use image_rampup::ImageRampupManager;
pub use lists::{JobTypeAllowList, ProjectVersionDenyList, ProxyUserDenyList, ALL_JOB_TYPES};
pub use ramp::{ramp_bucket, RampUp};
