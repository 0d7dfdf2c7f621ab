//! Rollout error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("no usable version found for image type: {image_type}")]
    MissingVersion { image_type: String },

    #[error("ramp-up percent must be within 0..=100, got {0}")]
    InvalidPercent(u32),

    #[error("state store error: {0}")]
    State(#[from] flowgrid_state::StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
