//! Image rampup — picks the version of each image type a new container gets.
//!
//! A rampup plan splits flows between versions by percentage. When the
//! plan is complete (sums to 100) a uniform draw in `1..=100` walks the
//! cumulative ranges in ascending-percentage order. Without a complete
//! plan the newest ACTIVE version is used.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use tracing::{debug, warn};

use flowgrid_state::{ImageRampup, ImageState, StateStore, VersionInfo};

use crate::error::{RolloutError, RolloutResult};

/// Pick the plan slice whose cumulative range contains `draw` (1..=100).
fn pick_slice(plan: &[ImageRampup], draw: u32) -> Option<&ImageRampup> {
    let mut sorted: Vec<&ImageRampup> = plan.iter().collect();
    sorted.sort_by_key(|slice| slice.percent);
    let mut upper = 0;
    for slice in sorted {
        upper += slice.percent;
        if draw <= upper && slice.percent > 0 {
            return Some(slice);
        }
    }
    None
}

#[derive(Clone)]
pub struct ImageRampupManager {
    store: StateStore,
}

impl ImageRampupManager {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Version for one image type.
    pub fn select_version(&self, image_type: &str) -> RolloutResult<VersionInfo> {
        let draw = rand::rng().random_range(1..=100);
        self.select_with_draw(image_type, draw)
    }

    /// Versions for several image types, keyed by lower-cased type.
    pub fn select_versions(
        &self,
        image_types: &BTreeSet<String>,
    ) -> RolloutResult<BTreeMap<String, VersionInfo>> {
        image_types
            .iter()
            .map(|image_type| {
                self.select_version(image_type)
                    .map(|info| (image_type.to_ascii_lowercase(), info))
            })
            .collect()
    }

    fn select_with_draw(&self, image_type: &str, draw: u32) -> RolloutResult<VersionInfo> {
        let plan = self.store.get_image_rampups(image_type)?;
        let total: u32 = plan.iter().map(|slice| slice.percent).sum();

        if total == 100 {
            if let Some(slice) = pick_slice(&plan, draw) {
                match self.store.get_image_version(image_type, &slice.version)? {
                    Some(image) if !image.state.is_retired() => {
                        debug!(%image_type, version = %image.version, draw, "version picked from rampup");
                        return Ok(VersionInfo::new(&image.version, image.state));
                    }
                    Some(image) => {
                        warn!(%image_type, version = %image.version, state = ?image.state, "rampup points at a retired version");
                    }
                    None => {
                        warn!(%image_type, version = %slice.version, "rampup points at an unregistered version");
                    }
                }
            }
        } else if !plan.is_empty() {
            warn!(%image_type, total, "incomplete rampup plan ignored");
        }

        self.latest_active(image_type)
    }

    /// Newest ACTIVE version of an image type.
    pub fn latest_active(&self, image_type: &str) -> RolloutResult<VersionInfo> {
        self.store
            .list_image_versions(image_type)?
            .into_iter()
            .rev()
            .find(|image| image.state == ImageState::Active)
            .map(|image| VersionInfo::new(&image.version, image.state))
            .ok_or_else(|| RolloutError::MissingVersion {
                image_type: image_type.to_string(),
            })
    }
}
