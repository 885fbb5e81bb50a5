//! Load balancer rotation membership
//!
//! A frontend serves traffic only while it is in rotation. Each search
//! cluster the frontend dispatches to votes through a [`RotationSink`];
//! [`VipStatus`] keeps the frontend in rotation while every cluster is up.

use crate::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

/// Receiver of rotation votes. Both calls are idempotent.
pub trait RotationSink: Send + Sync {
    fn add_to_rotation(&self, cluster_id: &str);

    fn remove_from_rotation(&self, cluster_id: &str);
}

/// Rotation status of this frontend, combined over its search clusters
#[derive(Debug)]
pub struct VipStatus {
    clusters: Mutex<HashMap<String, bool>>,
    initially_in_rotation: bool,
}

impl Default for VipStatus {
    fn default() -> Self {
        Self::new(false)
    }
}

impl VipStatus {
    /// Create a status that reports `initially_in_rotation` until some cluster votes
    pub fn new(initially_in_rotation: bool) -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
            initially_in_rotation,
        }
    }

    /// Whether this frontend should receive traffic
    pub fn is_in_rotation(&self) -> bool {
        let clusters = self.clusters.lock();
        if clusters.is_empty() {
            return self.initially_in_rotation;
        }
        clusters.values().all(|up| *up)
    }

    /// Last vote of `cluster_id`, if it has voted
    pub fn cluster_status(&self, cluster_id: &str) -> Option<bool> {
        self.clusters.lock().get(cluster_id).copied()
    }

    fn set(&self, cluster_id: &str, up: bool) {
        let was_in_rotation = self.is_in_rotation();
        let previous = self.clusters.lock().insert(cluster_id.to_string(), up);
        let in_rotation = self.is_in_rotation();

        if previous != Some(up) {
            metrics::record_rotation(cluster_id, up);
        }
        if was_in_rotation != in_rotation {
            if in_rotation {
                info!("Putting container in rotation: cluster {} is up", cluster_id);
            } else {
                warn!("Removing container from rotation: cluster {} is down", cluster_id);
            }
        }
    }
}

impl RotationSink for VipStatus {
    fn add_to_rotation(&self, cluster_id: &str) {
        self.set(cluster_id, true);
    }

    fn remove_from_rotation(&self, cluster_id: &str) {
        self.set(cluster_id, false);
    }
}
