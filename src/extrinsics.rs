use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::lazy::Lazy;
use crate::{Result, SensorError};

/// Rigid transform: `p' = rotation * p + translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// 3x3 row-major rotation matrix.
    pub rotation: [[f64; 3]; 3],
    /// Translation in meters.
    pub translation: [f64; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub const fn identity() -> Self {
        Self {
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [0.0; 3],
        }
    }

    pub const fn from_translation(translation: [f64; 3]) -> Self {
        Self {
            rotation: Self::identity().rotation,
            translation,
        }
    }

    pub const fn new(rotation: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        Self { rotation, translation }
    }

    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        let r = &self.rotation;
        let mut out = self.translation;
        for (i, o) in out.iter_mut().enumerate() {
            *o += r[i][0] * p[0] + r[i][1] * p[1] + r[i][2] * p[2];
        }
        out
    }

    /// Inverse of a rigid transform: `Rᵀ, -Rᵀ t`.
    pub fn inverse(&self) -> Self {
        let r = &self.rotation;
        let mut rt = [[0.0; 3]; 3];
        for (i, row) in rt.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = r[j][i];
            }
        }
        let t = &self.translation;
        let mut translation = [0.0; 3];
        for (i, v) in translation.iter_mut().enumerate() {
            *v = -(rt[i][0] * t[0] + rt[i][1] * t[1] + rt[i][2] * t[2]);
        }
        Self {
            rotation: rt,
            translation,
        }
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Self {
        let a = &self.rotation;
        let b = &other.rotation;
        let mut rotation = [[0.0; 3]; 3];
        for (i, row) in rotation.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
            }
        }
        Self {
            rotation,
            translation: self.transform_point(other.translation),
        }
    }
}

/// Process-unique sensor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId(u64);

impl SensorId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SensorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Device-wide pose table; every sensor of a device registers here.
#[derive(Default)]
pub struct DeviceGraph {
    poses: RwLock<HashMap<SensorId, Arc<Lazy<Pose>>>>,
}

impl DeviceGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register (or replace) the pose provider of `id`.
    pub fn set_pose(&self, id: SensorId, pose: Lazy<Pose>) {
        self.poses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(pose));
    }

    pub fn remove(&self, id: SensorId) {
        self.poses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn provider(&self, id: SensorId) -> Result<Arc<Lazy<Pose>>> {
        self.poses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                SensorError::InvalidArgument(format!("sensor {:?} is not on this device", id))
            })
    }

    /// Pose of `id` relative to the device origin, computed on first use.
    pub fn pose(&self, id: SensorId) -> Result<Pose> {
        // The map lock is released before a possibly slow pose computation.
        let provider = self.provider(id)?;
        let pose = provider.get()?;
        Ok(*pose)
    }

    /// Transform taking points in the `from` frame into the `to` frame.
    pub fn extrinsics(&self, from: SensorId, to: SensorId) -> Result<Pose> {
        let from_pose = self.pose(from)?;
        if from == to {
            return Ok(Pose::identity());
        }
        let to_pose = self.pose(to)?;
        Ok(to_pose.inverse().compose(&from_pose))
    }
}
