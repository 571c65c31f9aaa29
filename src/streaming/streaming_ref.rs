//! Streaming residency descriptors
//!
//! A streaming ref is a viewer-independent description of when one level
//! should be resident and visible. The variants are a closed set; adding
//! a residency policy means adding a variant here.

use crate::guid::Guid;
use crate::world::LevelRef;
use glam::{Quat, Vec3};

/// A convex volume, represented as a center and extents for containment
/// tests. Real volumes come from brush geometry; the streamer only needs
/// the containment predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingVolume {
    pub center: Vec3,
    pub extents: Vec3,
}

impl StreamingVolume {
    pub fn contains(&self, point: Vec3) -> bool {
        let delta = (point - self.center).abs();
        delta.x <= self.extents.x && delta.y <= self.extents.y && delta.z <= self.extents.z
    }
}

/// Residency policy for one streamed level
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingPolicy {
    /// Script-controlled: explicit flags toggled by kismet actions
    KismetControlled {
        should_be_loaded: bool,
        should_be_visible: bool,
    },
    /// Resident while any viewer is within range of the origin
    DistanceBased { origin: Vec3, max_distance: f32 },
    /// Resident while any viewer is inside one of the volumes
    VolumeBased { volumes: Vec<StreamingVolume> },
    /// Always resident while the world is live
    AlwaysLoaded,
    /// Never unloads; used for nested seamless world hosts
    Persistent,
}

/// A residency descriptor plus its runtime bookkeeping
#[derive(Clone)]
pub struct StreamingRef {
    pub package_name: String,
    pub guid: Guid,
    pub policy: StreamingPolicy,
    /// Offset applied to the level's entities when associated
    pub offset: Vec3,
    pub old_offset: Vec3,
    pub rotation: Quat,
    pub is_visible: bool,
    pub has_load_request_pending: bool,
    pub has_unload_request_pending: bool,
    pub is_requesting_unload_and_removal: bool,
    pub should_block_on_load: bool,
    pub loaded_level: Option<LevelRef>,
}

impl StreamingRef {
    pub fn new(package_name: &str, guid: Guid, policy: StreamingPolicy) -> Self {
        StreamingRef {
            package_name: package_name.to_string(),
            guid,
            policy,
            offset: Vec3::ZERO,
            old_offset: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            is_visible: false,
            has_load_request_pending: false,
            has_unload_request_pending: false,
            is_requesting_unload_and_removal: false,
            should_block_on_load: false,
            loaded_level: None,
        }
    }

    /// Whether this level should be present in memory for a viewer here.
    /// Returning true only *starts* streaming; callers give the loader
    /// lead time by answering true before the level is needed.
    pub fn should_be_loaded(&self, view: Vec3) -> bool {
        match &self.policy {
            StreamingPolicy::KismetControlled {
                should_be_loaded, ..
            } => *should_be_loaded,
            StreamingPolicy::DistanceBased {
                origin,
                max_distance,
            } => view.distance(*origin) <= *max_distance,
            StreamingPolicy::VolumeBased { volumes } => {
                volumes.iter().any(|volume| volume.contains(view))
            }
            StreamingPolicy::AlwaysLoaded | StreamingPolicy::Persistent => true,
        }
    }

    /// Whether the level should be associated with the world if loaded
    pub fn should_be_visible(&self, view: Vec3) -> bool {
        match &self.policy {
            StreamingPolicy::KismetControlled {
                should_be_visible, ..
            } => *should_be_visible,
            _ => self.should_be_loaded(view),
        }
    }

    /// Persistent refs never unload regardless of viewers
    pub fn never_unloads(&self) -> bool {
        matches!(
            self.policy,
            StreamingPolicy::AlwaysLoaded | StreamingPolicy::Persistent
        )
    }
}

impl std::fmt::Debug for StreamingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingRef")
            .field("package_name", &self.package_name)
            .field("policy", &self.policy)
            .field("is_visible", &self.is_visible)
            .field("loaded", &self.loaded_level.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_policy() {
        let streaming = StreamingRef::new(
            "L2",
            Guid::from_words(1, 0, 0, 0),
            StreamingPolicy::DistanceBased {
                origin: Vec3::new(5000.0, 0.0, 0.0),
                max_distance: 8000.0,
            },
        );
        assert!(streaming.should_be_loaded(Vec3::ZERO));
        assert!(streaming.should_be_visible(Vec3::ZERO));
        assert!(!streaming.should_be_loaded(Vec3::new(20000.0, 0.0, 0.0)));
    }

    #[test]
    fn test_volume_policy() {
        let streaming = StreamingRef::new(
            "L3",
            Guid::from_words(2, 0, 0, 0),
            StreamingPolicy::VolumeBased {
                volumes: vec![StreamingVolume {
                    center: Vec3::new(100.0, 0.0, 0.0),
                    extents: Vec3::splat(50.0),
                }],
            },
        );
        assert!(streaming.should_be_loaded(Vec3::new(120.0, 10.0, -10.0)));
        assert!(!streaming.should_be_loaded(Vec3::ZERO));
    }

    #[test]
    fn test_kismet_policy_splits_loaded_and_visible() {
        let streaming = StreamingRef::new(
            "L4",
            Guid::from_words(3, 0, 0, 0),
            StreamingPolicy::KismetControlled {
                should_be_loaded: true,
                should_be_visible: false,
            },
        );
        assert!(streaming.should_be_loaded(Vec3::ZERO));
        assert!(!streaming.should_be_visible(Vec3::ZERO));
    }

    #[test]
    fn test_always_loaded_never_unloads() {
        let streaming = StreamingRef::new(
            "L5",
            Guid::from_words(4, 0, 0, 0),
            StreamingPolicy::AlwaysLoaded,
        );
        assert!(streaming.should_be_loaded(Vec3::splat(1.0e9)));
        assert!(streaming.never_unloads());
    }
}
