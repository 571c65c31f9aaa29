//! Shared scene resources owned by the world
//!
//! The physics solver, renderer and navigation store live behind their own
//! bindings; the world tracks what it has registered with each so add and
//! remove calls stay balanced across incremental init and teardown.

use crate::entity::EntityId;
use rustc_hash::FxHashSet;

/// Handle to the physics binding for one world
#[derive(Debug, Default)]
pub struct PhysicsScene {
    pub initialized: bool,
    bodies: FxHashSet<EntityId>,
    bsp_meshes: FxHashSet<String>,
}

impl PhysicsScene {
    pub fn init(&mut self) {
        self.initialized = true;
    }

    pub fn init_bsp_mesh(&mut self, package_name: &str) {
        self.bsp_meshes.insert(package_name.to_string());
    }

    pub fn term_bsp_mesh(&mut self, package_name: &str) {
        self.bsp_meshes.remove(package_name);
    }

    pub fn has_bsp_mesh(&self, package_name: &str) -> bool {
        self.bsp_meshes.contains(package_name)
    }

    pub fn init_body(&mut self, id: EntityId) {
        self.bodies.insert(id);
    }

    pub fn term_body(&mut self, id: EntityId) {
        self.bodies.remove(&id);
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn term(&mut self) {
        self.initialized = false;
        self.bodies.clear();
        self.bsp_meshes.clear();
    }
}

/// Handle to the renderer binding for one world
#[derive(Debug, Default)]
pub struct RendererScene {
    pub initialized: bool,
    attached: FxHashSet<(EntityId, String)>,
    pub persistent_debug_lines: usize,
}

impl RendererScene {
    pub fn init(&mut self) {
        self.initialized = true;
    }

    pub fn attach(&mut self, id: EntityId, component: &str) {
        self.attached.insert((id, component.to_string()));
    }

    pub fn detach_entity(&mut self, id: EntityId) {
        self.attached.retain(|(owner, _)| *owner != id);
    }

    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub fn flush_persistent_debug_lines(&mut self) {
        self.persistent_debug_lines = 0;
    }
}

/// Spatial lookup structure for entity queries
#[derive(Debug, Default)]
pub struct SpatialHash {
    entries: FxHashSet<EntityId>,
}

impl SpatialHash {
    pub fn insert(&mut self, id: EntityId) {
        self.entries.insert(id);
    }

    pub fn remove(&mut self, id: EntityId) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Navigation octree; nav points register while their level is resident
#[derive(Debug, Default)]
pub struct NavOctree {
    entries: FxHashSet<EntityId>,
}

impl NavOctree {
    pub fn insert(&mut self, id: EntityId) {
        self.entries.insert(id);
    }

    pub fn remove(&mut self, id: EntityId) {
        self.entries.remove(&id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
