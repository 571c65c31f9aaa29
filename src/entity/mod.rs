//! Entities: the unit of simulation
//!
//! An entity is a named scene object with a transform, attached
//! components, flags controlling streaming/tick behavior, and an optional
//! script object the scripting VM drives through a bounded set of hooks.

pub mod registry;
pub mod script;

pub use registry::{contains_entity, destroy_entity, remove_entity, spawn_entity};
pub use script::{DefaultGame, EntityScript, GameScript, PreLoginDecision};

use crate::guid::Guid;
use glam::{Quat, Vec3};
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Globally unique entity identity, stable across level reparenting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

/// Shared handle to an entity. The scene graph is single-threaded; all
/// mutation happens on the game thread between yield points.
pub type EntityRef = Rc<RefCell<Entity>>;
pub type EntityWeak = Weak<RefCell<Entity>>;

/// Network role of an entity, replicated as a byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NetRole {
    None = 0,
    SimulatedProxy = 1,
    AutonomousProxy = 2,
    Authority = 3,
}

/// Capability tags carried by an entity class. These replace run-time
/// class inspection: streaming, travel and net code branch on tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassTags {
    pub is_abstract: bool,
    pub is_world_info: bool,
    pub is_brush: bool,
    pub is_game_info: bool,
    pub is_controller: bool,
    pub is_player_controller: bool,
    pub is_pawn: bool,
    pub is_nav_point: bool,
}

/// A class/archetype reference: a path plus capability tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityClass {
    pub path: String,
    pub tags: ClassTags,
}

impl EntityClass {
    pub fn new(path: &str) -> Self {
        EntityClass {
            path: path.to_string(),
            tags: ClassTags::default(),
        }
    }

    pub fn with_tags(path: &str, tags: ClassTags) -> Self {
        EntityClass {
            path: path.to_string(),
            tags,
        }
    }

    pub fn world_info() -> Self {
        EntityClass::with_tags(
            "Engine.WorldInfo",
            ClassTags {
                is_world_info: true,
                ..Default::default()
            },
        )
    }

    pub fn brush() -> Self {
        EntityClass::with_tags(
            "Engine.Brush",
            ClassTags {
                is_brush: true,
                ..Default::default()
            },
        )
    }
}

/// An attached component. Renderer/physics state is tracked by the scene
/// handles; the entity records what it owns so attach/detach is cheap to
/// drive incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub name: String,
    pub attached: bool,
}

/// Mutable simulation state of an entity
#[derive(Debug)]
pub struct EntityState {
    pub id: EntityId,
    pub name: String,
    pub guid: Option<Guid>,
    pub class: EntityClass,
    pub location: Vec3,
    pub rotation: Quat,
    pub components: Vec<Component>,
    /// Static entities never move and sort into the actor-list prefix
    pub is_static: bool,
    /// No-delete entities survive level unloads
    pub no_delete: bool,
    pub wants_tick: bool,
    pub role: NetRole,
    pub remote_role: NetRole,
    pub pending_kill: bool,
    pub begun_play: bool,
    pub physics_initialized: bool,
    /// Kismet events generated for this entity, cleared on level move
    pub generated_events: Vec<String>,
    /// Set while a server-initiated controller swap awaits client ack
    pub pending_swap: bool,
}

impl EntityState {
    pub fn is_net_relevant(&self) -> bool {
        self.remote_role > NetRole::None
    }
}

/// A scene entity: state plus the optional script object driving it
pub struct Entity {
    pub state: EntityState,
    pub script: Option<Box<dyn EntityScript>>,
}

impl Entity {
    pub fn new(id: EntityId, name: &str, class: EntityClass) -> Self {
        Entity {
            state: EntityState {
                id,
                name: name.to_string(),
                guid: None,
                class,
                location: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                components: Vec::new(),
                is_static: false,
                no_delete: false,
                wants_tick: false,
                role: NetRole::Authority,
                remote_role: NetRole::None,
                pending_kill: false,
                begun_play: false,
                physics_initialized: false,
                generated_events: Vec::new(),
                pending_swap: false,
            },
            script: None,
        }
    }

    /// Route a script hook through the optional script object. The script
    /// is taken out for the call so it can mutate the entity state without
    /// aliasing itself.
    pub fn route<F>(entity: &EntityRef, f: F)
    where
        F: FnOnce(&mut dyn EntityScript, &mut EntityState),
    {
        let script = entity.borrow_mut().script.take();
        if let Some(mut script) = script {
            f(script.as_mut(), &mut entity.borrow_mut().state);
            entity.borrow_mut().script = Some(script);
        }
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("state", &self.state)
            .field("script", &self.script.as_ref().map(|_| "<script>"))
            .finish()
    }
}
