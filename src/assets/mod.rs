//! Asset loading
//!
//! Packages are identified by `(name, guid)` and carry a monotonically
//! incrementing generation, a per-generation net-object count vector used
//! to size network index spaces, and optionally a level template. The
//! `AssetServer` resolves load requests against a shared catalog with a
//! configurable latency in ticks and delivers completions back to the
//! game thread over a channel, mirroring an async loader thread.

use crate::entity::{EntityClass, EntityScript, NetRole};
use crate::guid::Guid;
use crate::streaming::StreamingRef;
use crossbeam_channel::{unbounded, Receiver, Sender};
use glam::Vec3;
use log::{debug, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Name suffix of localized variant packages
pub const LOCALIZED_SUFFIX: &str = "_LOC";

/// Factory producing a fresh script object for a templated entity
pub type ScriptFactory = Rc<dyn Fn() -> Box<dyn EntityScript>>;

/// A placed entity in a level template
#[derive(Clone)]
pub struct EntityTemplate {
    pub name: String,
    pub class: EntityClass,
    pub guid: Option<Guid>,
    pub location: Vec3,
    pub is_static: bool,
    pub no_delete: bool,
    pub wants_tick: bool,
    pub remote_role: NetRole,
    pub components: Vec<String>,
    pub script: Option<ScriptFactory>,
}

impl EntityTemplate {
    pub fn new(name: &str, class: EntityClass) -> Self {
        EntityTemplate {
            name: name.to_string(),
            class,
            guid: None,
            location: Vec3::ZERO,
            is_static: false,
            no_delete: false,
            wants_tick: false,
            remote_role: NetRole::None,
            components: Vec::new(),
            script: None,
        }
    }
}

/// A cross-level reference record in a template
#[derive(Clone)]
pub struct CrossRefTemplate {
    pub target_guid: Guid,
    pub owner_name: String,
    pub field: String,
}

/// Content of a level stored in a package
#[derive(Clone, Default)]
pub struct LevelTemplate {
    pub entities: Vec<EntityTemplate>,
    pub sequences: Vec<String>,
    pub has_bsp: bool,
    pub cross_refs: Vec<CrossRefTemplate>,
    /// Residency descriptors the level declares for its sub-levels
    pub streaming_levels: Vec<StreamingRef>,
}

/// A package known to the catalog
#[derive(Clone)]
pub struct PackageTemplate {
    pub name: String,
    pub guid: Guid,
    /// Net-object count per generation; `len()` is the local generation
    pub net_object_counts: Vec<u32>,
    pub level: Option<LevelTemplate>,
    pub has_localized_variant: bool,
    pub play_in_editor: bool,
}

impl PackageTemplate {
    pub fn new(name: &str, guid: Guid) -> Self {
        PackageTemplate {
            name: name.to_string(),
            guid,
            net_object_counts: vec![0],
            level: None,
            has_localized_variant: false,
            play_in_editor: false,
        }
    }

    pub fn local_generation(&self) -> u32 {
        self.net_object_counts.len() as u32
    }
}

/// The set of packages this process can resolve
#[derive(Default)]
pub struct PackageCatalog {
    packages: FxHashMap<String, PackageTemplate>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        PackageCatalog::default()
    }

    pub fn add(&mut self, package: PackageTemplate) {
        self.packages.insert(package.name.clone(), package);
    }

    pub fn get(&self, name: &str) -> Option<&PackageTemplate> {
        self.packages.get(name)
    }

    /// Find a package file by name, optionally pinned to a guid
    pub fn find(&self, name: &str, guid: Option<Guid>) -> Option<&PackageTemplate> {
        self.packages
            .get(name)
            .filter(|pkg| guid.map_or(true, |g| pkg.guid == g))
    }
}

/// Outcome of one async load request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub package_name: String,
    pub ok: bool,
}

struct PendingLoad {
    name: String,
    guid: Option<Guid>,
    remaining_ticks: u32,
}

/// Asynchronous package loader
///
/// Requests resolve after `latency_ticks` calls to `tick`, or immediately
/// on `flush`. Completed packages become resident until unloaded; the
/// completion channel is drained once per frame on the game thread.
pub struct AssetServer {
    catalog: Arc<RwLock<PackageCatalog>>,
    pending: Vec<PendingLoad>,
    resident: FxHashMap<String, PackageTemplate>,
    completion_tx: Sender<LoadResult>,
    completion_rx: Receiver<LoadResult>,
    pub latency_ticks: u32,
}

impl AssetServer {
    pub fn new(catalog: Arc<RwLock<PackageCatalog>>, latency_ticks: u32) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        AssetServer {
            catalog,
            pending: Vec::new(),
            resident: FxHashMap::default(),
            completion_tx,
            completion_rx,
            latency_ticks,
        }
    }

    pub fn catalog(&self) -> Arc<RwLock<PackageCatalog>> {
        self.catalog.clone()
    }

    /// Queue an async load. Already-resident packages complete this tick;
    /// duplicate requests coalesce.
    pub fn load_async(&mut self, name: &str, guid: Option<Guid>) {
        if self.resident.contains_key(name) {
            let _ = self.completion_tx.send(LoadResult {
                package_name: name.to_string(),
                ok: true,
            });
            return;
        }
        if self.pending.iter().any(|p| p.name == name) {
            return;
        }
        debug!("async load requested for package '{}'", name);
        self.pending.push(PendingLoad {
            name: name.to_string(),
            guid,
            remaining_ticks: self.latency_ticks,
        });
    }

    pub fn is_async_loading(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Advance pending loads by one tick
    pub fn tick(&mut self) {
        for load in self.pending.iter_mut() {
            if load.remaining_ticks > 0 {
                load.remaining_ticks -= 1;
            }
        }
        let mut finished = Vec::new();
        self.pending.retain(|load| {
            if load.remaining_ticks == 0 {
                finished.push((load.name.clone(), load.guid));
                false
            } else {
                true
            }
        });
        for (name, guid) in finished {
            self.finish_load(&name, guid);
        }
    }

    /// Complete all pending loads synchronously, optionally excluding
    /// packages whose name carries the given suffix
    pub fn flush(&mut self, exclude_suffix: Option<&str>) {
        let mut kept = Vec::new();
        let mut finished = Vec::new();
        for load in self.pending.drain(..) {
            let excluded = exclude_suffix.map_or(false, |s| load.name.ends_with(s));
            if excluded {
                kept.push(load);
            } else {
                finished.push((load.name, load.guid));
            }
        }
        self.pending = kept;
        for (name, guid) in finished {
            self.finish_load(&name, guid);
        }
    }

    fn finish_load(&mut self, name: &str, guid: Option<Guid>) {
        let package = self.catalog.read().find(name, guid).cloned();
        let ok = match package {
            Some(template) => {
                self.resident.insert(name.to_string(), template);
                true
            }
            None => {
                warn!("failed to find package '{}'", name);
                false
            }
        };
        let _ = self.completion_tx.send(LoadResult {
            package_name: name.to_string(),
            ok,
        });
    }

    /// Drain load completions delivered since the last call
    pub fn drain_completions(&mut self) -> Vec<LoadResult> {
        self.completion_rx.try_iter().collect()
    }

    /// A package that has finished loading and not been purged
    pub fn resident(&self, name: &str) -> Option<&PackageTemplate> {
        self.resident.get(name)
    }

    pub fn is_resident(&self, name: &str) -> bool {
        self.resident.contains_key(name)
    }

    /// Drop a resident package, used by the streaming purge path
    pub fn unload(&mut self, name: &str) {
        self.resident.remove(name);
    }

    /// Make a package resident without a load request (startup maps)
    pub fn force_resident(&mut self, name: &str) -> bool {
        if self.resident.contains_key(name) {
            return true;
        }
        match self.catalog.read().get(name).cloned() {
            Some(template) => {
                self.resident.insert(name.to_string(), template);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_catalog() -> Arc<RwLock<PackageCatalog>> {
        let mut catalog = PackageCatalog::new();
        catalog.add(PackageTemplate::new("DM-Foo", Guid::from_words(7, 0, 0, 0)));
        Arc::new(RwLock::new(catalog))
    }

    #[test]
    fn test_load_completes_after_latency() {
        let mut server = AssetServer::new(make_catalog(), 2);
        server.load_async("DM-Foo", None);
        assert!(server.is_async_loading());

        server.tick();
        assert!(server.drain_completions().is_empty());

        server.tick();
        let done = server.drain_completions();
        assert_eq!(done.len(), 1);
        assert!(done[0].ok);
        assert!(server.is_resident("DM-Foo"));
        assert!(!server.is_async_loading());
    }

    #[test]
    fn test_missing_package_reports_failure() {
        let mut server = AssetServer::new(make_catalog(), 0);
        server.load_async("DM-Missing", None);
        server.tick();
        let done = server.drain_completions();
        assert_eq!(done.len(), 1);
        assert!(!done[0].ok);
        assert!(!server.is_resident("DM-Missing"));
    }

    #[test]
    fn test_guid_mismatch_fails_load() {
        let mut server = AssetServer::new(make_catalog(), 0);
        server.load_async("DM-Foo", Some(Guid::from_words(9, 9, 9, 9)));
        server.tick();
        let done = server.drain_completions();
        assert!(!done[0].ok);
    }

    #[test]
    fn test_flush_completes_pending_except_excluded() {
        let catalog = make_catalog();
        catalog.write().add(PackageTemplate::new(
            "Textures_LOC",
            Guid::from_words(2, 0, 0, 0),
        ));
        let mut server = AssetServer::new(catalog, 10);
        server.load_async("DM-Foo", None);
        server.load_async("Textures_LOC", None);

        server.flush(Some(LOCALIZED_SUFFIX));
        assert!(server.is_resident("DM-Foo"));
        assert!(!server.is_resident("Textures_LOC"));
        assert!(server.is_async_loading());

        server.flush(None);
        assert!(server.is_resident("Textures_LOC"));
    }

    #[test]
    fn test_duplicate_requests_coalesce() {
        let mut server = AssetServer::new(make_catalog(), 3);
        server.load_async("DM-Foo", None);
        server.load_async("DM-Foo", None);
        server.tick();
        server.tick();
        server.tick();
        assert_eq!(server.drain_completions().len(), 1);
    }
}
