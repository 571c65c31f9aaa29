//! Package maps: the negotiated index space for network object references
//!
//! Each connection carries an ordered list of package entries. Object
//! indices are assigned at compute time from each package's
//! generation-specific net-object count; client and server maps must be
//! compute-identical before a join is accepted or replicated references
//! would dereference to the wrong entities.

use crate::guid::Guid;
use crate::net::message::WirePackageInfo;

/// One package entry in a connection's map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_name: String,
    pub guid: Guid,
    /// Generation the remote side reported, zero until acknowledged
    pub remote_generation: u32,
    /// Generation of the locally resolved package file, zero until found
    pub local_generation: u32,
    pub forced_export_base_package: Option<String>,
    /// Net-object count per generation of the local package file
    pub net_object_counts: Vec<u32>,
    /// Travel hop the entry was announced in; entries from the
    /// destination map wait for the world switch before verification
    pub loading_phase: u8,
    /// Whether the local package file has been located
    pub resolved: bool,
}

impl PackageInfo {
    pub fn from_wire(info: &WirePackageInfo) -> Self {
        PackageInfo {
            package_name: info.package_name.clone(),
            guid: info.guid,
            remote_generation: info.remote_generation,
            local_generation: 0,
            forced_export_base_package: info.forced_export_base_package.clone(),
            net_object_counts: Vec::new(),
            loading_phase: 0,
            resolved: false,
        }
    }

    pub fn to_wire(&self, generation: u32) -> WirePackageInfo {
        WirePackageInfo {
            package_name: self.package_name.clone(),
            guid: self.guid,
            remote_generation: generation,
            forced_export_base_package: self.forced_export_base_package.clone(),
        }
    }

    /// Generation whose net-object count sizes this package's index
    /// range: the newest generation both sides have.
    pub fn effective_generation(&self) -> u32 {
        match (self.local_generation, self.remote_generation) {
            (0, remote) => remote,
            (local, 0) => local,
            (local, remote) => local.min(remote),
        }
    }
}

/// Index range assigned to one package by compute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetIndexRange {
    pub package_name: String,
    pub guid: Guid,
    pub first: u32,
    pub count: u32,
}

/// Ordered set of package entries plus their computed index assignment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackageMap {
    pub list: Vec<PackageInfo>,
    assignments: Vec<NetIndexRange>,
}

impl PackageMap {
    pub fn clear(&mut self) {
        self.list.clear();
        self.assignments.clear();
    }

    /// Add an entry for a locally known package (server master map path)
    pub fn add_local_package(
        &mut self,
        name: &str,
        guid: Guid,
        local_generation: u32,
        net_object_counts: Vec<u32>,
    ) {
        if self.find(guid).is_some() {
            return;
        }
        self.list.push(PackageInfo {
            package_name: name.to_string(),
            guid,
            remote_generation: 0,
            local_generation,
            forced_export_base_package: None,
            net_object_counts,
            loading_phase: 0,
            resolved: true,
        });
    }

    /// Append an announced entry, preserving announcement order
    pub fn add_info(&mut self, info: PackageInfo) {
        if let Some(existing) = self.find_mut(info.guid) {
            existing.remote_generation = info.remote_generation;
            return;
        }
        self.list.push(info);
    }

    pub fn find(&self, guid: Guid) -> Option<&PackageInfo> {
        self.list.iter().find(|info| info.guid == guid)
    }

    pub fn find_mut(&mut self, guid: Guid) -> Option<&mut PackageInfo> {
        self.list.iter_mut().find(|info| info.guid == guid)
    }

    pub fn remove_by_guid(&mut self, guid: Guid) -> bool {
        let before = self.list.len();
        self.list.retain(|info| info.guid != guid);
        before != self.list.len()
    }

    /// Replace contents with another map's entries (welcome path)
    pub fn copy_from(&mut self, other: &PackageMap) {
        self.list = other.list.clone();
        self.assignments.clear();
    }

    /// Assign a dense index range to every entry, ordered by package
    /// order then index within the package. Re-run whenever a package is
    /// added or removed and whenever a remote generation arrives.
    pub fn compute(&mut self) -> &[NetIndexRange] {
        self.assignments.clear();
        let mut next = 0u32;
        for info in &self.list {
            let generation = info.effective_generation();
            let count = if generation == 0 {
                0
            } else {
                info.net_object_counts
                    .get(generation as usize - 1)
                    .copied()
                    .unwrap_or(0)
            };
            self.assignments.push(NetIndexRange {
                package_name: info.package_name.clone(),
                guid: info.guid,
                first: next,
                count,
            });
            next += count;
        }
        &self.assignments
    }

    pub fn assignments(&self) -> &[NetIndexRange] {
        &self.assignments
    }

    /// Total object index space across all computed ranges
    pub fn object_count(&self) -> u32 {
        self.assignments
            .last()
            .map_or(0, |range| range.first + range.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(n: u32) -> Guid {
        Guid::from_words(n, 0, 0, 0)
    }

    fn make_map() -> PackageMap {
        let mut map = PackageMap::default();
        map.add_local_package("Core", guid(1), 2, vec![10, 12]);
        map.add_local_package("DM-Foo", guid(2), 1, vec![100]);
        map
    }

    #[test]
    fn test_compute_assigns_dense_ordered_ranges() {
        let mut map = make_map();
        map.list[0].remote_generation = 2;
        map.list[1].remote_generation = 1;
        map.compute();
        let ranges = map.assignments();
        assert_eq!(ranges[0].first, 0);
        assert_eq!(ranges[0].count, 12);
        assert_eq!(ranges[1].first, 12);
        assert_eq!(ranges[1].count, 100);
        assert_eq!(map.object_count(), 112);
    }

    #[test]
    fn test_effective_generation_is_minimum_of_known() {
        let mut info = PackageInfo {
            package_name: "Core".to_string(),
            guid: guid(1),
            remote_generation: 2,
            local_generation: 3,
            forced_export_base_package: None,
            net_object_counts: vec![10, 12, 14],
            loading_phase: 0,
            resolved: true,
        };
        assert_eq!(info.effective_generation(), 2);
        info.remote_generation = 0;
        assert_eq!(info.effective_generation(), 3);
    }

    #[test]
    fn test_client_and_server_maps_compute_identically() {
        // Server's view of the client.
        let mut server = make_map();
        server.list[0].remote_generation = 2;
        server.list[1].remote_generation = 1;

        // Client built its map from the announcements, in order.
        let mut client = PackageMap::default();
        for info in &server.list {
            let mut entry = PackageInfo::from_wire(&info.to_wire(info.local_generation));
            entry.local_generation = info.remote_generation;
            entry.net_object_counts = info.net_object_counts.clone();
            entry.resolved = true;
            client.add_info(entry);
        }

        server.compute();
        client.compute();
        assert_eq!(server.assignments(), client.assignments());
    }

    #[test]
    fn test_add_info_preserves_order_and_updates_duplicates() {
        let mut map = PackageMap::default();
        map.add_info(PackageInfo::from_wire(&WirePackageInfo {
            package_name: "A".to_string(),
            guid: guid(5),
            remote_generation: 1,
            forced_export_base_package: None,
        }));
        map.add_info(PackageInfo::from_wire(&WirePackageInfo {
            package_name: "A".to_string(),
            guid: guid(5),
            remote_generation: 2,
            forced_export_base_package: None,
        }));
        assert_eq!(map.list.len(), 1);
        assert_eq!(map.list[0].remote_generation, 2);
    }

    #[test]
    fn test_remove_by_guid() {
        let mut map = make_map();
        assert!(map.remove_by_guid(guid(1)));
        assert!(!map.remove_by_guid(guid(1)));
        assert_eq!(map.list.len(), 1);
    }
}
