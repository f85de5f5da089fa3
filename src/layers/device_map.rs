//! Device map inference under a per-device memory budget.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use super::ModuleTree;
use crate::config::{DeviceId, MaxMemory};

/// Assignment of modules (or single parameters) to devices, in placement order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceMap {
    entries: Vec<(String, DeviceId)>,
}

/// Work item of the planner
#[derive(Debug, Clone)]
enum Item {
    Module(usize),
    Param { name: String, size: u64 },
}

impl Item {
    fn name<'a>(&'a self, tree: &'a ModuleTree) -> &'a str {
        match self {
            Item::Module(idx) => &tree.node(*idx).name,
            Item::Param { name, .. } => name,
        }
    }

    fn size(&self, tree: &ModuleTree) -> u64 {
        match self {
            Item::Module(idx) => tree.node(*idx).size,
            Item::Param { size, .. } => *size,
        }
    }
}

/// Plan where each module of `tree` lives.
///
/// Top-level modules are placed in order on the current device while they
/// fit. A module that does not fit is broken into its parameters and children,
/// unless it is a leaf or one of `no_split_classes`; then the planner moves on
/// to the next device. The first accelerator and the cpu keep room for the
/// largest unsplittable module. Whatever exceeds every budget goes to disk.
pub fn infer_device_map(
    tree: &ModuleTree,
    max_memory: &MaxMemory,
    no_split_classes: &[String],
) -> DeviceMap {
    let mut devices: Vec<DeviceId> = max_memory.devices().filter(|d| *d != DeviceId::Disk).collect();
    devices.push(DeviceId::Disk);

    let main_devices: Vec<DeviceId> = devices
        .iter()
        .copied()
        .find(DeviceId::is_accelerator)
        .into_iter()
        .chain(std::iter::once(DeviceId::Cpu))
        .collect();

    let reserved = largest_unsplittable(tree, no_split_classes);
    tracing::debug!(
        "Placing {} bytes over {:?}, reserving {} bytes on {:?}",
        tree.total_size(),
        devices,
        reserved,
        main_devices
    );

    let root = tree.root();
    let mut queue: VecDeque<Item> = root
        .params
        .iter()
        .map(|p| Item::Param {
            name: p.name.clone(),
            size: p.size,
        })
        .chain(root.children.iter().map(|c| Item::Module(*c)))
        .collect();

    let mut map = DeviceMap::default();
    let mut current = 0;
    let mut used: u64 = 0;

    while let Some(item) = queue.pop_front() {
        let device = devices[current];
        if device == DeviceId::Disk {
            map.insert(item.name(tree).to_string(), device);
            continue;
        }

        let mut limit = max_memory.limit(device).unwrap_or(0);
        if main_devices.contains(&device) {
            limit = limit.saturating_sub(reserved);
        }

        let size = item.size(tree);
        if used + size <= limit {
            map.insert(item.name(tree).to_string(), device);
            used += size;
            continue;
        }

        match split(tree, &item, no_split_classes) {
            Some(parts) => {
                tracing::trace!("Splitting {} ({} bytes) on {}", item.name(tree), size, device);
                for part in parts.into_iter().rev() {
                    queue.push_front(part);
                }
            }
            None => {
                tracing::debug!(
                    "{} ({} bytes) does not fit on {} ({} of {} used), moving on",
                    item.name(tree),
                    size,
                    device,
                    used,
                    limit
                );
                current += 1;
                used = 0;
                queue.push_front(item);
            }
        }
    }

    map.compact(tree);
    map
}

/// Parameters then children of a splittable module
fn split(tree: &ModuleTree, item: &Item, no_split_classes: &[String]) -> Option<Vec<Item>> {
    let Item::Module(idx) = item else {
        return None;
    };
    let node = tree.node(*idx);
    if tree.is_no_split(*idx, no_split_classes) {
        return None;
    }
    if node.children.is_empty() && node.params.len() <= 1 {
        return None;
    }

    Some(
        node.params
            .iter()
            .map(|p| Item::Param {
                name: p.name.clone(),
                size: p.size,
            })
            .chain(node.children.iter().map(|c| Item::Module(*c)))
            .collect(),
    )
}

/// Size of the biggest no-split module, or of the biggest parameter when the
/// model has none.
fn largest_unsplittable(tree: &ModuleTree, no_split_classes: &[String]) -> u64 {
    let blocks = tree.no_split_modules(no_split_classes);
    if blocks.is_empty() {
        tree.params_under(0).iter().map(|p| p.size).max().unwrap_or(0)
    } else {
        blocks.iter().map(|b| tree.node(*b).size).max().unwrap_or(0)
    }
}

/// `key` covers `name` when it is the same path or one of its ancestors.
fn covers(key: &str, name: &str) -> bool {
    key.is_empty()
        || name == key
        || (name.len() > key.len() && name.starts_with(key) && name.as_bytes()[key.len()] == b'.')
}

impl DeviceMap {
    pub fn insert(&mut self, name: String, device: DeviceId) {
        self.entries.push((name, device));
    }

    pub fn entries(&self) -> &[(String, DeviceId)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Device of a tensor, from the most specific covering entry
    pub fn device_of(&self, tensor_name: &str) -> Option<DeviceId> {
        self.entries
            .iter()
            .filter(|(key, _)| covers(key, tensor_name))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, device)| *device)
    }

    /// Distinct devices in use, in placement order
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.entries.iter().map(|(_, d)| *d).collect()
    }

    /// Bytes assigned to each device
    pub fn bytes_per_device(&self, tree: &ModuleTree) -> BTreeMap<DeviceId, u64> {
        let mut totals = BTreeMap::new();
        for param in tree.params_under(0) {
            if let Some(device) = self.device_of(&param.name) {
                *totals.entry(device).or_insert(0) += param.size;
            }
        }
        totals
    }

    /// Collapse subtrees placed entirely on one device into a single entry.
    pub fn compact(&mut self, tree: &ModuleTree) {
        self.compact_node(tree, 0);
    }

    fn compact_node(&mut self, tree: &ModuleTree, idx: usize) {
        let name = tree.node(idx).name.as_str();
        let covered: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, (key, _))| covers(name, key))
            .map(|(i, _)| i)
            .collect();

        if covered.is_empty() {
            return;
        }

        let first_device = self.entries[covered[0]].1;
        let uniform = covered.iter().all(|i| self.entries[*i].1 == first_device);

        if uniform {
            if covered.len() > 1 {
                let position = covered[0];
                for i in covered.iter().rev() {
                    self.entries.remove(*i);
                }
                self.entries.insert(position, (name.to_string(), first_device));
            }
            return;
        }

        for child in tree.node(idx).children.clone() {
            self.compact_node(tree, child);
        }
    }

    /// Fail if any module of a no-split class spans more than one device or
    /// has a parameter without a device.
    pub fn check_no_split(&self, tree: &ModuleTree, no_split_classes: &[String]) -> crate::Result<()> {
        for idx in tree.no_split_modules(no_split_classes) {
            let mut devices = BTreeSet::new();
            for param in tree.params_under(idx) {
                let device = self.device_of(&param.name).ok_or_else(|| {
                    crate::FetchError::PlacementError(format!("{} has no device", param.name))
                })?;
                devices.insert(device);
            }

            if devices.len() > 1 {
                return Err(crate::FetchError::PlacementError(format!(
                    "{} ({}) is split across devices {:?}",
                    tree.node(idx).name,
                    tree.node(idx).class,
                    devices
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{")?;
        for (name, device) in &self.entries {
            let name = if name.is_empty() { "''" } else { name.as_str() };
            writeln!(f, "  {}: {}", name, device)?;
        }
        write!(f, "}}")
    }
}
