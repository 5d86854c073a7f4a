use std::collections::BTreeMap;
use std::ops::Bound;

use crate::expr::SymExpr;
use crate::memory::SymbolicMemory;
use crate::value::{CType, Value};

/// One epoch of a tracked allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicObject {
    start: u64,
    size: usize,
    manager_idx: usize,
    snapshot_idx: usize,
    mem: SymbolicMemory,
    writes: Vec<(SymExpr, SymExpr)>,
}

impl SymbolicObject {
    pub fn new(start: u64, size: usize, manager_idx: usize) -> Self {
        Self {
            start,
            size,
            manager_idx,
            snapshot_idx: 0,
            mem: SymbolicMemory::new(),
            writes: Vec::new(),
        }
    }

    pub fn from_parts(
        start: u64,
        size: usize,
        manager_idx: usize,
        snapshot_idx: usize,
        mem: SymbolicMemory,
        writes: Vec<(SymExpr, SymExpr)>,
    ) -> Self {
        Self {
            start,
            size,
            manager_idx,
            snapshot_idx,
            mem,
            writes,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    pub fn manager_idx(&self) -> usize {
        self.manager_idx
    }

    pub fn snapshot_idx(&self) -> usize {
        self.snapshot_idx
    }

    pub fn mem(&self) -> &SymbolicMemory {
        &self.mem
    }

    pub fn writes(&self) -> &[(SymExpr, SymExpr)] {
        &self.writes
    }

    /// The next epoch: concrete-address memory carries over, pointer writes do not.
    pub fn next_snapshot(&self) -> Self {
        Self {
            start: self.start,
            size: self.size,
            manager_idx: self.manager_idx,
            snapshot_idx: self.snapshot_idx + 1,
            mem: self.mem.clone(),
            writes: Vec::new(),
        }
    }

    pub fn read(&self, addr: u64, val: Value) -> Option<SymExpr> {
        if self.writes.is_empty() {
            self.mem.read(addr, val)
        } else {
            Some(SymExpr::const_deref(
                val,
                self.manager_idx,
                self.snapshot_idx,
                addr,
            ))
        }
    }

    /// Record a write; `sym_addr` is the symbolic target address if there is one.
    pub fn write(&mut self, sym_addr: Option<SymExpr>, addr: u64, e: SymExpr) {
        let sym_addr = sym_addr
            .unwrap_or_else(|| SymExpr::constant(Value::integral(addr as i64, CType::ULong)));
        self.writes.push((sym_addr, e));
    }
}

#[derive(Debug, Clone)]
struct Region {
    object: SymbolicObject,
    dereferenced: bool,
}

/// Live allocations keyed by end address, plus the append-only history of
/// every object epoch that expressions may refer to.
#[derive(Debug, Clone, Default)]
pub struct ObjectTracker {
    regions: BTreeMap<u64, Region>,
    snapshot_manager: Vec<Vec<SymbolicObject>>,
    exiting: bool,
}

impl ObjectTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker holding only serialized history, as seen by the search side.
    pub fn from_snapshots(snapshot_manager: Vec<Vec<SymbolicObject>>) -> Self {
        Self {
            regions: BTreeMap::new(),
            snapshot_manager,
            exiting: true,
        }
    }

    pub fn snapshot_manager(&self) -> &[Vec<SymbolicObject>] {
        &self.snapshot_manager
    }

    pub fn snapshot(&self, manager_idx: usize, snapshot_idx: usize) -> Option<&SymbolicObject> {
        self.snapshot_manager
            .get(manager_idx)
            .and_then(|v| v.get(snapshot_idx))
    }

    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    fn region_key(&self, addr: u64) -> Option<u64> {
        self.regions
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .filter(|(_, r)| r.object.start() <= addr)
            .map(|(k, _)| *k)
    }

    pub fn add_region(&mut self, addr: u64, size: usize) {
        if self.exiting {
            return;
        }

        self.snapshot_manager.push(Vec::new());
        let manager_idx = self.snapshot_manager.len() - 1;
        let object = SymbolicObject::new(addr, size, manager_idx);

        tracing::trace!(addr, size, manager_idx, "tracking region");
        self.regions.insert(
            object.end(),
            Region {
                object,
                dereferenced: true,
            },
        );
    }

    pub fn find(&self, addr: u64) -> Option<&SymbolicObject> {
        let key = self.region_key(addr)?;
        self.regions.get(&key).map(|r| &r.object)
    }

    pub fn find_mut(&mut self, addr: u64) -> Option<&mut SymbolicObject> {
        let key = self.region_key(addr)?;
        self.regions.get_mut(&key).map(|r| &mut r.object)
    }

    pub fn is_dereferenced(&self, addr: u64) -> bool {
        self.region_key(addr)
            .and_then(|k| self.regions.get(&k))
            .map(|r| r.dereferenced)
            .unwrap_or(false)
    }

    pub fn set_dereferenced(&mut self, addr: u64, dereferenced: bool) {
        if let Some(key) = self.region_key(addr) {
            if let Some(r) = self.regions.get_mut(&key) {
                r.dereferenced = dereferenced;
            }
        }
    }

    /// Freeze the object containing `addr` into history and continue with its
    /// next epoch, which starts out not dereferenced.
    pub fn store_and_get_new_obj(&mut self, addr: u64) -> Option<&mut SymbolicObject> {
        let key = self.region_key(addr)?;
        let old = self.regions.remove(&key)?.object;
        let object = old.next_snapshot();

        tracing::trace!(
            manager_idx = old.manager_idx(),
            snapshot_idx = object.snapshot_idx(),
            "new object snapshot"
        );

        self.snapshot_manager[old.manager_idx()].push(old);
        let region = self.regions.entry(key).or_insert(Region {
            object,
            dereferenced: false,
        });
        Some(&mut region.object)
    }

    /// Snapshot and stop tracking the object starting exactly at `addr`.
    pub fn free(&mut self, addr: u64) {
        let key = match self.region_key(addr) {
            Some(key) => key,
            None => return,
        };

        if self.regions[&key].object.start() != addr {
            return;
        }

        if let Some(region) = self.regions.remove(&key) {
            let idx = region.object.manager_idx();
            self.snapshot_manager[idx].push(region.object);
        }
    }

    /// Program exit: no further regions are accepted and every live object is
    /// moved into history, whether or not it recorded writes. Epochs no
    /// expression refers to are never lowered.
    pub fn store_all_obj_and_remove(&mut self) {
        self.exiting = true;

        let regions = std::mem::take(&mut self.regions);
        for (_, region) in regions {
            let idx = region.object.manager_idx();
            if let Some(history) = self.snapshot_manager.get_mut(idx) {
                history.push(region.object);
            }
        }
    }
}
