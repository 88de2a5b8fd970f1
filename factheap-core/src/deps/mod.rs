//! Lock-free, append-only dependency graph.
//!
//! Edges `key -> val` between 31-bit vertices live in two fixed-size tables:
//!
//! - the **dedup table** holds one word per distinct edge and is what makes
//!   `add_edge` idempotent;
//! - the **dependency table** holds the adjacency lists. A key's bucket head
//!   and every list node are ordinary slots of the same table, so each edge
//!   costs exactly one slot.
//!
//! Both tables use open addressing with linear probing. Every insert is a
//! CAS loop; probing wraps at most once before reporting
//! [`FactHeapError::DepTableFull`].

mod slot;

pub use slot::hash_u64;

use crate::error::{FactHeapError, Result};
use crate::region::{Cell, Region};
use crate::types::Vertex;
use slot::{pack_edge, DepSlot, Link, BINDING_PRESENT};
use std::sync::atomic::{AtomicU64, Ordering};

/// Occupancy of the dependency tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepStats {
    /// Distinct edges stored.
    pub edges: u64,
    /// Non-empty slots of the adjacency table.
    pub used_slots: u64,
    /// Slots per table.
    pub capacity: u64,
}

/// View of the region's dependency graph.
#[derive(Debug, Clone, Copy)]
pub struct DepGraph<'a> {
    region: &'a Region,
}

impl Region {
    /// The dependency graph store.
    pub fn deps(&self) -> DepGraph<'_> {
        DepGraph { region: self }
    }
}

impl<'a> DepGraph<'a> {
    /// Slots per table.
    pub fn capacity(&self) -> u64 {
        self.region.config().dep_table_slots()
    }

    fn mask(&self) -> u64 {
        self.capacity() - 1
    }

    fn slot(&self, index: u64) -> &'a AtomicU64 {
        self.region.atomic(self.region.layout().dep_slot(index))
    }

    fn binding(&self, index: u64) -> &'a AtomicU64 {
        self.region.atomic(self.region.layout().binding_slot(index))
    }

    fn edges(&self) -> &'a AtomicU64 {
        self.region.cell(Cell::DepEdges)
    }

    fn full(&self) -> FactHeapError {
        FactHeapError::DepTableFull {
            edges: self.edge_count(),
            capacity: self.capacity(),
        }
    }

    /// Record the edge `key -> val`.
    ///
    /// Returns `true` if the edge is new and `false` if it was already
    /// present. Safe to call concurrently from any process.
    pub fn add_edge(&self, key: Vertex, val: Vertex) -> Result<bool> {
        self.region.check_should_exit()?;
        if !self.add_binding(key, val)? {
            return Ok(false);
        }
        self.prepend(key, val)?;
        Ok(true)
    }

    /// Claim the dedup slot for the edge. `false` if another writer already did.
    fn add_binding(&self, key: Vertex, val: Vertex) -> Result<bool> {
        let packed = pack_edge(key, val);
        let value = packed | BINDING_PRESENT;
        let init = hash_u64(packed) & self.mask();
        let mut index = init;

        loop {
            let current = self.binding(index).load(Ordering::Acquire);
            if current == value {
                return Ok(false);
            }
            if self.edges().load(Ordering::Relaxed) >= self.capacity() {
                return Err(self.full());
            }
            if current == 0 {
                match self.binding(index).compare_exchange(
                    0,
                    value,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.edges().fetch_add(1, Ordering::AcqRel);
                        return Ok(true);
                    }
                    // Lost the race; look at what landed in this slot.
                    Err(_) => continue,
                }
            }
            index = (index + 1) & self.mask();
            if index == init {
                return Err(self.full());
            }
        }
    }

    /// Add `val` to the front of `key`'s list, creating the bucket if needed.
    fn prepend(&self, key: Vertex, val: Vertex) -> Result<()> {
        let init = hash_u64(u64::from(key.as_u32())) & self.mask();
        let mut index = init;

        loop {
            let current = DepSlot::from_raw(self.slot(index).load(Ordering::Acquire));

            if current.is_head_for(key) {
                let node = self.alloc_node(key, val)?;
                self.link_node(index, key, val, node);
                return Ok(());
            }

            if current.is_empty() {
                let head = DepSlot::head(key, val);
                if self
                    .slot(index)
                    .compare_exchange(0, head.raw(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                // Someone filled the slot; it may be our key's head.
                continue;
            }

            index = (index + 1) & self.mask();
            if index == init {
                return Err(self.full());
            }
        }
    }

    /// Claim a free slot for a list node holding `val`.
    fn alloc_node(&self, key: Vertex, val: Vertex) -> Result<u64> {
        let init = hash_u64(pack_edge(key, val)) & self.mask();
        let mut index = init;
        let claimed = DepSlot::unwired(val).raw();

        loop {
            if self.slot(index).load(Ordering::Acquire) == 0
                && self
                    .slot(index)
                    .compare_exchange(0, claimed, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::trace!(
                    key = %key,
                    slot = index,
                    probes = index.wrapping_sub(init) & self.mask(),
                    "Claimed dependency node slot"
                );
                return Ok(index);
            }
            index = (index + 1) & self.mask();
            if index == init {
                return Err(self.full());
            }
        }
    }

    /// Swing the head at `head_index` to `node`, retrying until it sticks.
    fn link_node(&self, head_index: u64, key: Vertex, val: Vertex, node: u64) {
        let head_slot = self.slot(head_index);
        let mut head = DepSlot::from_raw(head_slot.load(Ordering::Acquire));
        loop {
            // The node is unreachable until the CAS below succeeds.
            self.slot(node)
                .store(DepSlot::node(val, head.link()).raw(), Ordering::Relaxed);
            let new_head = DepSlot::head_with(key, Link::Next(node));
            match head_slot.compare_exchange(
                head.raw(),
                new_head.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = DepSlot::from_raw(actual),
            }
        }
    }

    /// All values recorded for `key`, most recently added first.
    ///
    /// # Panics
    /// Panics while the coordinator has dependency reads disabled.
    pub fn get_edges(&self, key: Vertex) -> Result<Vec<Vertex>> {
        self.region.check_should_exit()?;
        assert!(
            self.region.dependency_table_reads_allowed(),
            "dependency table reads are disabled"
        );

        let init = hash_u64(u64::from(key.as_u32())) & self.mask();
        let mut index = init;
        loop {
            let current = DepSlot::from_raw(self.slot(index).load(Ordering::Acquire));
            if current.is_empty() {
                return Ok(Vec::new());
            }
            if current.is_head_for(key) {
                return Ok(self.walk(current));
            }
            index = (index + 1) & self.mask();
            if index == init {
                return Ok(Vec::new());
            }
        }
    }

    fn walk(&self, head: DepSlot) -> Vec<Vertex> {
        let mut values = Vec::new();
        let mut link = head.link();
        loop {
            match link {
                Link::Value(last) => {
                    values.push(last);
                    return values;
                }
                Link::Next(index) => {
                    let node = DepSlot::from_raw(self.slot(index).load(Ordering::Acquire));
                    values.push(node.low());
                    link = node.link();
                }
            }
        }
    }

    /// Visit every key with its value list.
    ///
    /// Intended for a quiescent table (snapshots); concurrent inserts may or
    /// may not be observed.
    pub fn for_each_list(&self, mut f: impl FnMut(Vertex, &[Vertex]) -> Result<()>) -> Result<()> {
        for index in 0..self.capacity() {
            let current = DepSlot::from_raw(self.slot(index).load(Ordering::Acquire));
            if current.is_head() {
                let values = self.walk(current);
                f(current.low(), &values)?;
            }
        }
        Ok(())
    }

    /// Distinct edges stored.
    pub fn edge_count(&self) -> u64 {
        self.edges().load(Ordering::Acquire)
    }

    /// Non-empty slots of the adjacency table.
    pub fn used_slots(&self) -> u64 {
        (0..self.capacity())
            .filter(|&index| self.slot(index).load(Ordering::Relaxed) != 0)
            .count() as u64
    }

    /// Occupancy summary.
    pub fn stats(&self) -> DepStats {
        DepStats {
            edges: self.edge_count(),
            used_slots: self.used_slots(),
            capacity: self.capacity(),
        }
    }

    /// Drop every edge.
    ///
    /// Only valid while no other process touches the graph.
    pub fn reset(&self) {
        self.region.assert_coordinator("dependency table reset");
        let layout = self.region.layout();
        // SAFETY: both tables are contiguous sections of the mapping, and
        // the coordinator owns them while no worker runs.
        unsafe {
            std::ptr::write_bytes(
                self.region.ptr(layout.dep_table.offset),
                0,
                layout.dep_table.len as usize,
            );
            std::ptr::write_bytes(
                self.region.ptr(layout.bindings.offset),
                0,
                layout.bindings.len as usize,
            );
        }
        self.edges().store(0, Ordering::Release);
        tracing::info!("Dependency table reset");
    }
}
