//! GPU virtual-address tracking: mapping raw addresses back to resources.
//!
//! Shaders under debug hand the debugger raw 64-bit GPU addresses (root
//! descriptors, buffer device addresses); [`AddressRangeTracker`] is the
//! interval index that resolves them to the resource occupying that space
//! and a byte offset into it. Ranges may overlap and may be co-sited
//! (aliased resources sharing a start address), and lookups can optionally
//! tolerate reads past a resource's logical end but within its backing
//! store.
//!
//! Unlike the single-threaded reconvergence engine, this index is shared:
//! every call takes its own scoped reader/writer lock, so a lookup observes
//! *some* consistent prior state but no ordering against concurrent
//! mutation is promised.

use parking_lot::RwLock;
use thiserror::Error;
use tracing::error;

/// A location in the GPU virtual address space.
pub type Address = u64;

/// Identifies a GPU resource (buffer, texture) known to the debugger.
///
/// The default value is the null id, returned by lookups that resolve
/// nothing.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub const NULL: ResourceId = ResourceId(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

/// One resource's occupancy of the address space.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AddressRange {
    pub start: Address,
    /// One past the last byte of the resource proper; the strict bound.
    pub real_end: Address,
    /// One past the last byte of the backing store; the bound tolerated for
    /// out-of-bounds reads. Never below `real_end`.
    pub oob_end: Address,
    pub id: ResourceId,
}

/// Tightest known bounding endpoints around an address, defined even when
/// no range covers it: "this address falls in unmapped space between
/// resource A and resource B".
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct AddressBound {
    pub lower: ResourceId,
    pub lower_va: Address,
    pub upper: ResourceId,
    pub upper_va: Address,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressTrackerError {
    #[error("no address range starting at {start:#x} for {id:?}")]
    RangeNotFound { start: Address, id: ResourceId },
}

/// Interval index over the GPU address space.
///
/// Ranges are kept sorted by `start` ascending, then by size *descending*
/// among equal starts, so that a forward scan over co-sited aliases finds
/// the widest covering range first.
#[derive(Default)]
pub struct AddressRangeTracker {
    addresses: RwLock<Vec<AddressRange>>,
}

impl AddressRangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, range: AddressRange) {
        let mut addresses = self.addresses.write();
        let mut i = addresses.partition_point(|r| r.start < range.start);
        while i < addresses.len()
            && addresses[i].start == range.start
            && addresses[i].real_end > range.real_end
        {
            i += 1;
        }
        addresses.insert(i, range);
    }

    /// Remove the unique range matching both `start` and `id`.
    ///
    /// A missing match is reported, not fatal: the tracker is unchanged and
    /// behaves as if the removal had been a no-op.
    pub fn remove(&self, start: Address, id: ResourceId) -> Result<(), AddressTrackerError> {
        {
            let mut addresses = self.addresses.write();
            let mut i = addresses.partition_point(|r| r.start < start);
            // co-sited ranges share a start; match on the id as well
            while i < addresses.len() && addresses[i].start == start {
                if addresses[i].id == id {
                    addresses.remove(i);
                    return Ok(());
                }
                i += 1;
            }
        }

        error!(start, ?id, "no matching address range to remove");
        Err(AddressTrackerError::RangeNotFound { start, id })
    }

    pub fn clear(&self) {
        self.addresses.write().clear();
    }

    /// Snapshot of every tracked range, in index order.
    pub fn addresses(&self) -> Vec<AddressRange> {
        self.addresses.read().clone()
    }

    /// The ids of every tracked range, in index order.
    pub fn ids(&self) -> Vec<ResourceId> {
        self.addresses.read().iter().map(|r| r.id).collect()
    }

    /// Resolve `addr` to the resource covering it and the byte offset into
    /// that resource, enforcing the strict (`real_end`) bound. Null id and
    /// zero offset if nothing covers the address.
    pub fn res_id_from_addr(&self, addr: Address) -> (ResourceId, u64) {
        self.lookup(addr, false)
    }

    /// Like [`Self::res_id_from_addr`], but tolerating addresses past the
    /// resource's logical end as long as they stay within the backing store
    /// (`oob_end`) - stale descriptors must still not resolve to unrelated
    /// memory.
    pub fn res_id_from_addr_allow_out_of_bounds(&self, addr: Address) -> (ResourceId, u64) {
        self.lookup(addr, true)
    }

    fn lookup(&self, addr: Address, allow_oob: bool) -> (ResourceId, u64) {
        if addr == 0 {
            return (ResourceId::NULL, 0);
        }

        let addresses = self.addresses.read();
        let group_end = addresses.partition_point(|r| r.start <= addr);
        if group_end == 0 {
            return (ResourceId::NULL, 0);
        }

        // candidates share the greatest start <= addr, widest first; a
        // narrower co-sited alias cannot cover what the widest does not
        let group_start_addr = addresses[group_end - 1].start;
        let group_start = addresses.partition_point(|r| r.start < group_start_addr);
        for range in &addresses[group_start..group_end] {
            let end = if allow_oob { range.oob_end } else { range.real_end };
            if addr < end {
                return (range.id, addr - range.start);
            }
        }

        (ResourceId::NULL, 0)
    }

    /// The tightest known lower and upper bounding endpoints around `addr`.
    ///
    /// When a range covers `addr`, both bounds name that range (its start
    /// and its `real_end`). Otherwise the lower bound is the nearest range
    /// starting at or below `addr` and the upper bound is the next range
    /// above, either side left null when no such range exists.
    pub fn res_id_bound_for_addr(&self, addr: Address) -> AddressBound {
        let mut bound = AddressBound::default();
        if addr == 0 {
            return bound;
        }

        let addresses = self.addresses.read();
        if addresses.is_empty() {
            return bound;
        }

        let group_end = addresses.partition_point(|r| r.start <= addr);
        if group_end == 0 {
            // below every known range
            bound.upper = addresses[0].id;
            bound.upper_va = addresses[0].start;
            return bound;
        }

        // the widest candidate at the greatest start <= addr
        let group_start_addr = addresses[group_end - 1].start;
        let group_start = addresses.partition_point(|r| r.start < group_start_addr);
        let range = addresses[group_start];
        bound.lower = range.id;
        bound.lower_va = range.start;

        if range.real_end > addr {
            // covered: the range itself is the tight bound on both sides
            bound.upper = range.id;
            bound.upper_va = range.real_end;
        } else if group_end < addresses.len() {
            bound.upper = addresses[group_end].id;
            bound.upper_va = addresses[group_end].start;
        }

        bound
    }
}
