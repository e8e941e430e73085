//! Per-function stack data areas.
//!
//! Two flavors by purpose: the *function local* area (spills and
//! address-taken locals, laid out below the frame pointer, growing down) and
//! the *parameter passing* area (arguments beyond the six register slots,
//! above the return address, growing up).
//!
//! Regions stay sorted largest-first so the run of decreasing alignments
//! wastes no interior padding; the whole area is padded to a multiple of 16
//! as the ABI requires of frames.

use crate::common::*;
use crate::front::types::{round_up, TypeTable};

/// What a stack data area is for; decides the direction addresses grow.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AreaPurpose {
    FunctionLocal,
    ParameterPassing,
}

/// One contiguous slice of the frame.
#[derive(Clone, Debug)]
pub struct StackRegion {
    pub id: RegionId,
    /// Offset of the region's base from the frame pointer.  Negative for
    /// local areas, positive (past the saved frame pointer and return
    /// address) for parameter areas.
    pub base: i32,
    pub size: u32,
    pub align: u32,
    pub reads: u32,
    /// Important regions survive dead-variable compaction.
    pub important: bool,
    removed: bool,
}

/// A stack data area: a region arena plus the largest-first layout order and
/// the variables that live in the regions.
#[derive(Debug)]
pub struct StackDataArea {
    pub purpose: AreaPurpose,
    regions: Vec<StackRegion>,
    /// Layout order, sorted by decreasing size (stable for equal sizes).
    order: Vec<RegionId>,
    /// Variables materialized into this area.
    pub vars: Vec<VarId>,
    total_size: u32,
}

impl StackDataArea {
    pub fn new(purpose: AreaPurpose) -> Self {
        Self {
            purpose,
            regions: Vec::new(),
            order: Vec::new(),
            vars: Vec::new(),
            total_size: 0,
        }
    }

    pub fn region(&self, id: RegionId) -> &StackRegion {
        &self.regions[id.index()]
    }

    pub fn region_mut(&mut self, id: RegionId) -> &mut StackRegion {
        &mut self.regions[id.index()]
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn live_regions(&self) -> impl Iterator<Item = &StackRegion> {
        self.order.iter().map(|id| &self.regions[id.index()])
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Create a region sized and aligned for `ty`, keep the layout sorted
    /// largest-first, and recompute every base address.
    pub fn create_stack_region_for_type(&mut self, types: &TypeTable, ty: TypeId) -> RegionId {
        let size = round_up(types.size(ty).max(1), types.align(ty));
        self.create_stack_region(size, types.align(ty))
    }

    /// Create a raw region of `size` bytes.
    pub fn create_stack_region(&mut self, size: u32, align: u32) -> RegionId {
        let id = RegionId(self.regions.len() as u32);
        self.regions.push(StackRegion {
            id,
            base: 0,
            size,
            align,
            reads: 0,
            important: false,
            removed: false,
        });
        // Binary insert by decreasing size; equal sizes keep insertion order.
        let pos = self
            .order
            .partition_point(|other| self.regions[other.index()].size >= size);
        self.order.insert(pos, id);
        self.assign_addresses();
        id
    }

    /// Remove a dead region and compact the addresses of the survivors.
    /// Important regions refuse removal.
    pub fn remove_region(&mut self, id: RegionId) {
        let region = &mut self.regions[id.index()];
        if region.important {
            panic!("invariant violated: removing an important stack region");
        }
        if region.removed {
            panic!("invariant violated: stack region removed twice");
        }
        region.removed = true;
        self.order.retain(|r| *r != id);
        self.assign_addresses();
    }

    pub fn mark_important(&mut self, id: RegionId) {
        self.regions[id.index()].important = true;
    }

    pub fn note_read(&mut self, id: RegionId) {
        self.regions[id.index()].reads += 1;
    }

    pub fn add_variable(&mut self, var: VarId) {
        self.vars.push(var);
    }

    /// Recompute base offsets in layout order and the incremental total.
    fn assign_addresses(&mut self) {
        let mut offset: i32 = 0;
        let mut total: u32 = 0;
        for id in &self.order {
            let region = &mut self.regions[id.index()];
            let size = round_up(region.size, region.align) as i32;
            match self.purpose {
                AreaPurpose::FunctionLocal => {
                    // below the frame pointer
                    offset -= size;
                    region.base = offset;
                }
                AreaPurpose::ParameterPassing => {
                    // past the saved frame pointer and the return address
                    region.base = 16 + offset;
                    offset += size;
                }
            }
            total += size as u32;
        }
        self.total_size = total;
    }

    /// Pad the area's total size up to a multiple of 16.
    pub fn align_stack_data_area(&mut self) {
        self.total_size = round_up(self.total_size, 16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::types::{Mutability, Primitive};

    #[test]
    fn regions_sort_largest_first() {
        let mut types = TypeTable::new();
        let i8t = types.basic(Primitive::I8);
        let i64t = types.basic(Primitive::I64);
        let i32t = i32_of(&mut types);
        let arr = types.array_of(i32t, 4, Mutability::Immutable);

        let mut area = StackDataArea::new(AreaPurpose::FunctionLocal);
        let small = area.create_stack_region_for_type(&types, i8t);
        let big = area.create_stack_region_for_type(&types, arr);
        let mid = area.create_stack_region_for_type(&types, i64t);

        let sizes: Vec<u32> = area.live_regions().map(|r| r.size).collect();
        assert_eq!(sizes, vec![16, 8, 1]);
        assert!(area.region(big).base > area.region(mid).base);
        assert!(area.region(mid).base > area.region(small).base);
        assert!(area.region(big).base < 0);
    }

    fn i32_of(types: &mut TypeTable) -> TypeId {
        types.basic(Primitive::I32)
    }

    #[test]
    fn total_size_aligns_to_sixteen() {
        let mut types = TypeTable::new();
        let i32t = i32_of(&mut types);
        let mut area = StackDataArea::new(AreaPurpose::FunctionLocal);
        area.create_stack_region_for_type(&types, i32t);
        assert_eq!(area.total_size(), 4);
        area.align_stack_data_area();
        assert_eq!(area.total_size(), 16);
        assert_eq!(area.total_size() % 16, 0);
    }

    #[test]
    fn removal_compacts_addresses() {
        let mut area = StackDataArea::new(AreaPurpose::FunctionLocal);
        let a = area.create_stack_region(8, 8);
        let b = area.create_stack_region(8, 8);
        assert_eq!(area.total_size(), 16);
        assert_eq!(area.region(b).base, -16);
        area.remove_region(a);
        assert_eq!(area.total_size(), 8);
        assert_eq!(area.region(b).base, -8);
    }

    #[test]
    #[should_panic(expected = "important stack region")]
    fn important_regions_refuse_removal() {
        let mut area = StackDataArea::new(AreaPurpose::FunctionLocal);
        let a = area.create_stack_region(8, 8);
        area.mark_important(a);
        area.remove_region(a);
    }

    #[test]
    fn parameter_area_grows_upward_from_the_return_address() {
        let mut area = StackDataArea::new(AreaPurpose::ParameterPassing);
        let a = area.create_stack_region(8, 8);
        let b = area.create_stack_region(8, 8);
        assert_eq!(area.region(a).base, 16);
        assert_eq!(area.region(b).base, 24);
    }
}
