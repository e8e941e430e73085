//! Common definitions that are shared between different parts of the compiler.

// Use sorted sets and maps for consistent output
pub use std::collections::{BTreeMap as Map, BTreeSet as Set};

/// Identifiers.
pub type Id = internment::Intern<String>;

/// Intern a string as an [Id].
pub fn id(name: &str) -> Id {
    Id::from_ref(name)
}

/// Declare an index newtype into one of the per-function arenas.  Relations
/// between IR nodes are stored as these indices instead of pointers, so the
/// cyclic graphs (CFG, instruction lists, interference) stay borrow-checker
/// friendly.
macro_rules! arena_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_index! {
    /// A basic block in its function's block arena.
    BlockId
}
arena_index! {
    /// An OIR statement in its function's instruction arena.
    InstId
}
arena_index! {
    /// An SSA variable in its function's variable arena.
    VarId
}
arena_index! {
    /// A function in the module's function list.
    FuncId
}
arena_index! {
    /// An interned type in the type table.
    TypeId
}
arena_index! {
    /// A live range in the allocator's live-range arena.
    LiveRangeId
}
arena_index! {
    /// A stack region inside a stack data area.
    RegionId
}

/// The compilation context.  Holds the monotonic counters that used to be
/// process-wide; one `Ctx` is threaded through every pass of a compilation
/// unit so no global state exists.
#[derive(Debug, Default)]
pub struct Ctx {
    next_temp: u32,
    next_block: u32,
    next_func: u32,
}

impl Ctx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next temporary-variable number, unique across the unit.
    pub fn fresh_temp(&mut self) -> u32 {
        let n = self.next_temp;
        self.next_temp += 1;
        n
    }

    /// Next basic-block number, unique across the unit.
    pub fn fresh_block(&mut self) -> u32 {
        let n = self.next_block;
        self.next_block += 1;
        n
    }

    /// Next function number, unique across the unit.
    pub fn fresh_func(&mut self) -> u32 {
        let n = self.next_func;
        self.next_func += 1;
        n
    }

    pub fn func_count(&self) -> usize {
        self.next_func as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_monotonic() {
        let mut ctx = Ctx::new();
        assert_eq!(ctx.fresh_temp(), 0);
        assert_eq!(ctx.fresh_temp(), 1);
        assert_eq!(ctx.fresh_block(), 0);
        assert_eq!(ctx.fresh_temp(), 2);
        assert_eq!(ctx.fresh_block(), 1);
        assert_eq!(ctx.fresh_func(), 0);
        assert_eq!(ctx.func_count(), 1);
    }

    #[test]
    fn ids_intern_to_the_same_pointer() {
        assert_eq!(id("main"), id("main"));
        assert_ne!(id("main"), id("main2"));
    }
}
