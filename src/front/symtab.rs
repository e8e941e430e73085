//! Symbol tables: scoped variable and type tables (a stack of sheafs, each a
//! bucket array with chained collisions), single-scope function and macro
//! tables, the call graph, and the unused-symbol diagnostics.
//!
//! The tables are both the owner and the interner of their records; AST and
//! IR nodes refer into them by index, so the tables must outlive all IR.

use derive_more::Display;

use crate::common::*;
use crate::containers::{MinQueue, VecSet};
use crate::front::types::*;

// Bucket counts per table.  Primes, sized to the expected symbol population.
const FUNCTION_KEYSPACE: usize = 499;
const VARIABLE_KEYSPACE: usize = 1021;
const TYPE_KEYSPACE: usize = 257;
const MACRO_KEYSPACE: usize = 127;

/// FNV-1a 64-bit with an avalanche finalizer, the hash every table keys on.
pub fn fnv1a64(name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in name.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    // Avalanche finalizer (xor-shift-multiply), spreads low-entropy tails.
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}

// Salts XORed into a type's hash when it is mutable, selected by the first
// character of the name so `mut T` lands in a different bucket than `T`.
const MUTABILITY_SALTS: [u64; 16] = [
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
    0x8cb9_2ba7_2f3d_8dd7,
    0xd6e8_feb8_6659_fd93,
    0xa5a3_564d_60e4_2ff1,
    0x27d4_eb2f_1656_67c5,
    0x1656_67b1_9e37_79f9,
    0x85eb_ca6b_27d4_eb4f,
    0xc2b2_ae3d_27d4_eb4f,
    0x1b87_3593_85eb_ca77,
    0xcc9e_2d51_1b87_3593,
    0xe653_4be9_cc9e_2d51,
    0x62a9_d9ed_799705e5,
    0x2b55_4671_62a9_d9f3,
];

/// Hash used by the type symbol table: (name, mutability) and, for arrays,
/// the member count folded in.
pub fn type_symbol_hash(name: &str, mutability: Mutability, array_len: Option<u32>) -> u64 {
    let mut hash = fnv1a64(name);
    if mutability == Mutability::Mutable {
        let first = name.bytes().next().unwrap_or(0) as usize;
        hash ^= MUTABILITY_SALTS[first & 0xF];
    }
    if let Some(len) = array_len {
        hash = hash.rotate_left(13) ^ (len as u64);
    }
    hash
}

/// What kind of storage a variable record describes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Membership {
    #[display("local")]
    Local,
    #[display("param")]
    Parameter,
    #[display("global")]
    Global,
    #[display("label")]
    Label,
    #[display("member")]
    StructMember,
    #[display("enum")]
    EnumMember,
}

// Symbol indices are plain u32 newtypes, like the arena ids in `common`.
macro_rules! sym_index {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

sym_index! {
    /// Index of a variable record in the variable table.
    VarSymId
}
sym_index! {
    /// Index of a macro record in the macro table.
    MacroSymId
}

/// A source-level variable.  SSA construction keys its generation counter and
/// renaming stack off this record; the diagnostics pass reads the flag bits.
#[derive(Debug)]
pub struct VarRecord {
    pub name: Id,
    pub hash: u64,
    /// Lexical nesting level of the declaring scope.
    pub level: u32,
    pub line: u32,
    pub ty: TypeId,
    /// Next SSA generation to hand out for this variable.
    pub ssa_generation: u32,
    /// Renaming stack used while walking the dominator tree.
    pub rename_stack: Vec<VarId>,
    pub declaring_func: Option<FuncId>,
    pub membership: Membership,
    /// Stack region backing this variable once it has been materialized.
    pub region: Option<RegionId>,
    /// Parameter position, when this variable is a function parameter.
    pub param_index: Option<u32>,
    pub use_count: u32,
    pub is_temp: bool,
    pub initialized: bool,
    pub mutated: bool,
    pub address_taken: bool,
    /// Chain link for bucket collisions.
    next: Option<u32>,
}

struct Sheaf {
    buckets: Vec<Option<u32>>,
}

impl Sheaf {
    fn new(keyspace: usize) -> Self {
        Self {
            buckets: vec![None; keyspace],
        }
    }
}

/// The scoped variable table: a stack of sheafs, searched innermost-first.
pub struct VariableTable {
    records: Vec<VarRecord>,
    sheafs: Vec<Sheaf>,
}

impl Default for VariableTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            sheafs: vec![Sheaf::new(VARIABLE_KEYSPACE)],
        }
    }

    /// Push a fresh sheaf for a new lexical scope.
    pub fn initialize_scope(&mut self) {
        self.sheafs.push(Sheaf::new(VARIABLE_KEYSPACE));
    }

    /// Pop the innermost sheaf.  Its records stay in the arena (IR keeps
    /// borrowing them); they just stop being findable.
    pub fn finalize_scope(&mut self) {
        if self.sheafs.len() <= 1 {
            panic!("invariant violated: finalize_scope with no open scope");
        }
        self.sheafs.pop();
    }

    pub fn current_level(&self) -> u32 {
        (self.sheafs.len() - 1) as u32
    }

    pub fn declare(&mut self, mut record: VarRecord) -> VarSymId {
        let hash = fnv1a64(&record.name);
        record.hash = hash;
        record.level = self.current_level();
        let idx = self.records.len() as u32;
        let sheaf = self.sheafs.last_mut().unwrap();
        let bucket = (hash % VARIABLE_KEYSPACE as u64) as usize;
        record.next = sheaf.buckets[bucket];
        sheaf.buckets[bucket] = Some(idx);
        self.records.push(record);
        VarSymId(idx)
    }

    /// Look a name up from the innermost sheaf outward.
    pub fn lookup(&self, name: Id) -> Option<VarSymId> {
        let hash = fnv1a64(&name);
        for sheaf in self.sheafs.iter().rev() {
            if let Some(found) = self.search_sheaf(sheaf, name, hash) {
                return Some(found);
            }
        }
        None
    }

    /// Look a name up in the innermost sheaf only.
    pub fn lookup_local(&self, name: Id) -> Option<VarSymId> {
        let hash = fnv1a64(&name);
        self.search_sheaf(self.sheafs.last().unwrap(), name, hash)
    }

    fn search_sheaf(&self, sheaf: &Sheaf, name: Id, hash: u64) -> Option<VarSymId> {
        let bucket = (hash % VARIABLE_KEYSPACE as u64) as usize;
        let mut cursor = sheaf.buckets[bucket];
        while let Some(idx) = cursor {
            let record = &self.records[idx as usize];
            if record.hash == hash && record.name == name {
                return Some(VarSymId(idx));
            }
            cursor = record.next;
        }
        None
    }

    pub fn record(&self, id: VarSymId) -> &VarRecord {
        &self.records[id.index()]
    }

    pub fn record_mut(&mut self, id: VarSymId) -> &mut VarRecord {
        &mut self.records[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarSymId, &VarRecord)> {
        self.records
            .iter()
            .enumerate()
            .map(|(i, r)| (VarSymId(i as u32), r))
    }
}

impl VarRecord {
    pub fn new(name: Id, ty: TypeId, membership: Membership, line: u32) -> Self {
        Self {
            name,
            hash: 0,
            level: 0,
            line,
            ty,
            ssa_generation: 0,
            rename_stack: Vec::new(),
            declaring_func: None,
            membership,
            region: None,
            param_index: None,
            use_count: 0,
            is_temp: false,
            initialized: false,
            mutated: false,
            address_taken: false,
            next: None,
        }
    }
}

/// A named type: binds a source name (plus mutability, plus array length for
/// array aliases) to an interned [TypeId].
#[derive(Debug)]
struct TypeSymRecord {
    name: Id,
    hash: u64,
    line: u32,
    ty: TypeId,
    next: Option<u32>,
}

/// The scoped type-name table.  Same sheaf discipline as the variable table,
/// with mutability salted into the hash.
pub struct TypeNameTable {
    records: Vec<TypeSymRecord>,
    sheafs: Vec<Sheaf>,
}

impl Default for TypeNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeNameTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            sheafs: vec![Sheaf::new(TYPE_KEYSPACE)],
        }
    }

    pub fn initialize_scope(&mut self) {
        self.sheafs.push(Sheaf::new(TYPE_KEYSPACE));
    }

    pub fn finalize_scope(&mut self) {
        if self.sheafs.len() <= 1 {
            panic!("invariant violated: finalize_scope with no open scope");
        }
        self.sheafs.pop();
    }

    pub fn declare(
        &mut self,
        name: Id,
        mutability: Mutability,
        array_len: Option<u32>,
        ty: TypeId,
        line: u32,
    ) {
        let hash = type_symbol_hash(&name, mutability, array_len);
        let idx = self.records.len() as u32;
        let sheaf = self.sheafs.last_mut().unwrap();
        let bucket = (hash % TYPE_KEYSPACE as u64) as usize;
        let next = sheaf.buckets[bucket];
        sheaf.buckets[bucket] = Some(idx);
        self.records.push(TypeSymRecord {
            name,
            hash,
            line,
            ty,
            next,
        });
    }

    pub fn lookup(&self, name: Id, mutability: Mutability, array_len: Option<u32>) -> Option<TypeId> {
        let hash = type_symbol_hash(&name, mutability, array_len);
        for sheaf in self.sheafs.iter().rev() {
            let bucket = (hash % TYPE_KEYSPACE as u64) as usize;
            let mut cursor = sheaf.buckets[bucket];
            while let Some(idx) = cursor {
                let record = &self.records[idx as usize];
                if record.hash == hash && record.name == name {
                    return Some(record.ty);
                }
                cursor = record.next;
            }
        }
        None
    }
}

/// A function symbol.  The lowered body (blocks, instructions, stack areas)
/// lives in the middle end; this record carries the interface and the
/// call-graph facts.
#[derive(Debug)]
pub struct FunctionRecord {
    pub name: Id,
    pub hash: u64,
    pub id: FuncId,
    pub line: u32,
    pub visibility: Visibility,
    pub inlined: bool,
    pub params: Vec<VarSymId>,
    pub ret: TypeId,
    /// The function-pointer type describing this signature.
    pub signature: TypeId,
    /// Functions this one calls directly.
    pub calls: VecSet<FuncId>,
    pub called: bool,
    pub defined: bool,
    next: Option<u32>,
}

/// Single-scope function table.
pub struct FunctionTable {
    records: Vec<FunctionRecord>,
    buckets: Vec<Option<u32>>,
}

impl Default for FunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            buckets: vec![None; FUNCTION_KEYSPACE],
        }
    }

    /// Insert a record.  The caller obtains the [FuncId] from the context so
    /// ids stay unique across the unit; records are stored in id order.
    pub fn declare(&mut self, ctx: &mut Ctx, mut record: FunctionRecord) -> FuncId {
        let id = FuncId(ctx.fresh_func());
        assert_eq!(
            id.index(),
            self.records.len(),
            "function ids must be dense in declaration order"
        );
        record.id = id;
        record.hash = fnv1a64(&record.name);
        let bucket = (record.hash % FUNCTION_KEYSPACE as u64) as usize;
        record.next = self.buckets[bucket];
        self.buckets[bucket] = Some(id.0);
        self.records.push(record);
        id
    }

    pub fn lookup(&self, name: Id) -> Option<FuncId> {
        let hash = fnv1a64(&name);
        let bucket = (hash % FUNCTION_KEYSPACE as u64) as usize;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            let record = &self.records[idx as usize];
            if record.hash == hash && record.name == name {
                return Some(record.id);
            }
            cursor = record.next;
        }
        None
    }

    pub fn record(&self, id: FuncId) -> &FunctionRecord {
        &self.records[id.index()]
    }

    pub fn record_mut(&mut self, id: FuncId) -> &mut FunctionRecord {
        &mut self.records[id.index()]
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.records.iter()
    }
}

impl FunctionRecord {
    pub fn new(name: Id, visibility: Visibility, ret: TypeId, signature: TypeId, line: u32) -> Self {
        Self {
            name,
            hash: 0,
            id: FuncId(0),
            line,
            visibility,
            inlined: false,
            params: Vec::new(),
            ret,
            signature,
            calls: VecSet::new(),
            called: false,
            defined: false,
            next: None,
        }
    }
}

/// A macro record.  Macro bodies are substituted textually by the front-end;
/// the table only exists so redefinitions and lookups work.
#[derive(Debug)]
pub struct MacroRecord {
    pub name: Id,
    pub hash: u64,
    pub line: u32,
    pub replacement: Id,
    next: Option<u32>,
}

/// Single-scope macro table.
pub struct MacroTable {
    records: Vec<MacroRecord>,
    buckets: Vec<Option<u32>>,
}

impl Default for MacroTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MacroTable {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            buckets: vec![None; MACRO_KEYSPACE],
        }
    }

    pub fn declare(&mut self, name: Id, replacement: Id, line: u32) -> MacroSymId {
        let hash = fnv1a64(&name);
        let idx = self.records.len() as u32;
        let bucket = (hash % MACRO_KEYSPACE as u64) as usize;
        let next = self.buckets[bucket];
        self.buckets[bucket] = Some(idx);
        self.records.push(MacroRecord {
            name,
            hash,
            line,
            replacement,
            next,
        });
        MacroSymId(idx)
    }

    pub fn lookup(&self, name: Id) -> Option<&MacroRecord> {
        let hash = fnv1a64(&name);
        let bucket = (hash % MACRO_KEYSPACE as u64) as usize;
        let mut cursor = self.buckets[bucket];
        while let Some(idx) = cursor {
            let record = &self.records[idx as usize];
            if record.hash == hash && record.name == name {
                return Some(record);
            }
            cursor = record.next;
        }
        None
    }
}

/// Call graph: adjacency matrix over function ids plus its Warshall
/// transitive closure, both flat byte arrays.
pub struct CallGraph {
    width: usize,
    matrix: Vec<u8>,
    closure: Vec<u8>,
}

impl CallGraph {
    /// Build from the per-function call sets, then close transitively.
    pub fn build(functions: &FunctionTable) -> Self {
        let width = functions.len();
        let mut matrix = vec![0u8; width * width];
        for record in functions.iter() {
            for &callee in record.calls.iter() {
                matrix[record.id.index() * width + callee.index()] = 1;
            }
        }
        let mut closure = matrix.clone();
        // Warshall: k as the intermediate vertex.
        for k in 0..width {
            for i in 0..width {
                if closure[i * width + k] == 0 {
                    continue;
                }
                for j in 0..width {
                    if closure[k * width + j] == 1 {
                        closure[i * width + j] = 1;
                    }
                }
            }
        }
        Self {
            width,
            matrix,
            closure,
        }
    }

    pub fn calls_directly(&self, caller: FuncId, callee: FuncId) -> bool {
        self.matrix[caller.index() * self.width + callee.index()] == 1
    }

    pub fn reaches(&self, caller: FuncId, callee: FuncId) -> bool {
        self.closure[caller.index() * self.width + callee.index()] == 1
    }

    /// Directly or mutually recursive.
    pub fn is_recursive(&self, func: FuncId) -> bool {
        self.reaches(func, func)
    }

    pub fn is_directly_recursive(&self, func: FuncId) -> bool {
        self.calls_directly(func, func)
    }
}

/// A single warning, ready to print.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("line {line}: warning: {message}")]
pub struct Warning {
    pub line: u32,
    pub message: String,
}

/// Collect the unused-symbol warnings, in source order.  Offenders are pushed
/// into a min-queue keyed on line number and drained, so callers get them
/// sorted regardless of table order.
pub fn collect_warnings(
    functions: &FunctionTable,
    variables: &VariableTable,
    types: &TypeTable,
) -> Vec<Warning> {
    let mut queue: MinQueue<Warning> = MinQueue::new();

    for record in functions.iter() {
        let name = &record.name;
        if !record.defined && !record.called {
            queue.push(
                record.line as i64,
                Warning {
                    line: record.line,
                    message: format!("function '{name}' is never defined and never called"),
                },
            );
        } else if record.called && !record.defined {
            queue.push(
                record.line as i64,
                Warning {
                    line: record.line,
                    message: format!("function '{name}' is called but never defined"),
                },
            );
        } else if record.defined
            && !record.called
            && record.visibility == Visibility::Private
        {
            queue.push(
                record.line as i64,
                Warning {
                    line: record.line,
                    message: format!("private function '{name}' is defined but never called"),
                },
            );
        }
    }

    for (_, record) in variables.iter() {
        if record.is_temp || record.membership != Membership::Local {
            continue;
        }
        let name = &record.name;
        if record.use_count > 0 && !record.initialized && !types.is_pointerish(record.ty) {
            queue.push(
                record.line as i64,
                Warning {
                    line: record.line,
                    message: format!("variable '{name}' is used before being initialized"),
                },
            );
        }
        if types.is_mutable(record.ty) && !record.mutated {
            queue.push(
                record.line as i64,
                Warning {
                    line: record.line,
                    message: format!("variable '{name}' is declared mutable but never mutated"),
                },
            );
        }
    }

    let mut out = Vec::with_capacity(queue.len());
    while let Some(warning) = queue.pop() {
        out.push(warning);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;
    use crate::front::types::Primitive;

    fn mk_types() -> TypeTable {
        TypeTable::new()
    }

    #[test]
    fn fnv_is_stable_and_spread() {
        let a = fnv1a64("alpha");
        let b = fnv1a64("alphb");
        assert_eq!(a, fnv1a64("alpha"));
        assert_ne!(a, b);
        // the finalizer must touch the high bits
        assert_ne!(a >> 32, 0);
    }

    #[test]
    fn variable_scopes_shadow_and_unwind() {
        let mut types = mk_types();
        let i32t = types.basic(Primitive::I32);
        let mut table = VariableTable::new();
        let outer = table.declare(VarRecord::new(id("x"), i32t, Membership::Local, 1));
        table.initialize_scope();
        let inner = table.declare(VarRecord::new(id("x"), i32t, Membership::Local, 2));
        assert_eq!(table.lookup(id("x")), Some(inner));
        assert_eq!(table.lookup_local(id("x")), Some(inner));
        table.finalize_scope();
        assert_eq!(table.lookup(id("x")), Some(outer));
        assert_eq!(table.record(outer).level, 0);
        assert_eq!(table.record(inner).level, 1);
    }

    #[test]
    fn local_lookup_does_not_walk_outward() {
        let mut types = mk_types();
        let i32t = types.basic(Primitive::I32);
        let mut table = VariableTable::new();
        table.declare(VarRecord::new(id("y"), i32t, Membership::Local, 1));
        table.initialize_scope();
        assert_eq!(table.lookup_local(id("y")), None);
        assert!(table.lookup(id("y")).is_some());
    }

    #[test]
    fn type_names_hash_mutability_apart() {
        let mut types = mk_types();
        let imm = types.basic(Primitive::I64);
        let mu = types.basic_mut(Primitive::I64);
        let mut names = TypeNameTable::new();
        names.declare(id("word"), Mutability::Immutable, None, imm, 1);
        names.declare(id("word"), Mutability::Mutable, None, mu, 1);
        assert_eq!(names.lookup(id("word"), Mutability::Immutable, None), Some(imm));
        assert_eq!(names.lookup(id("word"), Mutability::Mutable, None), Some(mu));
        assert_eq!(names.lookup(id("word"), Mutability::Immutable, Some(4)), None);
    }

    #[test]
    fn call_graph_closure_flags_mutual_recursion() {
        let mut ctx = Ctx::new();
        let mut types = mk_types();
        let i32t = types.basic(Primitive::I32);
        let mut funcs = FunctionTable::new();
        let mut rec = |funcs: &mut FunctionTable, ctx: &mut Ctx, name: &str| {
            funcs.declare(
                ctx,
                FunctionRecord::new(id(name), Visibility::Public, i32t, i32t, 1),
            )
        };
        let f = rec(&mut funcs, &mut ctx, "even");
        let g = rec(&mut funcs, &mut ctx, "odd");
        let h = rec(&mut funcs, &mut ctx, "leaf");
        funcs.record_mut(f).calls.insert(g);
        funcs.record_mut(g).calls.insert(f);
        funcs.record_mut(f).calls.insert(h);
        let graph = CallGraph::build(&funcs);
        assert!(graph.calls_directly(f, g));
        assert!(!graph.calls_directly(h, f));
        assert!(graph.is_recursive(f));
        assert!(graph.is_recursive(g));
        assert!(!graph.is_recursive(h));
        assert!(!graph.is_directly_recursive(f));
        assert!(graph.reaches(g, h));
    }

    #[test]
    fn warnings_drain_in_source_order() {
        let mut ctx = Ctx::new();
        let mut types = mk_types();
        let i32t = types.basic(Primitive::I32);
        let mut funcs = FunctionTable::new();
        let late = funcs.declare(
            &mut ctx,
            FunctionRecord::new(id("late"), Visibility::Private, i32t, i32t, 30),
        );
        funcs.record_mut(late).defined = true;
        let early = funcs.declare(
            &mut ctx,
            FunctionRecord::new(id("early"), Visibility::Public, i32t, i32t, 3),
        );
        funcs.record_mut(early).called = true;
        let variables = VariableTable::new();
        let warnings = collect_warnings(&funcs, &variables, &types);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("early"));
        assert!(warnings[1].message.contains("late"));
        assert!(warnings[0].line <= warnings[1].line);
    }

    #[test]
    fn unused_mut_and_uninitialized_variables_warn() {
        let mut types = mk_types();
        let i32m = types.basic_mut(Primitive::I32);
        let i32t = types.basic(Primitive::I32);
        let funcs = FunctionTable::new();
        let mut variables = VariableTable::new();
        let never_mut = variables.declare(VarRecord::new(id("m"), i32m, Membership::Local, 4));
        variables.record_mut(never_mut).initialized = true;
        let uninit = variables.declare(VarRecord::new(id("u"), i32t, Membership::Local, 9));
        variables.record_mut(uninit).use_count = 2;
        let warnings = collect_warnings(&funcs, &variables, &types);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].message.contains("never mutated"));
        assert!(warnings[1].message.contains("before being initialized"));
    }
}
