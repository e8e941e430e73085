//! The type system: primitive classification, compound shapes, sizes,
//! signedness, and the assignability/widening predicates the back-end keys
//! instruction sizes off of.

use derive_more::Display;

use crate::common::*;

/// Primitive type tags.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Primitive {
    #[display("void")]
    Void,
    #[display("i8")]
    I8,
    #[display("i16")]
    I16,
    #[display("i32")]
    I32,
    #[display("i64")]
    I64,
    #[display("u8")]
    U8,
    #[display("u16")]
    U16,
    #[display("u32")]
    U32,
    #[display("u64")]
    U64,
    #[display("char")]
    Char,
    #[display("f32")]
    F32,
    #[display("f64")]
    F64,
}

impl Primitive {
    pub fn size(self) -> u32 {
        use Primitive::*;
        match self {
            Void => 0,
            I8 | U8 | Char => 1,
            I16 | U16 => 2,
            I32 | U32 | F32 => 4,
            I64 | U64 | F64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        use Primitive::*;
        matches!(self, I8 | I16 | I32 | I64)
    }

    /// Floats are carried through the type system for register-class
    /// bookkeeping only; no code is generated for them.
    pub fn is_float(self) -> bool {
        matches!(self, Primitive::F32 | Primitive::F64)
    }
}

/// Whether a type permits writes through it.  Immutability is a property of
/// the type itself, not of individual use sites.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Mutability {
    #[display("mut")]
    Mutable,
    #[display("")]
    Immutable,
}

/// Function visibility.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Visibility {
    #[display("pub")]
    Public,
    #[display("priv")]
    Private,
}

/// The type sum.  Compound types refer to their element types through the
/// interning [TypeTable], never by value, so structurally equal types share
/// one [TypeId].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum TypeKind {
    Basic {
        prim: Primitive,
        mutability: Mutability,
    },
    Pointer {
        elem: TypeId,
        mutability: Mutability,
    },
    Reference {
        target: TypeId,
    },
    Array {
        elem: TypeId,
        len: u32,
        mutability: Mutability,
    },
    /// An ordered-member record type.
    Construct {
        name: Id,
        members: Vec<(Id, TypeId)>,
    },
    /// An ordered named-constant type.
    Enumerated {
        name: Id,
        constants: Vec<(Id, i64)>,
    },
    FunctionPointer {
        visibility: Visibility,
        inline: bool,
        params: Vec<TypeId>,
        ret: TypeId,
        mutability: Mutability,
    },
}

/// The hash-consing type table.  Both the owner and the interner of every
/// type in a compilation unit; all IR nodes borrow into it by [TypeId].
#[derive(Debug, Default)]
pub struct TypeTable {
    types: Vec<TypeKind>,
    interned: Map<TypeKind, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `kind`, returning the existing id when an identical shape (same
    /// mutability included) is already present.
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.types[id.index()]
    }

    pub fn basic(&mut self, prim: Primitive) -> TypeId {
        self.intern(TypeKind::Basic {
            prim,
            mutability: Mutability::Immutable,
        })
    }

    pub fn basic_mut(&mut self, prim: Primitive) -> TypeId {
        self.intern(TypeKind::Basic {
            prim,
            mutability: Mutability::Mutable,
        })
    }

    pub fn pointer_to(&mut self, elem: TypeId, mutability: Mutability) -> TypeId {
        self.intern(TypeKind::Pointer { elem, mutability })
    }

    pub fn array_of(&mut self, elem: TypeId, len: u32, mutability: Mutability) -> TypeId {
        self.intern(TypeKind::Array {
            elem,
            len,
            mutability,
        })
    }

    /// Size of a value of this type in bytes.
    pub fn size(&self, id: TypeId) -> u32 {
        match self.kind(id) {
            TypeKind::Basic { prim, .. } => prim.size(),
            TypeKind::Pointer { .. } | TypeKind::Reference { .. } => 8,
            TypeKind::FunctionPointer { .. } => 8,
            TypeKind::Array { elem, len, .. } => self.size(*elem) * len,
            TypeKind::Enumerated { .. } => 4,
            TypeKind::Construct { members, .. } => {
                let mut offset = 0u32;
                let mut max_align = 1u32;
                for (_, member) in members {
                    let align = self.align(*member);
                    max_align = max_align.max(align);
                    offset = round_up(offset, align) + self.size(*member);
                }
                round_up(offset, max_align)
            }
        }
    }

    /// Natural alignment of this type.
    pub fn align(&self, id: TypeId) -> u32 {
        match self.kind(id) {
            TypeKind::Basic { prim, .. } => prim.size().max(1),
            TypeKind::Pointer { .. }
            | TypeKind::Reference { .. }
            | TypeKind::FunctionPointer { .. } => 8,
            TypeKind::Array { elem, .. } => self.align(*elem),
            TypeKind::Enumerated { .. } => 4,
            TypeKind::Construct { members, .. } => members
                .iter()
                .map(|(_, m)| self.align(*m))
                .max()
                .unwrap_or(1),
        }
    }

    pub fn is_signed(&self, id: TypeId) -> bool {
        match self.kind(id) {
            TypeKind::Basic { prim, .. } => prim.is_signed(),
            TypeKind::Enumerated { .. } => true,
            _ => false,
        }
    }

    pub fn is_mutable(&self, id: TypeId) -> bool {
        match self.kind(id) {
            TypeKind::Basic { mutability, .. }
            | TypeKind::Pointer { mutability, .. }
            | TypeKind::Array { mutability, .. }
            | TypeKind::FunctionPointer { mutability, .. } => *mutability == Mutability::Mutable,
            TypeKind::Reference { .. } | TypeKind::Construct { .. } | TypeKind::Enumerated { .. } => {
                false
            }
        }
    }

    /// Is this an integer-or-address type, as opposed to an aggregate?
    pub fn is_scalar(&self, id: TypeId) -> bool {
        matches!(
            self.kind(id),
            TypeKind::Basic { .. }
                | TypeKind::Pointer { .. }
                | TypeKind::Reference { .. }
                | TypeKind::Enumerated { .. }
                | TypeKind::FunctionPointer { .. }
        )
    }

    pub fn is_pointerish(&self, id: TypeId) -> bool {
        matches!(
            self.kind(id),
            TypeKind::Pointer { .. } | TypeKind::Reference { .. } | TypeKind::FunctionPointer { .. }
        )
    }

    /// The pointed-to type, through pointers and references.
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            TypeKind::Pointer { elem, .. } => Some(*elem),
            TypeKind::Reference { target } => Some(*target),
            TypeKind::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Shape equality modulo mutability.  Two types that differ only in their
    /// `mut` qualifier remain compatible for most operations.
    fn same_shape(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (self.kind(a), self.kind(b)) {
            (TypeKind::Basic { prim: pa, .. }, TypeKind::Basic { prim: pb, .. }) => pa == pb,
            (TypeKind::Pointer { elem: ea, .. }, TypeKind::Pointer { elem: eb, .. }) => {
                self.same_shape(*ea, *eb)
            }
            (TypeKind::Reference { target: ta }, TypeKind::Reference { target: tb }) => {
                self.same_shape(*ta, *tb)
            }
            (
                TypeKind::Array {
                    elem: ea, len: la, ..
                },
                TypeKind::Array {
                    elem: eb, len: lb, ..
                },
            ) => la == lb && self.same_shape(*ea, *eb),
            _ => false,
        }
    }

    /// Decide whether `rhs` may be assigned to `lhs`, returning the
    /// dominating type of the operation, or `None` when incompatible.
    ///
    /// Scalars widen toward the wider operand; at equal widths the unsigned
    /// side dominates.  A pointer-to-mutable narrows to the matching
    /// pointer-to-immutable, never the other way.
    pub fn types_assignable(&self, lhs: TypeId, rhs: TypeId) -> Option<TypeId> {
        if lhs == rhs || self.same_shape(lhs, rhs) {
            // mut -> const pointer narrowing is fine; const -> mut is not.
            if let (
                TypeKind::Pointer {
                    mutability: Mutability::Mutable,
                    ..
                },
                TypeKind::Pointer {
                    mutability: Mutability::Immutable,
                    ..
                },
            ) = (self.kind(lhs), self.kind(rhs))
            {
                return None;
            }
            return Some(lhs);
        }
        let (ka, kb) = (self.kind(lhs), self.kind(rhs));
        match (ka, kb) {
            (TypeKind::Basic { prim: pa, .. }, TypeKind::Basic { prim: pb, .. }) => {
                if pa.is_float() != pb.is_float() || *pa == Primitive::Void || *pb == Primitive::Void
                {
                    return None;
                }
                let dominating = match pa.size().cmp(&pb.size()) {
                    std::cmp::Ordering::Greater => lhs,
                    std::cmp::Ordering::Less => rhs,
                    std::cmp::Ordering::Equal => {
                        if pa.is_signed() {
                            rhs
                        } else {
                            lhs
                        }
                    }
                };
                Some(dominating)
            }
            // Enums assign like their underlying 32-bit integer.
            (TypeKind::Enumerated { .. }, TypeKind::Basic { prim, .. })
            | (TypeKind::Basic { prim, .. }, TypeKind::Enumerated { .. })
                if !prim.is_float() =>
            {
                Some(lhs)
            }
            // Arrays decay to pointers over the same element.
            (TypeKind::Pointer { elem, .. }, TypeKind::Array { elem: ae, .. })
                if self.same_shape(*elem, *ae) =>
            {
                Some(lhs)
            }
            _ => None,
        }
    }

    /// True when moving `source` into `destination` needs a widening move
    /// (destination strictly wider), which the selector turns into a sign- or
    /// zero-extending MOV depending on the source's signedness.
    pub fn is_expanding_move_required(&self, destination: TypeId, source: TypeId) -> bool {
        self.size(destination) > self.size(source)
    }

    /// x86 effective-address operands must be 32 or 64 bits wide; anything
    /// narrower is widened before entering an address calculation.
    pub fn is_address_calculation_compatible(&self, id: TypeId) -> bool {
        self.is_scalar(id) && matches!(self.size(id), 4 | 8)
    }

    /// Byte offset and type of a named member of a construct type.
    pub fn member_offset(&self, id: TypeId, field: Id) -> Option<(TypeId, u32)> {
        let TypeKind::Construct { members, .. } = self.kind(id) else {
            return None;
        };
        let mut offset = 0u32;
        for (name, member) in members {
            offset = round_up(offset, self.align(*member));
            if *name == field {
                return Some((*member, offset));
            }
            offset += self.size(*member);
        }
        None
    }

    /// The mutable rendition of a type, where mutability applies.
    pub fn make_mutable(&mut self, id: TypeId) -> TypeId {
        let kind = match self.kind(id).clone() {
            TypeKind::Basic { prim, .. } => TypeKind::Basic {
                prim,
                mutability: Mutability::Mutable,
            },
            TypeKind::Pointer { elem, .. } => TypeKind::Pointer {
                elem,
                mutability: Mutability::Mutable,
            },
            TypeKind::Array { elem, len, .. } => TypeKind::Array {
                elem,
                len,
                mutability: Mutability::Mutable,
            },
            other => other,
        };
        self.intern(kind)
    }

    /// Render a type for diagnostics and IR printing.
    pub fn display(&self, id: TypeId) -> String {
        match self.kind(id) {
            TypeKind::Basic { prim, mutability } => match mutability {
                Mutability::Mutable => format!("mut {prim}"),
                Mutability::Immutable => prim.to_string(),
            },
            TypeKind::Pointer { elem, mutability } => match mutability {
                Mutability::Mutable => format!("*mut {}", self.display(*elem)),
                Mutability::Immutable => format!("*{}", self.display(*elem)),
            },
            TypeKind::Reference { target } => format!("&{}", self.display(*target)),
            TypeKind::Array { elem, len, .. } => format!("[{}; {len}]", self.display(*elem)),
            TypeKind::Construct { name, .. } => format!("struct {name}"),
            TypeKind::Enumerated { name, .. } => format!("enum {name}"),
            TypeKind::FunctionPointer { params, ret, .. } => {
                let params: Vec<_> = params.iter().map(|p| self.display(*p)).collect();
                format!("fn({}) -> {}", params.join(", "), self.display(*ret))
            }
        }
    }
}

pub fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    #[test]
    fn interning_dedups_but_distinguishes_mutability() {
        let mut table = TypeTable::new();
        let a = table.basic(Primitive::I32);
        let b = table.basic(Primitive::I32);
        let c = table.basic_mut(Primitive::I32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn construct_size_respects_member_alignment() {
        let mut table = TypeTable::new();
        let i8t = table.basic(Primitive::I8);
        let i64t = table.basic(Primitive::I64);
        let s = table.intern(TypeKind::Construct {
            name: id("pair"),
            members: vec![(id("a"), i8t), (id("b"), i64t)],
        });
        assert_eq!(table.size(s), 16);
        assert_eq!(table.align(s), 8);
    }

    #[test]
    fn assignability_picks_the_dominating_type() {
        let mut table = TypeTable::new();
        let i16t = table.basic(Primitive::I16);
        let i32t = table.basic(Primitive::I32);
        let u32t = table.basic(Primitive::U32);
        assert_eq!(table.types_assignable(i32t, i16t), Some(i32t));
        assert_eq!(table.types_assignable(i16t, i32t), Some(i32t));
        assert_eq!(table.types_assignable(u32t, i32t), Some(u32t));
        let construct = table.intern(TypeKind::Construct {
            name: id("s"),
            members: vec![],
        });
        assert_eq!(table.types_assignable(i32t, construct), None);
    }

    #[test]
    fn pointer_mutability_narrows_one_way() {
        let mut table = TypeTable::new();
        let i32t = table.basic(Primitive::I32);
        let p_const = table.pointer_to(i32t, Mutability::Immutable);
        let p_mut = table.pointer_to(i32t, Mutability::Mutable);
        assert_eq!(table.types_assignable(p_const, p_mut), Some(p_const));
        assert_eq!(table.types_assignable(p_mut, p_const), None);
    }

    #[test]
    fn widening_and_address_compatibility() {
        let mut table = TypeTable::new();
        let i8t = table.basic(Primitive::I8);
        let i32t = table.basic(Primitive::I32);
        let i64t = table.basic(Primitive::I64);
        assert!(table.is_expanding_move_required(i64t, i8t));
        assert!(!table.is_expanding_move_required(i8t, i64t));
        assert!(!table.is_address_calculation_compatible(i8t));
        assert!(table.is_address_calculation_compatible(i32t));
        assert!(table.is_address_calculation_compatible(i64t));
    }
}
