//! The x86-64 machine description.
//!
//! # Design decisions
//!
//! We target the System V AMD64 ABI (Linux and the BSDs on x86-64) and emit
//! AT&T-syntax assembly.  See
//! <https://gitlab.com/x86-psABIs/x86-64-ABI> for the ABI specification.
//!
//! # Call stack frame
//!
//! The stack grows down and every call site keeps `rsp` 16-byte aligned.  A
//! single function's frame, between the frame pointer and the stack pointer:
//!
//! ```txt
//!
//!   High memory addresses
//!
//!   +---------------------------+
//!   | Previous stack frame      |
//!   |      ...                  |
//!   +---------------------------+
//!   | Stack-passed arguments    |  <- parameter-passing data area
//!   +---------------------------+     (rbp + 16 and up)
//!   | Return address            |
//!   +---------------------------+
//!   | Saved frame pointer       |  <- Current frame pointer (rbp)
//!   +---------------------------+
//!   | Local data area           |  <- spills, address-taken locals,
//!   | (16-byte aligned total)   |     aggregates (rbp - offset)
//!   +---------------------------+
//!   | Saved callee-owned regs   |
//!   +---------------------------+  <- Stack pointer (rsp)
//!
//!   Low memory addresses
//! ```
//!
//! # Calling convention
//!
//! 1. The first six integer-class arguments travel in `rdi rsi rdx rcx r8
//!    r9`; the rest are stored to the parameter-passing area, rightmost
//!    pushed first.
//! 2. `call` pushes the return address; the callee saves `rbp` and installs
//!    its own frame.
//! 3. The return value travels in `rax`.
//! 4. `rbx r12 r13 r14 r15` (and `rbp`) belong to the callee; everything
//!    else belongs to the caller.
//!
//! # Fixed-register instructions
//!
//! - `idiv`/`div` consume `rdx:rax` and write quotient to `rax`, remainder
//!   to `rdx`; the dividend is sign-extended with `cqo`/`cdq`/`cwd`/`cbw`.
//! - One-operand `mul` reads `rax` and writes `rdx:rax`.
//! - Variable shift counts live in `cl`.
//!
//! The selector pins these with [Mach::src_reg]/[Mach::dst_reg]; the
//! allocator treats the pins as precolored live ranges.

use derive_more::Display;

use crate::middle::oir::Cc;

use Register::*;

/// The integer register file, in encoding order.  `rsp` is never allocated
/// and never interferes.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Register {
    #[display("rax")]
    Rax,
    #[display("rcx")]
    Rcx,
    #[display("rdx")]
    Rdx,
    #[display("rbx")]
    Rbx,
    #[display("rsp")]
    Rsp,
    #[display("rbp")]
    Rbp,
    #[display("rsi")]
    Rsi,
    #[display("rdi")]
    Rdi,
    #[display("r8")]
    R8,
    #[display("r9")]
    R9,
    #[display("r10")]
    R10,
    #[display("r11")]
    R11,
    #[display("r12")]
    R12,
    #[display("r13")]
    R13,
    #[display("r14")]
    R14,
    #[display("r15")]
    R15,
}

/// Argument registers of the integer class, in ABI order.
pub static ARG_REGISTERS: [Register; 6] = [Rdi, Rsi, Rdx, Rcx, R8, R9];

/// Registers the allocator may hand out, cheapest first: caller-owned
/// scratch registers before callee-owned ones (which cost a save/restore).
/// `r15` stays reserved for the emitter.
pub const ALLOCATABLE: [Register; 13] = [
    Rax, Rcx, Rdx, Rsi, Rdi, R8, R9, R10, R11, Rbx, R12, R13, R14,
];

impl Register {
    pub fn is_callee_saved(self) -> bool {
        matches!(self, Rbx | Rbp | R12 | R13 | R14 | R15)
    }

    /// The register's name at the given operand width.
    pub fn name(self, size: OpSize) -> &'static str {
        use OpSize::*;
        match (self, size) {
            (Rax, Byte) => "al",
            (Rax, Word) => "ax",
            (Rax, DoubleWord) => "eax",
            (Rax, QuadWord) => "rax",
            (Rbx, Byte) => "bl",
            (Rbx, Word) => "bx",
            (Rbx, DoubleWord) => "ebx",
            (Rbx, QuadWord) => "rbx",
            (Rcx, Byte) => "cl",
            (Rcx, Word) => "cx",
            (Rcx, DoubleWord) => "ecx",
            (Rcx, QuadWord) => "rcx",
            (Rdx, Byte) => "dl",
            (Rdx, Word) => "dx",
            (Rdx, DoubleWord) => "edx",
            (Rdx, QuadWord) => "rdx",
            (Rsi, Byte) => "sil",
            (Rsi, Word) => "si",
            (Rsi, DoubleWord) => "esi",
            (Rsi, QuadWord) => "rsi",
            (Rdi, Byte) => "dil",
            (Rdi, Word) => "di",
            (Rdi, DoubleWord) => "edi",
            (Rdi, QuadWord) => "rdi",
            (Rbp, Byte) => "bpl",
            (Rbp, Word) => "bp",
            (Rbp, DoubleWord) => "ebp",
            (Rbp, QuadWord) => "rbp",
            (Rsp, Byte) => "spl",
            (Rsp, Word) => "sp",
            (Rsp, DoubleWord) => "esp",
            (Rsp, QuadWord) => "rsp",
            (R8, Byte) => "r8b",
            (R8, Word) => "r8w",
            (R8, DoubleWord) => "r8d",
            (R8, QuadWord) => "r8",
            (R9, Byte) => "r9b",
            (R9, Word) => "r9w",
            (R9, DoubleWord) => "r9d",
            (R9, QuadWord) => "r9",
            (R10, Byte) => "r10b",
            (R10, Word) => "r10w",
            (R10, DoubleWord) => "r10d",
            (R10, QuadWord) => "r10",
            (R11, Byte) => "r11b",
            (R11, Word) => "r11w",
            (R11, DoubleWord) => "r11d",
            (R11, QuadWord) => "r11",
            (R12, Byte) => "r12b",
            (R12, Word) => "r12w",
            (R12, DoubleWord) => "r12d",
            (R12, QuadWord) => "r12",
            (R13, Byte) => "r13b",
            (R13, Word) => "r13w",
            (R13, DoubleWord) => "r13d",
            (R13, QuadWord) => "r13",
            (R14, Byte) => "r14b",
            (R14, Word) => "r14w",
            (R14, DoubleWord) => "r14d",
            (R14, QuadWord) => "r14",
            (R15, Byte) => "r15b",
            (R15, Word) => "r15w",
            (R15, DoubleWord) => "r15d",
            (R15, QuadWord) => "r15",
        }
    }
}

/// Operand widths and their AT&T mnemonic suffixes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Display)]
pub enum OpSize {
    #[display("b")]
    Byte,
    #[display("w")]
    Word,
    #[display("l")]
    DoubleWord,
    #[display("q")]
    QuadWord,
}

impl OpSize {
    pub fn from_bytes(bytes: u32) -> OpSize {
        match bytes {
            1 => OpSize::Byte,
            2 => OpSize::Word,
            4 => OpSize::DoubleWord,
            8 => OpSize::QuadWord,
            _ => panic!("invariant violated: no operand size for {bytes} bytes"),
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            OpSize::Byte => 1,
            OpSize::Word => 2,
            OpSize::DoubleWord => 4,
            OpSize::QuadWord => 8,
        }
    }
}

/// Mnemonic tags.  Width suffixes and condition codes are printed from the
/// accompanying [Mach] fields, so `mov` covers `movb/movw/movl/movq`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Display)]
pub enum Mnemonic {
    #[display("mov")]
    Mov,
    /// Zero-extending move; prints both widths (`movzbl`).
    #[display("movz")]
    Movzx,
    /// Sign-extending move; prints both widths (`movsbl`).
    #[display("movs")]
    Movsx,
    #[display("lea")]
    Lea,
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("imul")]
    Imul,
    #[display("mul")]
    Mul,
    #[display("idiv")]
    Idiv,
    #[display("div")]
    Div,
    /// The `rax` sign-extension family: cbw/cwd/cdq/cqo by size.
    #[display("cqo")]
    SignExtendAcc,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("not")]
    Not,
    #[display("neg")]
    Neg,
    #[display("sal")]
    Sal,
    #[display("sar")]
    Sar,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
    #[display("inc")]
    Inc,
    #[display("dec")]
    Dec,
    #[display("cmp")]
    Cmp,
    #[display("test")]
    Test,
    /// `set<cc>`; the condition lives in [Mach::cc].
    #[display("set")]
    Set,
    #[display("jmp")]
    Jmp,
    /// `j<cc>`; the condition lives in [Mach::cc].
    #[display("j")]
    Jcc,
    #[display("call")]
    Call,
    #[display("ret")]
    Ret,
    #[display("nop")]
    Nop,
}

/// The machine annotation the selector attaches to an OIR statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mach {
    pub mnemonic: Mnemonic,
    /// Primary operand width.
    pub size: OpSize,
    /// Source width for the extending moves.
    pub src_size: Option<OpSize>,
    pub cc: Option<Cc>,
    /// ABI-pinned source register (e.g. the `cl` shift count).
    pub src_reg: Option<Register>,
    /// ABI-pinned destination register (e.g. `rax` around a division).
    pub dst_reg: Option<Register>,
}

impl Mach {
    pub fn plain(mnemonic: Mnemonic, size: OpSize) -> Self {
        Self {
            mnemonic,
            size,
            src_size: None,
            cc: None,
            src_reg: None,
            dst_reg: None,
        }
    }

    pub fn with_cc(mnemonic: Mnemonic, size: OpSize, cc: Cc) -> Self {
        Self {
            cc: Some(cc),
            ..Self::plain(mnemonic, size)
        }
    }

    /// The printed mnemonic: base name plus condition code plus width
    /// suffixes as the mnemonic family demands.
    pub fn opcode_text(&self) -> String {
        use Mnemonic::*;
        match self.mnemonic {
            Movzx | Movsx => {
                let src = self.src_size.expect("extending move needs a source width");
                format!("{}{}{}", self.mnemonic, src, self.size)
            }
            Set => format!("set{}", self.cc.expect("setcc needs a condition")),
            Jcc => format!("j{}", self.cc.expect("jcc needs a condition")),
            SignExtendAcc => match self.size {
                OpSize::Byte => "cbw".to_string(),
                OpSize::Word => "cwd".to_string(),
                OpSize::DoubleWord => "cdq".to_string(),
                OpSize::QuadWord => "cqo".to_string(),
            },
            Jmp | Call | Ret | Nop => self.mnemonic.to_string(),
            _ => format!("{}{}", self.mnemonic, self.size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_names_follow_operand_width() {
        assert_eq!(Rax.name(OpSize::Byte), "al");
        assert_eq!(Rax.name(OpSize::QuadWord), "rax");
        assert_eq!(R9.name(OpSize::DoubleWord), "r9d");
        assert_eq!(Rsi.name(OpSize::Byte), "sil");
    }

    #[test]
    fn opcode_text_composes_suffixes() {
        assert_eq!(
            Mach::plain(Mnemonic::Mov, OpSize::DoubleWord).opcode_text(),
            "movl"
        );
        let movzx = Mach {
            src_size: Some(OpSize::Byte),
            ..Mach::plain(Mnemonic::Movzx, OpSize::DoubleWord)
        };
        assert_eq!(movzx.opcode_text(), "movzbl");
        assert_eq!(
            Mach::with_cc(Mnemonic::Set, OpSize::Byte, Cc::Ne).opcode_text(),
            "setne"
        );
        assert_eq!(
            Mach::plain(Mnemonic::SignExtendAcc, OpSize::DoubleWord).opcode_text(),
            "cdq"
        );
    }

    #[test]
    fn abi_register_sets_are_disjoint_where_required() {
        assert!(!ALLOCATABLE.contains(&Rsp));
        assert!(!ALLOCATABLE.contains(&Rbp));
        for reg in ARG_REGISTERS {
            assert!(ALLOCATABLE.contains(&reg));
            assert!(!reg.is_callee_saved());
        }
    }
}
