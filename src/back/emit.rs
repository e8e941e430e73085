//! Final text emission: AT&T-syntax x86-64 from the selected, scheduled,
//! register-allocated instruction stream, plus the stable post-selection
//! printing mode used by `-i` and the golden tests.
//!
//! Emission is deliberately thin: every decision was made upstream, this
//! module only renders.  Globals print after the functions; jump tables go
//! to `.rodata` beside their function.

use crate::back::asm::{Mach, Mnemonic, OpSize, Register};
use crate::back::isel::select;
use crate::back::regalloc::{allocate, Allocation};
use crate::back::sched::schedule;
use crate::common::*;
use crate::front::parse::Unit;
use crate::front::symtab::FunctionTable;
use crate::middle::cfg::{eliminate_phis, Function, Module};
use crate::middle::linearize::{linear_order, linearize};
use crate::middle::oir::{Constant, MemTarget, Op};
use crate::middle::peephole::simplify;

/// Run the per-function back-end passes and emit the final assembly.
pub fn code_gen(unit: &mut Unit, module: &mut Module) -> String {
    let mut out = String::new();
    out.push_str("\t.text\n");
    for func in &mut module.funcs {
        eliminate_phis(&mut unit.ctx, func);
        linearize(func);
        simplify(func, &unit.types);
        select(func, &mut unit.types, &mut unit.ctx);
        schedule(func);
        let allocation = allocate(func, &mut unit.types, &mut unit.ctx);
        func.local_area.align_stack_data_area();
        func.param_area.align_stack_data_area();
        out.push_str(&emit_function(func, &allocation, &unit.functions));
    }
    out.push_str(&emit_globals(module, &unit.types));
    out
}

/// Render one function: prologue, blocks in layout order, jump tables.
pub fn emit_function(
    func: &Function,
    allocation: &Allocation,
    functions: &FunctionTable,
) -> String {
    let mut out = String::new();
    let name = func.name.to_string();
    out.push_str(&format!("\t.globl {name}\n{name}:\n"));

    // prologue: frame pointer, local area, callee-saved registers
    out.push_str("\tpushq %rbp\n\tmovq %rsp, %rbp\n");
    let frame = func.local_area.total_size();
    if frame > 0 {
        out.push_str(&format!("\tsubq ${frame}, %rsp\n"));
    }
    let mut saved: Vec<Register> = allocation.used_callee_saved.clone();
    saved.sort();
    for reg in &saved {
        out.push_str(&format!("\tpushq %{reg}\n"));
    }
    if saved.len() % 2 == 1 {
        out.push_str("\tsubq $8, %rsp\n");
    }

    let resolve = |var: VarId, size: OpSize| -> String {
        let register = allocation.regs.get(&var).unwrap_or_else(|| {
            panic!(
                "invariant violated: no register for '{}'",
                func.body.var(var).name
            )
        });
        format!("%{}", register.name(size))
    };
    let epilogue = {
        let mut text = String::new();
        if saved.len() % 2 == 1 {
            text.push_str("\taddq $8, %rsp\n");
        }
        for reg in saved.iter().rev() {
            text.push_str(&format!("\tpopq %{reg}\n"));
        }
        text.push_str("\tleave\n");
        text
    };

    for block in linear_order(func) {
        out.push_str(&format!("{}:\n", block_label(func, block)));
        for inst in func.body.block_insts(block) {
            for line in
                render_machine_inst(func, inst, &resolve, functions, Some(epilogue.as_str()))
            {
                out.push_str(&format!("\t{line}\n"));
            }
        }
    }

    // jump tables live in .rodata next to the code
    if !func.jump_tables.is_empty() {
        out.push_str("\t.section .rodata\n\t.align 8\n");
        for table in &func.jump_tables {
            out.push_str(&format!("{}:\n", table_label(func, table.id)));
            for &target in &table.targets {
                out.push_str(&format!("\t.quad {}\n", block_label(func, target)));
            }
        }
        out.push_str("\t.text\n");
    }
    out
}

/// The post-selection printing mode: one line per machine instruction,
/// operands shown as variable names.
pub fn print_selected(func: &Function, functions: &FunctionTable) -> String {
    let mut out = String::new();
    out.push_str(&format!("fn {} {{\n", func.name));
    let resolve = |var: VarId, _size: OpSize| func.body.var_name(var).to_string();
    for block in linear_order(func) {
        out.push_str(&format!("{}:\n", block_label(func, block)));
        for inst in func.body.block_insts(block) {
            for line in render_machine_inst(func, inst, &resolve, functions, None) {
                out.push_str(&format!("    {line}\n"));
            }
        }
    }
    out.push_str("}\n");
    out
}

fn block_label(func: &Function, block: BlockId) -> String {
    format!(".L{}_{}", func.name, block.0)
}

fn table_label(func: &Function, table: u32) -> String {
    format!(".JT{}_{}", func.name, table)
}

fn imm_text(constant: Constant) -> String {
    match constant {
        Constant::Hex(v) => format!("$0x{v:x}"),
        other => format!("${}", other.value_i64()),
    }
}

fn region_operand(func: &Function, target: MemTarget, offset: i32) -> String {
    match target {
        MemTarget::Local(region) => {
            let base = func.local_area.region(region).base + offset;
            format!("{base}(%rbp)")
        }
        MemTarget::Param(region) => {
            let base = func.param_area.region(region).base + offset;
            format!("{base}(%rbp)")
        }
        MemTarget::Global(name) => format!("{name}(%rip)"),
    }
}

/// Render one selected statement.  Most statements are one line; calls with
/// stack arguments and returns expand to a short sequence.
fn render_machine_inst(
    func: &Function,
    inst: InstId,
    resolve: &dyn Fn(VarId, OpSize) -> String,
    functions: &FunctionTable,
    epilogue: Option<&str>,
) -> Vec<String> {
    let body = &func.body;
    let node = body.inst(inst);
    let mach: Mach = node
        .mach
        .unwrap_or_else(|| panic!("invariant violated: unselected statement reached emission"));
    let opcode = mach.opcode_text();
    let sz = mach.size;
    let src_sz = mach.src_size.unwrap_or(sz);

    let one = |line: String| vec![line];
    match &node.op {
        Op::Assign { dst, src } | Op::Cast { dst, src } => one(format!(
            "{opcode} {}, {}",
            resolve(*src, effective_src_size(mach, src_sz)),
            resolve(*dst, sz)
        )),
        Op::AssignConst { dst, src } => {
            one(format!("{opcode} {}, {}", imm_text(*src), resolve(*dst, sz)))
        }
        Op::Bin { dst, lhs, rhs, .. } => match mach.mnemonic {
            // one-operand forms: the other operands are implicit in rax/rdx
            Mnemonic::Idiv | Mnemonic::Div => one(format!("{opcode} {}", resolve(*rhs, sz))),
            Mnemonic::Mul => one(format!("{opcode} {}", resolve(*lhs, sz))),
            // variable shift counts print as the cl byte
            Mnemonic::Sal | Mnemonic::Sar | Mnemonic::Shl | Mnemonic::Shr
                if mach.src_reg.is_some() =>
            {
                one(format!(
                    "{opcode} {}, {}",
                    resolve(*rhs, OpSize::Byte),
                    resolve(*dst, sz)
                ))
            }
            _ => one(format!(
                "{opcode} {}, {}",
                resolve(*rhs, sz),
                resolve(*dst, sz)
            )),
        },
        Op::BinConst { dst, imm, .. } => {
            one(format!("{opcode} {}, {}", imm_text(*imm), resolve(*dst, sz)))
        }
        Op::Negate { dst, .. } | Op::BitNot { dst, .. } => {
            one(format!("{opcode} {}", resolve(*dst, sz)))
        }
        Op::LogicalNot { .. } => {
            panic!("invariant violated: logical-not must be expanded by selection")
        }
        Op::Lea {
            dst,
            base,
            index,
            scale,
            offset,
        } => {
            let base = resolve(*base, OpSize::QuadWord);
            let addr = match index {
                Some(index) => format!(
                    "{offset}({base},{},{scale})",
                    resolve(*index, OpSize::QuadWord)
                ),
                None => format!("{offset}({base})"),
            };
            one(format!("{opcode} {addr}, {}", resolve(*dst, OpSize::QuadWord)))
        }
        Op::MemoryAddress {
            dst,
            target,
            offset,
        } => one(format!(
            "{opcode} {}, {}",
            region_operand(func, *target, *offset),
            resolve(*dst, OpSize::QuadWord)
        )),
        Op::Inc { dst } | Op::Dec { dst } => one(format!("{opcode} {}", resolve(*dst, sz))),
        Op::Test { lhs, rhs } => one(format!(
            "{opcode} {}, {}",
            resolve(*rhs, sz),
            resolve(*lhs, sz)
        )),
        Op::Cmp { lhs, rhs } => one(format!(
            "{opcode} {}, {}",
            resolve(*rhs, sz),
            resolve(*lhs, sz)
        )),
        Op::CmpConst { lhs, imm } => {
            one(format!("{opcode} {}, {}", imm_text(*imm), resolve(*lhs, sz)))
        }
        Op::Load { dst, addr } => one(format!(
            "{opcode} ({}), {}",
            resolve(*addr, OpSize::QuadWord),
            resolve(*dst, sz)
        )),
        Op::LoadConstOffset { dst, base, offset } => one(format!(
            "{opcode} {offset}({}), {}",
            resolve(*base, OpSize::QuadWord),
            resolve(*dst, sz)
        )),
        Op::LoadVarOffset {
            dst,
            base,
            index,
            scale,
        } => one(format!(
            "{opcode} ({},{},{scale}), {}",
            resolve(*base, OpSize::QuadWord),
            resolve(*index, OpSize::QuadWord),
            resolve(*dst, sz)
        )),
        Op::Store { addr, src } => one(format!(
            "{opcode} {}, ({})",
            resolve(*src, sz),
            resolve(*addr, OpSize::QuadWord)
        )),
        Op::StoreConstOffset { base, offset, src } => one(format!(
            "{opcode} {}, {offset}({})",
            resolve(*src, sz),
            resolve(*base, OpSize::QuadWord)
        )),
        Op::StoreVarOffset {
            base,
            index,
            scale,
            src,
        } => one(format!(
            "{opcode} {}, ({},{},{scale})",
            resolve(*src, sz),
            resolve(*base, OpSize::QuadWord),
            resolve(*index, OpSize::QuadWord)
        )),
        Op::Jump { target } => one(format!("{opcode} {}", block_label(func, *target))),
        Op::Branch { tt, .. } => one(format!("{opcode} {}", block_label(func, *tt))),
        Op::IndirectJumpCalc {
            dst, table, index, ..
        } => one(format!(
            "{opcode} {}(,{},8), {}",
            table_label(func, *table),
            resolve(*index, OpSize::QuadWord),
            resolve(*dst, OpSize::QuadWord)
        )),
        Op::IndirectJump { addr, .. } => {
            one(format!("{opcode} *{}", resolve(*addr, OpSize::QuadWord)))
        }
        Op::Call { func: callee, args, .. } => {
            let mut lines = Vec::new();
            let extra = args.len().saturating_sub(crate::middle::cfg::PARAM_REGISTER_QUOTA);
            if extra % 2 == 1 {
                lines.push("subq $8, %rsp".to_string());
            }
            for arg in args.iter().skip(crate::middle::cfg::PARAM_REGISTER_QUOTA).rev() {
                lines.push(format!("pushq {}", resolve(*arg, OpSize::QuadWord)));
            }
            lines.push(format!("{opcode} {}", functions.record(*callee).name));
            if extra > 0 {
                let pad = if extra % 2 == 1 { 8 } else { 0 };
                lines.push(format!("addq ${}, %rsp", extra * 8 + pad));
            }
            lines
        }
        Op::IndirectCall { target, args, .. } => {
            let mut lines = Vec::new();
            let extra = args.len().saturating_sub(crate::middle::cfg::PARAM_REGISTER_QUOTA);
            if extra % 2 == 1 {
                lines.push("subq $8, %rsp".to_string());
            }
            for arg in args.iter().skip(crate::middle::cfg::PARAM_REGISTER_QUOTA).rev() {
                lines.push(format!("pushq {}", resolve(*arg, OpSize::QuadWord)));
            }
            lines.push(format!("{opcode} *{}", resolve(*target, OpSize::QuadWord)));
            if extra > 0 {
                let pad = if extra % 2 == 1 { 8 } else { 0 };
                lines.push(format!("addq ${}, %rsp", extra * 8 + pad));
            }
            lines
        }
        Op::Set { dst, .. } => one(format!("{opcode} {}", resolve(*dst, OpSize::Byte))),
        Op::Return { .. } => match epilogue {
            Some(epilogue) => {
                let mut lines: Vec<String> = epilogue
                    .lines()
                    .map(|l| l.trim_start_matches('\t').to_string())
                    .collect();
                lines.push("ret".to_string());
                lines
            }
            None => one("ret".to_string()),
        },
        Op::Nop => one(opcode),
        Op::InlineAsm { text } => one(text.to_string()),
        Op::Phi { .. } => panic!("invariant violated: phi reached emission"),
    }
}

/// Extending moves read the source at its own width; everything else reads
/// at the instruction width.
fn effective_src_size(mach: Mach, src_sz: OpSize) -> OpSize {
    match mach.mnemonic {
        Mnemonic::Movzx | Mnemonic::Movsx => src_sz,
        _ => mach.size,
    }
}

/// Globals are printed after the functions.
fn emit_globals(module: &Module, types: &crate::front::types::TypeTable) -> String {
    if module.globals.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    out.push_str("\t.data\n");
    for global in &module.globals {
        let size = types.size(global.ty).max(1);
        out.push_str(&format!("\t.globl {}\n", global.name));
        match global.init {
            Some(init) => {
                let directive = match size {
                    1 => ".byte",
                    2 => ".word",
                    4 => ".long",
                    _ => ".quad",
                };
                out.push_str(&format!("{}:\n\t{directive} {init}\n", global.name));
            }
            None => {
                out.push_str(&format!("\t.comm {},{},8\n", global.name, size));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::middle::cfg::build_cfg;
    use crate::middle::opt::optimize;

    fn compile(source: &str) -> String {
        let mut unit = parse(source);
        assert!(!unit.root.is_err(), "{:?}", unit.root);
        let mut module = build_cfg(&mut unit);
        optimize(&mut module, &unit.types);
        code_gen(&mut unit, &mut module)
    }

    #[test]
    fn straight_line_function_emits_a_frame_and_ret() {
        let asm = compile("fn main() -> i32 { return 42; }");
        assert!(asm.contains(".globl main"), "{asm}");
        assert!(asm.contains("pushq %rbp"), "{asm}");
        assert!(asm.contains("movq %rsp, %rbp"), "{asm}");
        assert!(asm.contains("$42"), "{asm}");
        assert!(asm.contains("leave"), "{asm}");
        assert!(asm.contains("\tret\n"), "{asm}");
    }

    #[test]
    fn return_value_lands_in_eax() {
        let asm = compile("fn f() -> i32 { return 7; }");
        assert!(asm.contains("%eax"), "{asm}");
    }

    #[test]
    fn globals_print_after_functions() {
        let asm = compile(
            "global counter: i64 = 5;\n\
             fn main() -> i32 { return 0; }\n",
        );
        let func_pos = asm.find("main:").unwrap();
        let global_pos = asm.find("counter:").unwrap();
        assert!(global_pos > func_pos, "{asm}");
        assert!(asm.contains(".quad 5"), "{asm}");
    }

    #[test]
    fn switch_emits_a_jump_table() {
        let asm = compile(
            "fn pick(x: i32) -> i32 {\n\
               switch (x) {\n\
                 case 0: return 1;\n\
                 case 1: return 2;\n\
                 case 2: return 3;\n\
                 default: return 0;\n\
               }\n\
             }\n",
        );
        assert!(asm.contains(".JTpick_0:"), "{asm}");
        assert!(asm.contains(".rodata"), "{asm}");
        assert!(asm.contains("jmp *"), "{asm}");
        // three real cases in the dense table
        assert_eq!(asm.matches("\t.quad .Lpick_").count(), 3, "{asm}");
    }

    #[test]
    fn division_uses_the_accumulator_protocol() {
        let asm = compile("fn f(a: i32, b: i32) -> i32 { return a / b; }");
        assert!(asm.contains("cdq"), "{asm}");
        assert!(asm.contains("idivl"), "{asm}");
    }

    #[test]
    fn branches_fall_through_to_the_else_side() {
        let asm = compile(
            "fn f(a: i32) -> i32 {\n\
               if (a > 0) { return 1; }\n\
               return 0;\n\
             }\n",
        );
        assert!(asm.contains("jg .Lf_"), "{asm}");
        // the conditional's else side is the fall-through, so there is no
        // jmp immediately after the jg
        let jg_line = asm.lines().position(|l| l.contains("jg ")).unwrap();
        let next = asm.lines().nth(jg_line + 1).unwrap();
        assert!(!next.contains("jmp"), "{asm}");
    }

    #[test]
    fn selected_printing_mode_is_stable() {
        let mut unit = parse("fn f() -> i32 { return 3; }");
        let mut module = build_cfg(&mut unit);
        optimize(&mut module, &unit.types);
        let _asm = code_gen(&mut unit, &mut module);
        let printed = print_selected(&module.funcs[0], &unit.functions);
        let again = print_selected(&module.funcs[0], &unit.functions);
        assert_eq!(printed, again);
        assert!(printed.contains("movl $3,"), "{printed}");
    }
}
