//! The middle-end: OIR, the CFG builder in SSA form, the optimizer, the
//! block linearizer, and the peephole simplifier.

pub mod cfg;
pub mod frame;
pub mod linearize;
pub mod oir;
pub mod opt;
pub mod peephole;

pub use cfg::{build_cfg, Function, Module};
