//! Compiler configuration.

use serde::{Deserialize, Serialize};

/// What the code generator does with statically dead instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeadCode {
    /// Emit nothing at all.
    #[default]
    Suppress,
    /// Emit an `ILLEGAL` opcode followed by `NOP` fill of the same size,
    /// keeping positions stable for inspection.
    IllegalFill,
}

/// Options controlling a compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Run the peephole optimiser over closed code fragments.
    pub peephole: bool,
    /// Dead code handling once control flow is known to have exited.
    pub dead_code: DeadCode,
    /// Pascal-style division: integer `/` integer yields a real.
    pub pascal_divs: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            peephole: true,
            dead_code: DeadCode::default(),
            pascal_divs: false,
        }
    }
}
